//! Cluster-side configuration read from ConfigMaps in the config namespace.
//! Re-read on every validation and poll cycle.

use keeper_core::DetailLevel;
use keeper_kubehub::{KubeApi, KubeError, ResourceTypeDescriptor};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

pub const LIMIT_POLL_CONFIGMAP: &str = "watch-keeper-limit-poll";
pub const NON_NAMESPACED_CONFIGMAP: &str = "watch-keeper-non-namespaced";

const LIST_MODE_KEYS: &[&str] = &["whitelist.json", "whitelist", "blacklist.json", "blacklist"];

/// Poll allow/deny list over `{apiVersion}_{kind|name}` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResourceFilter {
    #[default]
    All,
    Allow(FxHashSet<String>),
    Deny(FxHashSet<String>),
}

fn flag_set(data: &Map<String, Value>, key: &str) -> bool { data.get(key).and_then(Value::as_str) == Some("true") }

// Entries are the remaining keys whose value is "true".
fn flag_entries(data: &Map<String, Value>) -> FxHashSet<String> {
    data.iter()
        .filter(|(k, _)| !LIST_MODE_KEYS.contains(&k.to_lowercase().as_str()))
        .filter(|(_, v)| v.as_str() == Some("true"))
        .map(|(k, _)| k.to_lowercase())
        .collect()
}

// `{"apps/v1": ["Deployment", "statefulsets"]}` -> {"apps_v1_deployment", "apps_v1_statefulsets"}
fn json_entries(raw: &str) -> Result<FxHashSet<String>, serde_json::Error> {
    let parsed: FxHashMap<String, Vec<String>> = serde_json::from_str(raw)?;
    Ok(parsed
        .iter()
        .flat_map(|(av, names)| {
            let av = av.replace('/', "_");
            names.iter().map(move |n| format!("{}_{}", av, n.replace('/', "_")).to_lowercase())
        })
        .collect())
}

impl ResourceFilter {
    pub fn from_data(data: &Map<String, Value>) -> Self {
        if flag_set(data, "whitelist") {
            return ResourceFilter::Allow(flag_entries(data));
        }
        if flag_set(data, "blacklist") {
            return ResourceFilter::Deny(flag_entries(data));
        }
        for (key, allow) in [("whitelist.json", true), ("blacklist.json", false)] {
            let Some(raw) = data.get(key).and_then(Value::as_str) else { continue };
            return match json_entries(raw) {
                Ok(set) if allow => ResourceFilter::Allow(set),
                Ok(set) => ResourceFilter::Deny(set),
                Err(e) => {
                    error!(key, error = %e, "invalid poll limit list; polling everything");
                    ResourceFilter::All
                }
            };
        }
        ResourceFilter::All
    }

    pub fn permits(&self, d: &ResourceTypeDescriptor) -> bool {
        let listed = |set: &FxHashSet<String>| d.filter_keys().iter().any(|k| set.contains(k));
        match self {
            ResourceFilter::All => true,
            ResourceFilter::Allow(set) => listed(set),
            ResourceFilter::Deny(set) => !listed(set),
        }
    }
}

/// Cluster-scoped polling level and the resource types given a global watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonNamespacedConfig {
    /// `None` disables the cluster-scoped poll pass.
    pub poll: Option<DetailLevel>,
    pub global_watches: FxHashMap<String, DetailLevel>,
}

impl Default for NonNamespacedConfig {
    fn default() -> Self { Self { poll: Some(DetailLevel::Lite), global_watches: FxHashMap::default() } }
}

impl NonNamespacedConfig {
    pub fn from_data(data: &Map<String, Value>) -> Self {
        let poll = match data.get("poll").and_then(Value::as_str) {
            Some("false") => None,
            Some(level) => Some(DetailLevel::from_label(level)),
            None => Some(DetailLevel::Lite),
        };
        let global_watches = data
            .iter()
            .filter(|(k, _)| k.as_str() != "poll")
            .filter_map(|(k, v)| Some((k.to_lowercase(), DetailLevel::from_label(v.as_str()?))))
            .filter(|(_, level)| *level != DetailLevel::Omit)
            .collect();
        Self { poll, global_watches }
    }

    /// Detail level of the cluster-wide watch configured for `d`, if any.
    pub fn global_level(&self, d: &ResourceTypeDescriptor) -> Option<DetailLevel> {
        d.filter_keys().iter().find_map(|k| self.global_watches.get(k).copied())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub filter: ResourceFilter,
    pub non_namespaced: NonNamespacedConfig,
}

async fn configmap_data(api: &dyn KubeApi, namespace: &str, name: &str) -> Option<Map<String, Value>> {
    let collection = format!("/api/v1/namespaces/{}/configmaps", namespace);
    match api.get(&collection, name).await {
        Ok(mut cm) => match cm.get_mut("data").map(Value::take) {
            Some(Value::Object(data)) => Some(data),
            _ => Some(Map::new()),
        },
        Err(KubeError::Status { code: 404, .. }) => {
            debug!(namespace, name, "configmap not present");
            None
        }
        Err(e) => {
            warn!(namespace, name, error = %e, "configmap read failed; using defaults");
            None
        }
    }
}

/// Read both ConfigMaps. Missing or unreadable maps yield defaults.
pub async fn load_cluster_config(api: &dyn KubeApi, namespace: &str) -> ClusterConfig {
    let filter = configmap_data(api, namespace, LIMIT_POLL_CONFIGMAP).await.map(|d| ResourceFilter::from_data(&d)).unwrap_or_default();
    let non_namespaced =
        configmap_data(api, namespace, NON_NAMESPACED_CONFIGMAP).await.map(|d| NonNamespacedConfig::from_data(&d)).unwrap_or_default();
    ClusterConfig { filter, non_namespaced }
}
