//! Cluster identity and the metadata reported with every heartbeat.

use keeper_core::CLUSTER_META_LABEL;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::transport::{KubeApi, KubeError, ListQuery};

const NAMESPACES: &str = "/api/v1/namespaces";
const CONFIGMAPS: &str = "/api/v1/configmaps";

/// Cluster id: the explicit override when set, otherwise the uid of
/// `namespace` (normally `kube-system`).
pub async fn cluster_id(api: &dyn KubeApi, override_id: Option<&str>, namespace: &str) -> Result<String, KubeError> {
    if let Some(id) = override_id.filter(|s| !s.is_empty()) {
        return Ok(id.to_string());
    }
    let ns = api.get(NAMESPACES, namespace).await?;
    ns.pointer("/metadata/uid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| KubeError::Decode(format!("namespace {} has no uid", namespace)))
}

/// Heartbeat metadata: optional cluster name, the data of every ConfigMap
/// labelled `razee/cluster-metadata=true`, and `kube_version`.
/// Lookups that fail are logged and skipped.
pub async fn cluster_metadata(api: &dyn KubeApi, cluster_name: Option<&str>) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(name) = cluster_name.filter(|s| !s.is_empty()) {
        out.insert("name".into(), Value::String(name.to_string()));
    }

    let query = ListQuery::default().labels(format!("{}=true", CLUSTER_META_LABEL));
    match api.list(CONFIGMAPS, &query).await {
        Ok(list) => {
            let items = list.get("items").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default();
            for data in items.iter().filter_map(|cm| cm.get("data").and_then(Value::as_object)) {
                for (k, v) in data {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        Err(e) => debug!(error = %e, "cluster metadata configmaps unavailable"),
    }

    match api.server_version().await {
        Ok(v) => {
            out.insert("kube_version".into(), v);
        }
        Err(e) => warn!(error = %e, "kube version unavailable"),
    }
    out
}
