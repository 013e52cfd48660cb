//! Resource directory: which collections the cluster serves and what can be
//! done to them.

use futures::future::try_join_all;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIResource, APIResourceList};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::{KubeApi, KubeError};

/// One served resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeDescriptor {
    /// `/api/v1` or `/apis/{group}/{version}`.
    pub api_path: String,
    /// Plural name, possibly with a subresource (`pods/status`).
    pub name: String,
    pub singular_name: String,
    pub kind: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl ResourceTypeDescriptor {
    pub fn from_api_resource(api_path: &str, r: &APIResource) -> Self {
        Self {
            api_path: api_path.to_string(),
            name: r.name.clone(),
            singular_name: r.singular_name.clone(),
            kind: r.kind.clone(),
            namespaced: r.namespaced,
            verbs: r.verbs.clone(),
        }
    }

    /// Cluster-wide collection URI.
    pub fn uri(&self) -> String { format!("{}/{}", self.api_path, self.name) }

    pub fn has_verb(&self, verb: &str) -> bool { self.verbs.iter().any(|v| v == verb) }

    pub fn is_subresource(&self) -> bool { self.name.contains('/') }

    /// `v1` or `group/version`.
    pub fn api_version(&self) -> &str {
        self.api_path
            .strip_prefix("/apis/")
            .or_else(|| self.api_path.strip_prefix("/api/"))
            .unwrap_or(&self.api_path)
    }

    /// Lowercase `{apiVersion}_{kind}` and `{apiVersion}_{name}` keys, slashes
    /// replaced by underscores, used by the poll allow/deny lists.
    pub fn filter_keys(&self) -> [String; 2] {
        let av = self.api_version().replace('/', "_");
        [
            format!("{}_{}", av, self.kind).to_lowercase(),
            format!("{}_{}", av, self.name.replace('/', "_")).to_lowercase(),
        ]
    }
}

fn descriptors(api_path: &str, list: &APIResourceList) -> Vec<ResourceTypeDescriptor> {
    list.resources.iter().map(|r| ResourceTypeDescriptor::from_api_resource(api_path, r)).collect()
}

async fn core_descriptors(api: &dyn KubeApi) -> Result<Vec<ResourceTypeDescriptor>, KubeError> {
    let list = api.core_resources("v1").await?;
    Ok(descriptors("/api/v1", &list))
}

async fn group_descriptors(api: &dyn KubeApi) -> Result<Vec<ResourceTypeDescriptor>, KubeError> {
    let groups = api.api_groups().await?;
    let versions: Vec<String> =
        groups.groups.iter().filter_map(|g| g.preferred_version.as_ref()).map(|pv| pv.group_version.clone()).collect();
    let lists = try_join_all(versions.iter().map(|gv| async move {
        let list = api.group_resources(gv).await?;
        let gv = if list.group_version.is_empty() { gv.as_str() } else { list.group_version.as_str() };
        Ok::<_, KubeError>(descriptors(&format!("/apis/{}", gv), &list))
    }))
    .await?;
    Ok(lists.into_iter().flatten().collect())
}

// Core types first, then one entry per group resource name; a legacy
// `extensions` entry yields to any other group serving the same name.
fn merge(core: Vec<ResourceTypeDescriptor>, groups: Vec<ResourceTypeDescriptor>) -> Vec<ResourceTypeDescriptor> {
    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    let mut merged: Vec<ResourceTypeDescriptor> = Vec::new();
    for d in groups {
        match index.get(&d.name) {
            None => {
                index.insert(d.name.clone(), merged.len());
                merged.push(d);
            }
            Some(&i) if merged[i].api_path.starts_with("/apis/extensions/") => merged[i] = d,
            Some(_) => {}
        }
    }
    core.into_iter().chain(merged).collect()
}

/// Enumerate served resource types, optionally keeping only those that
/// support `verb`. Group lists are fetched concurrently; any failure fails the
/// whole discovery.
pub async fn discover(api: &dyn KubeApi, verb: Option<&str>) -> Result<Vec<ResourceTypeDescriptor>, KubeError> {
    let (core, groups) = futures::try_join!(core_descriptors(api), group_descriptors(api))?;
    let mut all = merge(core, groups);
    if let Some(verb) = verb {
        all.retain(|d| d.has_verb(verb));
    }
    debug!(count = all.len(), verb = ?verb, "resource discovery complete");
    Ok(all)
}

/// Look up one resource type under `api_path` by plural name, singular name
/// or kind, in that order of preference.
pub async fn get_single(
    api: &dyn KubeApi,
    api_path: &str,
    resource: &str,
    verb: Option<&str>,
) -> Result<Option<ResourceTypeDescriptor>, KubeError> {
    let path = api_path.trim_end_matches('/');
    let list = if let Some(version) = path.strip_prefix("/api/") {
        api.core_resources(version).await?
    } else if let Some(gv) = path.strip_prefix("/apis/") {
        api.group_resources(gv).await?
    } else {
        return Err(KubeError::Request(format!("unsupported api path {}", api_path)));
    };
    let found = list
        .resources
        .iter()
        .find(|r| r.name == resource)
        .or_else(|| list.resources.iter().find(|r| !r.singular_name.is_empty() && r.singular_name == resource))
        .or_else(|| list.resources.iter().find(|r| !r.name.contains('/') && r.kind == resource))
        .map(|r| ResourceTypeDescriptor::from_api_resource(path, r));
    Ok(found.filter(|d| verb.map_or(true, |v| d.has_verb(v))))
}
