//! In-memory [`KubeApi`] used by tests across the workspace.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroup, APIGroupList, APIResource, APIResourceList, GroupVersionForDiscovery,
};
use serde_json::{json, Value};

use crate::transport::{ByteStream, KubeApi, KubeError, ListQuery};

/// Scripted outcome of one watch call. Unscripted calls hang open.
#[derive(Debug, Clone)]
pub enum WatchScript {
    /// Deliver the frames, then close cleanly.
    Frames(Vec<Value>),
    /// Deliver the frames, then stay open.
    FramesThenHang(Vec<Value>),
    /// Refuse with this HTTP status.
    Fail(u16),
}

#[derive(Default)]
struct State {
    core: Vec<APIResource>,
    groups: Vec<(String, Vec<APIResource>)>,
    objects: Vec<(String, Value)>,
    singles: HashMap<String, Value>,
    list_failures: HashMap<String, u16>,
    transport_failures: HashSet<String>,
    discovery_down: bool,
    list_delays: HashMap<String, std::time::Duration>,
    scripts: HashMap<String, VecDeque<WatchScript>>,
    watch_calls: HashMap<String, usize>,
    list_calls: Vec<(String, ListQuery)>,
}

#[derive(Default)]
pub struct MockKube {
    state: Mutex<State>,
}

pub fn api_resource(name: &str, kind: &str, namespaced: bool, verbs: &[&str]) -> APIResource {
    APIResource {
        name: name.to_string(),
        kind: kind.to_string(),
        namespaced,
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

impl MockKube {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> std::sync::MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn with_core(self, resource: APIResource) -> Self {
        self.state().core.push(resource);
        self
    }

    /// Register a resource under a preferred group version such as `apps/v1`.
    pub fn with_group(self, group_version: &str, resource: APIResource) -> Self {
        {
            let mut st = self.state();
            match st.groups.iter_mut().find(|(gv, _)| gv == group_version) {
                Some((_, list)) => list.push(resource),
                None => st.groups.push((group_version.to_string(), vec![resource])),
            }
        }
        self
    }

    /// Add an object to the collection at `path`.
    pub fn add_object(&self, path: &str, obj: Value) { self.state().objects.push((path.to_string(), obj)); }

    pub fn clear_objects(&self, path: &str) { self.state().objects.retain(|(p, _)| p != path); }

    /// Serve `obj` for `GET {collection}/{name}`.
    pub fn put(&self, collection: &str, name: &str, obj: Value) {
        self.state().singles.insert(format!("{}/{}", collection, name), obj);
    }

    pub fn fail_list(&self, path: &str, code: u16) { self.state().list_failures.insert(path.to_string(), code); }

    pub fn break_transport(&self, path: &str) { self.state().transport_failures.insert(path.to_string()); }

    pub fn heal(&self, path: &str) {
        let mut st = self.state();
        st.list_failures.remove(path);
        st.transport_failures.remove(path);
    }

    pub fn set_discovery_down(&self, down: bool) { self.state().discovery_down = down; }

    /// Make list calls on `path` take `delay` before answering.
    pub fn set_list_delay(&self, path: &str, delay: std::time::Duration) {
        self.state().list_delays.insert(path.to_string(), delay);
    }

    pub fn script_watch(&self, path: &str, script: WatchScript) {
        self.state().scripts.entry(path.to_string()).or_default().push_back(script);
    }

    pub fn watch_calls(&self, path: &str) -> usize { self.state().watch_calls.get(path).copied().unwrap_or(0) }

    pub fn list_calls(&self) -> Vec<(String, ListQuery)> { self.state().list_calls.clone() }

    fn discovery_check(&self) -> Result<(), KubeError> {
        if self.state().discovery_down {
            return Err(KubeError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn list_kind(&self, path: &str) -> String {
        let st = self.state();
        let last = path.rsplit('/').next().unwrap_or_default();
        st.core
            .iter()
            .chain(st.groups.iter().flat_map(|(_, rs)| rs.iter()))
            .find(|r| r.name == last)
            .map(|r| format!("{}List", r.kind))
            .unwrap_or_else(|| "List".to_string())
    }
}

// Supports `k in (a,b)`, `k=v`, `k==v` and bare `k`.
fn label_matches(selector: &str, obj: &Value) -> bool {
    let labels = obj.pointer("/metadata/labels");
    let get = |k: &str| labels.and_then(|l| l.get(k)).and_then(Value::as_str);
    let sel = selector.trim();
    if let Some((key, rest)) = sel.split_once(" in ") {
        let set = rest.trim().trim_start_matches('(').trim_end_matches(')');
        return get(key.trim()).map_or(false, |v| set.split(',').any(|s| s.trim() == v));
    }
    if let Some((key, val)) = sel.split_once("==").or_else(|| sel.split_once('=')) {
        return get(key.trim()) == Some(val.trim());
    }
    get(sel).is_some()
}

fn field_matches(selector: &str, obj: &Value) -> bool {
    let Some((key, val)) = selector.split_once("==").or_else(|| selector.split_once('=')) else { return true };
    let pointer = format!("/{}", key.trim().replace('.', "/"));
    obj.pointer(&pointer).and_then(Value::as_str) == Some(val.trim())
}

fn status(code: u16, message: &str) -> KubeError { KubeError::Status { code, message: message.to_string() } }

#[async_trait]
impl KubeApi for MockKube {
    async fn core_resources(&self, version: &str) -> Result<APIResourceList, KubeError> {
        self.discovery_check()?;
        Ok(APIResourceList { group_version: version.to_string(), resources: self.state().core.clone() })
    }

    async fn api_groups(&self) -> Result<APIGroupList, KubeError> {
        self.discovery_check()?;
        let groups = self
            .state()
            .groups
            .iter()
            .map(|(gv, _)| {
                let (name, version) = gv.split_once('/').unwrap_or((gv.as_str(), ""));
                let pv = GroupVersionForDiscovery { group_version: gv.clone(), version: version.to_string() };
                APIGroup { name: name.to_string(), preferred_version: Some(pv.clone()), versions: vec![pv], ..Default::default() }
            })
            .collect();
        Ok(APIGroupList { groups })
    }

    async fn group_resources(&self, group_version: &str) -> Result<APIResourceList, KubeError> {
        self.discovery_check()?;
        let st = self.state();
        let (_, resources) = st.groups.iter().find(|(gv, _)| gv == group_version).ok_or_else(|| status(404, "group not found"))?;
        Ok(APIResourceList { group_version: group_version.to_string(), resources: resources.clone() })
    }

    async fn list(&self, path: &str, query: &ListQuery) -> Result<Value, KubeError> {
        let delay = self.state().list_delays.get(path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let kind = self.list_kind(path);
        let mut st = self.state();
        st.list_calls.push((path.to_string(), query.clone()));
        if st.transport_failures.contains(path) {
            return Err(KubeError::Transport("connection reset".into()));
        }
        if let Some(code) = st.list_failures.get(path) {
            return Err(status(*code, "list failed"));
        }
        let matching: Vec<Value> = st
            .objects
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, o)| o)
            .filter(|o| query.label_selector.as_deref().map_or(true, |s| label_matches(s, o)))
            .filter(|o| query.field_selector.as_deref().map_or(true, |s| field_matches(s, o)))
            .cloned()
            .collect();
        let offset: usize = query.continue_token.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = query.limit.map_or(matching.len(), |l| (offset + l as usize).min(matching.len()));
        let page = matching.get(offset.min(matching.len())..end).unwrap_or_default().to_vec();
        let mut metadata = json!({"resourceVersion": "1"});
        if end < matching.len() {
            metadata["continue"] = json!(end.to_string());
        }
        Ok(json!({"kind": kind, "apiVersion": "v1", "metadata": metadata, "items": page}))
    }

    async fn get(&self, collection: &str, name: &str) -> Result<Value, KubeError> {
        let st = self.state();
        if st.transport_failures.contains(collection) {
            return Err(KubeError::Transport("connection reset".into()));
        }
        st.singles.get(&format!("{}/{}", collection, name)).cloned().ok_or_else(|| status(404, "not found"))
    }

    async fn server_version(&self) -> Result<Value, KubeError> {
        Ok(json!({"major": "1", "minor": "29", "gitVersion": "v1.29.3", "platform": "linux/amd64"}))
    }

    async fn watch(&self, path: &str, _query: &ListQuery) -> Result<ByteStream, KubeError> {
        let script = {
            let mut st = self.state();
            *st.watch_calls.entry(path.to_string()).or_default() += 1;
            st.scripts.get_mut(path).and_then(VecDeque::pop_front)
        };
        let encode = |frames: Vec<Value>| -> Vec<Result<Bytes, KubeError>> {
            frames.into_iter().map(|f| Ok(Bytes::from(format!("{}\n", f)))).collect()
        };
        match script {
            None => Ok(stream::pending().boxed()),
            Some(WatchScript::Fail(code)) => Err(status(code, "watch refused")),
            Some(WatchScript::Frames(frames)) => Ok(stream::iter(encode(frames)).boxed()),
            Some(WatchScript::FramesThenHang(frames)) => Ok(stream::iter(encode(frames)).chain(stream::pending()).boxed()),
        }
    }
}
