//! Redaction pipeline: turns a raw object into its transmit-safe form at a
//! given detail level.

use serde_json::{Map, Value};

use crate::{label_value, DetailLevel, WATCH_LABEL};

pub const REDACTED: &str = "REDACTED";

const LAST_APPLIED_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "kapitan.razee.io/last-applied-configuration",
    "deploy.razee.io/last-applied-configuration",
];

// Container-bearing spec shapes, checked in order.
const CONTAINER_SPEC_PATHS: &[&[&str]] = &[
    &["spec", "template", "spec"],
    &["spec"],
    &["spec", "jobTemplate", "spec", "template", "spec"],
];

/// Shapes accepted by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// One Kubernetes object.
    Single(Value),
    /// Several payloads formatted element-wise.
    List(Vec<Payload>),
    /// A list object such as `SecretList`: the envelope is kept as-is and
    /// every entry of `items` is formatted.
    Collection { envelope: Map<String, Value>, items: Vec<Payload> },
    /// A watch event `{type, object}`.
    Wrapped { event_type: String, object: Box<Payload> },
}

impl Payload {
    pub fn classify(v: Value) -> Self {
        match v {
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::classify).collect()),
            Value::Object(mut map) if map.get("type").map_or(false, Value::is_string) && map.contains_key("object") => {
                let event_type = map.remove("type").and_then(|t| t.as_str().map(str::to_string)).unwrap_or_default();
                let object = map.remove("object").unwrap_or(Value::Null);
                Payload::Wrapped { event_type, object: Box::new(Payload::classify(object)) }
            }
            Value::Object(mut map) if map.get("items").map_or(false, Value::is_array) => {
                let items = match map.remove("items") {
                    Some(Value::Array(items)) => items.into_iter().map(Payload::classify).collect(),
                    _ => Vec::new(),
                };
                Payload::Collection { envelope: map, items }
            }
            other => Payload::Single(other),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Payload::Single(v) => v,
            Payload::List(items) => Value::Array(items.into_iter().map(Payload::into_value).collect()),
            Payload::Collection { mut envelope, items } => {
                envelope.insert("items".into(), Value::Array(items.into_iter().map(Payload::into_value).collect()));
                Value::Object(envelope)
            }
            Payload::Wrapped { event_type, object } => {
                let mut m = Map::new();
                m.insert("type".into(), Value::String(event_type));
                m.insert("object".into(), object.into_value());
                Value::Object(m)
            }
        }
    }
}

/// Format a payload. Returns `None` when nothing is left to send.
pub fn format(payload: Payload, default: DetailLevel) -> Option<Payload> {
    match payload {
        Payload::Single(v) => format_object(v, default).map(Payload::Single),
        Payload::List(items) => Some(Payload::List(items.into_iter().filter_map(|p| format(p, default)).collect())),
        Payload::Collection { envelope, items } => {
            Some(Payload::Collection { envelope, items: items.into_iter().filter_map(|p| format(p, default)).collect() })
        }
        Payload::Wrapped { event_type, object } => {
            format(*object, default).map(|o| Payload::Wrapped { event_type, object: Box::new(o) })
        }
    }
}

/// Format one object. The object's own watch label overrides `default`.
/// Objects carrying an `items` array are formatted entry by entry.
pub fn format_object(obj: Value, default: DetailLevel) -> Option<Value> {
    if obj.get("items").map_or(false, Value::is_array) {
        return format(Payload::classify(obj), default).map(Payload::into_value);
    }
    let level = label_value(&obj, WATCH_LABEL).map(DetailLevel::from_label).unwrap_or(default);
    let mut obj = match level {
        DetailLevel::Debug => return Some(obj),
        DetailLevel::Omit => return None,
        DetailLevel::Lite => collapse_lite(obj),
        DetailLevel::Detailed => obj,
    };

    if let Some(annotations) = obj.pointer_mut("/metadata/annotations").and_then(Value::as_object_mut) {
        for key in LAST_APPLIED_ANNOTATIONS {
            annotations.remove(*key);
        }
    }

    match obj.get("kind").and_then(Value::as_str) {
        Some("Secret") | Some("ConfigMap") => {
            if let Some(data) = obj.get_mut("data").and_then(Value::as_object_mut) {
                for v in data.values_mut() {
                    *v = Value::String(REDACTED.to_string());
                }
            }
        }
        Some("Node") => {
            if let Some(status) = obj.get_mut("status").and_then(Value::as_object_mut) {
                status.remove("images");
            }
        }
        _ => redact_pod_spec(&mut obj),
    }
    Some(obj)
}

fn collapse_lite(obj: Value) -> Value {
    let mut out = Map::new();
    let Value::Object(mut src) = obj else { return obj };
    out.insert("kind".into(), src.remove("kind").unwrap_or(Value::Null));
    out.insert("apiVersion".into(), src.remove("apiVersion").unwrap_or(Value::Null));
    out.insert("metadata".into(), src.remove("metadata").unwrap_or(Value::Null));
    if let Some(status) = src.remove("status") {
        out.insert("status".into(), status);
    }
    Value::Object(out)
}

fn redact_pod_spec(obj: &mut Value) {
    for path in CONTAINER_SPEC_PATHS {
        let mut cur = Some(&mut *obj);
        for seg in path.iter() {
            cur = cur.and_then(|c| c.get_mut(*seg));
        }
        let Some(spec) = cur else { continue };
        if spec.get("containers").is_none() {
            continue;
        }
        for field in ["containers", "initContainers"] {
            if let Some(containers) = spec.get_mut(field).and_then(Value::as_array_mut) {
                containers.iter_mut().for_each(clear_container_env);
            }
        }
        return;
    }
}

fn clear_container_env(container: &mut Value) {
    let Some(envs) = container.get_mut("env").and_then(Value::as_array_mut) else { return };
    for env in envs.iter_mut() {
        // only literal values; valueFrom references carry nothing secret
        let has_literal = env.get("value").map_or(false, |v| match v {
            Value::String(s) => !s.is_empty(),
            Value::Null => false,
            _ => true,
        });
        if has_literal {
            env["value"] = Value::String(REDACTED.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "kind": "Deployment",
            "apiVersion": "apps/v1",
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "labels": {"razee/watch-resource": "detail"},
                "annotations": {
                    "kubectl.kubernetes.io/last-applied-configuration": "{...}",
                    "keep": "me"
                }
            },
            "spec": {"template": {"spec": {"containers": [{
                "name": "app",
                "env": [
                    {"name": "X", "value": "secret"},
                    {"name": "Y", "valueFrom": {"secretKeyRef": {"name": "s", "key": "k"}}}
                ]
            }]}}},
            "status": {"replicas": 1}
        })
    }

    #[test]
    fn secret_data_is_redacted() {
        let s = json!({"kind": "Secret", "apiVersion": "v1", "metadata": {"name": "s"}, "data": {"a": "1", "b": "2"}});
        let out = format_object(s, DetailLevel::Detailed).unwrap();
        assert_eq!(out["data"], json!({"a": "REDACTED", "b": "REDACTED"}));
    }

    #[test]
    fn container_env_values_are_redacted_value_from_untouched() {
        let out = format_object(deployment(), DetailLevel::Lite).unwrap();
        let env = &out["spec"]["template"]["spec"]["containers"][0]["env"];
        assert_eq!(env[0], json!({"name": "X", "value": "REDACTED"}));
        assert_eq!(env[1], json!({"name": "Y", "valueFrom": {"secretKeyRef": {"name": "s", "key": "k"}}}));
        let annotations = out["metadata"]["annotations"].as_object().unwrap();
        assert!(!annotations.contains_key("kubectl.kubernetes.io/last-applied-configuration"));
        assert_eq!(annotations["keep"], "me");
    }

    #[test]
    fn bare_pod_and_cronjob_envs_are_redacted() {
        let pod = json!({"kind": "Pod", "metadata": {"labels": {"razee/watch-resource": "detailed"}},
            "spec": {"containers": [{"env": [{"name": "A", "value": "v"}]}], "initContainers": [{"env": [{"name": "B", "value": "w"}]}]}});
        let out = format_object(pod, DetailLevel::Lite).unwrap();
        assert_eq!(out["spec"]["containers"][0]["env"][0]["value"], "REDACTED");
        assert_eq!(out["spec"]["initContainers"][0]["env"][0]["value"], "REDACTED");

        let cron = json!({"kind": "CronJob", "metadata": {},
            "spec": {"jobTemplate": {"spec": {"template": {"spec": {"containers": [{"env": [{"name": "A", "value": "v"}]}]}}}}}});
        let out = format_object(cron, DetailLevel::Detailed).unwrap();
        assert_eq!(out["spec"]["jobTemplate"]["spec"]["template"]["spec"]["containers"][0]["env"][0]["value"], "REDACTED");
    }

    #[test]
    fn lite_collapses_to_kind_api_metadata_status() {
        let o = json!({"kind": "Service", "apiVersion": "v1", "metadata": {"name": "s"}, "spec": {"ports": []}, "status": {"loadBalancer": {}}});
        let out = format_object(o, DetailLevel::Lite).unwrap();
        let keys: Vec<_> = out.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 4);
        assert!(out.get("spec").is_none());
        assert_eq!(out["status"], json!({"loadBalancer": {}}));

        let no_status = format_object(json!({"kind": "ServiceAccount", "apiVersion": "v1", "metadata": {}}), DetailLevel::Lite).unwrap();
        assert_eq!(no_status.as_object().unwrap().len(), 3);
    }

    #[test]
    fn label_overrides_default_and_debug_passes_through() {
        let mut o = deployment();
        o["metadata"]["labels"]["razee/watch-resource"] = json!("debug");
        let out = format_object(o.clone(), DetailLevel::Lite).unwrap();
        assert_eq!(out, o);

        o["metadata"]["labels"]["razee/watch-resource"] = json!("lite");
        let out = format_object(o, DetailLevel::Detailed).unwrap();
        assert!(out.get("spec").is_none());
    }

    #[test]
    fn node_images_are_dropped() {
        let n = json!({"kind": "Node", "metadata": {}, "status": {"images": [{"names": ["a"]}], "capacity": {"cpu": "4"}}});
        let out = format_object(n, DetailLevel::Detailed).unwrap();
        assert!(out["status"].get("images").is_none());
        assert_eq!(out["status"]["capacity"]["cpu"], "4");
    }

    #[test]
    fn omit_drops_and_wrappers_recurse() {
        let ev = json!({"type": "MODIFIED", "object": {"kind": "ConfigMap", "metadata": {"name": "c"}, "data": {"k": "v"}}});
        let out = format(Payload::classify(ev), DetailLevel::Detailed).unwrap().into_value();
        assert_eq!(out["type"], "MODIFIED");
        assert_eq!(out["object"]["data"]["k"], "REDACTED");

        let list = json!([
            {"kind": "Pod", "metadata": {"name": "a"}},
            {"kind": "Pod", "metadata": {"name": "b", "labels": {"razee/watch-resource": "false"}}}
        ]);
        match format(Payload::classify(list), DetailLevel::Lite).unwrap() {
            Payload::List(items) => assert_eq!(items.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(format(Payload::Single(json!({"metadata": {}})), DetailLevel::Omit).is_none());
    }

    #[test]
    fn list_objects_format_every_item() {
        let list = json!({
            "kind": "SecretList",
            "apiVersion": "v1",
            "metadata": {"resourceVersion": "9"},
            "items": [
                {"kind": "Secret", "metadata": {"name": "a"}, "data": {"token": "1"}},
                {"kind": "Secret", "metadata": {"name": "b", "labels": {"razee/watch-resource": "omit"}}, "data": {"token": "2"}}
            ]
        });
        let detailed = format(Payload::classify(list.clone()), DetailLevel::Detailed).unwrap().into_value();
        assert_eq!(detailed["kind"], "SecretList");
        assert_eq!(detailed["metadata"]["resourceVersion"], "9");
        assert_eq!(detailed["items"].as_array().unwrap().len(), 1);
        assert_eq!(detailed["items"][0]["data"]["token"], "REDACTED");

        let lite = format_object(list, DetailLevel::Lite).unwrap();
        assert_eq!(lite["items"][0]["metadata"]["name"], "a");
        assert!(lite["items"][0].get("data").is_none());
    }
}
