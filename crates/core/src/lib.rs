//! watch-keeper core types: detail levels, resource identities, outbound events
//! and the redaction pipeline applied before anything leaves the cluster.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod redact;

pub use redact::{format, format_object, Payload};

/// Label that opts an object (or a whole namespace) into reporting.
pub const WATCH_LABEL: &str = "razee/watch-resource";

/// Label selecting ConfigMaps whose data is merged into heartbeat metadata.
pub const CLUSTER_META_LABEL: &str = "razee/cluster-metadata";

const DETAIL_SYNONYMS: &[&str] = &["heavy", "detail", "Detail", "detailed"];
const LITE_SYNONYMS: &[&str] = &["lite", "Lite", "light", "brief"];

/// How much of an object survives the redaction pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DetailLevel {
    /// Unmodified passthrough.
    Debug,
    /// Full object with secrets and env values redacted.
    Detailed,
    /// kind + apiVersion + metadata + status, redacted.
    Lite,
    /// Not transmitted at all.
    Omit,
}

impl DetailLevel {
    /// Parse a label value. Unknown values fall back to `Lite`.
    pub fn from_label(value: &str) -> Self {
        let v = value.trim();
        if v == "debug" {
            DetailLevel::Debug
        } else if DETAIL_SYNONYMS.contains(&v) {
            DetailLevel::Detailed
        } else if matches!(v, "false" | "none" | "omit") {
            DetailLevel::Omit
        } else {
            DetailLevel::Lite
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetailLevel::Debug => "debug",
            DetailLevel::Detailed => "detail",
            DetailLevel::Lite => "lite",
            DetailLevel::Omit => "omit",
        }
    }
}

impl Default for DetailLevel {
    fn default() -> Self { DetailLevel::Lite }
}

impl std::fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Label selector matching every value that opts an object in.
pub fn watch_label_selector() -> String {
    let mut values = vec!["true", "debug"];
    values.extend_from_slice(LITE_SYNONYMS);
    values.extend_from_slice(DETAIL_SYNONYMS);
    format!("{} in ({})", WATCH_LABEL, values.join(","))
}

/// Label value on the object itself, if any.
pub fn label_value<'a>(obj: &'a Value, label: &str) -> Option<&'a str> {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(label))
        .and_then(|v| v.as_str())
}

/// Stable reference to one cluster object, used as the per-cycle dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIdentity(String);

impl ResourceIdentity {
    /// Prefer the server-provided selfLink; otherwise build
    /// `group/version/Kind[/namespace]/name` from the object itself.
    pub fn from_object(obj: &Value) -> Option<Self> {
        let meta = obj.get("metadata")?;
        if let Some(link) = meta.get("selfLink").and_then(|v| v.as_str()) {
            if !link.is_empty() {
                return Some(Self(link.to_string()));
            }
        }
        let name = meta.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?;
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        let key = match meta.get("namespace").and_then(|v| v.as_str()) {
            Some(ns) if !ns.is_empty() => format!("{}/{}/{}/{}", api_version, kind, ns, name),
            _ => format!("{}/{}/{}", api_version, kind, name),
        };
        Some(Self(key))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Outbound event type as the collector sees it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Polled,
    Added,
    Modified,
    Deleted,
}

impl EventKind {
    /// Map a Kubernetes watch event type. BOOKMARK/ERROR are not reportable.
    pub fn from_watch_type(t: &str) -> Option<Self> {
        match t {
            "ADDED" => Some(EventKind::Added),
            "MODIFIED" => Some(EventKind::Modified),
            "DELETED" => Some(EventKind::Deleted),
            _ => None,
        }
    }
}

/// A transmit-ready object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub object: Value,
}

impl OutboundEvent {
    pub fn polled(object: Value) -> Self { Self { kind: EventKind::Polled, object } }

    pub fn identity(&self) -> Option<ResourceIdentity> { ResourceIdentity::from_object(&self.object) }
}

/// End-of-cycle checkpoint posted to `resources/sync`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCheckpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: usize,
}

impl SyncCheckpoint {
    pub fn new(count: usize) -> Self { Self { kind: "SYNC".to_string(), count } }
}

/// Legacy checkpoint shape: the identity list itself, posted to `resources`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegacySync {
    #[serde(rename = "type")]
    pub kind: String,
    pub object: Vec<ResourceIdentity>,
}

impl LegacySync {
    pub fn new(object: Vec<ResourceIdentity>) -> Self { Self { kind: "SYNC".to_string(), object } }
}

pub mod prelude {
    pub use super::{DetailLevel, EventKind, OutboundEvent, Payload, ResourceIdentity, SyncCheckpoint};
}
