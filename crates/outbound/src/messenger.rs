//! Operator-visible messages and the cluster heartbeat.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::collector::{deliver, Collector, DeliveryError, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageLevel {
    Error,
    Warn,
    Info,
}

/// Posts `{level, message, data}` to the collector's messages endpoint.
#[derive(Clone)]
pub struct Messenger {
    collector: Arc<dyn Collector>,
    cluster_id: Option<String>,
    retry: RetryPolicy,
}

impl Messenger {
    /// Without a cluster id, messages go to the unscoped `messages` endpoint.
    pub fn new(collector: Arc<dyn Collector>, cluster_id: Option<String>, retry: RetryPolicy) -> Self {
        Self { collector, cluster_id, retry }
    }

    fn path(&self) -> String {
        match &self.cluster_id {
            Some(id) => format!("clusters/{}/messages", id),
            None => "messages".to_string(),
        }
    }

    pub async fn message(&self, level: MessageLevel, msg: &str, data: Value) -> Result<u16, DeliveryError> {
        let body = json!({"level": level, "message": msg, "data": data});
        deliver(self.collector.as_ref(), &self.retry, &self.path(), &body).await
    }

    pub async fn error(&self, msg: &str, data: Value) -> Result<u16, DeliveryError> {
        self.message(MessageLevel::Error, msg, data).await
    }

    pub async fn warn(&self, msg: &str, data: Value) -> Result<u16, DeliveryError> {
        self.message(MessageLevel::Warn, msg, data).await
    }

    pub async fn info(&self, msg: &str, data: Value) -> Result<u16, DeliveryError> {
        self.message(MessageLevel::Info, msg, data).await
    }
}

/// Heartbeat to `clusters/{id}`. No retries; the next tick is the retry.
#[derive(Clone)]
pub struct Heartbeat {
    collector: Arc<dyn Collector>,
    cluster_id: String,
}

impl Heartbeat {
    pub fn new(collector: Arc<dyn Collector>, cluster_id: &str) -> Self {
        Self { collector, cluster_id: cluster_id.to_string() }
    }

    /// Returns `true` when the collector asks for a fresh poll (HTTP 205).
    pub async fn beat(&self, metadata: &Value) -> bool {
        info!(cluster = %self.cluster_id, "sending heartbeat");
        match self.collector.post(&format!("clusters/{}", self.cluster_id), metadata).await {
            Ok(205) => true,
            Ok(200) => false,
            Ok(status) => {
                error!(status, "heartbeat rejected");
                false
            }
            Err(e) => {
                error!(error = %e, "heartbeat failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCollector, MockReply};

    #[tokio::test]
    async fn heartbeat_status_mapping() {
        let c = Arc::new(MockCollector::new());
        let hb = Heartbeat::new(c.clone(), "c1");
        c.script("clusters/c1", vec![MockReply::Status(205), MockReply::Status(200), MockReply::Status(500), MockReply::Transport]);
        let md = json!({"name": "prod"});
        assert!(hb.beat(&md).await);
        assert!(!hb.beat(&md).await);
        assert!(!hb.beat(&md).await);
        assert!(!hb.beat(&md).await);
        assert_eq!(c.posts_to("clusters/c1")[0], md);
    }

    #[tokio::test]
    async fn messages_scope_to_cluster_when_known() {
        let c = Arc::new(MockCollector::new());
        let scoped = Messenger::new(c.clone(), Some("c1".into()), RetryPolicy::default());
        scoped.error("poll failed", json!({"pass": 2})).await.unwrap();
        assert_eq!(
            c.posts_to("clusters/c1/messages"),
            vec![json!({"level": "ERROR", "message": "poll failed", "data": {"pass": 2}})]
        );

        let bare = Messenger::new(c.clone(), None, RetryPolicy::default());
        bare.info("starting", json!({})).await.unwrap();
        assert_eq!(c.posts_to("messages")[0]["level"], "INFO");
    }
}
