use std::sync::Arc;

use keeper_kubehub::{cluster_metadata, KubeApi, WatchRegistry};
use keeper_outbound::{Collector, Heartbeat, Messenger, Sender};
use serde_json::{json, Value};
use tracing::error;

use crate::settings::AgentSettings;

/// Logs and forwards cycle failures to the collector's messages endpoint.
#[derive(Clone)]
pub struct Reporter {
    messenger: Messenger,
}

impl Reporter {
    pub fn new(messenger: Messenger) -> Self { Self { messenger } }

    pub async fn error(&self, msg: &str, err: &anyhow::Error) {
        error!(error = %format!("{:#}", err), "{}", msg);
        let data = json!({"error": format!("{:#}", err)});
        if let Err(e) = self.messenger.error(msg, data).await {
            error!(error = %e, "failed to send error message");
        }
    }
}

/// Everything one agent instance shares across cycles.
pub struct AgentContext {
    pub kube: Arc<dyn KubeApi>,
    pub watches: WatchRegistry,
    pub sender: Arc<Sender>,
    pub reporter: Reporter,
    pub heartbeat: Heartbeat,
    pub settings: AgentSettings,
}

impl AgentContext {
    pub fn new(kube: Arc<dyn KubeApi>, collector: Arc<dyn Collector>, cluster_id: &str, settings: AgentSettings) -> Self {
        let sender = Arc::new(Sender::new(collector.clone(), cluster_id, settings.batch, settings.retry));
        let messenger = Messenger::new(collector.clone(), Some(cluster_id.to_string()), settings.retry);
        Self {
            watches: WatchRegistry::with_backoff(kube.clone(), settings.backoff),
            kube,
            sender,
            reporter: Reporter::new(messenger),
            heartbeat: Heartbeat::new(collector, cluster_id),
            settings,
        }
    }

    /// Collect cluster metadata and post a heartbeat. Returns the collector's
    /// refresh request.
    pub async fn heartbeat(&self) -> bool {
        let metadata = cluster_metadata(self.kube.as_ref(), self.settings.cluster_name.as_deref()).await;
        self.heartbeat.beat(&Value::Object(metadata)).await
    }
}
