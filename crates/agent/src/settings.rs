use std::{path::PathBuf, time::Duration};

use keeper_kubehub::BackoffPolicy;
use keeper_outbound::{BatchConfig, RetryPolicy};

/// Scheduler intervals, counted in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub validate: u64,
    pub poll: u64,
    pub clean_start: u64,
}

impl Default for Intervals {
    fn default() -> Self { Self { validate: 10, poll: 60, clean_start: 1440 } }
}

impl Intervals {
    /// `clean_start >= poll >= validate`
    pub fn is_ordered(&self) -> bool { self.clean_start >= self.poll && self.poll >= self.validate }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Namespace holding the agent's ConfigMaps and, by default, the cluster id.
    pub config_namespace: String,
    pub cluster_name: Option<String>,
    pub intervals: Intervals,
    pub tick: Duration,
    pub start_delay_max: Duration,
    /// Page size for list calls.
    pub page_size: u32,
    pub liveness_file: Option<PathBuf>,
    pub batch: BatchConfig,
    pub retry: RetryPolicy,
    pub backoff: BackoffPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            config_namespace: "kube-system".to_string(),
            cluster_name: None,
            intervals: Intervals::default(),
            tick: Duration::from_secs(60),
            start_delay_max: Duration::from_secs(10 * 60),
            page_size: 500,
            liveness_file: None,
            batch: BatchConfig::default(),
            retry: RetryPolicy::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}
