//! watch-keeper agent – the reconciliation engine. Keeps watches on labelled
//! resources, sweeps the cluster on a schedule and closes every complete
//! sweep with a SYNC checkpoint.

#![forbid(unsafe_code)]

pub mod cluster_config;
pub mod context;
pub mod poll;
pub mod scheduler;
pub mod settings;
pub mod watch;

pub use cluster_config::{load_cluster_config, ClusterConfig, NonNamespacedConfig, ResourceFilter};
pub use context::{AgentContext, Reporter};
pub use poll::{create_polled_events, poll, trim_resources};
pub use scheduler::{run, tick, Scheduler, TickPlan};
pub use settings::{AgentSettings, Intervals};
pub use watch::{validate_watches, watch_handler};
