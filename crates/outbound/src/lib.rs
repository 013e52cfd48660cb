//! watch-keeper outbound – everything that leaves the cluster: batched
//! resource events, SYNC checkpoints, messages and heartbeats.

#![forbid(unsafe_code)]

pub mod batcher;
pub mod collector;
pub mod messenger;
pub mod mock;
pub mod sender;

pub use batcher::{BatchConfig, Batcher};
pub use collector::{deliver, Collector, DeliveryError, HttpCollector, RetryPolicy, ORG_KEY_HEADER};
pub use messenger::{Heartbeat, MessageLevel, Messenger};
pub use sender::{DedupSet, Sender};
