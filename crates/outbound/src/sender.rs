//! Resource sender: per-cycle dedup in front of the batcher, plus the SYNC
//! checkpoint that closes a poll cycle.

use std::sync::{Arc, Mutex, MutexGuard};

use keeper_core::{LegacySync, OutboundEvent, ResourceIdentity, SyncCheckpoint};
use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    batcher::{BatchConfig, Batcher},
    collector::{deliver, Collector, DeliveryError, RetryPolicy},
};

/// Identities already sent this cycle, in first-sent order.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: FxHashSet<ResourceIdentity>,
    order: Vec<ResourceIdentity>,
}

impl DedupSet {
    /// Returns `true` the first time an identity is seen.
    pub fn insert(&mut self, id: ResourceIdentity) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        self.seen.insert(id.clone());
        self.order.push(id);
        true
    }

    pub fn contains(&self, id: &ResourceIdentity) -> bool { self.seen.contains(id) }
    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn ids(&self) -> &[ResourceIdentity] { &self.order }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

pub struct Sender {
    batcher: Batcher,
    collector: Arc<dyn Collector>,
    retry: RetryPolicy,
    cluster_id: String,
    dedup: Mutex<DedupSet>,
}

impl Sender {
    pub fn new(collector: Arc<dyn Collector>, cluster_id: &str, config: BatchConfig, retry: RetryPolicy) -> Self {
        let batcher = Batcher::new(collector.clone(), format!("clusters/{}/resources", cluster_id), config, retry);
        Self { batcher, collector, retry, cluster_id: cluster_id.to_string(), dedup: Mutex::new(DedupSet::default()) }
    }

    fn dedup(&self) -> MutexGuard<'_, DedupSet> { self.dedup.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn max_items(&self) -> usize { self.batcher.max_items() }

    /// Distinct identities sent since the last reset.
    pub fn resource_count(&self) -> usize { self.dedup().len() }

    /// Queue events not yet sent this cycle. Events without an identity always
    /// pass. Returns how many were queued.
    pub fn send(&self, events: Vec<OutboundEvent>) -> usize {
        let fresh: Vec<OutboundEvent> = {
            let mut dedup = self.dedup();
            events
                .into_iter()
                .filter(|e| match e.identity() {
                    Some(id) => dedup.insert(id),
                    None => true,
                })
                .collect()
        };
        let n = fresh.len();
        self.batcher.send(fresh.iter().filter_map(encode).collect());
        n
    }

    /// Queue a watch event. Watch traffic bypasses dedup.
    pub fn forward(&self, event: OutboundEvent) {
        if let Some(v) = encode(&event) {
            self.batcher.send(vec![v]);
        }
    }

    pub fn flush(&self) { self.batcher.flush(); }

    /// Wait for batches already handed to the collector.
    pub async fn drain(&self) { self.batcher.drain().await; }

    pub fn reset(&self) { self.dedup().clear(); }

    /// Flush, wait for in-flight batches, then post the SYNC checkpoint. A
    /// 404 from `resources/sync` falls back to the legacy identity list on
    /// `resources`. The dedup set is reset whatever the outcome.
    pub async fn send_poll_complete(&self) -> Result<u16, DeliveryError> {
        self.batcher.flush();
        self.batcher.drain().await;
        let (count, ids) = {
            let d = self.dedup();
            (d.len(), d.ids().to_vec())
        };
        let result = self.post_sync(count, ids).await;
        self.reset();
        match &result {
            Ok(status) => info!(count, status, "SYNC posted"),
            Err(e) => warn!(count, error = %e, "SYNC failed"),
        }
        result
    }

    async fn post_sync(&self, count: usize, ids: Vec<ResourceIdentity>) -> Result<u16, DeliveryError> {
        let body = serde_json::to_value(SyncCheckpoint::new(count)).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        let path = format!("clusters/{}/resources/sync", self.cluster_id);
        let status = deliver(self.collector.as_ref(), &self.retry, &path, &body).await?;
        if status != 404 {
            return Ok(status);
        }
        debug!("sync endpoint not found; sending identity list to resources");
        let legacy = serde_json::to_value(vec![LegacySync::new(ids)]).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        let path = format!("clusters/{}/resources", self.cluster_id);
        deliver(self.collector.as_ref(), &self.retry, &path, &legacy).await
    }
}

fn encode(event: &OutboundEvent) -> Option<Value> {
    match serde_json::to_value(event) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "dropping unencodable event");
            None
        }
    }
}
