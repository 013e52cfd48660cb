//! Delayed batch delivery: items are queued and posted as one array either
//! when the queue fills or when the flush timer fires.

use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use metrics::counter;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::collector::{deliver, Collector, DeliveryError, RetryPolicy};

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_items: usize,
    pub delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self { Self { max_items: 50, delay: Duration::from_secs(1) } }
}

#[derive(Default)]
struct BatchState {
    queue: Vec<Value>,
    timer: Option<(u64, JoinHandle<()>)>,
    timer_gen: u64,
    in_flight: Vec<JoinHandle<()>>,
}

struct Inner {
    collector: Arc<dyn Collector>,
    path: String,
    config: BatchConfig,
    retry: RetryPolicy,
    state: Mutex<BatchState>,
}

fn lock(m: &Mutex<BatchState>) -> MutexGuard<'_, BatchState> { m.lock().unwrap_or_else(|e| e.into_inner()) }

/// Queue of JSON objects posted to one collector path.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<Inner>,
}

impl Batcher {
    pub fn new(collector: Arc<dyn Collector>, path: impl Into<String>, config: BatchConfig, retry: RetryPolicy) -> Self {
        let inner = Inner { collector, path: path.into(), config, retry, state: Mutex::new(BatchState::default()) };
        Self { inner: Arc::new(inner) }
    }

    pub fn max_items(&self) -> usize { self.inner.config.max_items }

    /// Items queued but not yet handed to a delivery.
    pub fn pending(&self) -> usize { lock(&self.inner.state).queue.len() }

    /// Queue items. Flushes at `max_items`, otherwise arms the timer if idle.
    pub fn send(&self, items: Vec<Value>) {
        if items.is_empty() {
            return;
        }
        counter!("keeper_events_queued_total", items.len() as u64);
        let mut st = lock(&self.inner.state);
        st.queue.extend(items);
        if st.queue.len() >= self.inner.config.max_items {
            self.inner.flush_locked(&mut st, true);
        } else if st.timer.is_none() {
            st.timer_gen += 1;
            let gen = st.timer_gen;
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let delay = self.inner.config.delay;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.fire_timer(gen);
                }
            });
            st.timer = Some((gen, handle));
        }
    }

    /// Cancel the timer and post whatever is queued as one batch.
    pub fn flush(&self) {
        let mut st = lock(&self.inner.state);
        self.inner.flush_locked(&mut st, true);
    }

    /// Wait for every delivery started so far.
    pub async fn drain(&self) {
        let handles = std::mem::take(&mut lock(&self.inner.state).in_flight);
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "delivery task failed");
            }
        }
    }
}

impl Inner {
    fn fire_timer(self: &Arc<Self>, gen: u64) {
        let mut st = lock(&self.state);
        // a flush or a newer timer already took over
        if !matches!(st.timer, Some((g, _)) if g == gen) {
            return;
        }
        self.flush_locked(&mut st, false);
    }

    fn flush_locked(self: &Arc<Self>, st: &mut BatchState, cancel_timer: bool) {
        if let Some((_, timer)) = st.timer.take() {
            if cancel_timer {
                timer.abort();
            }
        }
        st.in_flight.retain(|h| !h.is_finished());
        if st.queue.is_empty() {
            return;
        }
        let batch = Value::Array(std::mem::take(&mut st.queue));
        let inner = Arc::clone(self);
        st.in_flight.push(tokio::spawn(async move { inner.post(batch).await }));
    }

    async fn post(&self, batch: Value) {
        let n = batch.as_array().map_or(0, Vec::len);
        let result = deliver(self.collector.as_ref(), &self.retry, &self.path, &batch).await;
        let outcome = outcome(&result);
        counter!("keeper_batches_posted_total", 1u64, "outcome" => outcome);
        match result {
            Ok(status) if outcome == "ok" => info!(count = n, path = %self.path, status, "POST resources successful"),
            Ok(status) => error!(count = n, path = %self.path, status, "POST resources failed"),
            Err(e) => error!(count = n, path = %self.path, error = %e, "POST resources failed"),
        }
    }
}

/// Metric label for a delivery result. Any 2xx is a success.
fn outcome(result: &Result<u16, DeliveryError>) -> &'static str {
    match result {
        Ok(status) if (200..300).contains(status) => "ok",
        Ok(_) => "rejected",
        Err(_) => "error",
    }
}
