//! Keyed registry of long-lived watch connections with reconnect and backoff.

use std::{
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHasher};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    stream::{decode_frames, WatchEvent, WatchFrame},
    transport::{KubeApi, KubeError, ListQuery},
};

/// Callback invoked for every ADDED/MODIFIED/DELETED frame.
pub type WatchHandler = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Reconnect delay after `n` consecutive errors is `step * n`, optionally capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub step: Duration,
    pub cap: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self { Self { step: Duration::from_secs(1), cap: None } }
}

impl BackoffPolicy {
    pub fn delay(&self, errors: u32) -> Duration {
        let d = self.step.saturating_mul(errors);
        match self.cap {
            Some(cap) => d.min(cap),
            None => d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connecting,
    Active,
    Backoff,
    Removed,
}

#[derive(Debug)]
struct ConnStatus {
    state: Mutex<WatchState>,
    errors: AtomicU32,
}

impl ConnStatus {
    fn set(&self, s: WatchState) {
        let mut g = lock(&self.state);
        // removal is terminal
        if *g != WatchState::Removed {
            *g = s;
        }
    }
}

/// One registered watch. Cloned handles share the same connection.
#[derive(Debug)]
pub struct WatchConnection {
    id: u64,
    uri: String,
    query: ListQuery,
    global: bool,
    fingerprint: u64,
    status: Arc<ConnStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub type WatchHandle = Arc<WatchConnection>;

impl WatchConnection {
    pub fn id(&self) -> u64 { self.id }
    pub fn uri(&self) -> &str { &self.uri }
    pub fn query(&self) -> &ListQuery { &self.query }
    pub fn is_global(&self) -> bool { self.global }
    pub fn state(&self) -> WatchState { *lock(&self.status.state) }
    /// Consecutive errors since the last successful open.
    pub fn error_count(&self) -> u32 { self.status.errors.load(Ordering::Relaxed) }

    fn end(&self) {
        *lock(&self.status.state) = WatchState::Removed;
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for WatchConnection {
    fn drop(&mut self) { self.end(); }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

fn fingerprint(query: &ListQuery) -> u64 {
    let mut h = FxHasher::default();
    query.hash(&mut h);
    h.finish()
}

/// Watch connections keyed by collection URI. At most one per URI.
pub struct WatchRegistry {
    api: Arc<dyn KubeApi>,
    backoff: BackoffPolicy,
    next_id: AtomicU64,
    entries: Mutex<FxHashMap<String, WatchHandle>>,
}

impl WatchRegistry {
    pub fn new(api: Arc<dyn KubeApi>) -> Self { Self::with_backoff(api, BackoffPolicy::default()) }

    pub fn with_backoff(api: Arc<dyn KubeApi>, backoff: BackoffPolicy) -> Self {
        Self { api, backoff, next_id: AtomicU64::new(1), entries: Mutex::new(FxHashMap::default()) }
    }

    /// Return the watch for `uri`, starting one if needed.
    ///
    /// A non-global request leaves a live non-global entry alone. Otherwise the
    /// entry is replaced when its global flag or query differs.
    pub fn ensure_watch(&self, uri: &str, query: ListQuery, handler: WatchHandler, global: bool) -> WatchHandle {
        let fp = fingerprint(&query);
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(uri) {
            let unchanged = existing.global == global && existing.fingerprint == fp;
            if (!global && !existing.global) || unchanged {
                return existing.clone();
            }
            info!(uri = %uri, global, "watch selector changed; recreating");
            existing.end();
            entries.remove(uri);
        }
        let conn = self.start(uri, query, handler, global, fp);
        entries.insert(uri.to_string(), conn.clone());
        gauge!("keeper_active_watches", entries.len() as f64);
        conn
    }

    fn start(&self, uri: &str, query: ListQuery, handler: WatchHandler, global: bool, fp: u64) -> WatchHandle {
        let status = Arc::new(ConnStatus { state: Mutex::new(WatchState::Connecting), errors: AtomicU32::new(0) });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run_connection(
            self.api.clone(),
            uri.to_string(),
            query.clone(),
            handler,
            self.backoff,
            status.clone(),
        ));
        debug!(uri = %uri, id, global, "watch started");
        Arc::new(WatchConnection { id, uri: uri.to_string(), query, global, fingerprint: fp, status, task: Mutex::new(Some(task)) })
    }

    /// Tear down the watch for `uri`. Returns whether one existed.
    pub fn remove_watch(&self, uri: &str) -> bool {
        let mut entries = lock(&self.entries);
        let removed = entries.remove(uri);
        gauge!("keeper_active_watches", entries.len() as f64);
        match removed {
            Some(conn) => {
                conn.end();
                debug!(uri = %uri, "watch removed");
                true
            }
            None => false,
        }
    }

    pub fn remove_all_watches(&self) {
        let mut entries = lock(&self.entries);
        let n = entries.len();
        for (_, conn) in entries.drain() {
            conn.end();
        }
        gauge!("keeper_active_watches", 0.0);
        info!(count = n, "all watches removed");
    }

    pub fn get_watch(&self, uri: &str) -> Option<WatchHandle> { lock(&self.entries).get(uri).cloned() }

    pub fn len(&self) -> usize { lock(&self.entries).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Snapshot of registered URIs.
    pub fn uris(&self) -> Vec<String> { lock(&self.entries).keys().cloned().collect() }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        for (_, conn) in lock(&self.entries).drain() {
            conn.end();
        }
    }
}

async fn run_connection(
    api: Arc<dyn KubeApi>,
    uri: String,
    query: ListQuery,
    handler: WatchHandler,
    backoff: BackoffPolicy,
    status: Arc<ConnStatus>,
) {
    loop {
        status.set(WatchState::Connecting);
        let failure = match api.watch(&uri, &query).await {
            Ok(bytes) => {
                status.errors.store(0, Ordering::Relaxed);
                status.set(WatchState::Active);
                consume(decode_frames(bytes), &handler).await
            }
            Err(e) => Some(e),
        };
        let Some(err) = failure else {
            debug!(uri = %uri, "watch stream closed; re-watching");
            continue;
        };
        let errors = status.errors.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = backoff.delay(errors);
        counter!("keeper_watch_errors_total", 1u64);
        warn!(uri = %uri, errors, delay_ms = delay.as_millis() as u64, error = %err, "watch errored; backing off");
        status.set(WatchState::Backoff);
        tokio::time::sleep(delay).await;
    }
}

// Feeds events to the handler until the stream ends (None) or fails.
async fn consume<S>(frames: S, handler: &WatchHandler) -> Option<KubeError>
where
    S: Stream<Item = Result<WatchFrame, KubeError>>,
{
    futures::pin_mut!(frames);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(WatchFrame::Event(ev)) => handler(ev),
            Ok(WatchFrame::Bookmark) => {}
            Ok(WatchFrame::Error(obj)) => {
                let code = obj.get("code").and_then(|c| c.as_u64()).unwrap_or(0) as u16;
                let message = obj.get("message").and_then(|m| m.as_str()).unwrap_or("watch error event").to_string();
                return Some(KubeError::Status { code, message });
            }
            Err(e) => return Some(e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockKube, WatchScript};
    use serde_json::json;

    fn noop() -> WatchHandler { Arc::new(|_| {}) }

    #[test]
    fn backoff_is_linear_and_optionally_capped() {
        let p = BackoffPolicy::default();
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(7), Duration::from_secs(7));
        let capped = BackoffPolicy { cap: Some(Duration::from_secs(5)), ..p };
        assert_eq!(capped.delay(30), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_watch_is_idempotent_for_namespaced_watches() {
        let mock = Arc::new(MockKube::new());
        let reg = WatchRegistry::new(mock.clone());
        let q = ListQuery::default().labels("razee/watch-resource in (true)");
        let a = reg.ensure_watch("/api/v1/pods", q.clone(), noop(), false);
        let b = reg.ensure_watch("/api/v1/pods", ListQuery::default(), noop(), false);
        assert_eq!(a.id(), b.id());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mock.watch_calls("/api/v1/pods"), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(a.state(), WatchState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn global_watch_recreated_on_selector_change() {
        let mock = Arc::new(MockKube::new());
        let reg = WatchRegistry::new(mock.clone());
        let a = reg.ensure_watch("/api/v1/nodes", ListQuery::default(), noop(), true);
        let same = reg.ensure_watch("/api/v1/nodes", ListQuery::default(), noop(), true);
        assert_eq!(a.id(), same.id());

        let b = reg.ensure_watch("/api/v1/nodes", ListQuery::default().labels("tier=infra"), noop(), true);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), WatchState::Removed);
        assert_eq!(reg.get_watch("/api/v1/nodes").map(|w| w.id()), Some(b.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_handler_and_clean_close_reconnects() {
        let mock = Arc::new(MockKube::new());
        mock.script_watch(
            "/api/v1/configmaps",
            WatchScript::Frames(vec![
                json!({"type": "ADDED", "object": {"kind": "ConfigMap", "metadata": {"name": "a"}}}),
                json!({"type": "BOOKMARK", "object": {}}),
                json!({"type": "DELETED", "object": {"kind": "ConfigMap", "metadata": {"name": "a"}}}),
            ]),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reg = WatchRegistry::new(mock.clone());
        let h = reg.ensure_watch(
            "/api/v1/configmaps",
            ListQuery::default(),
            Arc::new(move |ev: WatchEvent| sink.lock().unwrap().push(ev.event_type)),
            false,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["ADDED", "DELETED"]);
        // closed cleanly, so a second watch was opened without waiting
        assert_eq!(mock.watch_calls("/api/v1/configmaps"), 2);
        assert_eq!(h.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_back_off_linearly() {
        let mock = Arc::new(MockKube::new());
        for _ in 0..5 {
            mock.script_watch("/api/v1/secrets", WatchScript::Fail(500));
        }
        let reg = WatchRegistry::new(mock.clone());
        let h = reg.ensure_watch("/api/v1/secrets", ListQuery::default(), noop(), false);
        // attempts at t=0, 1s, 3s; the next is due at 6s
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(mock.watch_calls("/api/v1/secrets"), 3);
        assert_eq!(h.error_count(), 3);
        assert_eq!(h.state(), WatchState::Backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_error_count() {
        let mock = Arc::new(MockKube::new());
        mock.script_watch("/api/v1/services", WatchScript::Fail(503));
        mock.script_watch("/api/v1/services", WatchScript::Fail(503));
        let reg = WatchRegistry::new(mock.clone());
        let h = reg.ensure_watch("/api/v1/services", ListQuery::default(), noop(), false);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(mock.watch_calls("/api/v1/services"), 3);
        assert_eq!(h.error_count(), 0);
        assert_eq!(h.state(), WatchState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_counts_as_failure() {
        let mock = Arc::new(MockKube::new());
        mock.script_watch(
            "/api/v1/events",
            WatchScript::Frames(vec![json!({"type": "ERROR", "object": {"kind": "Status", "code": 410, "message": "too old"}})]),
        );
        let reg = WatchRegistry::new(mock.clone());
        let h = reg.ensure_watch("/api/v1/events", ListQuery::default(), noop(), false);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.error_count(), 1);
        assert_eq!(h.state(), WatchState::Backoff);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(mock.watch_calls("/api/v1/events"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_and_remove_all() {
        let mock = Arc::new(MockKube::new());
        let reg = WatchRegistry::new(mock.clone());
        let a = reg.ensure_watch("/api/v1/pods", ListQuery::default(), noop(), false);
        reg.ensure_watch("/apis/apps/v1/deployments", ListQuery::default(), noop(), false);
        assert!(reg.remove_watch("/api/v1/pods"));
        assert!(!reg.remove_watch("/api/v1/pods"));
        assert_eq!(a.state(), WatchState::Removed);
        assert_eq!(reg.uris(), vec!["/apis/apps/v1/deployments".to_string()]);
        reg.remove_all_watches();
        assert!(reg.is_empty());
    }
}
