//! In-memory [`Collector`] recording every request.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde_json::Value;

use crate::collector::{Collector, DeliveryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReply {
    Status(u16),
    Transport,
}

#[derive(Default)]
struct State {
    requests: Vec<(String, Value)>,
    scripted: HashMap<String, VecDeque<MockReply>>,
    defaults: HashMap<String, u16>,
}

/// Answers 200 unless told otherwise per path.
#[derive(Default)]
pub struct MockCollector {
    state: Mutex<State>,
}

impl MockCollector {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Default status for `path`.
    pub fn respond(&self, path: &str, status: u16) { self.state().defaults.insert(path.to_string(), status); }

    /// Replies consumed in order before falling back to the default.
    pub fn script(&self, path: &str, replies: Vec<MockReply>) {
        self.state().scripted.entry(path.to_string()).or_default().extend(replies);
    }

    pub fn requests(&self) -> Vec<(String, Value)> { self.state().requests.clone() }

    pub fn posts_to(&self, path: &str) -> Vec<Value> {
        self.state().requests.iter().filter(|(p, _)| p == path).map(|(_, b)| b.clone()).collect()
    }

    /// Every event object posted to any `.../resources` path, flattened.
    pub fn resource_events(&self) -> Vec<Value> {
        self.state()
            .requests
            .iter()
            .filter(|(p, _)| p.ends_with("/resources"))
            .filter_map(|(_, b)| b.as_array().cloned())
            .flatten()
            .filter(|e| e.get("type").and_then(Value::as_str) != Some("SYNC"))
            .collect()
    }
}

#[async_trait]
impl Collector for MockCollector {
    async fn post(&self, path: &str, body: &Value) -> Result<u16, DeliveryError> {
        let mut st = self.state();
        st.requests.push((path.to_string(), body.clone()));
        let reply = st.scripted.get_mut(path).and_then(VecDeque::pop_front);
        match reply {
            Some(MockReply::Status(s)) => Ok(s),
            Some(MockReply::Transport) => Err(DeliveryError::Transport("connection refused".into())),
            None => Ok(st.defaults.get(path).copied().unwrap_or(200)),
        }
    }
}
