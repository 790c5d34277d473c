use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::component::merge_dict;
use crate::observer::{ObserverList, Subscription};

/// Default bound on the number of queued changes per component.
pub const DEFAULT_MAX_CHANGES_PER_COMPONENT: usize = 100;

/// A timestamped state patch recorded for one component.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub changed_properties: Map<String, Value>,
}

#[derive(Default)]
struct LogInner {
    queues: BTreeMap<String, VecDeque<(DateTime<Utc>, Map<String, Value>)>>,
    last_update_id: u64,
}

/// Accumulates per-component state deltas until the cloud engine drains
/// them. Every recorded update increments a monotonically increasing update
/// id; subscribers learn which id the server has durably acknowledged.
pub struct StateChangeLog {
    inner: Mutex<LogInner>,
    max_per_component: usize,
    server_acked: ObserverList<u64>,
}

impl Default for StateChangeLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_CHANGES_PER_COMPONENT)
    }
}

impl StateChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_per_component: usize) -> Self {
        StateChangeLog {
            inner: Mutex::new(LogInner::default()),
            max_per_component: max_per_component.max(2),
            server_acked: ObserverList::new(),
        }
    }

    /// Record a state delta for `component`. Returns the new update id.
    ///
    /// When a component's queue exceeds its bound, the two oldest entries
    /// are merged by key-wise union (newer values win, the earlier timestamp
    /// is kept) until the queue fits again.
    pub fn record(
        &self,
        component: &str,
        timestamp: DateTime<Utc>,
        patch: Map<String, Value>,
    ) -> u64 {
        let mut inner = self.lock();
        inner.last_update_id += 1;
        let id = inner.last_update_id;
        let max = self.max_per_component;
        let queue = inner.queues.entry(component.to_string()).or_default();
        queue.push_back((timestamp, patch));
        while queue.len() > max {
            // Both pops succeed: len > max >= 2.
            let (Some((ts0, mut oldest)), Some((_, second))) =
                (queue.pop_front(), queue.pop_front())
            else {
                break;
            };
            merge_dict(&mut oldest, &second);
            queue.push_front((ts0, oldest));
        }
        id
    }

    /// Take all recorded changes, sorted by timestamp across components,
    /// along with the update id they run up to.
    pub fn drain(&self) -> (u64, Vec<StateChange>) {
        let mut inner = self.lock();
        let mut changes: Vec<StateChange> = Vec::new();
        for (component, queue) in std::mem::take(&mut inner.queues) {
            for (timestamp, changed_properties) in queue {
                changes.push(StateChange {
                    timestamp,
                    component: component.clone(),
                    changed_properties,
                });
            }
        }
        changes.sort_by_key(|c| c.timestamp);
        (inner.last_update_id, changes)
    }

    pub fn last_update_id(&self) -> u64 {
        self.lock().last_update_id
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queues.is_empty()
    }

    /// Announce that changes up through `update_id` are durable on the
    /// server.
    pub fn notify_updated_on_server(&self, update_id: u64) {
        self.server_acked.notify(&update_id);
    }

    /// Subscribe to server acknowledgements. A subscriber added while the
    /// log is empty is immediately told the current update id.
    pub fn on_server_ack(
        &self,
        callback: impl Fn(&u64) + Send + Sync + 'static,
    ) -> Subscription {
        let current = {
            let inner = self.lock();
            inner.queues.is_empty().then_some(inner.last_update_id)
        };
        if let Some(id) = current {
            callback(&id);
        }
        self.server_acked.add(callback)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn update_ids_are_monotonic() {
        let log = StateChangeLog::new();
        let t = Utc::now();
        assert_eq!(log.record("a", t, props(json!({"t.p": 1}))), 1);
        assert_eq!(log.record("b", t, props(json!({"t.p": 2}))), 2);
        let (id, changes) = log.drain();
        assert_eq!(id, 2);
        assert_eq!(changes.len(), 2);
        assert!(log.is_empty());
        // Changes recorded after a drain get larger ids.
        assert_eq!(log.record("a", t, props(json!({"t.p": 3}))), 3);
    }

    #[test]
    fn drain_sorts_across_components_by_timestamp() {
        let log = StateChangeLog::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let t2 = t0 + chrono::Duration::seconds(2);
        log.record("b", t1, props(json!({"x": 1})));
        log.record("a", t2, props(json!({"y": 2})));
        log.record("a", t0, props(json!({"z": 3})));

        let (_, changes) = log.drain();
        let order: Vec<&str> = changes.iter().map(|c| c.component.as_str()).collect();
        assert_eq!(order, ["a", "b", "a"]);
    }

    #[test]
    fn overflow_merges_oldest_pair() {
        let log = StateChangeLog::with_capacity(2);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let t2 = t0 + chrono::Duration::seconds(2);
        log.record("a", t0, props(json!({"p": 1, "q": 1})));
        log.record("a", t1, props(json!({"p": 2})));
        log.record("a", t2, props(json!({"r": 3})));

        let (_, changes) = log.drain();
        assert_eq!(changes.len(), 2);
        // Oldest two merged; the newer value of "p" won, the earlier
        // timestamp survived.
        assert_eq!(changes[0].timestamp, t0);
        assert_eq!(
            Value::Object(changes[0].changed_properties.clone()),
            json!({"p": 2, "q": 1})
        );
        assert_eq!(changes[1].timestamp, t2);
    }

    #[test]
    fn empty_log_acks_subscribers_immediately() {
        let log = StateChangeLog::new();
        let t = Utc::now();
        log.record("a", t, props(json!({"p": 1})));
        log.drain();

        let seen = std::sync::Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let _sub = log.on_server_ack(move |id| {
            *seen2.lock().unwrap() = Some(*id);
        });
        assert_eq!(*seen.lock().unwrap(), Some(1));
    }

    #[test]
    fn non_empty_log_defers_ack() {
        let log = StateChangeLog::new();
        log.record("a", Utc::now(), props(json!({"p": 1})));

        let seen = std::sync::Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let _sub = log.on_server_ack(move |id| {
            *seen2.lock().unwrap() = Some(*id);
        });
        assert_eq!(*seen.lock().unwrap(), None);

        log.notify_updated_on_server(1);
        assert_eq!(*seen.lock().unwrap(), Some(1));
    }
}
