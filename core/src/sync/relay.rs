//! Relay protocols: notification, island, media, clipboard, status
//!
//! These channels carry payloads produced and consumed outside the core
//! (notification listeners, clipboard capture, media players). The relay
//! checks staleness and duplicates, then hands the decrypted JSON to the
//! consumer behind `EventSink`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::protocol::constants::PAYLOAD_STALENESS;
use crate::protocol::now_millis;
use crate::protocol::wire::DataTag;

/// Consumer of relayed payloads and sync notifications. Implemented by the
/// presentation layer; the core never interprets relay bodies beyond their
/// `time` field.
pub trait EventSink: Send + Sync {
    fn notification(&self, from: Uuid, payload: Value);
    fn super_island(&self, from: Uuid, payload: Value);
    fn media_play(&self, from: Uuid, payload: Value);
    fn media_control(&self, from: Uuid, payload: Value);
    fn clipboard(&self, from: Uuid, payload: Value);
    fn status(&self, from: Uuid, payload: Value);
    fn file_transfer(&self, from: Uuid, payload: Value);
    fn icons_updated(&self, from: Uuid, packages: Vec<String>);
    fn app_list_updated(&self, from: Uuid, count: usize);
}

/// Sink that discards everything. Useful when a consumer only cares about
/// service events, and in tests.
pub struct NullSink;

impl EventSink for NullSink {
    fn notification(&self, _from: Uuid, _payload: Value) {}
    fn super_island(&self, _from: Uuid, _payload: Value) {}
    fn media_play(&self, _from: Uuid, _payload: Value) {}
    fn media_control(&self, _from: Uuid, _payload: Value) {}
    fn clipboard(&self, _from: Uuid, _payload: Value) {}
    fn status(&self, _from: Uuid, _payload: Value) {}
    fn file_transfer(&self, _from: Uuid, _payload: Value) {}
    fn icons_updated(&self, _from: Uuid, _packages: Vec<String>) {}
    fn app_list_updated(&self, _from: Uuid, _count: usize) {}
}

/// Stateless-ish relay dispatch with per-peer duplicate suppression.
pub struct RelayDispatch {
    sink: std::sync::Arc<dyn EventSink>,
    staleness: Duration,
    seen: Mutex<HashMap<Uuid, BTreeSet<u64>>>,
}

impl RelayDispatch {
    pub fn new(sink: std::sync::Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            staleness: PAYLOAD_STALENESS,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Forward one decrypted relay payload to the sink.
    ///
    /// Payloads with a `time` older than the staleness window are dropped;
    /// notification and clipboard payloads are additionally deduplicated by
    /// `(peer, time)` since producers re-emit on reconnect.
    pub fn handle(&self, tag: &DataTag, from: Uuid, payload: Value) {
        let time = payload.get("time").and_then(Value::as_u64).unwrap_or(0);
        let now = now_millis();

        if time > 0 && now.saturating_sub(time) > self.staleness.as_millis() as u64 {
            tracing::debug!(peer = %from, tag = tag.as_header(), time, "stale payload dropped");
            return;
        }

        if time > 0 && matches!(tag, DataTag::Notification | DataTag::Clipboard) {
            let mut seen = self.seen.lock().expect("relay dedup lock poisoned");
            let times = seen.entry(from).or_default();
            if !times.insert(time) {
                tracing::debug!(peer = %from, tag = tag.as_header(), time, "duplicate payload dropped");
                return;
            }
            // Keep the window bounded to the staleness horizon.
            let horizon = now.saturating_sub(self.staleness.as_millis() as u64);
            while let Some(&oldest) = times.iter().next() {
                if oldest >= horizon {
                    break;
                }
                times.remove(&oldest);
            }
        }

        match tag {
            DataTag::Notification => self.sink.notification(from, payload),
            DataTag::SuperIsland => self.sink.super_island(from, payload),
            DataTag::MediaPlay => self.sink.media_play(from, payload),
            DataTag::MediaControl => self.sink.media_control(from, payload),
            DataTag::Clipboard => self.sink.clipboard(from, payload),
            DataTag::Status => self.sink.status(from, payload),
            DataTag::Ftp => self.sink.file_transfer(from, payload),
            other => {
                tracing::debug!(tag = other.as_header(), "tag is not a relay channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSink {
        notifications: Mutex<Vec<(Uuid, Value)>>,
        clipboards: Mutex<usize>,
        statuses: Mutex<usize>,
    }

    impl EventSink for CountingSink {
        fn notification(&self, from: Uuid, payload: Value) {
            self.notifications.lock().unwrap().push((from, payload));
        }
        fn super_island(&self, _from: Uuid, _payload: Value) {}
        fn media_play(&self, _from: Uuid, _payload: Value) {}
        fn media_control(&self, _from: Uuid, _payload: Value) {}
        fn clipboard(&self, _from: Uuid, _payload: Value) {
            *self.clipboards.lock().unwrap() += 1;
        }
        fn status(&self, _from: Uuid, _payload: Value) {
            *self.statuses.lock().unwrap() += 1;
        }
        fn file_transfer(&self, _from: Uuid, _payload: Value) {}
        fn icons_updated(&self, _from: Uuid, _packages: Vec<String>) {}
        fn app_list_updated(&self, _from: Uuid, _count: usize) {}
    }

    #[test]
    fn duplicate_notification_suppressed() {
        let sink = Arc::new(CountingSink::default());
        let relay = RelayDispatch::new(sink.clone());
        let from = Uuid::new_v4();
        let payload = json!({"time": now_millis(), "title": "hi"});

        relay.handle(&DataTag::Notification, from, payload.clone());
        relay.handle(&DataTag::Notification, from, payload);
        assert_eq!(sink.notifications.lock().unwrap().len(), 1);
    }

    #[test]
    fn same_time_from_different_peers_both_pass() {
        let sink = Arc::new(CountingSink::default());
        let relay = RelayDispatch::new(sink.clone());
        let time = now_millis();

        relay.handle(&DataTag::Notification, Uuid::new_v4(), json!({"time": time}));
        relay.handle(&DataTag::Notification, Uuid::new_v4(), json!({"time": time}));
        assert_eq!(sink.notifications.lock().unwrap().len(), 2);
    }

    #[test]
    fn stale_payload_dropped() {
        let sink = Arc::new(CountingSink::default());
        let relay = RelayDispatch::new(sink.clone());
        let old = now_millis() - 10 * 60 * 1000;

        relay.handle(&DataTag::Clipboard, Uuid::new_v4(), json!({"time": old, "text": "x"}));
        assert_eq!(*sink.clipboards.lock().unwrap(), 0);
    }

    #[test]
    fn status_without_time_passes() {
        let sink = Arc::new(CountingSink::default());
        let relay = RelayDispatch::new(sink.clone());

        relay.handle(&DataTag::Status, Uuid::new_v4(), json!({"battery": 42}));
        relay.handle(&DataTag::Status, Uuid::new_v4(), json!({"battery": 42}));
        assert_eq!(*sink.statuses.lock().unwrap(), 2);
    }
}
