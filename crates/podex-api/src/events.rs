// Session event hub
//
// Per-session broadcast topics feeding the WebSocket event channels.
// Events for a given agent are delivered in emission order; ordering
// across agents is unspecified. Topics are created lazily and dropped
// when their last subscriber disconnects and a new emit finds no one
// listening.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use podex_agent::EventSink;
use podex_core::Result;

const TOPIC_CAPACITY: usize = 256;

/// In-process pub/sub hub keyed by session id
#[derive(Default)]
pub struct SessionEventHub {
    topics: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl SessionEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, session_id: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Subscribe to a session's event stream
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Value> {
        self.topic(session_id).subscribe()
    }

    /// Publish one event: `{type, ...payload}`
    pub fn emit_to_session(&self, session_id: &str, event_type: &str, payload: Value) {
        let mut event = json!({"type": event_type});
        if let (Some(target), Some(source)) = (event.as_object_mut(), payload.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }

        let sender = self.topic(session_id);
        if sender.send(event).is_err() {
            // No live subscribers; drop the topic so the map stays bounded
            debug!(session_id = %session_id, "Dropping event for idle session");
            self.topics.lock().unwrap().remove(session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.topics.lock().unwrap().len()
    }
}

#[async_trait]
impl EventSink for SessionEventHub {
    async fn emit(&self, session_id: &str, event_type: &str, payload: Value) -> Result<()> {
        self.emit_to_session(session_id, event_type, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_carry_type_and_payload() {
        let hub = SessionEventHub::new();
        let mut rx = hub.subscribe("sess-1");

        hub.emit_to_session(
            "sess-1",
            "agent_status",
            json!({"agent_id": "a1", "status": "running"}),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "agent_status");
        assert_eq!(event["agent_id"], "a1");
        assert_eq!(event["status"], "running");
    }

    #[tokio::test]
    async fn test_per_session_isolation() {
        let hub = SessionEventHub::new();
        let mut rx1 = hub.subscribe("sess-1");
        let mut rx2 = hub.subscribe("sess-2");

        hub.emit_to_session("sess-1", "workspace_status", json!({"workspace_id": "w1"}));

        assert!(rx1.recv().await.is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emission_order_preserved() {
        let hub = SessionEventHub::new();
        let mut rx = hub.subscribe("sess-1");

        for i in 0..5 {
            hub.emit_to_session("sess-1", "agent_status", json!({"seq": i}));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap()["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_idle_topic_is_dropped() {
        let hub = SessionEventHub::new();
        {
            let _rx = hub.subscribe("sess-1");
        }
        // Subscriber gone: the emit finds no receiver and prunes the topic
        hub.emit_to_session("sess-1", "agent_status", json!({}));
        assert_eq!(hub.session_count(), 0);
    }
}
