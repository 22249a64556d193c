//! In-process message relay
//!
//! Backs tests and the loopback demo. All channels live in one process;
//! delivery is immediate and ordered per channel. Like a real broker, a
//! broadcast is echoed back to the publisher's own subscription.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use super::{ChannelStatus, MessageRelay, RelayEvent, RelaySubscription};
use crate::Result;

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<mpsc::UnboundedSender<RelayEvent>>,
    presence: HashMap<String, Vec<Value>>,
}

impl ChannelState {
    /// Deliver an event to every live subscriber, forgetting dead ones
    fn fanout(&mut self, event: RelayEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn sync_snapshot(&self) -> RelayEvent {
        RelayEvent::PresenceSync {
            state: self.presence.clone(),
        }
    }
}

/// Relay where every channel lives in process memory
///
/// Cheap to clone; clones share the same channel space, so two call sessions
/// holding clones of one relay can signal each other.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
}

impl InMemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a channel
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.channels.lock().await;
        match channels.get_mut(channel) {
            Some(state) => {
                state.subscribers.retain(|tx| !tx.is_closed());
                state.subscribers.len()
            }
            None => 0,
        }
    }

    /// Push a delivery-state change to every subscriber of a channel
    ///
    /// Real brokers emit these when their connection degrades; here the
    /// caller decides, which lets tests exercise interruption handling.
    pub async fn set_channel_status(&self, channel: &str, status: ChannelStatus) {
        let mut channels = self.channels.lock().await;
        if let Some(state) = channels.get_mut(channel) {
            state.fanout(RelayEvent::StatusChanged(status));
        }
    }
}

#[async_trait]
impl MessageRelay for InMemoryRelay {
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = self.channels.lock().await;
        let state = channels.entry(channel.to_string()).or_default();

        // New subscribers hear their own confirmation and the current
        // presence state before any subsequent traffic.
        let _ = tx.send(RelayEvent::StatusChanged(ChannelStatus::Subscribed));
        let _ = tx.send(state.sync_snapshot());

        state.subscribers.push(tx);
        trace!(channel, subscribers = state.subscribers.len(), "subscribed");

        Ok(RelaySubscription::new(channel, rx))
    }

    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<()> {
        let mut channels = self.channels.lock().await;
        if let Some(state) = channels.get_mut(channel) {
            trace!(channel, event, "publishing broadcast");
            state.fanout(RelayEvent::Broadcast {
                event: event.to_string(),
                payload,
            });
        }
        Ok(())
    }

    async fn track_presence(&self, channel: &str, key: &str, payload: Value) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let state = channels.entry(channel.to_string()).or_default();
        state.presence.insert(key.to_string(), vec![payload]);
        trace!(channel, key, "presence tracked");

        let snapshot = state.sync_snapshot();
        state.fanout(snapshot);
        Ok(())
    }

    async fn untrack_presence(&self, channel: &str, key: &str) -> Result<()> {
        let mut channels = self.channels.lock().await;
        if let Some(state) = channels.get_mut(channel) {
            if state.presence.remove(key).is_some() {
                trace!(channel, key, "presence untracked");
                let snapshot = state.sync_snapshot();
                state.fanout(snapshot);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_emits_status_then_snapshot() {
        let relay = InMemoryRelay::new();
        let mut sub = relay.subscribe("room-1").await.unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::StatusChanged(status) => assert_eq!(status, ChannelStatus::Subscribed),
            other => panic!("expected status event, got {:?}", other),
        }
        match sub.recv().await.unwrap() {
            RelayEvent::PresenceSync { state } => assert!(state.is_empty()),
            other => panic!("expected presence sync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers_including_publisher() {
        let relay = InMemoryRelay::new();
        let mut a = relay.subscribe("room-1").await.unwrap();
        let mut b = relay.subscribe("room-1").await.unwrap();

        // Drain the subscription preamble
        for sub in [&mut a, &mut b] {
            sub.recv().await.unwrap();
            sub.recv().await.unwrap();
        }

        relay
            .publish("room-1", "signal", json!({"n": 1}))
            .await
            .unwrap();

        for sub in [&mut a, &mut b] {
            match sub.recv().await.unwrap() {
                RelayEvent::Broadcast { event, payload } => {
                    assert_eq!(event, "signal");
                    assert_eq!(payload, json!({"n": 1}));
                }
                other => panic!("expected broadcast, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let relay = InMemoryRelay::new();
        relay
            .publish("nowhere", "signal", json!(null))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_presence_track_and_untrack() {
        let relay = InMemoryRelay::new();
        let mut sub = relay.subscribe("room-1").await.unwrap();
        sub.recv().await.unwrap();
        sub.recv().await.unwrap();

        relay
            .track_presence("room-1", "user-a", json!({"role": "interviewer"}))
            .await
            .unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::PresenceSync { state } => {
                assert_eq!(state.len(), 1);
                assert_eq!(state["user-a"], vec![json!({"role": "interviewer"})]);
            }
            other => panic!("expected presence sync, got {:?}", other),
        }

        relay.untrack_presence("room-1", "user-a").await.unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::PresenceSync { state } => assert!(state.is_empty()),
            other => panic!("expected presence sync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_untrack_unknown_key_is_silent() {
        let relay = InMemoryRelay::new();
        let mut sub = relay.subscribe("room-1").await.unwrap();
        sub.recv().await.unwrap();
        sub.recv().await.unwrap();

        relay.untrack_presence("room-1", "ghost").await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_track_replaces_previous_payload() {
        let relay = InMemoryRelay::new();
        relay
            .track_presence("room-1", "user-a", json!({"v": 1}))
            .await
            .unwrap();
        relay
            .track_presence("room-1", "user-a", json!({"v": 2}))
            .await
            .unwrap();

        let mut sub = relay.subscribe("room-1").await.unwrap();
        sub.recv().await.unwrap();
        match sub.recv().await.unwrap() {
            RelayEvent::PresenceSync { state } => {
                assert_eq!(state["user-a"], vec![json!({"v": 2})]);
            }
            other => panic!("expected presence sync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_forgotten() {
        let relay = InMemoryRelay::new();
        let a = relay.subscribe("room-1").await.unwrap();
        let _b = relay.subscribe("room-1").await.unwrap();
        assert_eq!(relay.subscriber_count("room-1").await, 2);

        drop(a);
        assert_eq!(relay.subscriber_count("room-1").await, 1);
    }

    #[tokio::test]
    async fn test_clones_share_channel_space() {
        let relay = InMemoryRelay::new();
        let peer_side = relay.clone();

        let mut sub = relay.subscribe("room-1").await.unwrap();
        sub.recv().await.unwrap();
        sub.recv().await.unwrap();

        peer_side
            .publish("room-1", "signal", json!("hello"))
            .await
            .unwrap();

        match sub.recv().await.unwrap() {
            RelayEvent::Broadcast { payload, .. } => assert_eq!(payload, json!("hello")),
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_injection() {
        let relay = InMemoryRelay::new();
        let mut sub = relay.subscribe("room-1").await.unwrap();
        sub.recv().await.unwrap();
        sub.recv().await.unwrap();

        relay
            .set_channel_status("room-1", ChannelStatus::Interrupted)
            .await;

        match sub.recv().await.unwrap() {
            RelayEvent::StatusChanged(status) => {
                assert_eq!(status, ChannelStatus::Interrupted);
                assert!(!status.is_live());
            }
            other => panic!("expected status event, got {:?}", other),
        }
    }
}
