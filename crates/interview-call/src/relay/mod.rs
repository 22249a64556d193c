//! Broker-agnostic message relay
//!
//! The call core never speaks to a realtime broker directly. Everything it
//! needs from one is captured by [`MessageRelay`]: named broadcast channels
//! plus a per-channel presence map. Production deployments back this with a
//! hosted realtime service; tests and the loopback demo use
//! [`InMemoryRelay`].

pub mod memory;

pub use memory::InMemoryRelay;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::Result;

/// Delivery state of a channel subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Subscription confirmed; broadcasts flow in both directions
    Subscribed,
    /// Delivery interrupted; the broker is reconnecting on its own
    Interrupted,
    /// Subscription ended and will not recover
    Closed,
}

impl ChannelStatus {
    /// Display name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "subscribed",
            ChannelStatus::Interrupted => "interrupted",
            ChannelStatus::Closed => "closed",
        }
    }

    /// Whether messages published now can reach other subscribers
    pub fn is_live(&self) -> bool {
        matches!(self, ChannelStatus::Subscribed)
    }
}

/// An event delivered on a subscribed channel
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A broadcast published by some subscriber (possibly the local one;
    /// the relay does not filter echoes)
    Broadcast {
        /// Application-level event name
        event: String,
        /// Decoded JSON payload
        payload: Value,
    },

    /// Full presence state of the channel, keyed by participant
    ///
    /// Sent after subscribing and again whenever any participant tracks or
    /// untracks. Receivers rebuild their view from each snapshot rather
    /// than applying deltas.
    PresenceSync {
        /// All tracked payloads per presence key
        state: HashMap<String, Vec<Value>>,
    },

    /// The subscription's delivery state changed
    StatusChanged(ChannelStatus),
}

/// Live subscription to one relay channel
///
/// Dropping the subscription detaches it from the channel; the relay stops
/// delivering and forgets the subscriber.
pub struct RelaySubscription {
    channel: String,
    events: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelaySubscription {
    /// Create a subscription from its receiving half
    ///
    /// Relay implementations call this; consumers only ever receive.
    pub fn new(channel: impl Into<String>, events: mpsc::UnboundedReceiver<RelayEvent>) -> Self {
        Self {
            channel: channel.into(),
            events,
        }
    }

    /// Name of the subscribed channel
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next event, or `None` once the relay side is gone
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Receive without waiting; `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        self.events.try_recv().ok()
    }
}

impl std::fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Session-scoped broadcast channels with presence
///
/// Implementations must fan a published broadcast out to every subscriber of
/// the channel, including the publisher's own subscription. Filtering out
/// the echo is the consumer's job; the relay has no notion of sender
/// identity beyond the presence key.
#[async_trait]
pub trait MessageRelay: Send + Sync {
    /// Subscribe to a channel
    ///
    /// Delivery starts with a `StatusChanged(Subscribed)` event followed by
    /// a presence snapshot of whoever is already tracked on the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker refuses the subscription.
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription>;

    /// Publish a broadcast event to all subscribers of a channel
    ///
    /// Publishing to a channel nobody is subscribed to succeeds and delivers
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the publish.
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<()>;

    /// Publish or replace the caller's presence payload on a channel
    ///
    /// Triggers a fresh presence snapshot to every subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the update.
    async fn track_presence(&self, channel: &str, key: &str, payload: Value) -> Result<()>;

    /// Withdraw the caller's presence payload from a channel
    ///
    /// Unknown keys are ignored. Triggers a fresh presence snapshot when the
    /// key was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the update.
    async fn untrack_presence(&self, channel: &str, key: &str) -> Result<()>;
}
