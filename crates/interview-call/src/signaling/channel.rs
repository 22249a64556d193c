//! Signaling channel adapter
//!
//! Wraps one relay channel as a typed signaling stream scoped to a single
//! session. The adapter decodes inbound payloads, drops the local
//! participant's own echoes before anyone sees them, and swallows sends
//! attempted before the subscription is confirmed, since a broadcast
//! nobody can hear yet is indistinguishable from a lost one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::relay::{ChannelStatus, MessageRelay, RelayEvent, RelaySubscription};
use crate::signaling::message::{SessionIdentity, SignalingMessage};
use crate::{Error, Result};

/// Broadcast event name carrying signaling messages
const SIGNAL_EVENT: &str = "signal";

/// Events delivered by an open signaling channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// A decoded message from the remote participant
    Message(SignalingMessage),
    /// The subscription's delivery state changed
    Status(ChannelStatus),
}

/// One session's typed signaling channel
///
/// Created per connection attempt and discarded with it. Cheap to share;
/// the engine holds it in an `Arc` and clones that into send tasks.
pub struct SignalingChannel {
    relay: Arc<dyn MessageRelay>,
    name: String,
    open: Arc<AtomicBool>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Subscribe to the session's signaling channel
    ///
    /// Returns the channel plus the stream of decoded events. The channel
    /// is not sendable until a `Status(Subscribed)` event has been
    /// delivered; sends before that are silently dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay refuses the subscription.
    pub async fn open(
        relay: Arc<dyn MessageRelay>,
        identity: SessionIdentity,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let name = identity.signaling_channel();
        let subscription = relay.subscribe(&name).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let open = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_events(
            subscription,
            events_tx,
            identity.participant_id.clone(),
            Arc::clone(&open),
        ));

        let channel = Arc::new(Self {
            relay,
            name,
            open,
            closed: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        });

        Ok((channel, events_rx))
    }

    /// Name of the underlying relay channel
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the subscription has been confirmed and not closed
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// Broadcast a signaling message to the session
    ///
    /// A send before the subscription is confirmed, or after the channel
    /// was closed, is dropped with a log entry and reported as success;
    /// callers must not assume delivery before subscription completes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the relay rejects the
    /// publish.
    pub async fn send(&self, message: &SignalingMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            debug!(kind = message.kind(), "send after close; dropped");
            return Ok(());
        }
        if !self.open.load(Ordering::Acquire) {
            debug!(kind = message.kind(), "send before subscription; dropped");
            return Ok(());
        }

        let payload = serde_json::to_value(message).map_err(|e| {
            Error::SerializationError(format!("Failed to encode signaling message: {}", e))
        })?;
        self.relay.publish(&self.name, SIGNAL_EVENT, payload).await
    }

    /// Unsubscribe and stop delivering events
    ///
    /// Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(task) = pump.take() {
                task.abort();
            }
        }
        debug!(channel = %self.name, "signaling channel closed");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decode relay traffic into channel events until the subscription or the
/// consumer goes away
async fn pump_events(
    mut subscription: RelaySubscription,
    events: mpsc::UnboundedSender<ChannelEvent>,
    local_participant: String,
    open: Arc<AtomicBool>,
) {
    while let Some(event) = subscription.recv().await {
        match event {
            RelayEvent::StatusChanged(status) => {
                match status {
                    ChannelStatus::Subscribed => open.store(true, Ordering::Release),
                    ChannelStatus::Interrupted | ChannelStatus::Closed => {
                        open.store(false, Ordering::Release)
                    }
                }
                if events.send(ChannelEvent::Status(status)).is_err() {
                    break;
                }
            }
            RelayEvent::Broadcast { event, payload } if event == SIGNAL_EVENT => {
                let message = match SignalingMessage::from_value(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        // Malformed traffic must never take the pump down
                        warn!(error = %e, "malformed signaling payload dropped");
                        continue;
                    }
                };
                if message.from() == local_participant {
                    trace!(kind = message.kind(), "own broadcast filtered");
                    continue;
                }
                if events.send(ChannelEvent::Message(message)).is_err() {
                    break;
                }
            }
            RelayEvent::Broadcast { event, .. } => {
                trace!(%event, "unrelated broadcast ignored");
            }
            RelayEvent::PresenceSync { .. } => {
                // Presence lives on its own channel
            }
        }
    }
}
