//! Participant presence
//!
//! Tracks who is attached to an interview session and whether their audio
//! and video are live. Presence rides the relay's membership primitive on a
//! channel separate from signaling: each participant publishes one keyed
//! record, and every subscriber receives a full roster snapshot whenever any
//! record changes. Snapshots are authoritative and total; consumers replace
//! their view instead of diffing.
//!
//! The tracker lives for the whole call. Connection attempt restarts do not
//! touch it, so the roster stays visible while negotiation recovers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::relay::{ChannelStatus, MessageRelay, RelayEvent, RelaySubscription};
use crate::session::CallEvent;
use crate::signaling::{ParticipantRole, SessionIdentity};
use crate::{Error, Result};

// ============================================================================
// Presence record
// ============================================================================

/// One participant's advertised state on the presence channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub role: ParticipantRole,
    /// RFC 3339 join timestamp; kept stable across media toggles
    pub joined_at: String,
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl PresenceRecord {
    /// Fresh record for a participant joining now, with all media live
    pub fn joining_now(identity: &SessionIdentity) -> Self {
        Self {
            user_id: identity.participant_id.clone(),
            role: identity.role,
            joined_at: Utc::now().to_rfc3339(),
            video_enabled: true,
            audio_enabled: true,
        }
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Publishes the local presence record and mirrors the session roster
///
/// Created with [`PresenceTracker::join`], which subscribes to the session's
/// presence channel and announces the local record once the subscription is
/// live. Roster changes are emitted as [`CallEvent::ParticipantsChanged`]
/// with the complete membership each time.
pub struct PresenceTracker {
    relay: Arc<dyn MessageRelay>,
    identity: SessionIdentity,
    channel: String,
    // std::sync::Mutex: accessors are sync and sections are short
    record: Arc<Mutex<PresenceRecord>>,
    roster: Arc<Mutex<Vec<PresenceRecord>>>,
    left: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    /// Join the session's presence channel
    ///
    /// Subscribes to the shared presence topic and publishes the local
    /// record as soon as the subscription reports live. Re-publishes on
    /// every later re-subscription so an interrupted relay connection does
    /// not silently drop this participant from the roster.
    ///
    /// # Errors
    ///
    /// Returns an error when the relay subscription cannot be established.
    pub async fn join(
        relay: Arc<dyn MessageRelay>,
        identity: SessionIdentity,
        events: broadcast::Sender<CallEvent>,
    ) -> Result<Self> {
        let channel = identity.presence_channel();
        let subscription = relay.subscribe(&channel).await?;
        debug!(channel = %channel, participant = %identity.participant_id, "presence joined");

        let record = Arc::new(Mutex::new(PresenceRecord::joining_now(&identity)));
        let roster = Arc::new(Mutex::new(Vec::new()));

        let pump = tokio::spawn(pump_presence(
            subscription,
            Arc::clone(&relay),
            channel.clone(),
            identity.participant_id.clone(),
            Arc::clone(&record),
            Arc::clone(&roster),
            events,
        ));

        Ok(Self {
            relay,
            identity,
            channel,
            record,
            roster,
            left: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Latest roster snapshot, ordered by join time
    pub fn participants(&self) -> Vec<PresenceRecord> {
        self.roster.lock().unwrap().clone()
    }

    /// Whether any other participant is attached to the session
    pub fn peer_present(&self) -> bool {
        self.roster
            .lock()
            .unwrap()
            .iter()
            .any(|record| record.user_id != self.identity.participant_id)
    }

    /// Re-publish the local record with updated media flags
    ///
    /// The join timestamp is preserved; only the toggle flags change.
    ///
    /// # Errors
    ///
    /// Returns an error when the relay rejects the publish.
    pub async fn update_media_state(&self, video_enabled: bool, audio_enabled: bool) -> Result<()> {
        if self.left.load(Ordering::Acquire) {
            trace!("media update ignored after leave");
            return Ok(());
        }
        let updated = {
            let mut record = self.record.lock().unwrap();
            record.video_enabled = video_enabled;
            record.audio_enabled = audio_enabled;
            record.clone()
        };
        let payload = serde_json::to_value(&updated).map_err(|e| {
            Error::SerializationError(format!("Failed to encode presence record: {}", e))
        })?;
        debug!(video_enabled, audio_enabled, "re-publishing presence record");
        self.relay
            .track_presence(&self.channel, &self.identity.participant_id, payload)
            .await
    }

    /// Withdraw the local record and stop mirroring the roster
    ///
    /// Idempotent; later calls return without touching the relay.
    pub async fn leave(&self) -> Result<()> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        debug!(channel = %self.channel, "leaving presence channel");
        self.relay
            .untrack_presence(&self.channel, &self.identity.participant_id)
            .await
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        // The untrack is skipped here; the relay prunes dropped
        // subscriptions and callers wanting a clean leave call leave()
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
    }
}

// ============================================================================
// Event pump
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn pump_presence(
    mut subscription: RelaySubscription,
    relay: Arc<dyn MessageRelay>,
    channel: String,
    participant_id: String,
    record: Arc<Mutex<PresenceRecord>>,
    roster: Arc<Mutex<Vec<PresenceRecord>>>,
    events: broadcast::Sender<CallEvent>,
) {
    while let Some(event) = subscription.recv().await {
        match event {
            RelayEvent::StatusChanged(status) => {
                if status == ChannelStatus::Subscribed {
                    let current = record.lock().unwrap().clone();
                    match serde_json::to_value(&current) {
                        Ok(payload) => {
                            if let Err(error) =
                                relay.track_presence(&channel, &participant_id, payload).await
                            {
                                warn!(%error, "failed to publish presence record");
                            }
                        }
                        Err(error) => warn!(%error, "presence record not serializable"),
                    }
                } else {
                    debug!(status = status.as_str(), "presence channel status changed");
                }
            }
            RelayEvent::PresenceSync { state } => {
                let snapshot = flatten_snapshot(state);
                trace!(participants = snapshot.len(), "presence sync");
                *roster.lock().unwrap() = snapshot.clone();
                let _ = events.send(CallEvent::ParticipantsChanged(snapshot));
            }
            RelayEvent::Broadcast { event, .. } => {
                trace!(%event, "broadcast on presence channel ignored");
            }
        }
    }
    trace!("presence pump finished");
}

/// Flatten the relay's keyed membership map into a stable roster
///
/// Records that fail to deserialize are skipped; a misbehaving participant
/// must not hide the rest of the roster. Sorted by join time with the user
/// id as tie-breaker so every subscriber sees the same order.
fn flatten_snapshot(state: std::collections::HashMap<String, Vec<serde_json::Value>>) -> Vec<PresenceRecord> {
    let mut snapshot: Vec<PresenceRecord> = state
        .into_values()
        .flatten()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(%error, "skipping malformed presence record");
                None
            }
        })
        .collect();
    snapshot.sort_by(|a, b| {
        a.joined_at
            .cmp(&b.joined_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    snapshot
}
