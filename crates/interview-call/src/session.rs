//! Call session facade
//!
//! The one object the application holds for the lifetime of a call. It
//! acquires local media, wires the negotiation engine, recovery controller,
//! and presence tracker together over a shared event broadcast, and owns
//! ordered teardown. Everything the UI layer needs (state transitions,
//! remote streams, roster changes, retry notices) arrives on the single
//! [`CallEvent`] stream; media toggles and manual retries go back in
//! through the session's methods.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::config::CallConfig;
use crate::media::{LocalStream, MediaCapture, RemoteStream};
use crate::negotiation::{ConnectionState, EngineHandle, NegotiationEngine};
use crate::presence::{PresenceRecord, PresenceTracker};
use crate::recovery::{RecoveryController, RecoveryHandle, RetryPolicy};
use crate::relay::MessageRelay;
use crate::signaling::{ParticipantRole, SessionIdentity};
use crate::stats::ConnectionQuality;
use crate::transport::PeerTransportFactory;
use crate::Result;

/// Capacity of the call-event broadcast; slow consumers observe a lag
/// error rather than blocking the producers
const EVENT_CAPACITY: usize = 128;

// ============================================================================
// Call events
// ============================================================================

/// Everything observable about a running call, in one stream
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The call-level connection state moved
    StateChanged(ConnectionState),

    /// A new remote media stream became available; fires once per stream
    RemoteStreamAdded(RemoteStream),

    /// The remote participant announced readiness to negotiate
    PeerReady { participant_id: String },

    /// A participant announced itself on the signaling channel
    PeerJoined {
        participant_id: String,
        role: ParticipantRole,
    },

    /// A participant left the signaling channel
    PeerLeft { participant_id: String },

    /// Authoritative full roster from the presence channel
    ParticipantsChanged(Vec<PresenceRecord>),

    /// A connection attempt was declared failed
    AttemptFailed { attempt: u64, reason: String },

    /// Recovery scheduled a fresh attempt after a backoff delay
    RetryScheduled {
        /// Attempt that failed
        attempt: u64,
        /// Ordinal of the upcoming retry, starting at 1
        retry: u32,
        /// Backoff delay before the restart
        delay: Duration,
    },

    /// The automatic retry budget is spent; only a manual retry continues
    RetriesExhausted { attempts: u32 },
}

// ============================================================================
// Session
// ============================================================================

/// A live interview call
///
/// Construct with [`CallSession::connect`]; drop or [`CallSession::end_call`]
/// to tear down. All methods take `&self` and are safe to call from any
/// task.
pub struct CallSession {
    identity: SessionIdentity,
    local_stream: LocalStream,
    engine: EngineHandle,
    recovery: RecoveryHandle,
    presence: PresenceTracker,
    events: broadcast::Sender<CallEvent>,
    ended: AtomicBool,
}

impl CallSession {
    /// Acquire local media and start connecting
    ///
    /// Joins presence, spawns the negotiation engine for the first attempt,
    /// and puts it under recovery supervision. The returned session is live
    /// immediately; subscribe to [`CallSession::events`] to follow progress.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid, media cannot be acquired,
    /// or the presence channel cannot be joined. A permission denial
    /// ([`crate::Error::MediaPermissionDenied`]) is terminal: retrying
    /// cannot succeed until the user grants device access.
    pub async fn connect(
        identity: SessionIdentity,
        config: CallConfig,
        relay: Arc<dyn MessageRelay>,
        factory: Arc<dyn PeerTransportFactory>,
        capture: Arc<dyn MediaCapture>,
    ) -> Result<Self> {
        info!(
            session = %identity.session_id,
            participant = %identity.participant_id,
            role = identity.role.as_str(),
            "starting call session"
        );

        config.validate()?;
        let local_stream = capture.acquire(&config.media).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let presence =
            PresenceTracker::join(Arc::clone(&relay), identity.clone(), events.clone()).await?;

        let policy = RetryPolicy::from_config(&config);
        let engine = NegotiationEngine::spawn(
            identity.clone(),
            config,
            relay,
            factory,
            local_stream.clone(),
            events.clone(),
        );
        let recovery = RecoveryController::spawn(
            policy,
            engine.state_watch(),
            engine.attempt_watch(),
            engine.command_sender(),
            events.clone(),
        );

        Ok(Self {
            identity,
            local_stream,
            engine,
            recovery,
            presence,
            events,
            ended: AtomicBool::new(false),
        })
    }

    /// Identity this session was opened with
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Subscribe to the call-event stream
    ///
    /// Each subscriber gets every event from subscription time onward.
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Current call-level connection state
    pub fn state(&self) -> ConnectionState {
        self.engine.state()
    }

    /// Watch receiver for connection-state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.engine.state_watch()
    }

    /// Number of the connection attempt currently running
    pub fn attempt(&self) -> u64 {
        self.engine.attempt()
    }

    /// Local capture tracks published to the peer
    pub fn local_stream(&self) -> &LocalStream {
        &self.local_stream
    }

    /// Latest full presence roster
    pub fn participants(&self) -> Vec<PresenceRecord> {
        self.presence.participants()
    }

    /// True until another participant shows up in presence
    pub fn waiting_for_peer(&self) -> bool {
        !self.presence.peer_present()
    }

    /// Flip the camera track and publish the new state to presence
    ///
    /// Returns the track's new enabled state.
    ///
    /// # Errors
    ///
    /// Returns an error when the presence update cannot be published; the
    /// local track is toggled regardless.
    pub async fn toggle_video(&self) -> Result<bool> {
        let enabled = self.local_stream.video().toggle();
        self.presence
            .update_media_state(enabled, self.local_stream.audio().is_enabled())
            .await?;
        Ok(enabled)
    }

    /// Flip the microphone track and publish the new state to presence
    ///
    /// Returns the track's new enabled state.
    ///
    /// # Errors
    ///
    /// Returns an error when the presence update cannot be published; the
    /// local track is toggled regardless.
    pub async fn toggle_audio(&self) -> Result<bool> {
        let enabled = self.local_stream.audio().toggle();
        self.presence
            .update_media_state(self.local_stream.video().is_enabled(), enabled)
            .await?;
        Ok(enabled)
    }

    /// Request an immediate fresh connection attempt
    ///
    /// Honored only in the failed state. Counts against the retry budget
    /// but remains available after the budget is spent.
    pub fn retry(&self) {
        self.recovery.manual_retry();
    }

    /// Retries consumed since the last successful connection
    pub fn retry_count(&self) -> u32 {
        self.recovery.retry_count()
    }

    /// Quality snapshot of the live transport, when one exists
    pub async fn diagnostics(&self) -> Option<ConnectionQuality> {
        self.engine.diagnostics().await
    }

    /// Tear the call down in order
    ///
    /// Stops local capture, closes the negotiation engine (which tears down
    /// the transport and signaling channel), waits for the engine to settle
    /// in idle, then withdraws presence. Every step runs even when an
    /// earlier one fails. Idempotent; later calls return immediately.
    pub async fn end_call(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session = %self.identity.session_id, "ending call");

        self.local_stream.stop();

        self.engine.close();
        let mut state = self.engine.state_watch();
        let _ = state.wait_for(|state| *state == ConnectionState::Idle).await;

        if let Err(error) = self.presence.leave().await {
            warn!(%error, "presence leave failed during teardown");
        }

        info!(session = %self.identity.session_id, "call ended");
    }
}
