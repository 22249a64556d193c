//! Call test harness
//!
//! Scripted stand-ins for the pluggable edges of a call session:
//! - [`ScriptedTransport`] / [`ScriptedTransportFactory`]: a peer transport
//!   whose events the test injects by hand and which records every call
//!   made against it
//! - [`SignalingPeer`]: a hand-driven counterpart on the signaling channel
//! - assertion helpers for states and call events
//!
//! Paired with [`InMemoryRelay`], a whole call runs in-process with the
//! test controlling every externally-driven event.
//!
//! Usage pattern:
//!
//! 1. Build a shared relay and a `ScriptedTransportFactory` per side
//! 2. Connect a `CallSession` (or spawn an engine) against them
//! 3. Drive the far side via a `SignalingPeer` and the scripted transport
//! 4. Assert on recorded operations, states, and call events

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use interview_call::relay::InMemoryRelay;
use interview_call::signaling::channel::{ChannelEvent, SignalingChannel};
use interview_call::{
    CallConfig, CallEvent, ConnectionQuality, ConnectionState, IceCandidate, LocalStream,
    MessageRelay, ParticipantRole, PeerEvent, PeerTransport, PeerTransportFactory,
    SessionDescription, SessionIdentity, SignalingMessage, TransportState,
};

/// How long helpers wait before declaring an expectation failed
pub const WAIT_BUDGET: Duration = Duration::from_secs(5);

// ============================================================================
// Scripted transport
// ============================================================================

/// Transport that does no networking and records everything instead
///
/// Offers and answers are canned SDP blobs tagged with the transport's
/// label and a sequence number. Events the engine would normally get from
/// the network are pushed by the test through [`ScriptedTransport::push`].
pub struct ScriptedTransport {
    label: String,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,

    /// Every operation in invocation order, for ordering assertions
    ops: Mutex<Vec<String>>,

    offers: AtomicU32,
    restart_offers: AtomicU32,
    answers: AtomicU32,
    closed: AtomicBool,

    /// Candidate strings whose application should fail
    rejects: Mutex<HashSet<String>>,
    /// Number of upcoming `create_offer` calls that should fail
    fail_offers: AtomicU32,

    quality: Mutex<Option<ConnectionQuality>>,
}

impl ScriptedTransport {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            ops: Mutex::new(Vec::new()),
            offers: AtomicU32::new(0),
            restart_offers: AtomicU32::new(0),
            answers: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            rejects: Mutex::new(HashSet::new()),
            fail_offers: AtomicU32::new(0),
            quality: Mutex::new(None),
        })
    }

    /// Inject an event as if the network produced it
    pub fn push(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Shorthand for a connection state event
    pub fn transition(&self, state: TransportState) {
        self.push(PeerEvent::StateChanged(state));
    }

    /// Make `add_ice_candidate` fail for one candidate string
    pub fn reject_candidate(&self, candidate: &str) {
        self.rejects.lock().unwrap().insert(candidate.to_string());
    }

    /// Make the next `create_offer` call fail
    pub fn fail_next_offer(&self) {
        self.fail_offers.fetch_add(1, Ordering::SeqCst);
    }

    /// Provide a canned quality snapshot
    pub fn set_quality(&self, quality: ConnectionQuality) {
        *self.quality.lock().unwrap() = Some(quality);
    }

    /// Operations recorded so far
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// Position of the first op equal to `needle`, if recorded
    pub fn op_index(&self, needle: &str) -> Option<usize> {
        self.ops.lock().unwrap().iter().position(|op| op == needle)
    }

    pub fn offers_created(&self) -> u32 {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn restart_offers_created(&self) -> u32 {
        self.restart_offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> u32 {
        self.answers.load(Ordering::SeqCst)
    }

    /// Applied remote candidate strings in application order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| op.strip_prefix("candidate:").map(str::to_string))
            .collect()
    }

    /// Kinds of remote descriptions installed, in order
    pub fn remote_descriptions(&self) -> Vec<String> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| op.strip_prefix("remote:").map(str::to_string))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, op: String) {
        debug!(transport = %self.label, %op, "scripted transport op");
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn publish_stream(&self, stream: &LocalStream) -> interview_call::Result<()> {
        self.record(format!("publish:{}", stream.tracks().len()));
        Ok(())
    }

    async fn create_offer(&self) -> interview_call::Result<SessionDescription> {
        if self
            .fail_offers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.record("offer-failed".to_string());
            return Err(interview_call::Error::SdpError(
                "scripted offer failure".to_string(),
            ));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("offer".to_string());
        Ok(SessionDescription::offer(format!(
            "v=0 {} offer {}",
            self.label, n
        )))
    }

    async fn create_restart_offer(&self) -> interview_call::Result<SessionDescription> {
        let n = self.restart_offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("restart-offer".to_string());
        Ok(SessionDescription::offer(format!(
            "v=0 {} restart {}",
            self.label, n
        )))
    }

    async fn create_answer(&self) -> interview_call::Result<SessionDescription> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("answer".to_string());
        Ok(SessionDescription::answer(format!(
            "v=0 {} answer {}",
            self.label, n
        )))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> interview_call::Result<()> {
        self.record(format!("remote:{:?}", description.kind).to_lowercase());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> interview_call::Result<()> {
        if self.rejects.lock().unwrap().contains(&candidate.candidate) {
            self.record(format!("candidate-rejected:{}", candidate.candidate));
            return Err(interview_call::Error::IceCandidateError(
                "scripted candidate rejection".to_string(),
            ));
        }
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn quality_snapshot(&self) -> Option<ConnectionQuality> {
        self.quality.lock().unwrap().clone()
    }

    async fn close(&self) -> interview_call::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.record("close".to_string());
        Ok(())
    }
}

// ============================================================================
// Scripted factory
// ============================================================================

/// Factory that remembers every transport it hands out
///
/// One factory per call side keeps attribution unambiguous: transport `0`
/// belongs to that side's first attempt, `1` to its second, and so on.
#[derive(Default)]
pub struct ScriptedTransportFactory {
    created: Mutex<Vec<Arc<ScriptedTransport>>>,
    fail_creates: AtomicU32,
}

impl ScriptedTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `create` call fail
    pub fn fail_next_create(&self) {
        self.fail_creates.fetch_add(1, Ordering::SeqCst);
    }

    pub fn transport_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Transport created for attempt `index + 1`
    ///
    /// Panics when that attempt has not created a transport yet; use
    /// [`ScriptedTransportFactory::wait_for_transport`] to block for it.
    pub fn transport(&self, index: usize) -> Arc<ScriptedTransport> {
        self.created
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("transport {} was never created", index))
    }

    /// Wait until the factory has created transport `index`
    pub async fn wait_for_transport(&self, index: usize) -> Arc<ScriptedTransport> {
        let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
        loop {
            if let Some(transport) = self.created.lock().unwrap().get(index).cloned() {
                return transport;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("transport {} was not created within the wait budget", index);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl PeerTransportFactory for ScriptedTransportFactory {
    async fn create(
        &self,
        _config: &CallConfig,
    ) -> interview_call::Result<Arc<dyn PeerTransport>> {
        if self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(interview_call::Error::TransportError(
                "scripted transport creation failure".to_string(),
            ));
        }
        let mut created = self.created.lock().unwrap();
        let transport = ScriptedTransport::new(format!("transport-{}", created.len()));
        created.push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ============================================================================
// Signaling peer
// ============================================================================

/// Hand-driven counterpart on the session's signaling channel
///
/// Lets a test play the far participant without running a second engine:
/// announce readiness, feed descriptions and candidates, and assert on
/// what the near side broadcasts.
pub struct SignalingPeer {
    pub identity: SessionIdentity,
    channel: Arc<SignalingChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl SignalingPeer {
    /// Subscribe to the session's signaling channel and wait for
    /// confirmation
    pub async fn join(relay: &Arc<InMemoryRelay>, session_id: &str, role: ParticipantRole) -> Self {
        let identity = SessionIdentity::generate(session_id, role);
        let (channel, mut events) = SignalingChannel::open(
            Arc::clone(relay) as Arc<dyn MessageRelay>,
            identity.clone(),
        )
        .await
        .unwrap_or_else(|e| panic!("signaling peer failed to join: {}", e));

        let confirmed = tokio::time::timeout(WAIT_BUDGET, async {
            while let Some(event) = events.recv().await {
                if matches!(
                    event,
                    ChannelEvent::Status(interview_call::ChannelStatus::Subscribed)
                ) {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(
            matches!(confirmed, Ok(true)),
            "signaling peer subscription never confirmed"
        );

        Self {
            identity,
            channel,
            events,
        }
    }

    pub async fn send(&self, message: SignalingMessage) {
        self.channel
            .send(&message)
            .await
            .unwrap_or_else(|e| panic!("signaling peer send failed: {}", e));
    }

    /// Broadcast the joined + ready pair the real client sends on entry
    pub async fn announce(&self) {
        self.send(SignalingMessage::user_joined(&self.identity)).await;
        self.send(SignalingMessage::user_ready(&self.identity)).await;
    }

    pub async fn send_offer(&self, sdp: &str) {
        self.send(SignalingMessage::offer(
            SessionDescription::offer(sdp),
            &self.identity,
        ))
        .await;
    }

    pub async fn send_answer(&self, sdp: &str) {
        self.send(SignalingMessage::answer(
            SessionDescription::answer(sdp),
            &self.identity,
        ))
        .await;
    }

    pub async fn send_candidate(&self, candidate: &str) {
        self.send(SignalingMessage::ice_candidate(
            IceCandidate::new(candidate, Some("0".to_string()), Some(0)),
            &self.identity,
        ))
        .await;
    }

    /// Next decoded message of any kind
    pub async fn next_message(&mut self) -> SignalingMessage {
        let message = tokio::time::timeout(WAIT_BUDGET, async {
            while let Some(event) = self.events.recv().await {
                if let ChannelEvent::Message(message) = event {
                    return Some(message);
                }
            }
            None
        })
        .await;
        match message {
            Ok(Some(message)) => message,
            Ok(None) => panic!("signaling channel closed while waiting for a message"),
            Err(_) => panic!("no signaling message within the wait budget"),
        }
    }

    /// Next message whose kind is in `kinds`, skipping the others
    pub async fn next_of(&mut self, kinds: &[&str]) -> SignalingMessage {
        loop {
            let message = self.next_message().await;
            if kinds.contains(&message.kind()) {
                return message;
            }
        }
    }

    /// Wait for the near side's offer, skipping presence chatter
    pub async fn expect_offer(&mut self) -> SessionDescription {
        match self.next_of(&["offer"]).await {
            SignalingMessage::Offer { payload, .. } => payload,
            other => panic!("expected offer, got {:?}", other),
        }
    }

    /// Wait for the near side's answer, skipping presence chatter
    pub async fn expect_answer(&mut self) -> SessionDescription {
        match self.next_of(&["answer"]).await {
            SignalingMessage::Answer { payload, .. } => payload,
            other => panic!("expected answer, got {:?}", other),
        }
    }

    /// Wait for the near side's next trickled candidate
    pub async fn expect_candidate(&mut self) -> IceCandidate {
        match self.next_of(&["ice-candidate"]).await {
            SignalingMessage::IceCandidate { payload, .. } => payload,
            other => panic!("expected candidate, got {:?}", other),
        }
    }

    /// Every message already delivered, without waiting for more
    pub async fn drain(&mut self) -> Vec<SignalingMessage> {
        settle().await;
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let ChannelEvent::Message(message) = event {
                drained.push(message);
            }
        }
        drained
    }
}

// ============================================================================
// Waiting helpers
// ============================================================================

/// Give in-flight tasks a chance to finish
///
/// Under a paused clock this returns once the runtime is idle; under a
/// running clock it is a short real sleep.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Wait until the watched state equals `target`
pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    let outcome = tokio::time::timeout(WAIT_BUDGET, rx.wait_for(|state| *state == target))
        .await
        .map(|inner| inner.is_ok());
    match outcome {
        Ok(true) => {}
        Ok(false) => panic!("state channel closed while waiting for {}", target),
        Err(_) => panic!("state never reached {} (still {})", target, *rx.borrow()),
    }
}

/// Wait for the first call event matching `pred`, discarding the rest
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<CallEvent>, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    let result = tokio::time::timeout(WAIT_BUDGET, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;
    match result {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed before a matching event"),
        Err(_) => panic!("no matching call event within the wait budget"),
    }
}

/// Poll `cond` until it holds, panicking with `what` on budget overrun
pub async fn wait_until<F>(mut cond: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("never observed: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the transport has recorded the given operation
pub async fn wait_for_op(transport: &ScriptedTransport, op: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    while transport.op_index(op).is_none() {
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "transport never recorded {:?} (ops: {:?})",
                op,
                transport.ops()
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until a relay channel has `count` live subscribers
pub async fn wait_for_subscribers(relay: &InMemoryRelay, channel: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT_BUDGET;
    while relay.subscriber_count(channel).await != count {
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "channel {} never reached {} subscribers (has {})",
                channel,
                count,
                relay.subscriber_count(channel).await
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Identities and configuration
// ============================================================================

pub fn interviewer(session_id: &str) -> SessionIdentity {
    SessionIdentity::generate(session_id, ParticipantRole::Interviewer)
}

pub fn candidate(session_id: &str) -> SessionIdentity {
    SessionIdentity::generate(session_id, ParticipantRole::Candidate)
}

/// Configuration most tests run under
pub fn test_config() -> CallConfig {
    CallConfig::default()
}
