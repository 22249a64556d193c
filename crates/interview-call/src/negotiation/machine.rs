//! Negotiation engine
//!
//! A single event-loop task owns every piece of negotiation state: the
//! transport, the signaling channel, the offer flags, and the candidate
//! queue. Transport and relay I/O runs in spawned subtasks whose
//! completions re-enter the loop tagged with the attempt number they
//! belong to; anything tagged with a superseded attempt is dropped on
//! arrival, so a retry can never be corrupted by leftovers of the attempt
//! it replaced.
//!
//! The loop itself never awaits I/O. Handlers only mutate state and spawn,
//! which keeps every inbound event processable while slow operations are
//! in flight.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::CallConfig;
use crate::media::LocalStream;
use crate::negotiation::candidates::CandidateQueue;
use crate::negotiation::ConnectionState;
use crate::relay::{ChannelStatus, MessageRelay};
use crate::session::CallEvent;
use crate::signaling::channel::{ChannelEvent, SignalingChannel};
use crate::signaling::message::{
    IceCandidate, SessionDescription, SessionIdentity, SignalingMessage,
};
use crate::stats::ConnectionQuality;
use crate::transport::{PeerEvent, PeerTransport, PeerTransportFactory, TransportState};
use crate::Error;

// ============================================================================
// Commands and internal events
// ============================================================================

/// Requests handled by the engine's event loop
#[derive(Debug)]
pub enum EngineCommand {
    /// The recovery controller declared attempt `attempt` stalled
    MarkStalled {
        /// Attempt the stall was measured against
        attempt: u64,
    },

    /// Tear down attempt `attempt` and start a fresh one
    RestartAttempt {
        /// Attempt being replaced; stale requests are ignored
        attempt: u64,
    },

    /// Report the live transport's quality snapshot
    Diagnostics {
        /// Where to deliver the snapshot
        reply: oneshot::Sender<Option<ConnectionQuality>>,
    },

    /// Final teardown; the engine exits after handling this
    Close,
}

/// Completions and forwarded events re-entering the loop
///
/// Every variant carries the attempt it was spawned under.
enum TaskEvent {
    ChannelOpened {
        attempt: u64,
        result: crate::Result<(Arc<SignalingChannel>, mpsc::UnboundedReceiver<ChannelEvent>)>,
    },
    TransportReady {
        attempt: u64,
        result: crate::Result<Arc<dyn PeerTransport>>,
    },
    Channel {
        attempt: u64,
        event: ChannelEvent,
    },
    Transport {
        attempt: u64,
        event: PeerEvent,
    },
    OfferSent {
        attempt: u64,
        result: crate::Result<()>,
    },
    RemoteOfferApplied {
        attempt: u64,
    },
    AnswerSent {
        attempt: u64,
        result: crate::Result<()>,
    },
    RemoteAnswerApplied {
        attempt: u64,
        result: crate::Result<()>,
    },
    RestartOfferSent {
        attempt: u64,
        result: crate::Result<()>,
    },
}

// ============================================================================
// Attempt context
// ============================================================================

/// Everything scoped to one connection attempt
///
/// A restart replaces the whole context; nothing in here outlives the
/// attempt it was created for.
struct AttemptContext {
    attempt: u64,
    transport: Option<Arc<dyn PeerTransport>>,
    channel: Option<Arc<SignalingChannel>>,
    queue: CandidateQueue,

    /// Set before the offer task is spawned; the at-most-one-offer guard
    offer_in_flight: bool,
    /// Peer announced it is listening
    remote_ready: bool,
    /// Our own channel subscription is confirmed
    channel_ready: bool,

    /// Our offer or answer has been broadcast; local candidates may follow
    description_sent: bool,
    answer_in_flight: bool,
    restart_requested: bool,

    /// Newest remote offer waiting for the transport or a prior apply
    pending_offer: Option<SessionDescription>,
    /// Local candidates held back until the description is broadcast
    held_candidates: Vec<IceCandidate>,

    /// Ordered outbound sends (candidates, announcements)
    outbound: Option<mpsc::UnboundedSender<SignalingMessage>>,
    /// Ordered remote-candidate application
    applier: Option<mpsc::UnboundedSender<IceCandidate>>,

    seen_streams: HashSet<String>,
}

impl AttemptContext {
    fn new(attempt: u64) -> Self {
        Self {
            attempt,
            transport: None,
            channel: None,
            queue: CandidateQueue::new(),
            offer_in_flight: false,
            remote_ready: false,
            channel_ready: false,
            description_sent: false,
            answer_in_flight: false,
            restart_requested: false,
            pending_offer: None,
            held_candidates: Vec::new(),
            outbound: None,
            applier: None,
            seen_streams: HashSet::new(),
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Control surface for a spawned engine
///
/// Dropping the handle closes the engine.
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    attempt_rx: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Current call-level connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch receiver for connection-state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Number of the current connection attempt (first attempt is 1)
    pub fn attempt(&self) -> u64 {
        *self.attempt_rx.borrow()
    }

    /// Watch receiver for the attempt counter
    pub fn attempt_watch(&self) -> watch::Receiver<u64> {
        self.attempt_rx.clone()
    }

    /// Clone of the engine's command sender for supervising tasks
    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<EngineCommand> {
        self.commands.clone()
    }

    /// Declare an attempt stalled; ignored when stale or not connecting
    pub fn mark_stalled(&self, attempt: u64) {
        let _ = self.commands.send(EngineCommand::MarkStalled { attempt });
    }

    /// Request a fresh attempt replacing `attempt`
    pub fn restart_attempt(&self, attempt: u64) {
        let _ = self.commands.send(EngineCommand::RestartAttempt { attempt });
    }

    /// Fetch the live transport's quality snapshot
    pub async fn diagnostics(&self) -> Option<ConnectionQuality> {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::Diagnostics { reply })
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    /// Request final teardown
    pub fn close(&self) {
        let _ = self.commands.send(EngineCommand::Close);
    }

    /// Wait for the engine task to finish
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(EngineCommand::Close);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The negotiation actor
///
/// Constructed and spawned via [`NegotiationEngine::spawn`]; all further
/// interaction goes through the returned [`EngineHandle`] and the shared
/// event broadcast.
pub struct NegotiationEngine {
    identity: SessionIdentity,
    config: CallConfig,
    relay: Arc<dyn MessageRelay>,
    factory: Arc<dyn PeerTransportFactory>,
    local_stream: LocalStream,

    ctx: AttemptContext,

    state_tx: watch::Sender<ConnectionState>,
    attempt_tx: watch::Sender<u64>,
    events: broadcast::Sender<CallEvent>,

    tasks: mpsc::UnboundedSender<TaskEvent>,
    task_rx: mpsc::UnboundedReceiver<TaskEvent>,
    command_rx: mpsc::UnboundedReceiver<EngineCommand>,
}

impl NegotiationEngine {
    /// Spawn the engine and start the first connection attempt
    ///
    /// `events` is the shared call-event broadcast; state transitions,
    /// remote streams, and failure notices are published there.
    pub fn spawn(
        identity: SessionIdentity,
        config: CallConfig,
        relay: Arc<dyn MessageRelay>,
        factory: Arc<dyn PeerTransportFactory>,
        local_stream: LocalStream,
        events: broadcast::Sender<CallEvent>,
    ) -> EngineHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (tasks, task_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (attempt_tx, attempt_rx) = watch::channel(0);

        let mut engine = Self {
            identity,
            config,
            relay,
            factory,
            local_stream,
            ctx: AttemptContext::new(0),
            state_tx,
            attempt_tx,
            events,
            tasks,
            task_rx,
            command_rx,
        };

        let task = tokio::spawn(async move { engine.run().await });

        EngineHandle {
            commands,
            state_rx,
            attempt_rx,
            task: Some(task),
        }
    }

    async fn run(&mut self) {
        info!(
            session = %self.identity.session_id,
            participant = %self.identity.participant_id,
            role = self.identity.role.as_str(),
            "negotiation engine started"
        );
        self.start_attempt();

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.task_rx.recv() => self.handle_task_event(event),
            }
        }

        info!("negotiation engine stopped");
    }

    /// Handle one command; returns false when the engine should exit
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::MarkStalled { attempt } => {
                if !self.is_current(attempt, "stall") {
                    return true;
                }
                if *self.state_tx.borrow() != ConnectionState::Connecting {
                    debug!("stall reported outside connecting; ignoring");
                    return true;
                }
                let reason = Error::StallTimeout(self.config.stall_timeout_secs).to_string();
                self.fail_attempt(reason);
                true
            }
            EngineCommand::RestartAttempt { attempt } => {
                if !self.is_current(attempt, "restart") {
                    return true;
                }
                info!(attempt, "restarting connection attempt");
                self.teardown_attempt(false);
                self.start_attempt();
                true
            }
            EngineCommand::Diagnostics { reply } => {
                match self.ctx.transport.clone() {
                    Some(transport) => {
                        tokio::spawn(async move {
                            let _ = reply.send(transport.quality_snapshot().await);
                        });
                    }
                    None => {
                        let _ = reply.send(None);
                    }
                }
                true
            }
            EngineCommand::Close => {
                self.shutdown();
                false
            }
        }
    }

    // ========================================================================
    // Attempt lifecycle
    // ========================================================================

    fn start_attempt(&mut self) {
        let attempt = self.ctx.attempt + 1;
        self.ctx = AttemptContext::new(attempt);
        let _ = self.attempt_tx.send(attempt);
        info!(attempt, "starting connection attempt");
        self.set_state(ConnectionState::Connecting);

        let relay = Arc::clone(&self.relay);
        let identity = self.identity.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let result = SignalingChannel::open(relay, identity).await;
            let _ = tasks.send(TaskEvent::ChannelOpened { attempt, result });
        });

        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let stream = self.local_stream.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let result: crate::Result<Arc<dyn PeerTransport>> = async {
                let transport = factory.create(&config).await?;
                transport.publish_stream(&stream).await?;
                Ok(transport)
            }
            .await;
            let _ = tasks.send(TaskEvent::TransportReady { attempt, result });
        });
    }

    /// Release the current attempt's transport and subscription
    fn teardown_attempt(&mut self, announce_leave: bool) {
        self.ctx.queue.reset();
        self.ctx.applier = None;
        self.ctx.outbound = None;

        if let Some(channel) = self.ctx.channel.take() {
            let identity = self.identity.clone();
            tokio::spawn(async move {
                if announce_leave {
                    let _ = channel.send(&SignalingMessage::user_left(&identity)).await;
                }
                channel.close();
            });
        }

        if let Some(transport) = self.ctx.transport.take() {
            tokio::spawn(async move {
                if let Err(e) = transport.close().await {
                    warn!(error = %e, "transport close failed");
                }
            });
        }
    }

    fn shutdown(&mut self) {
        info!("negotiation engine shutting down");
        self.teardown_attempt(true);
        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous == next {
            return;
        }
        info!(from = previous.as_str(), to = next.as_str(), "connection state changed");
        let _ = self.state_tx.send(next);
        let _ = self.events.send(CallEvent::StateChanged(next));
    }

    /// Move the attempt to failed and notify recovery, at most once per
    /// entry into the failed state
    fn fail_attempt(&mut self, reason: String) {
        if *self.state_tx.borrow() == ConnectionState::Failed {
            debug!(%reason, "attempt already failed");
            return;
        }
        warn!(attempt = self.ctx.attempt, %reason, "connection attempt failed");
        self.set_state(ConnectionState::Failed);
        let _ = self.events.send(CallEvent::AttemptFailed {
            attempt: self.ctx.attempt,
            reason,
        });
    }

    fn is_current(&self, attempt: u64, what: &str) -> bool {
        if attempt == self.ctx.attempt {
            true
        } else {
            trace!(
                attempt,
                current = self.ctx.attempt,
                what,
                "ignoring event from superseded attempt"
            );
            false
        }
    }

    // ========================================================================
    // Task event dispatch
    // ========================================================================

    fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::ChannelOpened { attempt, result } => self.on_channel_opened(attempt, result),
            TaskEvent::TransportReady { attempt, result } => {
                self.on_transport_ready(attempt, result)
            }
            TaskEvent::Channel { attempt, event } => self.on_channel_event(attempt, event),
            TaskEvent::Transport { attempt, event } => self.on_transport_event(attempt, event),
            TaskEvent::OfferSent { attempt, result } => self.on_offer_sent(attempt, result),
            TaskEvent::RemoteOfferApplied { attempt } => {
                // The remote description is in place; queued candidates are
                // applicable now, before the answer even exists.
                if self.is_current(attempt, "remote offer applied") {
                    self.drain_candidate_queue();
                }
            }
            TaskEvent::AnswerSent { attempt, result } => self.on_answer_sent(attempt, result),
            TaskEvent::RemoteAnswerApplied { attempt, result } => {
                self.on_remote_answer_applied(attempt, result)
            }
            TaskEvent::RestartOfferSent { attempt, result } => {
                if self.is_current(attempt, "restart offer") {
                    match result {
                        Ok(()) => debug!("restart offer broadcast"),
                        Err(e) => warn!(error = %e, "restart offer failed"),
                    }
                }
            }
        }
    }

    fn on_channel_opened(
        &mut self,
        attempt: u64,
        result: crate::Result<(Arc<SignalingChannel>, mpsc::UnboundedReceiver<ChannelEvent>)>,
    ) {
        if !self.is_current(attempt, "channel open") {
            // A superseded attempt's subscription must not linger
            if let Ok((channel, _)) = result {
                channel.close();
            }
            return;
        }
        match result {
            Ok((channel, mut events)) => {
                debug!(attempt, channel = channel.name(), "signaling channel open");
                self.ctx.channel = Some(channel);

                let tasks = self.tasks.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if tasks.send(TaskEvent::Channel { attempt, event }).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => self.fail_attempt(format!("signaling channel failed to open: {}", e)),
        }
    }

    fn on_transport_ready(&mut self, attempt: u64, result: crate::Result<Arc<dyn PeerTransport>>) {
        if !self.is_current(attempt, "transport ready") {
            if let Ok(transport) = result {
                tokio::spawn(async move {
                    let _ = transport.close().await;
                });
            }
            return;
        }
        match result {
            Ok(transport) => {
                debug!(attempt, "peer transport ready");

                match transport.take_events() {
                    Some(mut events) => {
                        let tasks = self.tasks.clone();
                        tokio::spawn(async move {
                            while let Some(event) = events.recv().await {
                                if tasks.send(TaskEvent::Transport { attempt, event }).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    None => warn!("transport event stream was already taken"),
                }

                // One applier task per attempt keeps remote candidates in
                // arrival order while isolating per-candidate failures.
                let (applier, mut candidates) = mpsc::unbounded_channel::<IceCandidate>();
                let applier_transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    while let Some(candidate) = candidates.recv().await {
                        if let Err(e) = applier_transport.add_ice_candidate(candidate).await {
                            warn!(error = %e, "failed to apply remote candidate");
                        }
                    }
                });

                self.ctx.applier = Some(applier);
                self.ctx.transport = Some(transport);

                self.maybe_create_offer();
                if let Some(offer) = self.ctx.pending_offer.take() {
                    self.apply_remote_offer(offer);
                }
            }
            Err(e) => self.fail_attempt(format!("transport creation failed: {}", e)),
        }
    }

    // ========================================================================
    // Signaling channel events
    // ========================================================================

    fn on_channel_event(&mut self, attempt: u64, event: ChannelEvent) {
        if !self.is_current(attempt, "channel event") {
            return;
        }
        match event {
            ChannelEvent::Status(status) => self.on_channel_status(status),
            ChannelEvent::Message(message) => self.on_signaling_message(message),
        }
    }

    fn on_channel_status(&mut self, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                if self.ctx.channel_ready {
                    debug!("duplicate subscription confirmation");
                    return;
                }
                self.ctx.channel_ready = true;
                info!(attempt = self.ctx.attempt, "signaling channel subscribed");

                // Announcements and candidates funnel through one task so
                // their relative order on the wire matches send order.
                if let Some(channel) = self.ctx.channel.clone() {
                    let (outbound, mut queued) = mpsc::unbounded_channel::<SignalingMessage>();
                    tokio::spawn(async move {
                        while let Some(message) = queued.recv().await {
                            let kind = message.kind();
                            if let Err(e) = channel.send(&message).await {
                                warn!(kind, error = %e, "signaling send failed");
                            }
                        }
                    });
                    let _ = outbound.send(SignalingMessage::user_joined(&self.identity));
                    let _ = outbound.send(SignalingMessage::user_ready(&self.identity));
                    self.ctx.outbound = Some(outbound);
                }

                self.maybe_create_offer();
            }
            ChannelStatus::Interrupted => {
                warn!("signaling channel interrupted");
            }
            ChannelStatus::Closed => {
                // Media flows outside the signaling path, so a dead channel
                // only matters while negotiation is still in progress; the
                // stall timeout classifies that case.
                warn!("signaling channel closed by the relay");
            }
        }
    }

    fn on_signaling_message(&mut self, message: SignalingMessage) {
        trace!(kind = message.kind(), from = message.from(), "signaling message received");
        match message {
            SignalingMessage::Offer { payload, from, role } => {
                if self.identity.role.is_offering_side() {
                    warn!(%from, "offer received by the offering side; dropped");
                    return;
                }
                if role == self.identity.role {
                    warn!(%from, "offer from a participant with our own role; dropped");
                    return;
                }
                if !self.ctx.remote_ready {
                    // An offer is itself proof the peer is up and listening
                    self.ctx.remote_ready = true;
                    let _ = self.events.send(CallEvent::PeerReady {
                        participant_id: from,
                    });
                }
                self.apply_remote_offer(payload);
            }
            SignalingMessage::Answer { payload, from, role } => {
                if !self.identity.role.is_offering_side() {
                    warn!(%from, "answer received by the answering side; dropped");
                    return;
                }
                if role == self.identity.role {
                    warn!(%from, "answer from a participant with our own role; dropped");
                    return;
                }
                self.apply_remote_answer(payload);
            }
            SignalingMessage::IceCandidate { payload, .. } => {
                self.on_remote_candidate(payload);
            }
            SignalingMessage::UserReady { from, role, .. } => {
                if role != self.identity.role.counterpart() {
                    debug!(%from, "user-ready from unexpected role; ignored");
                    return;
                }
                if !self.ctx.remote_ready {
                    self.ctx.remote_ready = true;
                    info!(attempt = self.ctx.attempt, peer = %from, "peer is ready");
                    let _ = self.events.send(CallEvent::PeerReady {
                        participant_id: from,
                    });
                }
                // The answering side echoes its readiness back, so an
                // offering side that subscribed after our original
                // announcement still learns we are listening. The offering
                // side's ready flag absorbs the duplicate.
                if !self.identity.role.is_offering_side() {
                    if let Some(outbound) = &self.ctx.outbound {
                        let _ = outbound.send(SignalingMessage::user_ready(&self.identity));
                    }
                }
                self.maybe_create_offer();
            }
            SignalingMessage::UserJoined { from, role } => {
                let _ = self.events.send(CallEvent::PeerJoined {
                    participant_id: from,
                    role,
                });
            }
            SignalingMessage::UserLeft { from, .. } => {
                let _ = self.events.send(CallEvent::PeerLeft {
                    participant_id: from,
                });
            }
        }
    }

    // ========================================================================
    // Offer / answer flows
    // ========================================================================

    /// Create and broadcast the attempt's single offer once every
    /// precondition holds; safe to call on every trigger event
    fn maybe_create_offer(&mut self) {
        if !self.identity.role.is_offering_side() {
            return;
        }
        if self.ctx.offer_in_flight {
            trace!("offer already in flight");
            return;
        }
        if !self.ctx.channel_ready || !self.ctx.remote_ready {
            trace!(
                channel_ready = self.ctx.channel_ready,
                remote_ready = self.ctx.remote_ready,
                "offer preconditions not met"
            );
            return;
        }
        let (Some(transport), Some(channel)) =
            (self.ctx.transport.clone(), self.ctx.channel.clone())
        else {
            trace!("offer preconditions not met: transport or channel missing");
            return;
        };

        // Set before spawning so a second trigger in the same batch of
        // events cannot start a second offer.
        self.ctx.offer_in_flight = true;
        info!(attempt = self.ctx.attempt, "creating offer");

        let identity = self.identity.clone();
        let tasks = self.tasks.clone();
        let attempt = self.ctx.attempt;
        tokio::spawn(async move {
            let result: crate::Result<()> = async {
                let description = transport.create_offer().await?;
                channel
                    .send(&SignalingMessage::offer(description, &identity))
                    .await
            }
            .await;
            let _ = tasks.send(TaskEvent::OfferSent { attempt, result });
        });
    }

    fn on_offer_sent(&mut self, attempt: u64, result: crate::Result<()>) {
        if !self.is_current(attempt, "offer sent") {
            return;
        }
        match result {
            Ok(()) => {
                info!(attempt, "offer broadcast");
                self.mark_description_sent();
            }
            Err(e) => {
                // Clearing the guard lets the next trigger retry the whole
                // sequence; nothing partial was broadcast.
                warn!(error = %e, "offer creation failed");
                self.ctx.offer_in_flight = false;
            }
        }
    }

    fn apply_remote_offer(&mut self, description: SessionDescription) {
        if self.ctx.answer_in_flight {
            debug!("answer in flight; holding newest offer");
            self.ctx.pending_offer = Some(description);
            return;
        }
        let (Some(transport), Some(channel)) =
            (self.ctx.transport.clone(), self.ctx.channel.clone())
        else {
            debug!("transport not ready; holding offer");
            self.ctx.pending_offer = Some(description);
            return;
        };

        self.ctx.answer_in_flight = true;
        info!(attempt = self.ctx.attempt, "applying remote offer");

        let identity = self.identity.clone();
        let tasks = self.tasks.clone();
        let attempt = self.ctx.attempt;
        tokio::spawn(async move {
            let result: crate::Result<()> = async {
                transport.set_remote_description(description).await?;
                let _ = tasks.send(TaskEvent::RemoteOfferApplied { attempt });
                let answer = transport.create_answer().await?;
                channel
                    .send(&SignalingMessage::answer(answer, &identity))
                    .await
            }
            .await;
            let _ = tasks.send(TaskEvent::AnswerSent { attempt, result });
        });
    }

    fn on_answer_sent(&mut self, attempt: u64, result: crate::Result<()>) {
        if !self.is_current(attempt, "answer sent") {
            return;
        }
        self.ctx.answer_in_flight = false;
        match result {
            Ok(()) => {
                info!(attempt, "answer broadcast");
                self.mark_description_sent();
            }
            Err(e) => {
                // Stay in place; the stall timeout notices the lack of
                // progress if the peer does not re-offer.
                warn!(error = %e, "offer handling failed");
            }
        }
        if let Some(offer) = self.ctx.pending_offer.take() {
            self.apply_remote_offer(offer);
        }
    }

    fn apply_remote_answer(&mut self, description: SessionDescription) {
        let Some(transport) = self.ctx.transport.clone() else {
            debug!("answer arrived without a transport; dropped");
            return;
        };
        info!(attempt = self.ctx.attempt, "applying remote answer");

        let tasks = self.tasks.clone();
        let attempt = self.ctx.attempt;
        tokio::spawn(async move {
            let result = transport.set_remote_description(description).await;
            let _ = tasks.send(TaskEvent::RemoteAnswerApplied { attempt, result });
        });
    }

    fn on_remote_answer_applied(&mut self, attempt: u64, result: crate::Result<()>) {
        if !self.is_current(attempt, "answer applied") {
            return;
        }
        match result {
            Ok(()) => self.drain_candidate_queue(),
            Err(e) => warn!(error = %e, "failed to apply remote answer"),
        }
    }

    // ========================================================================
    // Candidates
    // ========================================================================

    fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match self.ctx.queue.accept(candidate) {
            Some(candidate) => {
                if let Some(applier) = &self.ctx.applier {
                    let _ = applier.send(candidate);
                }
            }
            None => {
                trace!(
                    queued = self.ctx.queue.len(),
                    "candidate queued until remote description"
                );
            }
        }
    }

    fn drain_candidate_queue(&mut self) {
        let drained = self.ctx.queue.mark_remote_ready();
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "draining queued candidates");
        if let Some(applier) = &self.ctx.applier {
            for candidate in drained {
                let _ = applier.send(candidate);
            }
        }
    }

    fn mark_description_sent(&mut self) {
        self.ctx.description_sent = true;
        let held = std::mem::take(&mut self.ctx.held_candidates);
        if !held.is_empty() {
            debug!(count = held.len(), "releasing held local candidates");
        }
        for candidate in held {
            self.send_candidate(candidate);
        }
    }

    fn send_candidate(&mut self, candidate: IceCandidate) {
        if let Some(outbound) = &self.ctx.outbound {
            let _ = outbound.send(SignalingMessage::ice_candidate(candidate, &self.identity));
        }
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    fn on_transport_event(&mut self, attempt: u64, event: PeerEvent) {
        if !self.is_current(attempt, "transport event") {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if candidate.is_end_of_candidates() {
                    debug!("local candidate gathering complete");
                    return;
                }
                if self.ctx.description_sent {
                    self.send_candidate(candidate);
                } else {
                    // A candidate must never overtake the description that
                    // makes it meaningful
                    self.ctx.held_candidates.push(candidate);
                }
            }
            PeerEvent::RemoteStream(stream) => {
                if self.ctx.seen_streams.insert(stream.stream_id.clone()) {
                    info!(stream = %stream.stream_id, "remote stream added");
                    let _ = self.events.send(CallEvent::RemoteStreamAdded(stream));
                }
            }
            PeerEvent::StateChanged(state) => self.on_transport_state(state),
        }
    }

    fn on_transport_state(&mut self, state: TransportState) {
        debug!(state = state.as_str(), "transport state changed");
        match state {
            TransportState::Connecting => self.set_state(ConnectionState::Connecting),
            TransportState::Connected => self.set_state(ConnectionState::Connected),
            TransportState::Disconnected => self.set_state(ConnectionState::Disconnected),
            TransportState::Failed => {
                self.request_path_restart();
                self.fail_attempt("transport reported failure".to_string());
            }
            TransportState::New | TransportState::Closed => {}
        }
    }

    /// Ask the live transport for fresh paths before recovery replaces it
    ///
    /// Only the offering side can renegotiate; the answering side's
    /// transport recovers by answering the restart offer.
    fn request_path_restart(&mut self) {
        if !self.identity.role.is_offering_side() {
            return;
        }
        if self.ctx.restart_requested {
            debug!("path restart already requested this attempt");
            return;
        }
        let (Some(transport), Some(channel)) =
            (self.ctx.transport.clone(), self.ctx.channel.clone())
        else {
            return;
        };

        self.ctx.restart_requested = true;
        info!(attempt = self.ctx.attempt, "requesting path restart");

        let identity = self.identity.clone();
        let tasks = self.tasks.clone();
        let attempt = self.ctx.attempt;
        tokio::spawn(async move {
            let result: crate::Result<()> = async {
                let description = transport.create_restart_offer().await?;
                channel
                    .send(&SignalingMessage::offer(description, &identity))
                    .await
            }
            .await;
            let _ = tasks.send(TaskEvent::RestartOfferSent { attempt, result });
        });
    }
}
