//! Connection recovery
//!
//! Bounds how long a connection attempt may sit in `connecting` and how
//! many end-to-end retries are spent before giving up. The controller
//! never touches descriptions or candidates; it watches state, runs the
//! timers, and asks the engine to declare stalls or start fresh attempts.
//! The engine remains the only writer of connection state.

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::negotiation::{ConnectionState, EngineCommand};
use crate::session::CallEvent;

// ============================================================================
// Retry policy
// ============================================================================

/// Timing rules for stall detection and retry backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// How long an attempt may stay in `connecting`
    pub stall_timeout: Duration,
    /// Automatic restarts allowed before giving up
    pub max_retries: u32,
    /// First backoff delay in milliseconds
    pub backoff_initial_ms: u64,
    /// Backoff cap in milliseconds
    pub backoff_max_ms: u64,
    /// Spread restarts out with 0-25% random jitter
    pub jitter_enabled: bool,
}

impl RetryPolicy {
    /// Derive the policy from call configuration
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            stall_timeout: Duration::from_secs(config.stall_timeout_secs),
            max_retries: config.max_retries,
            backoff_initial_ms: config.backoff_initial_ms,
            backoff_max_ms: config.backoff_max_ms,
            jitter_enabled: true,
        }
    }

    /// Disable jitter for deterministic timing
    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    /// Check if another automatic retry is allowed
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Calculate backoff duration before retry number `retry_count + 1`
    ///
    /// Doubles per retry from the initial delay, clamped to the cap, plus
    /// optional jitter.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let backoff_ms = self
            .backoff_initial_ms
            .saturating_mul(2u64.saturating_pow(retry_count))
            .min(self.backoff_max_ms);

        let final_ms = if self.jitter_enabled {
            // Add 0-25% jitter to prevent thundering herd
            let jitter = rand::random::<f64>() * (backoff_ms as f64 * 0.25);
            backoff_ms as f64 + jitter
        } else {
            backoff_ms as f64
        };

        Duration::from_millis(final_ms as u64)
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Requests the caller can make of the controller
#[derive(Debug)]
enum RecoveryRequest {
    ManualRetry,
}

/// Control surface for a spawned recovery controller
pub struct RecoveryHandle {
    requests: mpsc::UnboundedSender<RecoveryRequest>,
    retries_rx: watch::Receiver<u32>,
    _task: JoinHandle<()>,
}

impl RecoveryHandle {
    /// Request an immediate fresh attempt
    ///
    /// Honored only while the call is in the failed state; counts against
    /// the same retry budget as automatic restarts, but is allowed even
    /// after that budget is spent.
    pub fn manual_retry(&self) {
        let _ = self.requests.send(RecoveryRequest::ManualRetry);
    }

    /// Retries consumed so far; resets to zero on every connect
    pub fn retry_count(&self) -> u32 {
        *self.retries_rx.borrow()
    }
}

/// Supervises connection attempts with a stall timer and bounded retries
pub struct RecoveryController {
    policy: RetryPolicy,
    state_rx: watch::Receiver<ConnectionState>,
    attempt_rx: watch::Receiver<u64>,
    commands: mpsc::UnboundedSender<EngineCommand>,
    events_tx: broadcast::Sender<CallEvent>,
    events_rx: broadcast::Receiver<CallEvent>,
    requests_rx: mpsc::UnboundedReceiver<RecoveryRequest>,
    retries_tx: watch::Sender<u32>,

    retry_count: u32,
    /// Attempt the armed stall timer is measuring
    watched_attempt: u64,
    stall_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
    /// Attempt to replace when the backoff elapses
    pending_restart: Option<u64>,
}

impl RecoveryController {
    /// Spawn the controller
    ///
    /// `state_rx`/`attempt_rx` come from the engine handle; `commands` is
    /// the engine's command sender. The controller exits on its own when
    /// the engine closes.
    pub fn spawn(
        policy: RetryPolicy,
        state_rx: watch::Receiver<ConnectionState>,
        attempt_rx: watch::Receiver<u64>,
        commands: mpsc::UnboundedSender<EngineCommand>,
        events_tx: broadcast::Sender<CallEvent>,
    ) -> RecoveryHandle {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (retries_tx, retries_rx) = watch::channel(0);
        let events_rx = events_tx.subscribe();

        let controller = Self {
            policy,
            state_rx,
            attempt_rx,
            commands,
            events_tx,
            events_rx,
            requests_rx,
            retries_tx,
            retry_count: 0,
            watched_attempt: 0,
            stall_deadline: None,
            retry_deadline: None,
            pending_restart: None,
        };

        let task = tokio::spawn(controller.run());

        RecoveryHandle {
            requests: requests_tx,
            retries_rx,
            _task: task,
        }
    }

    async fn run(mut self) {
        info!(
            stall_secs = self.policy.stall_timeout.as_secs(),
            max_retries = self.policy.max_retries,
            "recovery controller started"
        );

        loop {
            tokio::select! {
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.state_rx.borrow_and_update();
                    self.on_state(state);
                }
                event = self.events_rx.recv() => match event {
                    Ok(event) => self.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "recovery controller lagged behind call events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(request) = self.requests_rx.recv() => self.on_request(request),
                _ = wait_until(self.stall_deadline) => self.on_stall_elapsed(),
                _ = wait_until(self.retry_deadline) => self.on_retry_elapsed(),
            }
        }

        info!("recovery controller stopped");
    }

    fn on_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => {
                // Attempt number is published before the state flips, so
                // this reads the attempt the timer belongs to
                self.watched_attempt = *self.attempt_rx.borrow();
                self.stall_deadline = Some(Instant::now() + self.policy.stall_timeout);
                debug!(attempt = self.watched_attempt, "stall timer armed");
            }
            ConnectionState::Connected => {
                self.stall_deadline = None;
                self.retry_deadline = None;
                self.pending_restart = None;
                if self.retry_count != 0 {
                    info!(retries = self.retry_count, "connection recovered; retry budget reset");
                }
                self.set_retry_count(0);
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                // Any transition out of connecting disarms the stall timer;
                // a stale timer must never fire against a later attempt
                self.stall_deadline = None;
            }
            ConnectionState::Idle => {
                self.stall_deadline = None;
                self.retry_deadline = None;
                self.pending_restart = None;
            }
        }
    }

    fn on_event(&mut self, event: CallEvent) {
        let CallEvent::AttemptFailed { attempt, reason } = event else {
            return;
        };

        if !self.policy.should_retry(self.retry_count) {
            warn!(
                attempt,
                retries = self.retry_count,
                "retry budget exhausted; awaiting manual retry"
            );
            let _ = self.events_tx.send(CallEvent::RetriesExhausted {
                attempts: self.retry_count,
            });
            return;
        }

        let delay = self.policy.backoff_delay(self.retry_count);
        info!(
            attempt,
            retry = self.retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "scheduling attempt restart"
        );
        let _ = self.events_tx.send(CallEvent::RetryScheduled {
            attempt,
            retry: self.retry_count + 1,
            delay,
        });
        self.retry_deadline = Some(Instant::now() + delay);
        self.pending_restart = Some(attempt);
        self.set_retry_count(self.retry_count + 1);
    }

    fn on_request(&mut self, request: RecoveryRequest) {
        match request {
            RecoveryRequest::ManualRetry => {
                let state = *self.state_rx.borrow();
                if state != ConnectionState::Failed {
                    debug!(state = state.as_str(), "manual retry ignored outside failed state");
                    return;
                }
                let attempt = *self.attempt_rx.borrow();
                info!(attempt, retries = self.retry_count, "manual retry requested");
                self.retry_deadline = None;
                self.pending_restart = None;
                self.set_retry_count(self.retry_count + 1);
                let _ = self.commands.send(EngineCommand::RestartAttempt { attempt });
            }
        }
    }

    fn on_stall_elapsed(&mut self) {
        self.stall_deadline = None;
        warn!(
            attempt = self.watched_attempt,
            budget_secs = self.policy.stall_timeout.as_secs(),
            "no progress within the stall budget"
        );
        let _ = self.commands.send(EngineCommand::MarkStalled {
            attempt: self.watched_attempt,
        });
    }

    fn on_retry_elapsed(&mut self) {
        self.retry_deadline = None;
        if let Some(attempt) = self.pending_restart.take() {
            info!(attempt, "backoff elapsed; requesting fresh attempt");
            let _ = self.commands.send(EngineCommand::RestartAttempt { attempt });
        }
    }

    fn set_retry_count(&mut self, count: u32) {
        self.retry_count = count;
        let _ = self.retries_tx.send(count);
    }
}

/// Sleep until the deadline, or forever when there is none
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
