//! Loopback call demo
//!
//! Runs both sides of an interview call in one process: an interviewer and a
//! candidate session share an in-memory relay for signaling while real
//! peer connections negotiate over loopback host candidates. Useful for
//! exercising the full offer/answer/ICE flow without a browser or a
//! signaling backend.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (10 second call, verbose state logging)
//! cargo run --bin loopback_call
//!
//! # Custom session id and a longer hold
//! cargo run --bin loopback_call -- --session-id demo-42 --hold-secs 30
//!
//! # Hold the call until Ctrl+C
//! cargo run --bin loopback_call -- --hold-secs 0
//!
//! # Debug logging
//! RUST_LOG=interview_call=debug cargo run --bin loopback_call
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use interview_call::{
    CallConfig, CallEvent, CallSession, ConnectionState, InMemoryRelay, MediaCapture,
    MessageRelay, ParticipantRole, PeerTransportFactory, SessionIdentity, SyntheticCapture,
    WebRtcTransportFactory,
};

/// Command-line arguments for the loopback demo
#[derive(Parser, Debug)]
#[command(name = "loopback_call")]
#[command(about = "Run an interviewer and a candidate call session in one process")]
struct Args {
    /// Session identifier shared by both participants
    #[arg(long, env = "INTERVIEW_SESSION_ID", default_value = "loopback-demo")]
    session_id: String,

    /// STUN servers (comma-delimited)
    #[arg(
        long,
        env = "INTERVIEW_STUN_SERVERS",
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// Seconds a connection attempt may sit in Connecting before it is
    /// treated as stalled
    #[arg(long, env = "INTERVIEW_STALL_TIMEOUT_SECS", default_value_t = 15)]
    stall_timeout_secs: u64,

    /// Automatic retry budget per call
    #[arg(long, env = "INTERVIEW_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Seconds to hold the call once connected (0 waits for Ctrl+C)
    #[arg(long, default_value_t = 10)]
    hold_secs: u64,

    /// Seconds to wait for both sides to reach Connected before giving up
    #[arg(long, default_value_t = 30)]
    connect_timeout_secs: u64,
}

/// Build the call configuration from command-line arguments
fn build_config(args: &Args) -> CallConfig {
    CallConfig::default()
        .with_stun_servers(args.stun_servers.clone())
        .with_stall_timeout(args.stall_timeout_secs)
        .with_max_retries(args.max_retries)
}

/// Initialize the tracing subscriber
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Log every call event for one side of the call
fn spawn_event_logger(side: &'static str, mut events: broadcast::Receiver<CallEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged(state)) => {
                    info!(side, %state, "connection state changed");
                }
                Ok(CallEvent::RemoteStreamAdded(stream)) => {
                    info!(side, stream_id = %stream.stream_id, "remote stream arrived");
                }
                Ok(CallEvent::PeerReady { participant_id }) => {
                    info!(side, %participant_id, "peer signaling channel ready");
                }
                Ok(CallEvent::PeerJoined { participant_id, role }) => {
                    info!(side, %participant_id, role = role.as_str(), "peer joined");
                }
                Ok(CallEvent::PeerLeft { participant_id }) => {
                    info!(side, %participant_id, "peer left");
                }
                Ok(CallEvent::ParticipantsChanged(roster)) => {
                    let names: Vec<&str> = roster.iter().map(|p| p.user_id.as_str()).collect();
                    info!(side, participants = ?names, "roster updated");
                }
                Ok(CallEvent::AttemptFailed { attempt, reason }) => {
                    warn!(side, attempt, %reason, "connection attempt failed");
                }
                Ok(CallEvent::RetryScheduled { attempt, retry, delay }) => {
                    info!(side, attempt, retry, delay_ms = delay.as_millis() as u64, "retry scheduled");
                }
                Ok(CallEvent::RetriesExhausted { attempts }) => {
                    error!(side, attempts, "automatic retries exhausted");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(side, skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Wait until a session reaches Connected, or time out
async fn wait_for_connected(session: &CallSession, timeout: Duration) -> Result<()> {
    let mut state = session.state_watch();
    tokio::time::timeout(timeout, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .context("timed out waiting for the call to connect")?
        .context("session ended before connecting")?;
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();

    info!("Starting loopback call demo");
    info!(session_id = %args.session_id, "Session");
    info!(stun_servers = ?args.stun_servers, "STUN servers");
    info!(
        stall_timeout_secs = args.stall_timeout_secs,
        max_retries = args.max_retries,
        "Recovery policy"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let config = build_config(&args);
    config.validate().context("invalid call configuration")?;

    // Both sessions share one relay and one transport factory; each side
    // acquires its own synthetic media.
    let relay: Arc<dyn MessageRelay> = Arc::new(InMemoryRelay::new());
    let factory: Arc<dyn PeerTransportFactory> = Arc::new(WebRtcTransportFactory::new());
    let capture: Arc<dyn MediaCapture> = Arc::new(SyntheticCapture::new());

    let candidate_identity =
        SessionIdentity::generate(&args.session_id, ParticipantRole::Candidate);
    let interviewer_identity =
        SessionIdentity::generate(&args.session_id, ParticipantRole::Interviewer);

    // Candidate joins first and waits; the interviewer's arrival triggers
    // the offer.
    let candidate = CallSession::connect(
        candidate_identity,
        config.clone(),
        relay.clone(),
        factory.clone(),
        capture.clone(),
    )
    .await
    .context("candidate failed to join")?;
    let candidate_logger = spawn_event_logger("candidate", candidate.events());

    info!(
        waiting = candidate.waiting_for_peer(),
        "candidate joined, waiting for interviewer"
    );

    let interviewer = CallSession::connect(
        interviewer_identity,
        config,
        relay.clone(),
        factory.clone(),
        capture.clone(),
    )
    .await
    .context("interviewer failed to join")?;
    let interviewer_logger = spawn_event_logger("interviewer", interviewer.events());

    let connect_timeout = Duration::from_secs(args.connect_timeout_secs);
    let connected = tokio::try_join!(
        wait_for_connected(&interviewer, connect_timeout),
        wait_for_connected(&candidate, connect_timeout),
    );

    match connected {
        Ok(_) => {
            info!("both sides connected");

            let roster = interviewer.participants();
            info!(participants = roster.len(), "roster size");

            // Exercise a media toggle so the presence update is visible in
            // the logs.
            let video_on = interviewer.toggle_video().await?;
            info!(video_on, "interviewer toggled video");
            tokio::time::sleep(Duration::from_millis(250)).await;
            let video_on = interviewer.toggle_video().await?;
            info!(video_on, "interviewer toggled video back");

            if let Some(quality) = interviewer.diagnostics().await {
                info!(
                    path = quality.path.as_str(),
                    round_trip_ms = ?quality.round_trip_ms,
                    score = quality.quality_score(),
                    "interviewer connection quality"
                );
            }

            if args.hold_secs == 0 {
                info!("holding call until Ctrl+C");
                tokio::signal::ctrl_c()
                    .await
                    .context("failed to listen for Ctrl+C")?;
                info!("interrupted, hanging up");
            } else {
                info!(hold_secs = args.hold_secs, "holding call");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(args.hold_secs)) => {}
                    result = tokio::signal::ctrl_c() => {
                        result.context("failed to listen for Ctrl+C")?;
                        info!("interrupted, hanging up early");
                    }
                }
            }
        }
        Err(err) => {
            error!(error = %err, "call never connected, tearing down");
        }
    }

    interviewer.end_call().await;
    candidate.end_call().await;

    interviewer_logger.abort();
    candidate_logger.abort();

    info!("loopback call finished");
    Ok(())
}
