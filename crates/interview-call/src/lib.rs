//! Peer-to-peer call negotiation core for interview sessions
//!
//! This crate implements the call plumbing between exactly two fixed-role
//! participants: an interviewer and a candidate who exchange offers,
//! answers, and trickled ICE candidates over a shared message relay until
//! media flows directly between them.
//!
//! # Features
//!
//! - **Role-based offering**: the interviewer always offers, the candidate
//!   always answers, so offer glare cannot occur
//! - **Trickle ICE with queueing**: candidates arriving before the remote
//!   description are held and drained in order
//! - **Connection recovery**: stall detection, ICE restarts, and bounded
//!   exponential-backoff retries with fresh attempts
//! - **Presence roster**: who is attached and whether their camera and
//!   microphone are live, via the relay's membership primitive
//! - **Pluggable edges**: the message relay, media capture, and peer
//!   transport are traits; production uses WebRTC, tests use fakes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  CallSession (facade)                                    │
//! │  ├─ MediaCapture → LocalStream (microphone + camera)     │
//! │  ├─ NegotiationEngine (offer/answer, candidate queue)    │
//! │  │   ├─ SignalingChannel (relay broadcast, self-filter)  │
//! │  │   └─ PeerTransport (one per attempt; WebRTC)          │
//! │  ├─ RecoveryController (stall timer, bounded retries)    │
//! │  └─ PresenceTracker (roster + media toggle flags)        │
//! │        ↕                                                 │
//! │  MessageRelay (broadcast + presence primitive)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use interview_call::CallConfig;
//!
//! // Tune timings for flaky networks; validation catches bad values
//! let config = CallConfig::patient_network();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_retries, 5);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use interview_call::{
//!     CallConfig, CallEvent, CallSession, InMemoryRelay, ParticipantRole,
//!     SessionIdentity, SyntheticCapture, WebRtcTransportFactory,
//! };
//!
//! # async fn example() -> interview_call::Result<()> {
//! let identity = SessionIdentity::generate("interview-42", ParticipantRole::Interviewer);
//! let session = CallSession::connect(
//!     identity,
//!     CallConfig::default(),
//!     Arc::new(InMemoryRelay::default()),
//!     Arc::new(WebRtcTransportFactory::new()),
//!     Arc::new(SyntheticCapture::new()),
//! )
//! .await?;
//!
//! let mut events = session.events();
//! while let Ok(event) = events.recv().await {
//!     if let CallEvent::RemoteStreamAdded(stream) = event {
//!         println!("remote media: {}", stream.stream_id);
//!         break;
//!     }
//! }
//!
//! session.end_call().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod presence;
pub mod recovery;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod transport;

// Re-exports for public API
pub use config::{CallConfig, MediaConstraints, TurnServerConfig};
pub use error::{Error, Result};
pub use media::{LocalStream, LocalTrack, MediaCapture, RemoteStream, SyntheticCapture, TrackKind};
pub use negotiation::ConnectionState;
pub use presence::{PresenceRecord, PresenceTracker};
pub use relay::{ChannelStatus, InMemoryRelay, MessageRelay, RelayEvent, RelaySubscription};
pub use session::{CallEvent, CallSession};
pub use signaling::{
    IceCandidate, ParticipantRole, SessionDescription, SessionIdentity, SignalingMessage,
};
pub use stats::{ConnectionPath, ConnectionQuality};
pub use transport::{
    PeerEvent, PeerTransport, PeerTransportFactory, TransportState, WebRtcTransport,
    WebRtcTransportFactory,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
