//! Peer transport abstraction
//!
//! One [`PeerTransport`] is one connection attempt: it is created fresh,
//! negotiated, and discarded when the attempt ends. Retrying a call never
//! reuses a transport. The negotiation engine drives the trait; the WebRTC
//! implementation lives in [`webrtc`], and tests substitute scripted fakes.

pub mod webrtc;

pub use webrtc::{WebRtcTransport, WebRtcTransportFactory};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::CallConfig;
use crate::media::{LocalStream, RemoteStream};
use crate::signaling::message::{IceCandidate, SessionDescription};
use crate::stats::ConnectionQuality;
use crate::Result;

/// Low-level connection state reported by a transport
///
/// Distinct from the call-level state: the engine folds transport states
/// from the current attempt into the one state the application sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created, nothing negotiated yet
    New,
    /// Paths are being probed
    Connecting,
    /// Media is flowing
    Connected,
    /// Path lost; the transport may still recover on its own
    Disconnected,
    /// Path lost for good; only an ICE restart or a new transport helps
    Failed,
    /// Explicitly closed
    Closed,
}

impl TransportState {
    /// Display name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

/// Events surfaced asynchronously by a transport
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The underlying connection state moved
    StateChanged(TransportState),

    /// A local network path candidate was discovered and should be
    /// signaled to the peer
    LocalCandidate(IceCandidate),

    /// Remote media arrived
    RemoteStream(RemoteStream),
}

/// One peer connection attempt
///
/// All methods take `&self`; implementations are internally synchronized.
/// Offer/answer calls also install the created description locally, so the
/// caller's next step is always just to signal it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Publish the local capture tracks
    ///
    /// Must happen before creating the offer or answer so the description
    /// advertises the media.
    ///
    /// # Errors
    ///
    /// Returns an error if a track cannot be attached.
    async fn publish_stream(&self, stream: &LocalStream) -> Result<()>;

    /// Create an offer and set it as the local description
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot produce or install the
    /// description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an offer that discards current paths and gathers fresh ones
    ///
    /// Used to recover a live session whose network path degraded without
    /// tearing the whole attempt down.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot produce or install the
    /// description.
    async fn create_restart_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the current remote offer and set it locally
    ///
    /// # Errors
    ///
    /// Returns an error if no remote offer is installed or the answer
    /// cannot be produced.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Install the remote peer's description
    ///
    /// # Errors
    ///
    /// Returns an error if the description is rejected.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply one remote network path candidate
    ///
    /// # Errors
    ///
    /// Returns an error if the candidate is malformed or rejected.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Take the transport's event stream
    ///
    /// There is exactly one consumer; returns `None` on every call after
    /// the first.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// Current quality snapshot, when the transport can measure one
    async fn quality_snapshot(&self) -> Option<ConnectionQuality> {
        None
    }

    /// Close the transport and release its resources
    ///
    /// Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails; the transport is unusable
    /// either way.
    async fn close(&self) -> Result<()>;
}

/// Builds one transport per connection attempt
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a fresh, unconnected transport
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be constructed, for
    /// example when the configured servers are unusable.
    async fn create(&self, config: &CallConfig) -> Result<Arc<dyn PeerTransport>>;
}
