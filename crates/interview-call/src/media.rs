//! Local and remote media handles
//!
//! Capture acquisition sits behind [`MediaCapture`] so the negotiation core
//! stays independent of where frames come from. A [`LocalStream`] is a pair
//! of toggleable track handles published to the peer; mute state lives in
//! the handle and survives transport restarts, which re-publish the same
//! tracks.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::MediaConstraints;
use crate::Result;

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

impl TrackKind {
    /// Track kind as it appears in logs and SDP
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// One local capture track with a mute toggle
///
/// Clones share the enabled flag, so a toggle made through any clone is
/// visible everywhere the track is held.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create an enabled track handle
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this is audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the track is currently live
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or mute the track
    ///
    /// Has no effect once the track is stopped.
    pub fn set_enabled(&self, enabled: bool) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.enabled.store(enabled, Ordering::Release);
        debug!(track = %self.id, kind = self.kind.as_str(), enabled, "track toggled");
    }

    /// Flip the track's enabled state, returning the new state
    ///
    /// A stopped track stays disabled.
    pub fn toggle(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        // fetch_xor(true) flips the flag atomically
        let was = self.enabled.fetch_xor(true, Ordering::AcqRel);
        debug!(track = %self.id, kind = self.kind.as_str(), enabled = !was, "track toggled");
        !was
    }

    /// Stop the track, releasing its capture device
    ///
    /// A stopped track stays disabled; it cannot be re-enabled and a new
    /// acquisition is needed to capture again. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.enabled.store(false, Ordering::Release);
        debug!(track = %self.id, kind = self.kind.as_str(), "track stopped");
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// The local audio and video pair published to the peer
#[derive(Debug, Clone)]
pub struct LocalStream {
    audio: LocalTrack,
    video: LocalTrack,
}

impl LocalStream {
    /// Bundle an audio and a video track
    pub fn new(audio: LocalTrack, video: LocalTrack) -> Self {
        Self { audio, video }
    }

    /// The microphone track
    pub fn audio(&self) -> &LocalTrack {
        &self.audio
    }

    /// The camera track
    pub fn video(&self) -> &LocalTrack {
        &self.video
    }

    /// Both tracks in publish order (audio first)
    pub fn tracks(&self) -> [&LocalTrack; 2] {
        [&self.audio, &self.video]
    }

    /// Stop both tracks and release the capture hardware
    ///
    /// Idempotent; part of call teardown.
    pub fn stop(&self) {
        self.audio.stop();
        self.video.stop();
    }
}

/// Media arriving from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Id of the remote stream
    pub stream_id: String,
    /// Ids of the tracks observed on it so far
    pub track_ids: Vec<String>,
}

impl RemoteStream {
    /// Create a remote stream handle
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            track_ids: Vec::new(),
        }
    }

    /// Record a track observed on this stream
    pub fn with_track(mut self, track_id: impl Into<String>) -> Self {
        self.track_ids.push(track_id.into());
        self
    }
}

/// Source of local capture media
///
/// Acquisition happens once per call and the resulting stream is reused
/// across connection attempts. Denied device permission is terminal; no
/// amount of retrying fixes it.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire a local audio and video pair under the given constraints
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MediaPermissionDenied`] when the user refused
    /// device access, or [`crate::Error::MediaCaptureError`] for any other
    /// acquisition failure.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream>;
}

/// Capture source that fabricates tracks without touching devices
///
/// Used by the loopback demo and anywhere real devices are unavailable.
/// The tracks carry no frames; only their identity and mute state matter.
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture;

impl SyntheticCapture {
    /// Create a synthetic capture source
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        debug!(
            width = constraints.video_width,
            height = constraints.video_height,
            "acquiring synthetic capture"
        );
        let suffix = uuid::Uuid::new_v4();
        Ok(LocalStream::new(
            LocalTrack::new(format!("synthetic-audio-{}", suffix), TrackKind::Audio),
            LocalTrack::new(format!("synthetic-video-{}", suffix), TrackKind::Video),
        ))
    }
}
