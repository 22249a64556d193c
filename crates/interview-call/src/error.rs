//! Error types for the call negotiation core

/// Result type alias using the call core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or maintaining a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Relay channel is closed or was never subscribed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Offer/answer negotiation error
    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    /// SDP parse or apply error
    #[error("SDP error: {0}")]
    SdpError(String),

    /// ICE candidate parse or apply error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Underlying peer transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Media capture device error (other than permission denial)
    #[error("Media capture error: {0}")]
    MediaCaptureError(String),

    /// The user denied access to camera/microphone
    #[error("Media permission denied: {0}")]
    MediaPermissionDenied(String),

    /// Presence tracking error
    #[error("Presence error: {0}")]
    PresenceError(String),

    /// Connection did not reach connected within the stall budget
    #[error("Connection stalled: no progress after {0} seconds")]
    StallTimeout(u64),

    /// Automatic retry ceiling was reached without a successful connection
    #[error("Maximum retries reached: {0} attempts failed")]
    RetriesExhausted(u32),

    /// The call session was already closed
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable by a fresh connection attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::TransportError(_)
                | Error::StallTimeout(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error means the user denied device access
    ///
    /// Permission denials are terminal for an attempt: retrying cannot
    /// succeed without user action, so callers surface them immediately.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::MediaPermissionDenied(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is terminal for the whole call
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::MediaPermissionDenied(_) | Error::RetriesExhausted(_) | Error::SessionClosed(_)
        )
    }
}
