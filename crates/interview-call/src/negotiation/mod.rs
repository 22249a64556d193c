//! Offer/answer negotiation core
//!
//! The engine in [`machine`] owns the connection lifecycle for one call:
//! who offers, how answers and trickled candidates are applied, and what
//! the application-visible connection state is at any moment. Glare never
//! arises because exactly one role offers; the answering side only reacts.

pub mod candidates;
pub mod machine;

pub use candidates::CandidateQueue;
pub use machine::{EngineCommand, EngineHandle, NegotiationEngine};

use serde::Serialize;

/// Call-level connection state
///
/// Owned exclusively by the negotiation engine. Other components read it
/// through a watch channel and request transitions via commands; nobody
/// else writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection attempt exists
    Idle,
    /// Attempt underway: transport created, negotiation in progress
    Connecting,
    /// Media is flowing
    Connected,
    /// Transient loss; the transport may recover on its own
    Disconnected,
    /// The attempt is dead; only a restart produces a new one
    Failed,
}

impl ConnectionState {
    /// Display name used in logs and UI badges
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether an attempt currently exists in some form
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Idle)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Failed.as_str(), "failed");
    }

    #[test]
    fn test_idle_is_inactive() {
        assert!(!ConnectionState::Idle.is_active());
        assert!(ConnectionState::Disconnected.is_active());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
    }
}
