//! Session-scoped signaling
//!
//! [`message`] defines the wire format; [`channel`] adapts one relay
//! channel into a typed, self-filtered message stream for the negotiation
//! engine.

pub mod channel;
pub mod message;

pub use channel::{ChannelEvent, SignalingChannel};
pub use message::{
    IceCandidate, ParticipantRole, SdpKind, SessionDescription, SessionIdentity, SignalingMessage,
};
