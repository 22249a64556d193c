//! Signaling wire format
//!
//! Messages broadcast over a session's relay channel to bootstrap the
//! peer-to-peer connection. Every message carries the sender's identity so
//! receivers can discard their own broadcasts; the relay gives no ordering
//! guarantee across message types, so handlers never assume arrival order.

use serde::{Deserialize, Serialize};

/// Role of a participant within an interview session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Runs the interview; the side that creates offers
    Interviewer,
    /// Is interviewed; the side that answers
    Candidate,
}

impl ParticipantRole {
    /// Whether this role initiates the offer
    ///
    /// Exactly one role ever offers, so two participants can never produce
    /// colliding offers regardless of timing.
    pub fn is_offering_side(&self) -> bool {
        matches!(self, ParticipantRole::Interviewer)
    }

    /// The role on the other side of the call
    pub fn counterpart(&self) -> ParticipantRole {
        match self {
            ParticipantRole::Interviewer => ParticipantRole::Candidate,
            ParticipantRole::Candidate => ParticipantRole::Interviewer,
        }
    }

    /// Wire representation of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Interviewer => "interviewer",
            ParticipantRole::Candidate => "candidate",
        }
    }
}

/// Identity of the local participant, fixed for the lifetime of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Interview session this call belongs to
    pub session_id: String,

    /// Unique id of the local participant
    pub participant_id: String,

    /// Role of the local participant
    pub role: ParticipantRole,
}

impl SessionIdentity {
    /// Create an identity from known ids
    pub fn new(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        role: ParticipantRole,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            role,
        }
    }

    /// Create an identity with a random participant id
    pub fn generate(session_id: impl Into<String>, role: ParticipantRole) -> Self {
        Self::new(session_id, uuid::Uuid::new_v4().to_string(), role)
    }

    /// Relay channel carrying signaling messages for this session
    pub fn signaling_channel(&self) -> String {
        format!("interview-signaling-{}", self.session_id)
    }

    /// Relay channel carrying presence records for this session
    pub fn presence_channel(&self) -> String {
        format!("interview-presence-{}", self.session_id)
    }
}

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer created by the offering side
    Offer,
    /// Answer created in response to an offer
    Answer,
}

/// A session description exchanged as an offer or answer payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Whether this description is an offer or an answer
    #[serde(rename = "type")]
    pub kind: SdpKind,

    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate in its common JSON form
///
/// Field names on the wire match what browser peers produce, so the two
/// ends can interoperate without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description the candidate belongs to
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Create a candidate with media line metadata
    pub fn new(
        candidate: impl Into<String>,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
        }
    }

    /// Whether this is the end-of-gathering marker
    ///
    /// Gathering completion is signalled by an empty candidate string; the
    /// marker is local bookkeeping and is never broadcast.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

/// Payload of a `user-ready` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyFlag {
    /// Always true; the message itself is the signal
    pub ready: bool,
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self { ready: true }
    }
}

/// Signaling message types exchanged over the session channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP offer from the offering side
    Offer {
        /// Offer description
        payload: SessionDescription,
        /// Sending participant id
        from: String,
        /// Sending participant role
        role: ParticipantRole,
    },

    /// SDP answer from the answering side
    Answer {
        /// Answer description
        payload: SessionDescription,
        /// Sending participant id
        from: String,
        /// Sending participant role
        role: ParticipantRole,
    },

    /// One discovered network path
    IceCandidate {
        /// Candidate in its JSON form
        payload: IceCandidate,
        /// Sending participant id
        from: String,
        /// Sending participant role
        role: ParticipantRole,
    },

    /// Sender's signaling channel is subscribed and listening
    UserReady {
        /// Ready marker
        payload: ReadyFlag,
        /// Sending participant id
        from: String,
        /// Sending participant role
        role: ParticipantRole,
    },

    /// Sender attached to the session (informational)
    UserJoined {
        /// Sending participant id
        from: String,
        /// Sending participant role
        role: ParticipantRole,
    },

    /// Sender detached from the session (informational)
    UserLeft {
        /// Sending participant id
        from: String,
        /// Sending participant role
        role: ParticipantRole,
    },
}

impl SignalingMessage {
    /// Build an offer message from the local identity
    pub fn offer(description: SessionDescription, identity: &SessionIdentity) -> Self {
        SignalingMessage::Offer {
            payload: description,
            from: identity.participant_id.clone(),
            role: identity.role,
        }
    }

    /// Build an answer message from the local identity
    pub fn answer(description: SessionDescription, identity: &SessionIdentity) -> Self {
        SignalingMessage::Answer {
            payload: description,
            from: identity.participant_id.clone(),
            role: identity.role,
        }
    }

    /// Build an ice-candidate message from the local identity
    pub fn ice_candidate(candidate: IceCandidate, identity: &SessionIdentity) -> Self {
        SignalingMessage::IceCandidate {
            payload: candidate,
            from: identity.participant_id.clone(),
            role: identity.role,
        }
    }

    /// Build a user-ready message from the local identity
    pub fn user_ready(identity: &SessionIdentity) -> Self {
        SignalingMessage::UserReady {
            payload: ReadyFlag::default(),
            from: identity.participant_id.clone(),
            role: identity.role,
        }
    }

    /// Build a user-joined message from the local identity
    pub fn user_joined(identity: &SessionIdentity) -> Self {
        SignalingMessage::UserJoined {
            from: identity.participant_id.clone(),
            role: identity.role,
        }
    }

    /// Build a user-left message from the local identity
    pub fn user_left(identity: &SessionIdentity) -> Self {
        SignalingMessage::UserLeft {
            from: identity.participant_id.clone(),
            role: identity.role,
        }
    }

    /// Id of the sending participant
    pub fn from(&self) -> &str {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::UserReady { from, .. }
            | SignalingMessage::UserJoined { from, .. }
            | SignalingMessage::UserLeft { from, .. } => from,
        }
    }

    /// Role of the sending participant
    pub fn role(&self) -> ParticipantRole {
        match self {
            SignalingMessage::Offer { role, .. }
            | SignalingMessage::Answer { role, .. }
            | SignalingMessage::IceCandidate { role, .. }
            | SignalingMessage::UserReady { role, .. }
            | SignalingMessage::UserJoined { role, .. }
            | SignalingMessage::UserLeft { role, .. } => *role,
        }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::UserReady { .. } => "user-ready",
            SignalingMessage::UserJoined { .. } => "user-joined",
            SignalingMessage::UserLeft { .. } => "user-left",
        }
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse message from an already-decoded JSON value
    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        serde_json::from_value(value).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to decode signaling message: {}",
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interviewer() -> SessionIdentity {
        SessionIdentity::new("session-1", "user-a", ParticipantRole::Interviewer)
    }

    #[test]
    fn test_offer_round_trip() {
        let msg = SignalingMessage::offer(SessionDescription::offer("v=0\r\no=- ..."), &interviewer());
        let json = msg.to_json().unwrap();
        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(msg, parsed);
        assert!(json.contains("\"type\":\"offer\""));
    }

    #[test]
    fn test_ice_candidate_wire_shape() {
        let msg = SignalingMessage::ice_candidate(
            IceCandidate::new("candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host", Some("0".to_string()), Some(0)),
            &interviewer(),
        );
        let json = msg.to_json().unwrap();

        // Kebab-case tag plus browser-style candidate field names
        assert!(json.contains("\"type\":\"ice-candidate\""));
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));

        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_candidate_optional_fields_omitted() {
        let candidate = IceCandidate::new("candidate:...", None, None);
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(!json.contains("sdpMid"));
        assert!(!json.contains("sdpMLineIndex"));
    }

    #[test]
    fn test_end_of_candidates_marker() {
        assert!(IceCandidate::new("", None, None).is_end_of_candidates());
        assert!(!IceCandidate::new("candidate:...", None, None).is_end_of_candidates());
    }

    #[test]
    fn test_user_ready_round_trip() {
        let identity = SessionIdentity::new("session-1", "user-b", ParticipantRole::Candidate);
        let msg = SignalingMessage::user_ready(&identity);
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"user-ready\""));
        assert!(json.contains("\"ready\":true"));
        assert!(json.contains("\"role\":\"candidate\""));

        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(parsed.from(), "user-b");
        assert_eq!(parsed.role(), ParticipantRole::Candidate);
    }

    #[test]
    fn test_join_leave_round_trip() {
        let msg = SignalingMessage::user_joined(&interviewer());
        let parsed = SignalingMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed.kind(), "user-joined");

        let msg = SignalingMessage::user_left(&interviewer());
        let parsed = SignalingMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed.kind(), "user-left");
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(SignalingMessage::from_json("{\"type\":\"offer\"}").is_err());
        assert!(SignalingMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_role_helpers() {
        assert!(ParticipantRole::Interviewer.is_offering_side());
        assert!(!ParticipantRole::Candidate.is_offering_side());
        assert_eq!(
            ParticipantRole::Interviewer.counterpart(),
            ParticipantRole::Candidate
        );
        assert_eq!(ParticipantRole::Candidate.as_str(), "candidate");
    }

    #[test]
    fn test_channel_names() {
        let identity = interviewer();
        assert_eq!(identity.signaling_channel(), "interview-signaling-session-1");
        assert_eq!(identity.presence_channel(), "interview-presence-session-1");
    }

    #[test]
    fn test_generated_identity_is_unique() {
        let a = SessionIdentity::generate("s", ParticipantRole::Interviewer);
        let b = SessionIdentity::generate("s", ParticipantRole::Interviewer);
        assert_ne!(a.participant_id, b.participant_id);
    }
}
