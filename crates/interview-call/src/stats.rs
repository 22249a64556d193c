//! Connection path diagnostics
//!
//! Lightweight view of how the call is actually flowing, suitable for a
//! diagnostics panel. Values come from whatever the transport can measure;
//! a transport that cannot measure reports nothing rather than guessing.

use serde::Serialize;

/// How media travels between the two peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPath {
    /// Host-to-host, no intermediary
    Direct,
    /// Via server-reflexive addresses discovered through STUN
    Reflexive,
    /// Forwarded through a TURN relay
    Relayed,
    /// Selected pair not yet known
    Unknown,
}

impl ConnectionPath {
    /// Classify a selected candidate pair by its endpoint types
    ///
    /// Types are the standard candidate type strings (`host`, `srflx`,
    /// `prflx`, `relay`). A relay on either side makes the whole path
    /// relayed.
    pub fn classify(local_type: &str, remote_type: &str) -> Self {
        let is_reflexive = |t: &str| t == "srflx" || t == "prflx";

        if local_type == "relay" || remote_type == "relay" {
            ConnectionPath::Relayed
        } else if is_reflexive(local_type) || is_reflexive(remote_type) {
            ConnectionPath::Reflexive
        } else if local_type == "host" && remote_type == "host" {
            ConnectionPath::Direct
        } else {
            ConnectionPath::Unknown
        }
    }

    /// Path as a display string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPath::Direct => "direct",
            ConnectionPath::Reflexive => "reflexive",
            ConnectionPath::Relayed => "relayed",
            ConnectionPath::Unknown => "unknown",
        }
    }
}

/// Point-in-time connection quality snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionQuality {
    /// How media is flowing
    pub path: ConnectionPath,

    /// Current round-trip time in milliseconds, when measured
    pub round_trip_ms: Option<f64>,

    /// Outbound packets the peer reported as lost since the attempt started
    pub packets_lost: u64,

    /// Inbound packets received since the attempt started
    pub packets_received: u64,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            path: ConnectionPath::Unknown,
            round_trip_ms: None,
            packets_lost: 0,
            packets_received: 0,
        }
    }
}

impl ConnectionQuality {
    /// Approximate fraction of packets lost (0.0 - 1.0)
    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_lost + self.packets_received;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64
        }
    }

    /// Calculate quality score (0-100)
    ///
    /// Higher is better. Based on round-trip time and packet loss.
    pub fn quality_score(&self) -> u32 {
        let mut score = 100u32;

        // Deduct for latency (ideal < 100ms)
        if let Some(rtt) = self.round_trip_ms {
            if rtt > 100.0 {
                let deduction = ((rtt - 100.0) / 10.0).min(30.0) as u32;
                score = score.saturating_sub(deduction);
            }
        }

        // Deduct for packet loss (each 1% costs 10 points)
        let loss_deduction = (self.loss_rate() * 100.0 * 10.0).min(40.0) as u32;
        score = score.saturating_sub(loss_deduction);

        // Relayed paths add a hop worth of latency risk
        if self.path == ConnectionPath::Relayed {
            score = score.saturating_sub(10);
        }

        score
    }

    /// Check if connection quality is acceptable
    pub fn is_acceptable(&self) -> bool {
        self.quality_score() >= 50
    }
}
