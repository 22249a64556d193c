//! Configuration types for call sessions

use serde::{Deserialize, Serialize};

/// Main configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN server URLs (at least one required unless TURN is configured)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional; deployment concern, not protocol)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Seconds a connection may stay in `connecting` before it is
    /// classified as stalled (default: 15)
    pub stall_timeout_secs: u64,

    /// Maximum automatic retry attempts after a failure (default: 3)
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds; doubles per retry (default: 1000)
    pub backoff_initial_ms: u64,

    /// Maximum retry backoff in milliseconds (default: 30000)
    pub backoff_max_ms: u64,

    /// Local media capture constraints
    pub media: MediaConstraints,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Requested properties of the local capture device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Requested video width in pixels (default: 1280)
    pub video_width: u32,

    /// Requested video height in pixels (default: 720)
    pub video_height: u32,

    /// Enable acoustic echo cancellation (default: true)
    pub echo_cancellation: bool,

    /// Enable noise suppression (default: true)
    pub noise_suppression: bool,

    /// Enable automatic gain control (default: true)
    pub auto_gain_control: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            stall_timeout_secs: 15,
            max_retries: 3,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            media: MediaConstraints::default(),
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video_width: 1280,
            video_height: 720,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no STUN or TURN server is configured
    /// - a STUN URL does not start with `stun:`
    /// - a TURN URL does not start with `turn:` or `turns:`
    /// - `stall_timeout_secs` is zero
    /// - the backoff range is empty or inverted
    /// - a requested video dimension is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN URL must start with stun:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.stall_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "stall_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.backoff_initial_ms == 0 {
            return Err(Error::InvalidConfig(
                "backoff_initial_ms must be greater than zero".to_string(),
            ));
        }

        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "backoff_max_ms ({}) must not be below backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }

        if self.media.video_width == 0 || self.media.video_height == 0 {
            return Err(Error::InvalidConfig(format!(
                "video dimensions must be non-zero, got {}x{}",
                self.media.video_width, self.media.video_height
            )));
        }

        Ok(())
    }

    /// Create a configuration preset that gives up quickly
    ///
    /// Best for flows where a human is watching a spinner and a fast,
    /// explicit failure beats a long silent wait (e.g. pre-interview
    /// device checks).
    ///
    /// Settings:
    /// - Stall timeout: 5 seconds
    /// - Automatic retries: 1
    /// - Backoff: 500ms initial, 2000ms cap
    ///
    /// # Example
    ///
    /// ```
    /// use interview_call::CallConfig;
    ///
    /// let config = CallConfig::fast_fail();
    /// assert_eq!(config.stall_timeout_secs, 5);
    /// assert_eq!(config.max_retries, 1);
    /// ```
    pub fn fast_fail() -> Self {
        Self {
            stall_timeout_secs: 5,
            max_retries: 1,
            backoff_initial_ms: 500,
            backoff_max_ms: 2000,
            ..Self::default()
        }
    }

    /// Create a configuration preset for unreliable networks
    ///
    /// Best for participants on cellular or heavily firewalled networks.
    /// TURN servers should be added via [`CallConfig::with_turn_servers`]
    /// since relayed connectivity is usually what such networks need.
    ///
    /// Settings:
    /// - Stall timeout: 30 seconds (slow handshakes get more room)
    /// - Automatic retries: 5
    /// - Backoff: 2000ms initial, 60000ms cap
    ///
    /// # Example
    ///
    /// ```
    /// use interview_call::{CallConfig, TurnServerConfig};
    ///
    /// let config = CallConfig::patient_network().with_turn_servers(vec![
    ///     TurnServerConfig {
    ///         url: "turn:turn.example.com:3478".to_string(),
    ///         username: "user".to_string(),
    ///         credential: "pass".to_string(),
    ///     },
    /// ]);
    /// assert_eq!(config.stall_timeout_secs, 30);
    /// assert_eq!(config.turn_servers.len(), 1);
    /// ```
    pub fn patient_network() -> Self {
        Self {
            stall_timeout_secs: 30,
            max_retries: 5,
            backoff_initial_ms: 2000,
            backoff_max_ms: 60000,
            ..Self::default()
        }
    }

    /// Add TURN servers to this configuration
    ///
    /// Useful for chaining with preset methods.
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Replace the STUN server list
    ///
    /// Useful for chaining with preset methods.
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    /// Set the stall timeout in seconds
    ///
    /// Useful for chaining with preset methods.
    pub fn with_stall_timeout(mut self, secs: u64) -> Self {
        self.stall_timeout_secs = secs;
        self
    }

    /// Set the automatic retry ceiling
    ///
    /// Useful for chaining with preset methods.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
