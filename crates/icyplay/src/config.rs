//! Configuration for the icyplay engine
//!
//! Constants grouped by concern, plus `PlayerConfig`, the serde-loadable
//! runtime configuration whose defaults come from those constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlayerError, Result};

/// Audio analysis configuration
pub mod audio {
    /// FFT window size for the analysis tap
    pub const FFT_SIZE: usize = 512;

    /// Number of frequency bands in the spectrum
    pub const SPECTRUM_BANDS: usize = 16;

    /// VU meter decay factor (0.0-1.0, higher = slower decay)
    pub const VU_DECAY: f32 = 0.7;

    /// Sample rate of the silent clock source driving the output clock
    pub const CLOCK_SAMPLE_RATE: u32 = 48_000;
}

/// Network-related configuration
pub mod network {
    /// User agent for HTTP requests
    pub const USER_AGENT: &str = concat!("icyplay/", env!("CARGO_PKG_VERSION"));

    /// Request header asking the server for in-band metadata
    pub const ICY_METADATA_HEADER: &str = "Icy-MetaData";

    /// Prefix of response headers lowered into the tag set
    pub const ICY_HEADER_PREFIX: &str = "icy-";

    /// Connection attempt bound in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 3_000;

    /// Read size for the ICY body reader (bytes)
    pub const READ_CHUNK_SIZE: usize = 8 * 1024;

    /// Audio chunks buffered between the network thread and the pump
    pub const AUDIO_CHANNEL_BOUND: usize = 32;

    /// Minimum interval between stats-only events (milliseconds)
    pub const STATS_INTERVAL_MS: u64 = 1_000;

    /// How long a finishing session waits for its network threads to exit
    /// before leaving them detached (milliseconds)
    pub const WORKER_JOIN_MS: u64 = 250;
}

/// Playback scheduler configuration
pub mod scheduler {
    /// Lookahead used to seed the cursor at session start (seconds)
    pub const INITIAL_LOOKAHEAD_SECS: f64 = 0.2;

    /// Minimum distance from the output clock for any new buffer (seconds)
    pub const MIN_LOOKAHEAD_SECS: f64 = 0.02;

    /// How often the direct path checks whether its element finished (milliseconds)
    pub const ELEMENT_POLL_MS: u64 = 100;
}

/// Format probe configuration
pub mod probe {
    /// Maximum bytes read by the metadata probe before giving up
    pub const PROBE_BYTE_LIMIT: u64 = 1024 * 1024;

    /// Maximum time to wait for the direct-path format probe (seconds)
    pub const PROBE_TIMEOUT_SECS: u64 = 10;
}

/// Runtime configuration for a player.
///
/// Every field is optional in serialized form and falls back to the
/// matching constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_initial_lookahead")]
    pub initial_lookahead_secs: f64,

    #[serde(default = "default_min_lookahead")]
    pub min_lookahead_secs: f64,

    #[serde(default = "default_probe_byte_limit")]
    pub probe_byte_limit: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Initial volume (0.0 - 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_connect_timeout_ms() -> u64 {
    network::CONNECT_TIMEOUT_MS
}

fn default_initial_lookahead() -> f64 {
    scheduler::INITIAL_LOOKAHEAD_SECS
}

fn default_min_lookahead() -> f64 {
    scheduler::MIN_LOOKAHEAD_SECS
}

fn default_probe_byte_limit() -> u64 {
    probe::PROBE_BYTE_LIMIT
}

fn default_user_agent() -> String {
    network::USER_AGENT.to_string()
}

fn default_volume() -> f32 {
    1.0
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            initial_lookahead_secs: default_initial_lookahead(),
            min_lookahead_secs: default_min_lookahead(),
            probe_byte_limit: default_probe_byte_limit(),
            user_agent: default_user_agent(),
            volume: default_volume(),
        }
    }
}

impl PlayerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reject values the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(PlayerError::Config("connect_timeout_ms must be > 0".into()));
        }
        if !(self.initial_lookahead_secs >= 0.0) || !(self.min_lookahead_secs >= 0.0) {
            return Err(PlayerError::Config("lookahead must be non-negative".into()));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(PlayerError::Config("volume must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}
