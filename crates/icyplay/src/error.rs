//! Error types for icyplay
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Main error type for the icyplay engine
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("{}", friendly_network_error(.0))]
    Network(#[from] reqwest::Error),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation observed a cancellation request. Not a failure.
    #[error("Cancelled")]
    Cancelled,

    /// The caller broke the start/cancel contract of the session controller.
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PlayerError {
    /// True when the error is only a side effect of cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PlayerError::Cancelled)
    }
}

/// Result type alias for icyplay
pub type Result<T> = std::result::Result<T, PlayerError>;

fn friendly_network_error(e: &reqwest::Error) -> String {
    if e.is_builder() {
        if let Some(url) = e.url() {
            return format!("Invalid URL: {url}");
        }
        return "Invalid URL".to_string();
    }
    if e.is_connect() {
        if let Some(url) = e.url() {
            return format!("Could not connect to {}", url.host_str().unwrap_or("server"));
        }
        return "Could not connect to server".to_string();
    }
    if e.is_timeout() {
        return "Connection timed out".to_string();
    }
    if e.is_status() {
        if let Some(status) = e.status() {
            return format!("HTTP {status}");
        }
    }
    format!("Network error: {e}")
}
