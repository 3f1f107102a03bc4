//! icyplay - gapless ICY internet-radio playback
//!
//! Connects to Icecast/Shoutcast streams, extracts station tags and in-band
//! titles, decodes chunked audio, and schedules it back to back on the
//! output clock. A session controller guarantees that switching streams
//! never lets the previous stream's audio or metadata leak into the new one.
//!
//! ## Quick start
//!
//! ```no_run
//! use icyplay::config::PlayerConfig;
//! use icyplay::session::SessionController;
//! use icyplay::stream::StreamDescriptor;
//!
//! let player = SessionController::with_config(PlayerConfig::default())?;
//! player.start(StreamDescriptor::new("Radio", "http://example.com/stream.ogg"))?;
//! # Ok::<(), icyplay::error::PlayerError>(())
//! ```

pub mod audio;
pub mod cancel;
pub mod config;
pub mod error;
pub mod session;
pub mod stream;

#[cfg(test)]
mod testing;
