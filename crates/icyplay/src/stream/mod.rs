//! Stream handling
//!
//! Opens ICY (Icecast/Shoutcast) connections, extracts station tags and
//! in-band titles, and probes container/codec metadata.

pub mod connector;
pub mod format;
pub mod icy;
pub mod metadata;
pub mod types;

pub use connector::{HttpConnector, StreamConnector};
pub use format::{detect_format_hint, needs_decoding};
pub use icy::{ChunkRead, IcyReader};
pub use metadata::TrackTitle;
pub use types::{IcyEvent, IcyTagSet, OpenedStream, ResponseInfo, StatsSnapshot, StreamDescriptor};
