//! Stream types
//!
//! Descriptors, tag sets, and the byte-stream statistics exposed by the
//! tag extractor.

use std::collections::BTreeMap;
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::config::network::ICY_HEADER_PREFIX;
use crate::stream::icy::IcyReader;

/// One playable source. Immutable; the url is the lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamDescriptor {
    pub title: String,
    pub url: String,
}

impl StreamDescriptor {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }
}

/// Tags the presentation layer hides from the station table
const HIDDEN_TAGS: [&str; 2] = ["metaint", "br"];

/// Station tags taken from `icy-*` response headers, keyed by the
/// remainder of the header name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcyTagSet(BTreeMap<String, String>);

impl IcyTagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw header pairs. Names are matched case-insensitively;
    /// a repeated name keeps its last value.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut tags = BTreeMap::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if let Some(key) = name.strip_prefix(ICY_HEADER_PREFIX) {
                if !key.is_empty() {
                    tags.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        Self(tags)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Tags without the protocol plumbing entries (`metaint`, `br`).
    pub fn displayable(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, _)| !HIDDEN_TAGS.contains(k))
    }

    /// In-band metadata interval announced by the server (0 = none)
    pub fn metaint(&self) -> usize {
        self.get("metaint")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0)
    }

    /// Nominal bitrate in kbps announced by the server
    pub fn bitrate_kbps(&self) -> Option<u32> {
        self.get("br").and_then(|v| v.split(',').next()?.trim().parse().ok())
    }

    pub fn station_name(&self) -> Option<&str> {
        self.get("name")
    }
}

/// Byte counters observed by the tag extractor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub total_bytes_read: u64,
    pub audio_bytes_read: u64,
    pub icy_bytes_read: u64,
    pub started_at: Instant,
}

impl StatsSnapshot {
    pub fn new(started_at: Instant) -> Self {
        Self {
            total_bytes_read: 0,
            audio_bytes_read: 0,
            icy_bytes_read: 0,
            started_at,
        }
    }

    /// Observed audio bitrate in kbps at `now`. Zero under 100 ms of data.
    pub fn bitrate_kbps_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        if elapsed < 0.1 {
            return 0.0;
        }
        (self.audio_bytes_read as f64 * 8.0) / elapsed / 1000.0
    }

    pub fn bitrate_kbps(&self) -> f64 {
        self.bitrate_kbps_at(Instant::now())
    }
}

/// One update from the tag extractor: a new in-band title (when a metadata
/// block was parsed) plus the current counters.
#[derive(Debug, Clone, PartialEq)]
pub struct IcyEvent {
    pub title: Option<String>,
    pub stats: StatsSnapshot,
}

/// Response facts the session needs before choosing a playback path
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub content_type: Option<String>,
    pub tags: IcyTagSet,
    /// Whether the response came from the attempt carrying `Icy-MetaData`
    pub icy_requested: bool,
}

/// A playback connection handed from the connector to the session.
pub struct OpenedStream {
    pub info: ResponseInfo,
    pub reader: IcyReader,
    pub events: Receiver<IcyEvent>,
}
