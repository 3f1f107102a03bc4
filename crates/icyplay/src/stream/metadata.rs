//! In-band ICY metadata parsing
//!
//! Pure parsing functions for the `StreamTitle='…';` blocks interleaved
//! into an ICY byte stream.

/// A "now playing" title with an optional artist/title split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTitle {
    pub raw: String,
    pub artist: Option<String>,
    pub title: Option<String>,
}

impl TrackTitle {
    /// Split on the first ` - `: "Artist - Title" gives artist and title.
    /// Without a separator the whole string is the title.
    pub fn parse(raw: &str) -> Self {
        let non_empty = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };

        // Split before trimming so an empty side keeps its separator
        let (artist, title) = match raw.find(" - ") {
            Some(pos) => (non_empty(&raw[..pos]), non_empty(&raw[pos + 3..])),
            None => (None, non_empty(raw)),
        };
        Self {
            raw: raw.trim().to_string(),
            artist,
            title,
        }
    }
}

/// Extract the `StreamTitle` value from a metadata string.
///
/// Format: `StreamTitle='Artist - Song';StreamUrl='...';`
pub fn parse_stream_title(metadata: &str) -> Option<String> {
    const KEY: &str = "StreamTitle='";
    let start = metadata.find(KEY)? + KEY.len();
    let end = metadata[start..].find("';")?;
    let title = metadata[start..start + end].trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Extract the title from a raw, NUL-padded metadata block.
pub fn extract_stream_title(raw_block: &[u8]) -> Option<String> {
    let end = raw_block.iter().rposition(|&b| b != 0)? + 1;
    let meta = String::from_utf8_lossy(&raw_block[..end]);
    parse_stream_title(&meta)
}
