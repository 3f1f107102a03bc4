//! Content-type inspection and format probing
//!
//! Decides which playback path a response takes, derives symphonia format
//! hints, and probes container/codec metadata from a byte stream.

use std::io::{self, Read};
use std::sync::Mutex;

use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::decoder::codec_type_to_name;
use crate::audio::types::FormatMetadata;
use crate::cancel::CancelToken;
use crate::error::{PlayerError, Result};

/// True when the content type marks a compressed container that goes
/// through the chunk decoder instead of a self-timed playback element.
pub fn needs_decoding(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("ogg") || ct.contains("flac")
        })
        .unwrap_or(false)
}

/// Detect a format hint from content-type and/or URL extension
pub fn detect_format_hint(url: &str, content_type: Option<&str>) -> Option<String> {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        let hint = if ct.contains("audio/mpeg") || ct.contains("audio/mp3") {
            Some("mp3")
        } else if ct.contains("audio/aac") {
            Some("aac")
        } else if ct.contains("flac") && !ct.contains("ogg") {
            Some("flac")
        } else if ct.contains("ogg") || ct.contains("audio/opus") {
            Some("ogg")
        } else if ct.contains("audio/wav") || ct.contains("audio/x-wav") {
            Some("wav")
        } else {
            None
        };
        if let Some(h) = hint {
            return Some(h.to_string());
        }
    }

    let lower = url.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    let ext = path.rsplit('/').next()?.rsplit_once('.')?.1;
    match ext {
        "mp3" => Some("mp3"),
        "aac" | "adts" => Some("aac"),
        "ogg" | "oga" | "opus" => Some("ogg"),
        "flac" => Some("flac"),
        "m4a" | "mp4" => Some("mp4"),
        "wav" => Some("wav"),
        _ => None,
    }
    .map(str::to_string)
}

/// Human-readable container name for a format hint
pub fn container_name(hint: Option<&str>) -> Option<String> {
    let name = match hint? {
        "mp3" => "MPEG",
        "aac" => "ADTS",
        "ogg" => "Ogg",
        "flac" => "FLAC",
        "mp4" => "MPEG-4",
        "wav" => "WAVE",
        _ => return None,
    };
    Some(name.to_string())
}

/// Read adapter for the metadata probe: stops at a byte budget and as soon
/// as the owning session is cancelled. The mutex makes any `Read + Send`
/// body usable as a symphonia media source.
pub struct ProbeReader<R> {
    inner: Mutex<R>,
    remaining: u64,
    cancel: CancelToken,
}

impl<R: Read + Send> ProbeReader<R> {
    pub fn new(inner: R, limit: u64, cancel: CancelToken) -> Self {
        Self {
            inner: Mutex::new(inner),
            remaining: limit,
            cancel,
        }
    }
}

impl<R: Read + Send> Read for ProbeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "probe cancelled"));
        }
        if self.remaining == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "probe byte limit reached"));
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self
            .inner
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .read(&mut buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Probe container/codec metadata from the start of a stream.
///
/// `bitrate` is the nominal bitrate (bits per second) when the server
/// announces one; symphonia does not report it for most codecs.
pub fn probe_format<R>(
    reader: ProbeReader<R>,
    hint: Option<&str>,
    bitrate: Option<u32>,
) -> Result<FormatMetadata>
where
    R: Read + Send + 'static,
{
    let cancel = reader.cancel.clone();
    let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(reader)), Default::default());

    let mut symphonia_hint = Hint::new();
    if let Some(ext) = hint {
        symphonia_hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &symphonia_hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| {
            if cancel.is_cancelled() {
                PlayerError::Cancelled
            } else {
                PlayerError::Decode(format!("Probe error: {}", e))
            }
        })?;

    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| PlayerError::Decode("No audio track found".to_string()))?;
    let params = &track.codec_params;

    Ok(FormatMetadata {
        container: container_name(hint),
        codec: codec_type_to_name(params.codec),
        sample_rate: params.sample_rate,
        bits_per_sample: params.bits_per_sample,
        bitrate,
        channel_count: params.channels.map(|c| c.count() as u16),
    })
}
