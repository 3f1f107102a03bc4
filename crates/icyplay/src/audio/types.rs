//! Shared audio types
//!
//! Pure data types used across the audio subsystem.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::audio::SPECTRUM_BANDS;

/// One decoded block of planar PCM.
///
/// Produced by a decoder per decode call and consumed exactly once by the
/// playback scheduler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PcmBlock {
    pub sample_rate: u32,
    /// One sample buffer per channel, all of equal length
    pub channel_data: Vec<Vec<f32>>,
}

impl PcmBlock {
    pub fn new(sample_rate: u32, channel_data: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channel_data,
        }
    }

    /// Build a block from interleaved samples.
    pub fn from_interleaved(sample_rate: u32, channels: usize, samples: &[f32]) -> Self {
        if channels == 0 {
            return Self::new(sample_rate, Vec::new());
        }
        let frames = samples.len() / channels;
        let mut channel_data = vec![Vec::with_capacity(frames); channels];
        for frame in samples.chunks_exact(channels) {
            for (ch, &s) in frame.iter().enumerate() {
                channel_data[ch].push(s);
            }
        }
        Self::new(sample_rate, channel_data)
    }

    pub fn channels(&self) -> usize {
        self.channel_data.len()
    }

    /// Frames per channel (length of the first channel)
    pub fn frames(&self) -> usize {
        self.channel_data.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// A block the output graph can turn into a buffer: at least one frame,
    /// a known rate, and every channel of the same length.
    pub fn is_playable(&self) -> bool {
        let frames = self.frames();
        self.sample_rate > 0
            && frames > 0
            && self.channel_data.iter().all(|c| c.len() == frames)
    }

    /// Playback duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Interleave channel data (frame-major) for the output device.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frames();
        let channels = self.channels();
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            for ch in &self.channel_data {
                out.push(ch.get(i).copied().unwrap_or(0.0));
            }
        }
        out
    }

    /// Append another block with the same layout. Returns false (and leaves
    /// `self` untouched) when rate or channel count differ.
    pub fn append(&mut self, other: PcmBlock) -> bool {
        if self.channel_data.is_empty() {
            *self = other;
            return true;
        }
        if other.sample_rate != self.sample_rate || other.channels() != self.channels() {
            return false;
        }
        for (dst, src) in self.channel_data.iter_mut().zip(other.channel_data) {
            dst.extend(src);
        }
        true
    }
}

/// Container/codec description of a stream, probed once per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatMetadata {
    pub container: Option<String>,
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub bits_per_sample: Option<u32>,
    /// Bits per second
    pub bitrate: Option<u32>,
    pub channel_count: Option<u16>,
}

impl fmt::Display for FormatMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref container) = self.container {
            write!(f, "{} / ", container)?;
        }
        write!(f, "{}", self.codec)?;
        if let Some(br) = self.bitrate {
            write!(f, " · {:.2} kbps", br as f64 / 1000.0)?;
        }
        if let Some(rate) = self.sample_rate {
            write!(f, " · {} Hz", rate)?;
        }
        if let Some(bits) = self.bits_per_sample {
            write!(f, " · {}-bit", bits)?;
        }
        match self.channel_count {
            Some(1) => write!(f, " · Mono"),
            Some(_) => write!(f, " · Stereo"),
            None => Ok(()),
        }
    }
}

/// Trait alias for a seekable, sendable reader
pub trait ReadSeek: std::io::Read + std::io::Seek + Send + Sync {}
impl<T: std::io::Read + std::io::Seek + Send + Sync> ReadSeek for T {}

/// Audio analysis data produced by the analysis tap (VU meters + spectrum)
#[derive(Clone, Debug)]
pub struct AudioAnalysis {
    pub vu_left: f32,
    pub vu_right: f32,
    pub spectrum: [f32; SPECTRUM_BANDS],
    pub sample_count: u64,
}

impl Default for AudioAnalysis {
    fn default() -> Self {
        Self {
            vu_left: 0.0,
            vu_right: 0.0,
            spectrum: [0.0; SPECTRUM_BANDS],
            sample_count: 0,
        }
    }
}

impl AudioAnalysis {
    /// Reset all analysis values to zero
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Thread-safe handle to the analysis tap's output
pub type SharedAnalysis = Arc<Mutex<AudioAnalysis>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // --- PcmBlock ---

    #[test]
    fn pcm_block_dimensions() {
        let block = PcmBlock::new(48000, vec![vec![0.0; 480], vec![0.0; 480]]);
        assert_eq!(block.channels(), 2);
        assert_eq!(block.frames(), 480);
        assert!((block.duration_secs() - 0.01).abs() < 1e-9);
        assert!(block.is_playable());
    }

    #[test]
    fn pcm_block_empty_is_not_playable() {
        assert!(!PcmBlock::default().is_playable());
        assert!(PcmBlock::default().is_empty());
        let no_frames = PcmBlock::new(44100, vec![vec![], vec![]]);
        assert!(!no_frames.is_playable());
    }

    #[test]
    fn pcm_block_ragged_channels_are_malformed() {
        let block = PcmBlock::new(44100, vec![vec![0.1; 10], vec![0.1; 9]]);
        assert!(!block.is_playable());
    }

    #[test]
    fn pcm_block_zero_rate_is_malformed() {
        let block = PcmBlock::new(0, vec![vec![0.1; 10]]);
        assert!(!block.is_playable());
        assert_eq!(block.duration_secs(), 0.0);
    }

    #[test]
    fn pcm_block_interleave_and_back() {
        let block = PcmBlock::new(8000, vec![vec![1.0, 2.0, 3.0], vec![-1.0, -2.0, -3.0]]);
        let inter = block.interleaved();
        assert_eq!(inter, vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        assert_eq!(PcmBlock::from_interleaved(8000, 2, &inter), block);
    }

    #[test]
    fn pcm_block_from_interleaved_drops_partial_frame() {
        let block = PcmBlock::from_interleaved(8000, 2, &[1.0, 2.0, 3.0]);
        assert_eq!(block.frames(), 1);
        assert!(PcmBlock::from_interleaved(8000, 0, &[1.0]).is_empty());
    }

    #[test]
    fn pcm_block_append_same_layout() {
        let mut a = PcmBlock::new(44100, vec![vec![1.0], vec![2.0]]);
        assert!(a.append(PcmBlock::new(44100, vec![vec![3.0], vec![4.0]])));
        assert_eq!(a.channel_data, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
    }

    #[test]
    fn pcm_block_append_rejects_layout_change() {
        let mut a = PcmBlock::new(44100, vec![vec![1.0]]);
        assert!(!a.append(PcmBlock::new(48000, vec![vec![3.0]])));
        assert!(!a.append(PcmBlock::new(44100, vec![vec![3.0], vec![4.0]])));
        assert_eq!(a.frames(), 1);
    }

    #[test]
    fn pcm_block_append_into_empty_takes_other() {
        let mut a = PcmBlock::default();
        assert!(a.append(PcmBlock::new(22050, vec![vec![0.5; 4]])));
        assert_eq!(a.sample_rate, 22050);
        assert_eq!(a.frames(), 4);
    }

    // --- FormatMetadata ---

    #[test]
    fn format_metadata_display_full() {
        let meta = FormatMetadata {
            container: Some("Ogg".to_string()),
            codec: "FLAC".to_string(),
            sample_rate: Some(44100),
            bits_per_sample: Some(16),
            bitrate: Some(850_000),
            channel_count: Some(2),
        };
        assert_eq!(meta.to_string(), "Ogg / FLAC · 850.00 kbps · 44100 Hz · 16-bit · Stereo");
    }

    #[test]
    fn format_metadata_display_minimal() {
        let meta = FormatMetadata {
            codec: "MP3".to_string(),
            channel_count: Some(1),
            ..FormatMetadata::default()
        };
        assert_eq!(meta.to_string(), "MP3 · Mono");
    }

    // --- AudioAnalysis ---

    #[test]
    fn audio_analysis_reset() {
        let mut a = AudioAnalysis {
            vu_left: 0.8,
            vu_right: 0.6,
            spectrum: [0.5; SPECTRUM_BANDS],
            sample_count: 1000,
        };
        a.reset();
        assert_eq!(a.vu_left, 0.0);
        assert_eq!(a.sample_count, 0);
        assert!(a.spectrum.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn cursor_implements_read_seek() {
        let cursor = Cursor::new(vec![1u8, 2, 3]);
        let _boxed: Box<dyn ReadSeek> = Box::new(cursor);
    }
}
