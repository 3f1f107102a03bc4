//! Output-graph input tap
//!
//! Every source the graph plays passes through `TapSource`: the shared
//! `Gain` is applied first, then VU levels and an FFT spectrum are computed
//! into the shared `AudioAnalysis`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rodio::Source;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::config::audio::{FFT_SIZE, SPECTRUM_BANDS, VU_DECAY};

use super::types::SharedAnalysis;

/// Volume scalar shared by every input. Stored as f32 bits.
#[derive(Clone, Debug)]
pub struct Gain(Arc<AtomicU32>);

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Gain {
    pub fn new(value: f32) -> Self {
        let gain = Self(Arc::new(AtomicU32::new(0)));
        gain.set(value);
        gain
    }

    /// Set the gain, clamped to [0, 1]. NaN mutes.
    pub fn set(&self, value: f32) {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Wrapper source applying the shared gain and feeding the analysis tap
pub struct TapSource<S> {
    inner: S,
    gain: Gain,
    analysis: SharedAnalysis,
    buffer_left: Vec<f32>,
    buffer_right: Vec<f32>,
    channels: u16,
    sample_rate: u32,
    channel_pos: u16,
    fft_planner: FftPlanner<f32>,
}

impl<S> TapSource<S>
where
    S: Source<Item = f32>,
{
    pub fn new(source: S, gain: Gain, analysis: SharedAnalysis) -> Self {
        let channels = source.channels().max(1);
        let sample_rate = source.sample_rate();
        Self {
            inner: source,
            gain,
            analysis,
            buffer_left: Vec::with_capacity(FFT_SIZE),
            buffer_right: Vec::with_capacity(FFT_SIZE),
            channels,
            sample_rate,
            channel_pos: 0,
            fft_planner: FftPlanner::new(),
        }
    }

    fn process_buffers(&mut self) {
        let rms = |buf: &[f32]| (buf.iter().map(|s| s * s).sum::<f32>() / buf.len() as f32).sqrt();
        let rms_left = rms(&self.buffer_left);
        let rms_right = rms(&self.buffer_right);

        let fft = self.fft_planner.plan_fft_forward(FFT_SIZE);
        let mut fft_input: Vec<Complex<f32>> = self
            .buffer_left
            .iter()
            .zip(&self.buffer_right)
            .take(FFT_SIZE)
            .enumerate()
            .map(|(i, (&l, &r))| {
                // Hann window over the mid signal
                let window =
                    0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / FFT_SIZE as f32).cos());
                Complex::new((l + r) * 0.5 * window, 0.0)
            })
            .collect();
        fft.process(&mut fft_input);

        let mut spectrum = [0.0f32; SPECTRUM_BANDS];
        let nyquist = FFT_SIZE / 2;
        let fft_norm = 1.0 / FFT_SIZE as f32;

        // Logarithmic band edges
        for (band, value) in spectrum.iter_mut().enumerate() {
            let low = (band as f32 / SPECTRUM_BANDS as f32).powf(2.0);
            let high = ((band + 1) as f32 / SPECTRUM_BANDS as f32).powf(2.0);
            let start = (low * nyquist as f32) as usize;
            let end = ((high * nyquist as f32) as usize).max(start + 1).min(nyquist);

            let peak = fft_input[start..end]
                .iter()
                .map(|c| c.norm() * fft_norm)
                .fold(0.0f32, f32::max);
            *value = (peak * 8.0).sqrt().min(1.0);
        }

        {
            let mut analysis = self.analysis.lock().unwrap_or_else(|e| e.into_inner());
            analysis.vu_left = analysis.vu_left * VU_DECAY + rms_left * 3.0 * (1.0 - VU_DECAY);
            analysis.vu_right = analysis.vu_right * VU_DECAY + rms_right * 3.0 * (1.0 - VU_DECAY);
            for (slot, value) in analysis.spectrum.iter_mut().zip(spectrum) {
                *slot = *slot * VU_DECAY + value * (1.0 - VU_DECAY);
            }
            analysis.sample_count += FFT_SIZE as u64;
        }

        self.buffer_left.clear();
        self.buffer_right.clear();
    }
}

impl<S> Iterator for TapSource<S>
where
    S: Source<Item = f32>,
{
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let sample = self.inner.next()? * self.gain.get();

        // Channel 0 feeds the left meter, channel 1 the right one; mono
        // feeds both and extra channels are ignored.
        match (self.channels, self.channel_pos) {
            (1, _) => {
                self.buffer_left.push(sample);
                self.buffer_right.push(sample);
            }
            (_, 0) => self.buffer_left.push(sample),
            (_, 1) => self.buffer_right.push(sample),
            _ => {}
        }
        self.channel_pos = (self.channel_pos + 1) % self.channels;

        if self.buffer_left.len() >= FFT_SIZE && self.buffer_right.len() >= FFT_SIZE {
            self.process_buffers();
        }

        Some(sample)
    }
}

impl<S> Source for TapSource<S>
where
    S: Source<Item = f32>,
{
    fn current_span_len(&self) -> Option<usize> {
        self.inner.current_span_len()
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}
