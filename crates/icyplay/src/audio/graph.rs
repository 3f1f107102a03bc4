//! Output graph
//!
//! The fixed routing every sound goes through: input → gain → analysis tap
//! → destination. `RodioGraph` is built once per process on a dedicated
//! `output-graph` thread that owns the rodio output stream (cpal streams
//! may be !Send); everything else talks to its mixer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use rodio::mixer::Mixer;
use rodio::{OutputStreamBuilder, Sink, Source};
use thiserror::Error;
use tracing::debug;

use crate::config::audio::CLOCK_SAMPLE_RATE;
use crate::error::{PlayerError, Result};

use super::analyzer::{Gain, TapSource};
use super::decoder::{DecoderStats, SymphoniaSource};
use super::types::{AudioAnalysis, PcmBlock, ReadSeek, SharedAnalysis};

/// Why a buffer could not be scheduled. The buffer is dropped either way.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("start time {start_at:.3}s is before the output clock ({now:.3}s)")]
    InPast { start_at: f64, now: f64 },

    #[error("output graph is closed")]
    Closed,

    #[error("invalid buffer: {0}")]
    Invalid(String),
}

/// Callback run when a scheduled buffer plays to its end
pub type OnEnded = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one scheduled buffer. Stopping it silences the buffer at once.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    id: u64,
    stop: Arc<AtomicBool>,
}

impl BufferHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BufferHandle {}

/// What a playback element decoded, and the error that ended it early
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementReport {
    pub packets_decoded: u64,
    pub decode_errors: u64,
    pub error: Option<String>,
}

/// A self-timed playback element attached once to the input tap
pub trait PlaybackElement: Send + Sync {
    fn pause(&self);
    /// Disconnect from the graph and drop any queued audio
    fn detach(&self);
    fn is_finished(&self) -> bool;
    fn report(&self) -> ElementReport;
}

/// The output graph collaborator
pub trait OutputGraph: Send + Sync {
    /// Output clock in seconds
    fn current_time(&self) -> f64;

    /// Play `block` through the input tap starting at `start_at` on the
    /// output clock. `on_ended` runs only if the buffer plays to its end.
    fn schedule(
        &self,
        block: PcmBlock,
        start_at: f64,
        handle: BufferHandle,
        on_ended: OnEnded,
    ) -> std::result::Result<(), ScheduleError>;

    /// Attach a directly playable stream
    fn attach_element(
        &self,
        reader: Box<dyn ReadSeek>,
        format_hint: Option<&str>,
    ) -> Result<Box<dyn PlaybackElement>>;

    fn set_gain(&self, gain: f32);
    fn gain(&self) -> f32;
    fn analysis(&self) -> SharedAnalysis;
}

/// Silent source whose consumption drives the output clock
struct ClockSource {
    frames: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl Iterator for ClockSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        Some(0.0)
    }
}

impl Source for ClockSource {
    fn current_span_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        CLOCK_SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// One decoded block as a rodio source, with a stop flag and an end callback
pub struct BlockSource {
    samples: std::vec::IntoIter<f32>,
    channels: u16,
    sample_rate: u32,
    handle: BufferHandle,
    on_ended: Option<OnEnded>,
}

impl BlockSource {
    pub fn new(block: PcmBlock, handle: BufferHandle, on_ended: OnEnded) -> Self {
        Self {
            channels: block.channels() as u16,
            sample_rate: block.sample_rate,
            samples: block.interleaved().into_iter(),
            handle,
            on_ended: Some(on_ended),
        }
    }
}

impl Iterator for BlockSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.handle.is_stopped() {
            self.on_ended = None;
            return None;
        }
        match self.samples.next() {
            Some(s) => Some(s),
            None => {
                if let Some(on_ended) = self.on_ended.take() {
                    on_ended();
                }
                None
            }
        }
    }
}

impl Source for BlockSource {
    fn current_span_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        let frames = self.samples.len() / self.channels.max(1) as usize;
        Some(Duration::from_secs_f64(frames as f64 / self.sample_rate as f64))
    }
}

/// Check a block before it becomes a buffer
pub fn validate_block(block: &PcmBlock) -> std::result::Result<(), ScheduleError> {
    if !block.is_playable() {
        return Err(ScheduleError::Invalid(format!(
            "{} channels, {} frames at {} Hz",
            block.channels(),
            block.frames(),
            block.sample_rate
        )));
    }
    if block.channels() > u16::MAX as usize {
        return Err(ScheduleError::Invalid(format!("{} channels", block.channels())));
    }
    Ok(())
}

/// Playback element backed by a rodio sink on the graph's mixer
struct RodioElement {
    sink: Sink,
    stats: Arc<DecoderStats>,
    error: Arc<Mutex<Option<String>>>,
}

impl PlaybackElement for RodioElement {
    fn pause(&self) {
        self.sink.pause();
    }

    fn detach(&self) {
        self.sink.stop();
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }

    fn report(&self) -> ElementReport {
        ElementReport {
            packets_decoded: self.stats.packets_decoded(),
            decode_errors: self.stats.decode_errors(),
            error: self.error.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}

/// Output graph on the default audio device
pub struct RodioGraph {
    mixer: Mixer,
    clock_frames: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    gain: Gain,
    analysis: SharedAnalysis,
    shutdown_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RodioGraph {
    /// Open the default output device. Blocks until the device is ready.
    pub fn new() -> Result<Self> {
        let (init_tx, init_rx) = bounded::<std::result::Result<Mixer, String>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let thread = thread::Builder::new()
            .name("output-graph".to_string())
            .spawn(move || {
                let mut stream = match OutputStreamBuilder::open_default_stream() {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = init_tx.send(Err(format!("Failed to open audio output: {}", e)));
                        return;
                    }
                };
                stream.log_on_drop(false);
                let _ = init_tx.send(Ok(stream.mixer().clone()));

                // Keep the stream alive until the graph is dropped
                let _ = shutdown_rx.recv();
                debug!("output graph closed");
            })
            .map_err(|e| PlayerError::Audio(format!("Failed to spawn output thread: {}", e)))?;

        let mixer = init_rx
            .recv()
            .map_err(|_| PlayerError::Audio("Output thread exited during init".to_string()))?
            .map_err(PlayerError::Audio)?;

        let clock_frames = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        mixer.add(ClockSource {
            frames: clock_frames.clone(),
            closed: closed.clone(),
        });

        Ok(Self {
            mixer,
            clock_frames,
            closed,
            gain: Gain::default(),
            analysis: Arc::new(Mutex::new(AudioAnalysis::default())),
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn tap<S: Source<Item = f32>>(&self, source: S) -> TapSource<S> {
        TapSource::new(source, self.gain.clone(), self.analysis.clone())
    }
}

impl OutputGraph for RodioGraph {
    fn current_time(&self) -> f64 {
        self.clock_frames.load(Ordering::Relaxed) as f64 / CLOCK_SAMPLE_RATE as f64
    }

    fn schedule(
        &self,
        block: PcmBlock,
        start_at: f64,
        handle: BufferHandle,
        on_ended: OnEnded,
    ) -> std::result::Result<(), ScheduleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScheduleError::Closed);
        }
        validate_block(&block)?;
        let now = self.current_time();
        if start_at < now {
            return Err(ScheduleError::InPast { start_at, now });
        }

        let source = BlockSource::new(block, handle, on_ended)
            .delay(Duration::from_secs_f64(start_at - now));
        self.mixer.add(self.tap(source));
        Ok(())
    }

    fn attach_element(
        &self,
        reader: Box<dyn ReadSeek>,
        format_hint: Option<&str>,
    ) -> Result<Box<dyn PlaybackElement>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlayerError::Audio("Output graph is closed".to_string()));
        }
        let source = SymphoniaSource::new_with_hint(reader, format_hint)?;
        debug!(
            codec = source.codec_name(),
            rate = source.sample_rate(),
            channels = source.channels(),
            "attaching playback element"
        );
        let stats = source.stats();
        let error = source.error_slot();
        let sink = Sink::connect_new(&self.mixer);
        sink.append(self.tap(source));
        Ok(Box::new(RodioElement { sink, stats, error }))
    }

    fn set_gain(&self, gain: f32) {
        self.gain.set(gain);
    }

    fn gain(&self) -> f32 {
        self.gain.get()
    }

    fn analysis(&self) -> SharedAnalysis {
        self.analysis.clone()
    }
}

impl Drop for RodioGraph {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
