//! Audio decoding using Symphonia
//!
//! Two decoders live here:
//! - `SymphoniaChunkDecoder` turns compressed chunks handed over one at a
//!   time into `PcmBlock`s. It backs the process-wide `DecoderService`.
//! - `SymphoniaSource` is a self-timed rodio source for streams the output
//!   graph plays directly.

use std::io::{self, Read, Seek};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rodio::Source;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecType, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::{Hint, ProbeResult};
use tracing::debug;

use crate::config::probe::PROBE_TIMEOUT_SECS;
use crate::error::{PlayerError, Result};

use super::types::PcmBlock;

/// Convert a symphonia codec type to a human-readable name
pub fn codec_type_to_name(codec: CodecType) -> String {
    use symphonia::core::codecs::*;
    match codec {
        CODEC_TYPE_AAC => "AAC".to_string(),
        CODEC_TYPE_FLAC => "FLAC".to_string(),
        CODEC_TYPE_MP3 => "MP3".to_string(),
        CODEC_TYPE_OPUS => "Opus".to_string(),
        CODEC_TYPE_VORBIS => "Vorbis".to_string(),
        CODEC_TYPE_PCM_U8 => "PCM 8-bit".to_string(),
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM 16-bit".to_string(),
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM 24-bit".to_string(),
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM 32-bit".to_string(),
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM 32-bit Float".to_string(),
        CODEC_TYPE_PCM_F64LE | CODEC_TYPE_PCM_F64BE => "PCM 64-bit Float".to_string(),
        CODEC_TYPE_PCM_ALAW => "PCM A-law".to_string(),
        CODEC_TYPE_PCM_MULAW => "PCM u-law".to_string(),
        CODEC_TYPE_ALAC => "ALAC".to_string(),
        _ => "Audio".to_string(),
    }
}

fn is_end_of_stream(err: &SymphoniaError) -> bool {
    matches!(err, SymphoniaError::IoError(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

fn first_audio_track(format: &dyn FormatReader) -> Option<(u32, symphonia::core::codecs::CodecParameters)> {
    format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .map(|t| (t.id, t.codec_params.clone()))
}

// ---------------------------------------------------------------------------
// Chunk decoder
// ---------------------------------------------------------------------------

/// Decoder collaborator used by the decode pump.
///
/// `decode` is called with one compressed chunk at a time and returns
/// whatever PCM that chunk completed (possibly nothing while the stream
/// header is still being read). `reset` discards all internal state so the
/// next chunk is treated as the start of a new stream.
pub trait ChunkDecoder: Send {
    fn decode(&mut self, chunk: &[u8]) -> Result<PcmBlock>;
    fn reset(&mut self) -> Result<()>;
}

/// Process-wide decoder service.
///
/// Clones share one decoder; the mutex keeps exactly one decode in flight
/// across the whole process.
#[derive(Clone)]
pub struct DecoderService {
    inner: Arc<Mutex<Box<dyn ChunkDecoder>>>,
}

impl DecoderService {
    pub fn new(decoder: impl ChunkDecoder + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(decoder))),
        }
    }

    /// Service backed by symphonia's default codecs
    pub fn symphonia() -> Self {
        Self::new(SymphoniaChunkDecoder::new())
    }

    pub fn decode(&self, chunk: &[u8]) -> Result<PcmBlock> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .decode(chunk)
    }

    pub fn reset(&self) -> Result<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).reset()
    }
}

/// Messages from the decode worker back to `decode()`
enum WorkerMsg {
    Pcm(PcmBlock),
    PacketError(String),
    Fatal(String),
    /// All fed bytes are consumed; the worker is waiting for the next chunk
    NeedInput,
}

/// Blocking reader over chunks arriving on a channel.
///
/// Reports `NeedInput` when it runs dry, but only once per fed chunk so the
/// first read of a fresh worker does not produce a spurious request.
struct FeedReader {
    chunks: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
    fed_since_request: bool,
    msg_tx: Sender<WorkerMsg>,
}

impl Read for FeedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let remaining = self.current.len() - self.pos;
            if remaining > 0 {
                let n = buf.len().min(remaining);
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }

            if self.fed_since_request {
                self.fed_since_request = false;
                let _ = self.msg_tx.send(WorkerMsg::NeedInput);
            }

            match self.chunks.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                    self.fed_since_request = true;
                }
                // Feed closed: end of stream
                Err(_) => return Ok(0),
            }
        }
    }
}

struct DecodeWorker {
    feed_tx: Sender<Vec<u8>>,
    msg_rx: Receiver<WorkerMsg>,
    handle: JoinHandle<()>,
}

impl DecodeWorker {
    fn spawn() -> Result<Self> {
        let (feed_tx, feed_rx) = unbounded::<Vec<u8>>();
        let (msg_tx, msg_rx) = unbounded::<WorkerMsg>();
        let feed = FeedReader {
            chunks: feed_rx,
            current: Vec::new(),
            pos: 0,
            fed_since_request: false,
            msg_tx: msg_tx.clone(),
        };

        let handle = thread::Builder::new()
            .name("chunk-decoder".to_string())
            .spawn(move || run_worker(feed, msg_tx))
            .map_err(|e| PlayerError::Decode(format!("Failed to spawn decoder thread: {}", e)))?;

        Ok(Self {
            feed_tx,
            msg_rx,
            handle,
        })
    }

    /// Close the feed and wait for the worker to exit
    fn shutdown(self) {
        drop(self.feed_tx);
        if self.handle.join().is_err() {
            debug!("chunk-decoder thread panicked");
        }
    }
}

fn run_worker(feed: FeedReader, msg_tx: Sender<WorkerMsg>) {
    let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(feed)), Default::default());
    let probed = symphonia::default::get_probe().format(
        &Hint::new(),
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    );
    let mut format = match probed {
        Ok(p) => p.format,
        Err(e) => {
            if !is_end_of_stream(&e) {
                let _ = msg_tx.send(WorkerMsg::Fatal(format!("Probe error: {}", e)));
            }
            return;
        }
    };

    let codecs = symphonia::default::get_codecs();
    let open_track = |format: &dyn FormatReader| -> std::result::Result<_, String> {
        let (track_id, params) =
            first_audio_track(format).ok_or_else(|| "No audio track found".to_string())?;
        let decoder = codecs
            .make(&params, &DecoderOptions::default())
            .map_err(|e| format!("Decoder creation error: {}", e))?;
        Ok((track_id, decoder))
    };

    let (mut track_id, mut decoder) = match open_track(format.as_ref()) {
        Ok(t) => t,
        Err(e) => {
            let _ = msg_tx.send(WorkerMsg::Fatal(e));
            return;
        }
    };
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // A chained Ogg stream starts a new logical bitstream
            Err(SymphoniaError::ResetRequired) => match open_track(format.as_ref()) {
                Ok((id, dec)) => {
                    debug!("decoder reset for new logical stream");
                    track_id = id;
                    decoder = dec;
                    sample_buf = None;
                    continue;
                }
                Err(e) => {
                    let _ = msg_tx.send(WorkerMsg::Fatal(e));
                    return;
                }
            },
            Err(e) if is_end_of_stream(&e) => return,
            Err(e) => {
                let _ = msg_tx.send(WorkerMsg::Fatal(format!("Read error: {}", e)));
                return;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let msg = match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let capacity = decoded.capacity();
                if sample_buf.as_ref().map_or(true, |b| b.capacity() < capacity) {
                    sample_buf = Some(SampleBuffer::new(capacity as u64, spec));
                }
                match sample_buf {
                    Some(ref mut buf) => {
                        buf.copy_interleaved_ref(decoded);
                        WorkerMsg::Pcm(PcmBlock::from_interleaved(
                            spec.rate,
                            spec.channels.count(),
                            buf.samples(),
                        ))
                    }
                    None => continue,
                }
            }
            Err(SymphoniaError::DecodeError(e)) => WorkerMsg::PacketError(e.to_string()),
            Err(e) if is_end_of_stream(&e) => return,
            Err(e) => {
                let _ = msg_tx.send(WorkerMsg::Fatal(format!("Decode error: {}", e)));
                return;
            }
        };

        if msg_tx.send(msg).is_err() {
            return;
        }
    }
}

/// Incremental symphonia decoder for chunked input.
///
/// A `chunk-decoder` worker thread owns the format reader; chunks are fed
/// to it over a channel and decoded PCM comes back until the worker runs
/// out of input. The worker is started lazily and replaced on `reset`.
pub struct SymphoniaChunkDecoder {
    worker: Option<DecodeWorker>,
}

impl Default for SymphoniaChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SymphoniaChunkDecoder {
    pub fn new() -> Self {
        Self { worker: None }
    }

    fn feed(&mut self, chunk: Vec<u8>) -> Result<&DecodeWorker> {
        let chunk = match self.worker.as_ref() {
            Some(worker) => match worker.feed_tx.send(chunk) {
                Ok(()) => None,
                Err(e) => Some(e.into_inner()),
            },
            None => Some(chunk),
        };

        if let Some(chunk) = chunk {
            // No worker yet, or the previous one finished its stream
            self.stop_worker();
            let worker = DecodeWorker::spawn()?;
            worker
                .feed_tx
                .send(chunk)
                .map_err(|_| PlayerError::Decode("Decoder worker exited".to_string()))?;
            self.worker = Some(worker);
        }

        self.worker
            .as_ref()
            .ok_or_else(|| PlayerError::Decode("Decoder worker missing".to_string()))
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl ChunkDecoder for SymphoniaChunkDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Result<PcmBlock> {
        if chunk.is_empty() {
            return Ok(PcmBlock::default());
        }

        let worker = self.feed(chunk.to_vec())?;
        let mut block = PcmBlock::default();
        let mut error: Option<String> = None;
        let mut finished = false;

        loop {
            match worker.msg_rx.recv() {
                Ok(WorkerMsg::Pcm(pcm)) => {
                    if !block.append(pcm) {
                        debug!(
                            rate = block.sample_rate,
                            channels = block.channels(),
                            "dropping PCM with a different layout"
                        );
                    }
                }
                Ok(WorkerMsg::PacketError(e)) => {
                    error.get_or_insert(e);
                }
                Ok(WorkerMsg::Fatal(e)) => {
                    error.get_or_insert(e);
                    finished = true;
                }
                Ok(WorkerMsg::NeedInput) => break,
                Err(_) => {
                    finished = true;
                    break;
                }
            }
        }

        if finished {
            self.stop_worker();
        }

        match error {
            Some(e) => Err(PlayerError::Decode(e)),
            None => Ok(block),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.stop_worker();
        Ok(())
    }
}

impl Drop for SymphoniaChunkDecoder {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// ---------------------------------------------------------------------------
// Self-timed source
// ---------------------------------------------------------------------------

/// Lock-free counters for the direct-path decode loop
#[derive(Debug, Default)]
pub struct DecoderStats {
    packets_decoded: AtomicU64,
    decode_errors: AtomicU64,
}

impl DecoderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self) {
        self.packets_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_decoded(&self) -> u64 {
        self.packets_decoded.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

/// Spawn a probe thread and return the receiver immediately.
///
/// The probe runs on a background `symphonia-probe` thread so the caller
/// can bound the wait.
fn start_probe<R: Read + Seek + Send + Sync + 'static>(
    reader: R,
    format_hint: Option<String>,
) -> Result<Receiver<Result<ProbeResult>>> {
    let mss = MediaSourceStream::new(Box::new(ReadOnlySource::new(reader)), Default::default());

    let mut hint = Hint::new();
    if let Some(ref ext) = format_hint {
        hint.with_extension(ext);
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("symphonia-probe".to_string())
        .spawn(move || {
            let result = symphonia::default::get_probe().format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            );
            let _ = tx.send(result.map_err(|e| PlayerError::Decode(format!("Probe error: {}", e))));
        })
        .map_err(|e| PlayerError::Audio(format!("Failed to spawn probe thread: {}", e)))?;

    Ok(rx)
}

/// A symphonia-backed rodio source yielding interleaved f32 samples
pub struct SymphoniaSource {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    format: Box<dyn FormatReader>,
    track_id: u32,
    sample_buf: Option<SampleBuffer<f32>>,
    sample_idx: usize,
    channels: u16,
    sample_rate: u32,
    codec_name: String,
    last_error: Arc<Mutex<Option<String>>>,
    stats: Arc<DecoderStats>,
}

impl SymphoniaSource {
    #[cfg(test)]
    fn new<R: Read + Seek + Send + Sync + 'static>(reader: R) -> Result<Self> {
        Self::new_with_hint(reader, None)
    }

    /// Probe `reader` (bounded by `PROBE_TIMEOUT_SECS`) and build a source.
    pub fn new_with_hint<R: Read + Seek + Send + Sync + 'static>(
        reader: R,
        format_hint: Option<&str>,
    ) -> Result<Self> {
        let rx = start_probe(reader, format_hint.map(str::to_string))?;

        let probed = match rx.recv_timeout(Duration::from_secs(PROBE_TIMEOUT_SECS)) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(PlayerError::Timeout(format!(
                    "Format probe timed out after {}s",
                    PROBE_TIMEOUT_SECS
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PlayerError::Decode("Probe thread panicked".to_string()))
            }
        };

        Self::from_probed(probed)
    }

    fn from_probed(probed: ProbeResult) -> Result<Self> {
        let format = probed.format;
        let (track_id, codec_params) = first_audio_track(format.as_ref())
            .ok_or_else(|| PlayerError::Decode("No audio track found".to_string()))?;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| PlayerError::Decode(format!("Decoder creation error: {}", e)))?;

        let mut source = Self {
            decoder,
            format,
            track_id,
            sample_buf: None,
            sample_idx: 0,
            channels: codec_params.channels.map(|c| c.count() as u16).unwrap_or(2),
            sample_rate: codec_params.sample_rate.unwrap_or(44100),
            codec_name: codec_type_to_name(codec_params.codec),
            last_error: Arc::new(Mutex::new(None)),
            stats: Arc::new(DecoderStats::new()),
        };

        // The first decoded packet carries the real output rate and layout
        source.decode_next_packet();

        Ok(source)
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    /// Slot holding the error that ended the stream, if it did not end cleanly
    pub(crate) fn error_slot(&self) -> Arc<Mutex<Option<String>>> {
        self.last_error.clone()
    }

    pub(crate) fn stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }

    fn store_error(&self, err: &SymphoniaError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    fn decode_next_packet(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(e) if is_end_of_stream(&e) => return false,
                Err(e) => {
                    self.store_error(&e);
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    self.stats.record_packet();
                    let spec = *decoded.spec();
                    let capacity = decoded.capacity();
                    self.sample_rate = spec.rate;
                    self.channels = spec.channels.count() as u16;

                    if self.sample_buf.as_ref().map_or(true, |b| b.capacity() < capacity) {
                        self.sample_buf = Some(SampleBuffer::new(capacity as u64, spec));
                    }
                    if let Some(ref mut buf) = self.sample_buf {
                        buf.copy_interleaved_ref(decoded);
                        self.sample_idx = 0;
                        return true;
                    }
                }
                Err(SymphoniaError::DecodeError(_)) => {
                    self.stats.record_error();
                    continue;
                }
                Err(e) => {
                    self.store_error(&e);
                    return false;
                }
            }
        }
    }
}

impl Iterator for SymphoniaSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ref buf) = self.sample_buf {
                if self.sample_idx < buf.samples().len() {
                    let sample = buf.samples()[self.sample_idx];
                    self.sample_idx += 1;
                    return Some(sample);
                }
            }

            if !self.decode_next_packet() {
                return None;
            }
        }
    }
}

impl Source for SymphoniaSource {
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
        None
    }
}
