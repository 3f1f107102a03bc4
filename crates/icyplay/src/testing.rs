//! Test fixtures and fakes shared by the unit tests
//!
//! In-memory WAV/ICY builders, a virtual output graph with a settable
//! clock, a scripted decoder, and a scripted connector built on channels.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{after, select, unbounded, Receiver, Sender};

use crate::audio::analyzer::Gain;
use crate::audio::decoder::ChunkDecoder;
use crate::audio::graph::{
    BufferHandle, ElementReport, OnEnded, OutputGraph, PlaybackElement, ScheduleError,
};
use crate::audio::types::{AudioAnalysis, FormatMetadata, PcmBlock, ReadSeek, SharedAnalysis};
use crate::cancel::{AbortHandle, CancelToken};
use crate::error::{PlayerError, Result};
use crate::stream::connector::StreamConnector;
use crate::stream::icy::IcyReader;
use crate::stream::types::{IcyEvent, IcyTagSet, OpenedStream, ResponseInfo, StatsSnapshot};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll `cond` every 10 ms until it holds or `timeout` expires
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

// --- Byte fixtures ---

/// Build a minimal 16-bit PCM WAV file in memory
pub fn make_wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * (bits_per_sample as u32 / 8);
    let block_align = channels * (bits_per_sample / 8);
    let data_size = (samples.len() * 2) as u32;

    let mut buf = Vec::with_capacity(44 + samples.len() * 2);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_size).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

/// Build an ICY body: `audio` split every `metaint` bytes, with the given
/// metadata strings inserted at each boundary (missing or empty = length 0).
pub fn icy_body(audio: &[u8], metaint: usize, metas: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, block) in audio.chunks(metaint).enumerate() {
        out.extend_from_slice(block);
        if block.len() < metaint {
            break;
        }
        let mut bytes = metas.get(i).copied().unwrap_or("").as_bytes().to_vec();
        let padded = bytes.len().div_ceil(16) * 16;
        bytes.resize(padded, 0);
        out.push((padded / 16) as u8);
        out.extend_from_slice(&bytes);
    }
    out
}

// --- Virtual output graph ---

/// One buffer handed to the virtual graph
pub struct ScheduledBuffer {
    pub handle: BufferHandle,
    pub start_at: f64,
    pub duration: f64,
    on_ended: Option<OnEnded>,
}

/// State of an element attached to the virtual graph
#[derive(Debug, Default)]
pub struct ElementFlags {
    pub paused: AtomicBool,
    pub detached: AtomicBool,
    pub finished: AtomicBool,
    /// Reads that returned data, standing in for decoded packets
    pub packets: AtomicU64,
    pub error: Mutex<Option<String>>,
}

struct VirtualElement(Arc<ElementFlags>);

impl PlaybackElement for VirtualElement {
    fn pause(&self) {
        self.0.paused.store(true, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.0.detached.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::SeqCst)
    }

    fn report(&self) -> ElementReport {
        ElementReport {
            packets_decoded: self.0.packets.load(Ordering::SeqCst),
            decode_errors: 0,
            error: lock(&self.0.error).clone(),
        }
    }
}

/// Output graph with a manual clock that records what it is asked to play
pub struct VirtualGraph {
    now: Mutex<f64>,
    scheduled: Mutex<Vec<ScheduledBuffer>>,
    rejected: AtomicUsize,
    elements: Mutex<Vec<Arc<ElementFlags>>>,
    closed: AtomicBool,
    fail_attach: AtomicBool,
    fail_playback: AtomicBool,
    gain: Gain,
    analysis: SharedAnalysis,
}

impl VirtualGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(0.0),
            scheduled: Mutex::new(Vec::new()),
            rejected: AtomicUsize::new(0),
            elements: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            fail_playback: AtomicBool::new(false),
            gain: Gain::default(),
            analysis: Arc::new(Mutex::new(AudioAnalysis::default())),
        })
    }

    pub fn set_time(&self, t: f64) {
        *lock(&self.now) = t;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn fail_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    /// Elements attached from now on stop with an error after one read
    pub fn fail_playback(&self) {
        self.fail_playback.store(true, Ordering::SeqCst);
    }

    pub fn scheduled_count(&self) -> usize {
        lock(&self.scheduled).len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn start_times(&self) -> Vec<f64> {
        lock(&self.scheduled).iter().map(|b| b.start_at).collect()
    }

    pub fn durations(&self) -> Vec<f64> {
        lock(&self.scheduled).iter().map(|b| b.duration).collect()
    }

    pub fn handles(&self) -> Vec<BufferHandle> {
        lock(&self.scheduled).iter().map(|b| b.handle.clone()).collect()
    }

    pub fn elements(&self) -> Vec<Arc<ElementFlags>> {
        lock(&self.elements).clone()
    }

    /// Play every buffer that was not stopped to its end
    pub fn finish_all(&self) {
        let callbacks: Vec<OnEnded> = lock(&self.scheduled)
            .iter_mut()
            .filter(|b| !b.handle.is_stopped())
            .filter_map(|b| b.on_ended.take())
            .collect();
        for on_ended in callbacks {
            on_ended();
        }
    }
}

impl OutputGraph for VirtualGraph {
    fn current_time(&self) -> f64 {
        *lock(&self.now)
    }

    fn schedule(
        &self,
        block: PcmBlock,
        start_at: f64,
        handle: BufferHandle,
        on_ended: OnEnded,
    ) -> std::result::Result<(), ScheduleError> {
        if self.closed.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ScheduleError::Closed);
        }
        let now = self.current_time();
        if start_at < now {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ScheduleError::InPast { start_at, now });
        }
        lock(&self.scheduled).push(ScheduledBuffer {
            handle,
            start_at,
            duration: block.duration_secs(),
            on_ended: Some(on_ended),
        });
        Ok(())
    }

    fn attach_element(
        &self,
        mut reader: Box<dyn ReadSeek>,
        _format_hint: Option<&str>,
    ) -> Result<Box<dyn PlaybackElement>> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(PlayerError::Decode("unsupported stream".to_string()));
        }
        let flags = Arc::new(ElementFlags::default());
        lock(&self.elements).push(flags.clone());

        // "Play" by draining the reader until it ends or is detached
        let playing = flags.clone();
        let fail = self.fail_playback.load(Ordering::SeqCst);
        thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while !playing.detached.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        playing.packets.fetch_add(1, Ordering::SeqCst);
                        if fail {
                            *lock(&playing.error) = Some("corrupt frame header".to_string());
                            break;
                        }
                    }
                }
            }
            playing.finished.store(true, Ordering::SeqCst);
        });

        Ok(Box::new(VirtualElement(flags)))
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

// --- Scripted decoder ---

/// Counters shared between a `ScriptedDecoder` and the test
#[derive(Debug, Default)]
pub struct DecoderCounters {
    pub decodes: AtomicUsize,
    pub resets: AtomicUsize,
}

/// Blocks one decode call until the test releases it
pub struct DecodeGate {
    pub on_call: usize,
    pub entered: Sender<()>,
    pub release: Receiver<()>,
}

/// Decoder whose output is a function of the chunk: 8 stereo frames at
/// 8 kHz per input byte. Call numbers are 1-based and restart on reset.
pub struct ScriptedDecoder {
    calls: usize,
    fail_on: HashSet<usize>,
    empty_on: HashSet<usize>,
    gate: Option<DecodeGate>,
    counters: Arc<DecoderCounters>,
}

impl ScriptedDecoder {
    pub fn new() -> (Self, Arc<DecoderCounters>) {
        let counters = Arc::new(DecoderCounters::default());
        (
            Self {
                calls: 0,
                fail_on: HashSet::new(),
                empty_on: HashSet::new(),
                gate: None,
                counters: counters.clone(),
            },
            counters,
        )
    }

    pub fn fail_on(mut self, calls: &[usize]) -> Self {
        self.fail_on.extend(calls);
        self
    }

    pub fn empty_on(mut self, calls: &[usize]) -> Self {
        self.empty_on.extend(calls);
        self
    }

    pub fn gate(mut self, gate: DecodeGate) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl ChunkDecoder for ScriptedDecoder {
    fn decode(&mut self, chunk: &[u8]) -> Result<PcmBlock> {
        self.calls += 1;
        self.counters.decodes.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = self.gate.as_ref().filter(|g| g.on_call == self.calls) {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        if self.fail_on.contains(&self.calls) {
            return Err(PlayerError::Decode(format!("corrupt chunk {}", self.calls)));
        }
        if self.empty_on.contains(&self.calls) {
            return Ok(PcmBlock::default());
        }
        let frames = chunk.len() * 8;
        Ok(PcmBlock::new(8000, vec![vec![0.25; frames], vec![-0.25; frames]]))
    }

    fn reset(&mut self) -> Result<()> {
        self.calls = 0;
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// --- Scripted connector ---

/// A successful connection script
#[derive(Debug, Clone)]
pub struct StreamScript {
    pub content_type: Option<String>,
    pub tags: Vec<(String, String)>,
    pub chunks: Vec<Vec<u8>>,
    /// Title sent before the chunk with the same index
    pub titles: Vec<Option<String>>,
    pub connect_delay: Duration,
    /// When false the connection resolves after the delay even if aborted
    pub honor_abort: bool,
    pub chunk_interval: Duration,
    /// Keep the body open after the last chunk until aborted or cancelled
    pub hold_open: bool,
}

impl StreamScript {
    /// Ogg stream (decoded path) of `count` 100-byte chunks
    pub fn ogg(count: usize) -> Self {
        Self {
            content_type: Some("application/ogg".to_string()),
            tags: vec![("icy-name".to_string(), "Test FM".to_string())],
            chunks: (0..count).map(|i| vec![i as u8; 100]).collect(),
            titles: Vec::new(),
            connect_delay: Duration::ZERO,
            honor_abort: true,
            chunk_interval: Duration::ZERO,
            hold_open: false,
        }
    }

    /// MPEG stream (direct element path)
    pub fn mpeg(count: usize) -> Self {
        Self {
            content_type: Some("audio/mpeg".to_string()),
            ..Self::ogg(count)
        }
    }

    pub fn titled(mut self, index: usize, title: &str) -> Self {
        if self.titles.len() <= index {
            self.titles.resize(index + 1, None);
        }
        self.titles[index] = Some(title.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration, honor_abort: bool) -> Self {
        self.connect_delay = delay;
        self.honor_abort = honor_abort;
        self
    }

    pub fn paced(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Stream(StreamScript),
    Fail(String),
    /// Never answers; times out after the given bound like an unreachable host
    Hang(Duration),
}

type OpenHook = Box<dyn FnOnce() + Send>;

/// Connector that plays back scripts per URL
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<String, Script>>,
    formats: Mutex<HashMap<String, (Duration, Option<FormatMetadata>)>>,
    opens: Mutex<Vec<String>>,
    aborts: Mutex<Vec<AbortHandle>>,
    probes: AtomicUsize,
    format_lookups_returned: AtomicUsize,
    on_open: Mutex<Option<OpenHook>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, script: Script) {
        lock(&self.scripts).insert(url.to_string(), script);
    }

    pub fn format(&self, url: &str, delay: Duration, format: Option<FormatMetadata>) {
        lock(&self.formats).insert(url.to_string(), (delay, format));
    }

    /// Run `hook` on the calling (session) thread during the next open
    pub fn on_open(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.on_open) = Some(Box::new(hook));
    }

    pub fn opens(&self) -> Vec<String> {
        lock(&self.opens).clone()
    }

    pub fn abort_handles(&self) -> Vec<AbortHandle> {
        lock(&self.aborts).clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Probes that have returned, by result or cancellation
    pub fn format_lookups_returned(&self) -> usize {
        self.format_lookups_returned.load(Ordering::SeqCst)
    }

    fn open_scripted(&self, script: StreamScript, abort: &AbortHandle) -> Result<OpenedStream> {
        if script.honor_abort {
            select! {
                recv(abort.token().wake()) -> _ => return Err(PlayerError::Cancelled),
                recv(after(script.connect_delay)) -> _ => {}
            }
        } else {
            thread::sleep(script.connect_delay);
        }

        let (chunk_tx, chunk_rx) = unbounded::<Vec<u8>>();
        let (event_tx, event_rx) = unbounded::<IcyEvent>();
        let reader = IcyReader::from_channel(chunk_rx);
        let reader_cancel = reader.cancel_handle();
        let abort = abort.clone();

        thread::spawn(move || {
            let mut stats = StatsSnapshot::new(Instant::now());
            for (i, chunk) in script.chunks.into_iter().enumerate() {
                if abort.is_aborted() || reader_cancel.is_cancelled() {
                    return;
                }
                stats.audio_bytes_read += chunk.len() as u64;
                stats.total_bytes_read += chunk.len() as u64;
                if let Some(Some(title)) = script.titles.get(i) {
                    let _ = event_tx.send(IcyEvent {
                        title: Some(title.clone()),
                        stats,
                    });
                }
                let _ = chunk_tx.send(chunk);
                if !script.chunk_interval.is_zero() {
                    thread::sleep(script.chunk_interval);
                }
            }
            let _ = event_tx.send(IcyEvent { title: None, stats });
            if script.hold_open {
                select! {
                    recv(abort.token().wake()) -> _ => {},
                    recv(reader_cancel.wake()) -> _ => {},
                    recv(after(Duration::from_secs(10))) -> _ => {},
                }
            }
        });

        let tags = IcyTagSet::from_headers(
            script.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        Ok(OpenedStream {
            info: ResponseInfo {
                content_type: script.content_type,
                tags,
                icy_requested: true,
            },
            reader,
            events: event_rx,
        })
    }
}

impl StreamConnector for ScriptedConnector {
    fn open_stream(&self, url: &str, abort: &AbortHandle) -> Result<OpenedStream> {
        lock(&self.opens).push(url.to_string());
        lock(&self.aborts).push(abort.clone());
        let hook = lock(&self.on_open).take();
        if let Some(hook) = hook {
            hook();
        }

        let script = lock(&self.scripts)
            .get(url)
            .cloned()
            .unwrap_or_else(|| Script::Fail(format!("no route to {}", url)));

        match script {
            Script::Fail(msg) => Err(PlayerError::Stream(msg)),
            Script::Hang(timeout) => select! {
                recv(abort.token().wake()) -> _ => Err(PlayerError::Cancelled),
                recv(after(timeout)) -> _ => {
                    abort.abort();
                    Err(PlayerError::Timeout(format!("no response from {}", url)))
                }
            },
            Script::Stream(script) => self.open_scripted(script, abort),
        }
    }

    fn probe_format(&self, url: &str, cancel: &CancelToken) -> Result<FormatMetadata> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let (delay, format) = lock(&self.formats)
            .get(url)
            .cloned()
            .unwrap_or((Duration::ZERO, None));
        let result = select! {
            recv(cancel.wake()) -> _ => Err(PlayerError::Cancelled),
            recv(after(delay)) -> _ => {
                format.ok_or_else(|| PlayerError::Decode("probe found no audio track".to_string()))
            }
        };
        self.format_lookups_returned.fetch_add(1, Ordering::SeqCst);
        result
    }
}
