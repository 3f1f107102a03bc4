//! ICY stream reader
//!
//! Reads an Icecast/Shoutcast response body on a background thread,
//! strips the in-band metadata blocks, and hands audio chunks to the
//! session one at a time. Parsed titles and byte counters are emitted as
//! `IcyEvent`s on a separate channel.
//!
//! A body read that times out only means the server was idle for the
//! client's read timeout. The thread retries it after checking its stop
//! flag, so a stalled connection is released soon after cancellation.

use std::io::{self, Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, SendTimeoutError, Sender};
use tracing::debug;

use crate::cancel::{AbortHandle, CancelToken, Worker};
use crate::config::network::{AUDIO_CHANNEL_BOUND, READ_CHUNK_SIZE, STATS_INTERVAL_MS};
use crate::error::{PlayerError, Result};
use crate::stream::metadata::extract_stream_title;
use crate::stream::types::{IcyEvent, StatsSnapshot};

/// Outcome of waiting for the next audio chunk
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkRead {
    Chunk(Vec<u8>),
    /// The body ended (or the network thread exited)
    End,
    /// The reader was cancelled while waiting
    Cancelled,
}

/// Reader over the audio part of an ICY stream.
///
/// Uses a single-chunk design: holds at most one channel message at a time.
pub struct IcyReader {
    current_chunk: Vec<u8>,
    chunk_pos: usize,
    receiver: Receiver<Vec<u8>>,
    cancel: CancelToken,
    worker: Option<Worker>,
}

impl IcyReader {
    /// Start reading `body` on an `icy-reader` thread.
    ///
    /// `metaint` is the in-band metadata interval (0 = plain audio). The
    /// thread stops when the reader is cancelled or dropped, or when
    /// `abort` fires.
    pub fn spawn<R>(
        body: R,
        metaint: usize,
        abort: Option<AbortHandle>,
    ) -> Result<(Self, Receiver<IcyEvent>)>
    where
        R: Read + Send + 'static,
    {
        let (audio_tx, audio_rx) = bounded::<Vec<u8>>(AUDIO_CHANNEL_BOUND);
        let (event_tx, event_rx) = unbounded::<IcyEvent>();
        let cancel = CancelToken::new();

        let body_reader = IcyBodyReader {
            metaint,
            bytes_until_meta: metaint,
            stats: StatsSnapshot::new(Instant::now()),
            last_stats_emit: Instant::now(),
            audio_tx,
            event_tx,
            stop: cancel.clone(),
            abort,
        };

        let worker = Worker::spawn("icy-reader", move || body_reader.run(body))
            .map_err(|e| PlayerError::Stream(format!("Failed to spawn icy-reader thread: {}", e)))?;

        Ok((
            Self {
                current_chunk: Vec::new(),
                chunk_pos: 0,
                receiver: audio_rx,
                cancel,
                worker: Some(worker),
            },
            event_rx,
        ))
    }

    /// Build a reader fed directly by a channel (no network thread).
    #[cfg(test)]
    pub(crate) fn from_channel(receiver: Receiver<Vec<u8>>) -> Self {
        Self {
            current_chunk: Vec::new(),
            chunk_pos: 0,
            receiver,
            cancel: CancelToken::new(),
            worker: None,
        }
    }

    /// Cancel the reader and wait up to `bound` for the network thread to
    /// drop the body. Returns false if the thread was left running.
    pub fn shutdown(mut self, bound: Duration) -> bool {
        self.cancel.cancel();
        match self.worker.take() {
            Some(worker) => worker.join_within(bound),
            None => true,
        }
    }

    /// Handle that cancels this reader from another thread.
    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the next audio chunk. Any partially consumed chunk is
    /// returned first.
    pub fn next_chunk(&mut self) -> ChunkRead {
        if self.cancel.is_cancelled() {
            return ChunkRead::Cancelled;
        }
        if self.chunk_pos < self.current_chunk.len() {
            let rest = self.current_chunk.split_off(self.chunk_pos);
            self.current_chunk.clear();
            self.chunk_pos = 0;
            return ChunkRead::Chunk(rest);
        }

        select! {
            recv(self.receiver) -> msg => match msg {
                Ok(_) if self.cancel.is_cancelled() => ChunkRead::Cancelled,
                Ok(chunk) => ChunkRead::Chunk(chunk),
                Err(_) => ChunkRead::End,
            },
            recv(self.cancel.wake()) -> _ => ChunkRead::Cancelled,
        }
    }
}

impl Read for IcyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let remaining = self.current_chunk.len() - self.chunk_pos;
            if remaining > 0 {
                let n = buf.len().min(remaining);
                buf[..n].copy_from_slice(&self.current_chunk[self.chunk_pos..self.chunk_pos + n]);
                self.chunk_pos += n;
                if self.chunk_pos >= self.current_chunk.len() {
                    self.current_chunk = Vec::new();
                    self.chunk_pos = 0;
                }
                return Ok(n);
            }

            match self.next_chunk() {
                ChunkRead::Chunk(chunk) => {
                    self.current_chunk = chunk;
                    self.chunk_pos = 0;
                }
                ChunkRead::End => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "ICY stream ended"));
                }
                ChunkRead::Cancelled => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "ICY stream cancelled",
                    ));
                }
            }
        }
    }
}

impl Seek for IcyReader {
    /// Seeks only within the chunk currently held; a live stream is not
    /// seekable beyond that.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.current_chunk.len();
        let new_pos = match pos {
            SeekFrom::Start(p) => p as usize,
            SeekFrom::Current(p) => {
                if p >= 0 {
                    self.chunk_pos.saturating_add(p as usize)
                } else {
                    self.chunk_pos.saturating_sub(p.unsigned_abs() as usize)
                }
            }
            SeekFrom::End(p) => {
                if p >= 0 {
                    len
                } else {
                    len.saturating_sub(p.unsigned_abs() as usize)
                }
            }
        };

        self.chunk_pos = new_pos.min(len);
        Ok(self.chunk_pos as u64)
    }
}

impl Drop for IcyReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum ReadResult {
    Ok,
    Eof,
    Error,
    ChannelClosed,
    Stopped,
}

/// The read returned no data because the body was idle past the client's
/// read timeout
fn is_idle(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        || e.get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout)
}

fn is_retryable(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted || is_idle(e)
}

/// State of the background body reader
struct IcyBodyReader {
    metaint: usize,
    bytes_until_meta: usize,
    stats: StatsSnapshot,
    last_stats_emit: Instant,
    audio_tx: Sender<Vec<u8>>,
    event_tx: Sender<IcyEvent>,
    stop: CancelToken,
    abort: Option<AbortHandle>,
}

impl IcyBodyReader {
    fn stopped(&self) -> bool {
        self.stop.is_cancelled() || self.abort.as_ref().is_some_and(|a| a.is_aborted())
    }

    fn run<R: Read>(mut self, mut body: R) {
        let mut chunk_buffer = vec![0u8; READ_CHUNK_SIZE];

        loop {
            if self.stopped() {
                debug!("icy-reader stopped");
                return;
            }

            let result = if self.metaint == 0 {
                self.read_plain(&mut body, &mut chunk_buffer)
            } else {
                self.read_with_meta(&mut body, &mut chunk_buffer)
            };

            match result {
                ReadResult::Ok => self.maybe_emit_stats(),
                ReadResult::Eof => {
                    debug!(
                        audio_bytes = self.stats.audio_bytes_read,
                        "icy stream ended"
                    );
                    self.emit(None);
                    return;
                }
                ReadResult::Error => {
                    if !self.stopped() {
                        debug!("icy stream read failed");
                    }
                    return;
                }
                ReadResult::ChannelClosed => return,
                ReadResult::Stopped => {
                    debug!("icy-reader stopped");
                    return;
                }
            }
        }
    }

    fn read_plain<R: Read>(&mut self, body: &mut R, chunk_buffer: &mut [u8]) -> ReadResult {
        match body.read(chunk_buffer) {
            Ok(0) => ReadResult::Eof,
            Ok(n) => {
                self.stats.total_bytes_read += n as u64;
                self.stats.audio_bytes_read += n as u64;
                self.forward(chunk_buffer[..n].to_vec())
            }
            Err(e) if is_retryable(&e) => ReadResult::Ok,
            Err(_) => ReadResult::Error,
        }
    }

    fn read_with_meta<R: Read>(&mut self, body: &mut R, chunk_buffer: &mut [u8]) -> ReadResult {
        if self.bytes_until_meta > 0 {
            let to_read = chunk_buffer.len().min(self.bytes_until_meta);
            match body.read(&mut chunk_buffer[..to_read]) {
                Ok(0) => return ReadResult::Eof,
                Ok(n) => {
                    self.stats.total_bytes_read += n as u64;
                    self.stats.audio_bytes_read += n as u64;
                    self.bytes_until_meta -= n;
                    if let r @ (ReadResult::ChannelClosed | ReadResult::Error) =
                        self.forward(chunk_buffer[..n].to_vec())
                    {
                        return r;
                    }
                }
                Err(e) if is_retryable(&e) => return ReadResult::Ok,
                Err(_) => return ReadResult::Error,
            }
        }

        if self.bytes_until_meta == 0 {
            let mut len_byte = [0u8; 1];
            if let r @ (ReadResult::Eof | ReadResult::Error | ReadResult::Stopped) =
                self.read_full(body, &mut len_byte)
            {
                return r;
            }
            self.stats.total_bytes_read += 1;
            self.stats.icy_bytes_read += 1;

            let meta_len = len_byte[0] as usize * 16;
            if meta_len > 0 {
                let mut meta_buf = vec![0u8; meta_len];
                if let r @ (ReadResult::Eof | ReadResult::Error | ReadResult::Stopped) =
                    self.read_full(body, &mut meta_buf)
                {
                    return r;
                }
                self.stats.total_bytes_read += meta_len as u64;
                self.stats.icy_bytes_read += meta_len as u64;
                self.emit(extract_stream_title(&meta_buf));
            }

            self.bytes_until_meta = self.metaint;
        }

        ReadResult::Ok
    }

    /// Fill `buf` completely, riding out idle reads
    fn read_full<R: Read>(&self, body: &mut R, buf: &mut [u8]) -> ReadResult {
        let mut filled = 0;
        while filled < buf.len() {
            if self.stopped() {
                return ReadResult::Stopped;
            }
            match body.read(&mut buf[filled..]) {
                Ok(0) => return ReadResult::Eof,
                Ok(n) => filled += n,
                Err(e) if is_retryable(&e) => {}
                Err(_) => return ReadResult::Error,
            }
        }
        ReadResult::Ok
    }

    /// Send one audio chunk, waking up regularly to honor the stop flag
    /// while the consumer is slow.
    fn forward(&self, mut chunk: Vec<u8>) -> ReadResult {
        loop {
            match self.audio_tx.send_timeout(chunk, Duration::from_millis(100)) {
                Ok(()) => return ReadResult::Ok,
                Err(SendTimeoutError::Timeout(c)) => {
                    if self.stopped() {
                        return ReadResult::ChannelClosed;
                    }
                    chunk = c;
                }
                Err(SendTimeoutError::Disconnected(_)) => return ReadResult::ChannelClosed,
            }
        }
    }

    fn emit(&mut self, title: Option<String>) {
        self.last_stats_emit = Instant::now();
        let _ = self.event_tx.send(IcyEvent {
            title,
            stats: self.stats,
        });
    }

    fn maybe_emit_stats(&mut self) {
        if self.last_stats_emit.elapsed() >= Duration::from_millis(STATS_INTERVAL_MS) {
            self.emit(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::icy_body;
    use std::io::Cursor;

    fn drain(reader: &mut IcyReader) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match reader.next_chunk() {
                ChunkRead::Chunk(c) => out.extend(c),
                ChunkRead::End => return out,
                ChunkRead::Cancelled => panic!("unexpected cancel"),
            }
        }
    }

    // --- Body parsing ---

    #[test]
    fn plain_body_passes_through() {
        let audio: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let (mut reader, events) = IcyReader::spawn(Cursor::new(audio.clone()), 0, None).unwrap();
        assert_eq!(drain(&mut reader), audio);

        let last = events.iter().last().expect("final stats event");
        assert_eq!(last.stats.audio_bytes_read, audio.len() as u64);
        assert_eq!(last.stats.icy_bytes_read, 0);
    }

    #[test]
    fn metadata_blocks_are_stripped() {
        let audio: Vec<u8> = (0..100u8).collect();
        let body = icy_body(&audio, 32, &["StreamTitle='A - One';", "", "StreamTitle='B - Two';"]);
        let (mut reader, events) = IcyReader::spawn(Cursor::new(body.clone()), 32, None).unwrap();
        assert_eq!(drain(&mut reader), audio);

        let titles: Vec<String> = events.iter().filter_map(|e| e.title).collect();
        assert_eq!(titles, vec!["A - One".to_string(), "B - Two".to_string()]);
    }

    #[test]
    fn stats_count_audio_and_icy_bytes() {
        let audio = vec![7u8; 64];
        let body = icy_body(&audio, 16, &["StreamTitle='X';"]);
        let (mut reader, events) = IcyReader::spawn(Cursor::new(body.clone()), 16, None).unwrap();
        drain(&mut reader);

        let last = events.iter().last().unwrap();
        assert_eq!(last.stats.audio_bytes_read, 64);
        assert_eq!(last.stats.total_bytes_read, body.len() as u64);
        assert_eq!(
            last.stats.icy_bytes_read,
            last.stats.total_bytes_read - last.stats.audio_bytes_read
        );
    }

    #[test]
    fn truncated_metadata_ends_stream() {
        let mut body = vec![1u8; 16];
        body.push(2); // promises 32 bytes of metadata
        body.extend_from_slice(b"StreamTi");
        let (mut reader, _events) = IcyReader::spawn(Cursor::new(body), 16, None).unwrap();
        assert_eq!(drain(&mut reader), vec![1u8; 16]);
    }

    #[test]
    fn abort_stops_background_thread() {
        struct Endless;
        impl Read for Endless {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                std::thread::sleep(Duration::from_millis(5));
                buf.fill(0x55);
                Ok(buf.len())
            }
        }

        let abort = AbortHandle::new();
        let (mut reader, _events) = IcyReader::spawn(Endless, 0, Some(abort.clone())).unwrap();
        assert!(matches!(reader.next_chunk(), ChunkRead::Chunk(_)));
        abort.abort();

        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            match reader.next_chunk() {
                ChunkRead::End => break,
                ChunkRead::Chunk(_) => assert!(Instant::now() < deadline, "thread kept running"),
                ChunkRead::Cancelled => panic!("reader itself was not cancelled"),
            }
        }
    }

    /// Body that times out on every other read, like an idle server
    struct Idling {
        data: Cursor<Vec<u8>>,
        idle_next: bool,
    }

    impl Read for Idling {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.idle_next = !self.idle_next;
            if self.idle_next {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"));
            }
            // Short reads so metadata blocks straddle idle periods
            let n = buf.len().min(5);
            self.data.read(&mut buf[..n])
        }
    }

    #[test]
    fn idle_reads_do_not_end_stream() {
        let audio: Vec<u8> = (0..48u8).collect();
        let body = icy_body(&audio, 16, &["StreamTitle='Slow - Server';"]);
        let idling = Idling {
            data: Cursor::new(body),
            idle_next: false,
        };
        let (mut reader, events) = IcyReader::spawn(idling, 16, None).unwrap();
        assert_eq!(drain(&mut reader), audio);

        let titles: Vec<String> = events.iter().filter_map(|e| e.title).collect();
        assert_eq!(titles, vec!["Slow - Server".to_string()]);
    }

    #[test]
    fn shutdown_releases_stalled_body() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        /// Body that never delivers data; each read waits out a short timeout
        struct Stalled(Arc<AtomicBool>);
        impl Read for Stalled {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                std::thread::sleep(Duration::from_millis(20));
                Err(io::Error::new(io::ErrorKind::TimedOut, "idle"))
            }
        }
        impl Drop for Stalled {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let (reader, _events) =
            IcyReader::spawn(Stalled(released.clone()), 0, None).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!released.load(Ordering::SeqCst));

        assert!(reader.shutdown(Duration::from_secs(2)));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn only_timeouts_count_as_idle() {
        assert!(is_idle(&io::Error::new(io::ErrorKind::TimedOut, "t")));
        assert!(!is_idle(&io::Error::new(io::ErrorKind::ConnectionReset, "r")));
        assert!(!is_idle(&io::Error::new(io::ErrorKind::Other, "plain")));
    }

    // --- Chunk handoff ---

    #[test]
    fn next_chunk_from_channel() {
        let (tx, rx) = bounded(8);
        let mut reader = IcyReader::from_channel(rx);
        tx.send(vec![1, 2]).unwrap();
        tx.send(vec![3]).unwrap();
        drop(tx);
        assert_eq!(reader.next_chunk(), ChunkRead::Chunk(vec![1, 2]));
        assert_eq!(reader.next_chunk(), ChunkRead::Chunk(vec![3]));
        assert_eq!(reader.next_chunk(), ChunkRead::End);
    }

    #[test]
    fn cancel_wakes_blocked_next_chunk() {
        let (_tx, rx) = bounded::<Vec<u8>>(8);
        let mut reader = IcyReader::from_channel(rx);
        let cancel = reader.cancel_handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        assert_eq!(reader.next_chunk(), ChunkRead::Cancelled);
    }

    #[test]
    fn next_chunk_returns_partial_leftover_first() {
        let (tx, rx) = bounded(8);
        let mut reader = IcyReader::from_channel(rx);
        tx.send(vec![1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 1];
        reader.read(&mut buf).unwrap();
        assert_eq!(buf, [1]);
        assert_eq!(reader.next_chunk(), ChunkRead::Chunk(vec![2, 3, 4]));
    }

    // --- Read + Seek ---

    #[test]
    fn read_serves_one_chunk_at_a_time() {
        let (tx, rx) = bounded(8);
        let mut reader = IcyReader::from_channel(rx);
        tx.send(vec![1, 2]).unwrap();
        tx.send(vec![3, 4, 5]).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[1, 2]);
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[3, 4, 5]);
    }

    #[test]
    fn read_after_end_is_eof_error() {
        let (tx, rx) = bounded::<Vec<u8>>(1);
        drop(tx);
        let mut reader = IcyReader::from_channel(rx);
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_zero_length_buffer() {
        let (_tx, rx) = bounded::<Vec<u8>>(1);
        let mut reader = IcyReader::from_channel(rx);
        assert_eq!(reader.read(&mut []).unwrap(), 0);
    }

    #[test]
    fn seek_within_current_chunk() {
        let (tx, rx) = bounded(8);
        let mut reader = IcyReader::from_channel(rx);
        tx.send(vec![10, 20, 30, 40, 50]).unwrap();

        let mut buf = [0u8; 3];
        reader.read(&mut buf).unwrap();
        assert_eq!(reader.seek(SeekFrom::Current(-2)).unwrap(), 1);
        assert_eq!(reader.seek(SeekFrom::End(-1)).unwrap(), 4);
        assert_eq!(reader.seek(SeekFrom::Start(100)).unwrap(), 5);
        assert_eq!(reader.seek(SeekFrom::Current(-10)).unwrap(), 0);

        let mut all = [0u8; 5];
        assert_eq!(reader.read(&mut all).unwrap(), 5);
        assert_eq!(all, [10, 20, 30, 40, 50]);
    }

    #[test]
    fn drop_cancels_reader() {
        let (_tx, rx) = bounded::<Vec<u8>>(1);
        let reader = IcyReader::from_channel(rx);
        let cancel = reader.cancel_handle();
        drop(reader);
        assert!(cancel.is_cancelled());
    }
}
