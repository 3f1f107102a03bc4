//! Decode pump
//!
//! Moves one session's audio chunks through the decoder into the scheduler,
//! in arrival order, one at a time. A chunk that fails to decode is logged
//! once and skipped; it never ends the session. The pump re-checks the
//! session between every step and stops as soon as it was cancelled or
//! superseded, so a decode that resolves late never reaches the graph.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::audio::decoder::DecoderService;
use crate::session::scheduler::{PlaybackScheduler, ScheduleOutcome};
use crate::session::state::{Publisher, SessionState};
use crate::stream::icy::{ChunkRead, IcyReader};

/// Counters for one pump run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpReport {
    pub chunks_read: u64,
    pub chunks_decoded: u64,
    pub decode_errors: u64,
    /// Decoded blocks with nothing playable in them
    pub blocks_skipped: u64,
    pub buffers_scheduled: u64,
    /// Blocks the output graph refused
    pub buffers_dropped: u64,
}

/// Why the pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The stream ended and every chunk was handled
    Drained,
    Cancelled,
}

/// Source of audio chunks for the pump
pub trait ChunkSource {
    fn next_chunk(&mut self) -> ChunkRead;
}

impl ChunkSource for IcyReader {
    fn next_chunk(&mut self) -> ChunkRead {
        IcyReader::next_chunk(self)
    }
}

pub struct DecodePump {
    session: Arc<SessionState>,
    decoder: DecoderService,
    scheduler: PlaybackScheduler,
    publisher: Publisher,
    report: PumpReport,
}

impl DecodePump {
    pub fn new(
        session: Arc<SessionState>,
        decoder: DecoderService,
        scheduler: PlaybackScheduler,
        publisher: Publisher,
    ) -> Self {
        Self {
            session,
            decoder,
            scheduler,
            publisher,
            report: PumpReport::default(),
        }
    }

    pub fn report(&self) -> PumpReport {
        self.report
    }

    /// Cancelled, or another session took over the shared state
    fn superseded(&self) -> bool {
        self.session.is_cancelled() || !self.publisher.is_current()
    }

    pub fn run<S: ChunkSource>(&mut self, source: &mut S) -> PumpExit {
        let token = self.session.token();
        if let Err(e) = self.decoder.reset() {
            warn!(token, error = %e, "Decoder reset failed");
        }

        loop {
            let chunk = match source.next_chunk() {
                ChunkRead::Chunk(chunk) => chunk,
                ChunkRead::End => {
                    debug!(token, chunks = self.report.chunks_read, "Stream drained");
                    return PumpExit::Drained;
                }
                ChunkRead::Cancelled => return PumpExit::Cancelled,
            };
            self.report.chunks_read += 1;
            if self.superseded() {
                return PumpExit::Cancelled;
            }

            let block = match self.decoder.decode(&chunk) {
                Ok(block) => block,
                Err(e) => {
                    // A failure caused by cancellation is not worth a log line
                    if self.superseded() {
                        return PumpExit::Cancelled;
                    }
                    self.report.decode_errors += 1;
                    warn!(token, chunk = self.report.chunks_read, error = %e, "Skipping chunk that failed to decode");
                    self.publisher.pump_report(self.report);
                    continue;
                }
            };
            self.report.chunks_decoded += 1;

            if !block.is_playable() {
                self.report.blocks_skipped += 1;
                continue;
            }
            if self.superseded() {
                return PumpExit::Cancelled;
            }

            match self.scheduler.schedule(block) {
                ScheduleOutcome::Scheduled { .. } => self.report.buffers_scheduled += 1,
                ScheduleOutcome::Dropped(_) => self.report.buffers_dropped += 1,
                ScheduleOutcome::Cancelled => return PumpExit::Cancelled,
            }
            self.publisher.pump_report(self.report);
        }
    }
}
