//! Gapless playback scheduler
//!
//! Places decoded blocks back to back on the output clock. The cursor is
//! seeded one initial lookahead ahead of the clock; each block starts at
//! the cursor, or at `now + min_lookahead` when the cursor has fallen
//! behind, and the cursor then moves past it. A block the graph refuses is
//! dropped and leaves the cursor where it was.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::audio::graph::{OnEnded, OutputGraph, ScheduleError};
use crate::audio::types::PcmBlock;
use crate::session::state::SessionState;

/// What happened to one block handed to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    Scheduled { start_at: f64 },
    /// The graph refused the block; it was dropped
    Dropped(ScheduleError),
    /// The session was cancelled before the block could be registered
    Cancelled,
}

pub struct PlaybackScheduler {
    graph: Arc<dyn OutputGraph>,
    session: Arc<SessionState>,
    next_start: f64,
    min_lookahead: f64,
}

impl PlaybackScheduler {
    pub fn new(
        graph: Arc<dyn OutputGraph>,
        session: Arc<SessionState>,
        initial_lookahead: f64,
        min_lookahead: f64,
    ) -> Self {
        let next_start = graph.current_time() + initial_lookahead;
        Self {
            graph,
            session,
            next_start,
            min_lookahead,
        }
    }

    /// Output-clock time the next block would start at, before clamping
    pub fn next_start_time(&self) -> f64 {
        self.next_start
    }

    pub fn schedule(&mut self, block: PcmBlock) -> ScheduleOutcome {
        let now = self.graph.current_time();
        let start_at = self.next_start.max(now + self.min_lookahead);
        let duration = block.duration_secs();

        // Register before handing the block over so a concurrent cancel
        // always finds it in the live set.
        let handle = self.session.new_buffer_handle();
        let id = handle.id();
        if !self.session.register_buffer(handle.clone()) {
            return ScheduleOutcome::Cancelled;
        }

        let session: Weak<SessionState> = Arc::downgrade(&self.session);
        let on_ended: OnEnded = Box::new(move || {
            if let Some(session) = session.upgrade() {
                session.remove_buffer(id);
            }
        });

        match self.graph.schedule(block, start_at, handle, on_ended) {
            Ok(()) => {
                self.next_start = start_at + duration;
                ScheduleOutcome::Scheduled { start_at }
            }
            Err(e) => {
                self.session.remove_buffer(id);
                debug!(token = self.session.token(), error = %e, "Dropped block refused by output graph");
                ScheduleOutcome::Dropped(e)
            }
        }
    }
}
