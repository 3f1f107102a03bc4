//! Session events and their broadcast bus
//!
//! Every event carries the token of the session that produced it. The
//! controller emits them while holding its state lock, so a subscriber
//! never sees an event from a session after that session was cancelled.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::audio::types::FormatMetadata;
use crate::session::pump::PumpReport;
use crate::stream::metadata::TrackTitle;
use crate::stream::types::{IcyTagSet, StatsSnapshot, StreamDescriptor};

/// Discrete events broadcast to subscribers
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    SessionStarted {
        token: u64,
        descriptor: StreamDescriptor,
    },
    Connected {
        token: u64,
        content_type: Option<String>,
        tags: IcyTagSet,
        /// True when chunks go through the decoder and scheduler
        decoded: bool,
    },
    TitleChanged {
        token: u64,
        title: TrackTitle,
    },
    StatsUpdated {
        token: u64,
        stats: StatsSnapshot,
    },
    FormatProbed {
        token: u64,
        format: FormatMetadata,
    },
    SessionFailed {
        token: u64,
        error: String,
    },
    StreamEnded {
        token: u64,
        report: PumpReport,
    },
    SessionCancelled {
        token: u64,
    },
}

impl PlayerEvent {
    pub fn token(&self) -> u64 {
        match self {
            PlayerEvent::SessionStarted { token, .. }
            | PlayerEvent::Connected { token, .. }
            | PlayerEvent::TitleChanged { token, .. }
            | PlayerEvent::StatsUpdated { token, .. }
            | PlayerEvent::FormatProbed { token, .. }
            | PlayerEvent::SessionFailed { token, .. }
            | PlayerEvent::StreamEnded { token, .. }
            | PlayerEvent::SessionCancelled { token } => *token,
        }
    }
}

/// Broadcast mechanism for player events
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Emit an event to all subscribers. Removes disconnected subscribers.
    pub fn emit(&self, event: PlayerEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
