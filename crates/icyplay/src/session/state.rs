//! Session resources and observable player state
//!
//! `SessionState` owns everything one session may leave behind: the abort
//! handle of its connection, the cancel handle of its reader, the buffers
//! it scheduled, and the element it attached. Every install goes through a
//! lock that also checks the cancel flag, so nothing can be registered after
//! the controller started tearing the session down.
//!
//! `PlayerState` is what the outside world observes. Writes to it go
//! through a `Publisher`, which drops them unless its token is current.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::audio::graph::{BufferHandle, ElementReport, PlaybackElement};
use crate::audio::types::FormatMetadata;
use crate::cancel::{AbortHandle, CancelToken};
use crate::session::events::{EventBus, PlayerEvent};
use crate::session::pump::PumpReport;
use crate::stream::metadata::TrackTitle;
use crate::stream::types::{IcyTagSet, StatsSnapshot, StreamDescriptor};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resources owned by one play session.
pub struct SessionState {
    token: u64,
    cancel: CancelToken,
    abort: Mutex<Option<AbortHandle>>,
    reader: Mutex<Option<CancelToken>>,
    live_buffers: Mutex<HashMap<u64, BufferHandle>>,
    element: Mutex<Option<Box<dyn PlaybackElement>>>,
    next_buffer_id: AtomicU64,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("token", &self.token)
            .field("cancelled", &self.is_cancelled())
            .field("live_buffers", &self.live_buffer_count())
            .finish()
    }
}

impl SessionState {
    pub fn new(token: u64, abort: AbortHandle) -> Self {
        Self {
            token,
            cancel: CancelToken::new(),
            abort: Mutex::new(Some(abort)),
            reader: Mutex::new(None),
            live_buffers: Mutex::new(HashMap::new()),
            element: Mutex::new(None),
            next_buffer_id: AtomicU64::new(1),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Set the cancel flag and wake every waiter. Idempotent.
    pub fn request_cancel(&self) -> bool {
        self.cancel.cancel()
    }

    // --- Connection abort ---

    /// Clone of the abort handle, if the connection is still pending
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        lock(&self.abort).clone()
    }

    /// Forget the abort handle without invoking it
    pub fn take_abort(&self) -> Option<AbortHandle> {
        lock(&self.abort).take()
    }

    /// Take the abort handle and invoke it. At most once per session.
    pub fn invoke_abort(&self) -> bool {
        match self.take_abort() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_abort(&self) -> bool {
        lock(&self.abort).is_some()
    }

    // --- Reader ---

    /// Record the reader's cancel handle. Refused once cancelled; the caller
    /// then owns the reader and must drop it.
    pub fn install_reader(&self, reader: CancelToken) -> bool {
        let mut slot = lock(&self.reader);
        if self.is_cancelled() {
            return false;
        }
        *slot = Some(reader);
        true
    }

    /// Drop the reader handle after the reader was consumed
    pub fn release_reader(&self) {
        lock(&self.reader).take();
    }

    /// Cancel and forget the reader
    pub fn cancel_reader(&self) -> bool {
        match lock(&self.reader).take() {
            Some(reader) => {
                reader.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_reader(&self) -> bool {
        lock(&self.reader).is_some()
    }

    // --- Live buffers ---

    /// Fresh handle with an id unique within this session
    pub fn new_buffer_handle(&self) -> BufferHandle {
        BufferHandle::new(self.next_buffer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Track a buffer about to be scheduled. Refused once cancelled.
    pub fn register_buffer(&self, handle: BufferHandle) -> bool {
        let mut live = lock(&self.live_buffers);
        if self.is_cancelled() {
            return false;
        }
        live.insert(handle.id(), handle);
        true
    }

    pub fn remove_buffer(&self, id: u64) {
        lock(&self.live_buffers).remove(&id);
    }

    /// Stop every tracked buffer and empty the set. Returns how many.
    pub fn stop_buffers(&self) -> usize {
        let drained: Vec<BufferHandle> = lock(&self.live_buffers).drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.stop();
        }
        drained.len()
    }

    pub fn live_buffer_count(&self) -> usize {
        lock(&self.live_buffers).len()
    }

    // --- Direct element ---

    /// Record the attached element. Once cancelled the element is handed
    /// back so the caller can pause and detach it.
    pub fn install_element(
        &self,
        element: Box<dyn PlaybackElement>,
    ) -> Result<(), Box<dyn PlaybackElement>> {
        let mut slot = lock(&self.element);
        if self.is_cancelled() {
            return Err(element);
        }
        *slot = Some(element);
        Ok(())
    }

    pub fn take_element(&self) -> Option<Box<dyn PlaybackElement>> {
        lock(&self.element).take()
    }

    /// True when an attached element has played to its end
    pub fn element_finished(&self) -> bool {
        lock(&self.element)
            .as_ref()
            .map(|el| el.is_finished())
            .unwrap_or(false)
    }

    pub fn element_report(&self) -> Option<ElementReport> {
        lock(&self.element).as_ref().map(|el| el.report())
    }

    pub fn has_element(&self) -> bool {
        lock(&self.element).is_some()
    }
}

/// Coarse lifecycle of the current session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Playing,
    /// The stream ended on its own; scheduled audio may still be playing out
    Ended,
    Failed,
}

/// Observable player state
#[derive(Debug, Clone, Default)]
pub struct PlayerState {
    /// Token of the latest session (0 before the first start)
    pub token: u64,
    /// True from start until the session is cancelled or fails
    pub active: bool,
    pub status: SessionStatus,
    pub now_playing: Option<StreamDescriptor>,
    pub content_type: Option<String>,
    pub tags: IcyTagSet,
    pub title: Option<TrackTitle>,
    pub stats: Option<StatsSnapshot>,
    pub format: Option<FormatMetadata>,
    pub error: Option<String>,
    pub pump: PumpReport,
}

impl PlayerState {
    /// Idle state that remembers the latest token
    pub fn idle(token: u64) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Fresh state for a session that is connecting
    pub fn connecting(token: u64, descriptor: StreamDescriptor) -> Self {
        Self {
            token,
            active: true,
            status: SessionStatus::Connecting,
            now_playing: Some(descriptor),
            ..Self::default()
        }
    }
}

pub type SharedState = Arc<Mutex<PlayerState>>;

/// Token-checked writer for one session.
///
/// Every write happens under the state lock and only while the shared
/// state still belongs to this token and is active. Events are emitted
/// under the same lock.
#[derive(Clone)]
pub struct Publisher {
    token: u64,
    state: SharedState,
    events: Arc<EventBus>,
}

impl Publisher {
    pub fn new(token: u64, state: SharedState, events: Arc<EventBus>) -> Self {
        Self {
            token,
            state,
            events,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// True while the shared state belongs to this session
    pub fn is_current(&self) -> bool {
        let state = lock(&self.state);
        state.token == self.token && state.active
    }

    /// Apply `update` when current and emit whatever event it returns.
    /// Returns false when the write was discarded as stale.
    pub fn publish<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut PlayerState) -> Option<PlayerEvent>,
    {
        let mut state = lock(&self.state);
        if state.token != self.token || !state.active {
            return false;
        }
        if let Some(event) = update(&mut state) {
            self.events.emit(event);
        }
        true
    }

    pub fn connected(&self, content_type: Option<String>, tags: IcyTagSet, decoded: bool) -> bool {
        let token = self.token;
        self.publish(|state| {
            state.status = SessionStatus::Playing;
            state.content_type = content_type.clone();
            state.tags = tags.clone();
            Some(PlayerEvent::Connected {
                token,
                content_type,
                tags,
                decoded,
            })
        })
    }

    /// Publish a new title. Repeats of the current title are not re-emitted.
    pub fn title(&self, title: TrackTitle) -> bool {
        let token = self.token;
        self.publish(|state| {
            if state.title.as_ref() == Some(&title) {
                return None;
            }
            state.title = Some(title.clone());
            Some(PlayerEvent::TitleChanged { token, title })
        })
    }

    pub fn stats(&self, stats: StatsSnapshot) -> bool {
        let token = self.token;
        self.publish(|state| {
            state.stats = Some(stats);
            Some(PlayerEvent::StatsUpdated { token, stats })
        })
    }

    pub fn format(&self, format: FormatMetadata) -> bool {
        let token = self.token;
        self.publish(|state| {
            state.format = Some(format.clone());
            Some(PlayerEvent::FormatProbed { token, format })
        })
    }

    pub fn pump_report(&self, report: PumpReport) -> bool {
        self.publish(|state| {
            state.pump = report;
            None
        })
    }

    pub fn ended(&self, report: PumpReport) -> bool {
        let token = self.token;
        self.publish(|state| {
            state.status = SessionStatus::Ended;
            state.pump = report;
            Some(PlayerEvent::StreamEnded { token, report })
        })
    }

    /// Reset to idle with an error. Later writes from this session are
    /// discarded.
    pub fn failed(&self, error: String) -> bool {
        let token = self.token;
        self.publish(|state| {
            *state = PlayerState {
                status: SessionStatus::Failed,
                error: Some(error.clone()),
                ..PlayerState::idle(token)
            };
            Some(PlayerEvent::SessionFailed { token, error })
        })
    }
}
