//! Session controller
//!
//! Single owner of the "current session". `start` cancels whatever is
//! playing, bumps the token, and spawns a `stream-session` thread for the
//! new stream. `cancel` tears a session down in a fixed order and returns
//! only after its thread has exited, so nothing the old session does can
//! reach the output graph or the observable state afterwards.
//!
//! Both calls are serialized by one lifecycle lock. Calling either from
//! the session's own thread is a contract violation and is refused.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::audio::decoder::DecoderService;
use crate::audio::graph::{OutputGraph, RodioGraph};
use crate::audio::types::SharedAnalysis;
use crate::cancel::AbortHandle;
use crate::config::PlayerConfig;
use crate::error::{PlayerError, Result};
use crate::session::events::{EventBus, PlayerEvent};
use crate::session::runner::SessionRunner;
use crate::session::state::{PlayerState, Publisher, SessionState, SharedState};
use crate::stream::connector::{HttpConnector, StreamConnector};
use crate::stream::types::StreamDescriptor;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct ActiveSession {
    state: Arc<SessionState>,
    pump_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Lifecycle {
    last_token: u64,
    current: Option<ActiveSession>,
}

pub struct SessionController {
    graph: Arc<dyn OutputGraph>,
    decoder: DecoderService,
    connector: Arc<dyn StreamConnector>,
    config: PlayerConfig,
    state: SharedState,
    events: Arc<EventBus>,
    lifecycle: Mutex<Lifecycle>,
    session_thread: Mutex<Option<ThreadId>>,
}

impl SessionController {
    pub fn new(
        graph: Arc<dyn OutputGraph>,
        decoder: DecoderService,
        connector: Arc<dyn StreamConnector>,
        config: PlayerConfig,
    ) -> Result<Self> {
        config.validate()?;
        graph.set_gain(config.volume);
        Ok(Self {
            graph,
            decoder,
            connector,
            config,
            state: Arc::new(Mutex::new(PlayerState::default())),
            events: Arc::new(EventBus::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            session_thread: Mutex::new(None),
        })
    }

    /// Controller on the default output device, the symphonia decoder, and
    /// the HTTP connector.
    pub fn with_config(config: PlayerConfig) -> Result<Self> {
        let connector = HttpConnector::new(&config)?;
        let graph = RodioGraph::new()?;
        Self::new(
            Arc::new(graph),
            DecoderService::symphonia(),
            Arc::new(connector),
            config,
        )
    }

    /// Begin playing `descriptor`. Any current session is cancelled first.
    /// Returns the new session's token.
    pub fn start(&self, descriptor: StreamDescriptor) -> Result<u64> {
        self.check_caller("start")?;
        let mut lifecycle = lock(&self.lifecycle);
        if let Err(e) = self.cancel_locked(&mut lifecycle) {
            warn!(error = %e, "Previous session did not shut down cleanly");
        }

        lifecycle.last_token += 1;
        let token = lifecycle.last_token;
        let session = Arc::new(SessionState::new(token, AbortHandle::new()));

        {
            let mut state = lock(&self.state);
            *state = PlayerState::connecting(token, descriptor.clone());
            self.events.emit(PlayerEvent::SessionStarted {
                token,
                descriptor: descriptor.clone(),
            });
        }

        let runner = SessionRunner {
            session: session.clone(),
            publisher: Publisher::new(token, self.state.clone(), self.events.clone()),
            descriptor,
            graph: self.graph.clone(),
            decoder: self.decoder.clone(),
            connector: self.connector.clone(),
            config: self.config.clone(),
        };

        // Hold the id slot across the spawn so the new thread cannot
        // re-enter before it is recognized.
        let mut session_thread = lock(&self.session_thread);
        let handle = match thread::Builder::new()
            .name("stream-session".to_string())
            .spawn(move || runner.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                let error = format!("Failed to spawn session thread: {}", e);
                *lock(&self.state) = PlayerState {
                    error: Some(error.clone()),
                    ..PlayerState::idle(token)
                };
                return Err(PlayerError::Audio(error));
            }
        };
        *session_thread = Some(handle.thread().id());
        drop(session_thread);

        lifecycle.current = Some(ActiveSession {
            state: session,
            pump_task: Some(handle),
        });
        Ok(token)
    }

    /// Stop the current session, if any. Returns once its thread has
    /// exited. Cancelling with nothing playing is a no-op.
    pub fn cancel(&self) -> Result<()> {
        self.check_caller("cancel")?;
        let mut lifecycle = lock(&self.lifecycle);
        self.cancel_locked(&mut lifecycle)
    }

    fn cancel_locked(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let Some(mut active) = lifecycle.current.take() else {
            return Ok(());
        };
        let session = active.state.clone();
        let token = session.token();

        session.request_cancel();
        let stopped = session.stop_buffers();
        session.cancel_reader();
        let aborted = session.invoke_abort();
        if let Some(element) = session.take_element() {
            element.pause();
            element.detach();
        }

        {
            let mut state = lock(&self.state);
            if state.token == token {
                *state = PlayerState::idle(token);
                self.events.emit(PlayerEvent::SessionCancelled { token });
            }
        }

        let joined = active.pump_task.take().map(JoinHandle::join);
        *lock(&self.session_thread) = None;
        debug!(token, stopped, aborted, "Session cancelled");

        match joined {
            Some(Err(_)) => Err(PlayerError::Contract(format!(
                "session {} thread panicked before draining",
                token
            ))),
            _ => Ok(()),
        }
    }

    fn check_caller(&self, op: &str) -> Result<()> {
        let session_thread = *lock(&self.session_thread);
        if session_thread == Some(thread::current().id()) {
            warn!(op, "Refused call from the session thread");
            return Err(PlayerError::Contract(format!(
                "{} called from the session's own thread",
                op
            )));
        }
        Ok(())
    }

    /// Copy of the observable state
    pub fn snapshot(&self) -> PlayerState {
        lock(&self.state).clone()
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Resources of the current session, if one is running
    pub fn current_session(&self) -> Option<Arc<SessionState>> {
        lock(&self.lifecycle)
            .current
            .as_ref()
            .map(|active| active.state.clone())
    }

    /// Set the output volume (clamped to 0.0 - 1.0). Returns the value applied.
    pub fn set_volume(&self, volume: f32) -> f32 {
        self.graph.set_gain(volume);
        let applied = self.graph.gain();
        info!(volume = applied, "Volume set");
        applied
    }

    pub fn volume(&self) -> f32 {
        self.graph.gain()
    }

    pub fn analysis(&self) -> SharedAnalysis {
        self.graph.analysis()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Cancel any session and release the controller
    pub fn shutdown(self) -> Result<()> {
        self.cancel()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            warn!(error = %e, "Session shutdown failed");
        }
    }
}
