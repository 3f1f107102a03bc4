//! Cancellation primitives
//!
//! `CancelToken` is a shared stop flag with a wake channel: cancelling drops
//! the only sender, so every thread blocked in a `select!` on `wake()`
//! resolves at once. `AbortHandle` is the one-shot network abort built on it.
//! `Worker` is a named thread whose join can be bounded.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

struct CancelInner {
    flag: AtomicBool,
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

/// Cooperative cancellation flag shared between an owner and its workers.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                wake_tx: Mutex::new(Some(wake_tx)),
                wake_rx,
            }),
        }
    }

    /// Request cancellation. Returns true only for the call that flipped it.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.flag.swap(true, Ordering::SeqCst);
        // Dropping the sender disconnects every `wake()` receiver
        self.inner
            .wake_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) once cancelled.
    /// Never carries a message; use it as a `select!` arm.
    pub fn wake(&self) -> &Receiver<()> {
        &self.inner.wake_rx
    }
}

/// Handle that aborts an in-flight network connection.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    token: CancelToken,
    invocations: Arc<AtomicU32>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// How many times `abort()` has been called on any clone of this handle
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// A named background thread that can be joined with a time bound.
///
/// The thread holds the sender half of `done`; its receiver disconnects
/// when the thread exits, however it exits.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Worker {
    pub fn spawn<F>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = bounded::<()>(0);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _done = done_tx;
            f();
        })?;
        Ok(Self {
            name: name.to_string(),
            handle,
            done,
        })
    }

    /// Join if the thread exits within `bound`. Otherwise it is left
    /// detached and false is returned.
    pub fn join_within(self, bound: Duration) -> bool {
        match self.done.recv_timeout(bound) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if self.handle.join().is_err() {
                    debug!(thread = %self.name, "worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(
                    thread = %self.name,
                    bound_ms = bound.as_millis() as u64,
                    "worker still running, detaching"
                );
                false
            }
        }
    }
}
