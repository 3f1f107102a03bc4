//! Play sessions
//!
//! The controller owns at most one session at a time. A session connects,
//! pumps chunks through the decoder into the scheduler (or attaches the
//! stream as a self-timed element), and publishes tags, titles, and format
//! metadata under its token.

pub mod controller;
pub mod events;
pub mod pump;
mod runner;
pub mod scheduler;
pub mod state;

pub use controller::SessionController;
pub use events::{EventBus, PlayerEvent};
pub use pump::{DecodePump, PumpExit, PumpReport};
pub use scheduler::{PlaybackScheduler, ScheduleOutcome};
pub use state::{PlayerState, Publisher, SessionState, SessionStatus};
