//! idle-timer - activity-based idle timeout detection.
//!
//! An [`IdleTimer`] fires its handler once no activity has been reported via
//! [`IdleTimer::touch`] for the configured timeout. Activity is sampled every
//! interval, so the handler fires at most one interval late and never early.

pub mod config;
pub mod schedule;
pub mod timer;

use std::time::Duration;

pub use crate::config::Config;
pub use crate::schedule::{Schedule, TaskHandle};
pub use crate::timer::{IdleTimer, IdleTimerBuilder, TimerError};

/// Create and start an idle timer on the current tokio runtime.
pub fn create<F>(on_timeout: F, config: &Config) -> Result<IdleTimer, TimerError>
where
    F: FnOnce(Duration) + Send + 'static,
{
    IdleTimer::create(on_timeout, config)
}
