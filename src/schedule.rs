//! Time-driven scheduling on the tokio runtime.
//!
//! Provides "run once after a delay" and "run every period", each cancelable
//! through a [`TaskHandle`].

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;

use crate::timer::TimerError;

/// Scheduling facility bound to a tokio runtime.
#[derive(Debug, Clone)]
pub struct Schedule {
    runtime: Handle,
}

impl Schedule {
    /// Bind to the runtime the caller is running in.
    pub fn current() -> Result<Self, TimerError> {
        let runtime = Handle::try_current().map_err(|_| TimerError::NoRuntime)?;
        Ok(Self { runtime })
    }

    /// Bind to an explicit runtime handle.
    pub fn with_handle(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Run `task` once after `delay`.
    pub fn once<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let join = self.runtime.spawn(async move {
            time::sleep(delay).await;
            task();
        });

        TaskHandle::new(join.abort_handle())
    }

    /// Run `task` every `period`, starting one period from now.
    ///
    /// The task stops itself by returning `ControlFlow::Break`.
    pub fn every<F>(&self, period: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let join = self.runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if task().is_break() {
                    trace!("Recurring task stopped itself");
                    break;
                }
            }
        });

        TaskHandle::new(join.abort_handle())
    }
}

/// Handle to a scheduled task.
///
/// Dropping the handle detaches the task; only [`TaskHandle::cancel`] stops it.
#[derive(Debug)]
pub struct TaskHandle {
    abort: AbortHandle,
}

impl TaskHandle {
    fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    /// Prevent any future run of the task. Safe to call more than once.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Returns true once the task has completed or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}
