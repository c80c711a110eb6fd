//! Activity-based idle timer.
//!
//! The timer fires its callback once no activity has been observed for
//! `timeout`. Activity is recorded cheaply by [`IdleTimer::touch`] and committed
//! by a sampler running every `interval`, so the callback fires between
//! `timeout` and `timeout + interval` after the last activity, never earlier.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::schedule::{Schedule, TaskHandle};

/// Timeout handler, called with the idle duration that triggered it.
type TimeoutHandler = Box<dyn FnOnce(Duration) + Send + 'static>;

/// Errors raised by the idle timer.
#[derive(Error, Debug)]
pub enum TimerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Timer has already been destroyed")]
    AlreadyDestroyed,

    #[error("No tokio runtime available to schedule timer tasks")]
    NoRuntime,
}

/// Check that `interval` can be scheduled and does not exceed `timeout`.
pub(crate) fn check_periods(interval: Duration, timeout: Duration) -> Result<(), TimerError> {
    if interval.is_zero() {
        return Err(TimerError::InvalidConfiguration(
            "timer interval must be greater than zero".to_string(),
        ));
    }

    if interval > timeout {
        return Err(TimerError::InvalidConfiguration(format!(
            "timer interval ({}ms) exceeds timeout ({}ms)",
            interval.as_millis(),
            timeout.as_millis()
        )));
    }

    Ok(())
}

/// Idle timer handle.
///
/// Dropping the handle destroys the timer.
#[must_use = "dropping an IdleTimer destroys it"]
pub struct IdleTimer {
    shared: Arc<Shared>,
}

/// State shared between the handle and the scheduled tasks.
struct Shared {
    interval: Duration,
    timeout: Duration,
    schedule: Schedule,
    state: Mutex<State>,
}

/// Mutable timer state.
struct State {
    /// Most recently committed activity.
    last_activity: Instant,

    /// Set by `touch`, cleared when the sampler commits it.
    had_activity: bool,

    destroyed: bool,

    on_timeout: Option<TimeoutHandler>,

    /// Recurring sampler.
    sampler: Option<TaskHandle>,

    /// Pending deadline check. At most one exists at any time.
    deadline: Option<TaskHandle>,
}

impl State {
    /// Commit pending activity to `last_activity`.
    fn sample(&mut self) {
        if self.had_activity {
            self.last_activity = Instant::now();
            self.had_activity = false;
            trace!("Activity committed");
        }
    }

    /// Release both scheduled tasks and enter the terminal state.
    fn teardown(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.cancel();
        }
        if let Some(deadline) = self.deadline.take() {
            deadline.cancel();
        }
        if !self.destroyed {
            debug!("Idle timer destroyed");
        }
        self.destroyed = true;
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_interval(&self) -> ControlFlow<()> {
        let mut state = self.lock();
        if state.destroyed {
            return ControlFlow::Break(());
        }
        state.sample();
        ControlFlow::Continue(())
    }

    fn on_deadline(self: Arc<Self>) {
        let (handler, elapsed) = {
            let mut state = self.lock();

            // Destroyed while this check was in flight
            if state.destroyed {
                return;
            }

            // Fold in activity seen since the last sample before judging.
            state.sample();
            let elapsed = state.last_activity.elapsed();

            // Activity moved the real deadline out - check again then
            if elapsed < self.timeout {
                let remaining = self.timeout - elapsed;
                debug!(
                    "Activity {:?} ago, rechecking deadline in {:?}",
                    elapsed, remaining
                );
                // The replaced handle belongs to the task running right now.
                state.deadline = Some(self.arm_deadline(remaining));
                return;
            }

            // Idle long enough - tear down before the handler runs
            state.teardown();
            (state.on_timeout.take(), elapsed)
        };

        info!("Idle timeout reached after {:?}", elapsed);
        if let Some(handler) = handler {
            handler(elapsed);
        }
    }

    fn arm_deadline(self: &Arc<Self>, delay: Duration) -> TaskHandle {
        let shared = Arc::downgrade(self);
        self.schedule.once(delay, move || {
            if let Some(shared) = shared.upgrade() {
                shared.on_deadline();
            }
        })
    }

    fn start_sampler(self: &Arc<Self>) -> TaskHandle {
        let shared: Weak<Self> = Arc::downgrade(self);
        self.schedule.every(self.interval, move || match shared.upgrade() {
            Some(shared) => shared.on_interval(),
            None => ControlFlow::Break(()),
        })
    }
}

impl IdleTimer {
    /// Start configuring a new timer.
    #[must_use]
    pub fn builder() -> IdleTimerBuilder {
        IdleTimerBuilder::new()
    }

    /// Create and start a timer from `config`.
    pub fn create<F>(on_timeout: F, config: &Config) -> Result<Self, TimerError>
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        Self::builder().config(config).on_timeout(on_timeout).start()
    }

    /// Interval between activity samples.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Inactivity allowed before the timer fires.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    /// Returns true once the timer was destroyed or has fired.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// Record activity since the last sample.
    pub fn touch(&self) -> Result<(), TimerError> {
        let mut state = self.shared.lock();

        // Lifecycle bug on the caller's side
        if state.destroyed {
            return Err(TimerError::AlreadyDestroyed);
        }
        state.had_activity = true;
        Ok(())
    }

    /// Stop the timer. Safe to call any number of times, including after it fired.
    pub fn destroy(&self) {
        let handler = {
            let mut state = self.shared.lock();
            state.teardown();
            state.on_timeout.take()
        };
        // Dropped unlocked: the handler may own timers of its own.
        drop(handler);
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for IdleTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTimer")
            .field("interval", &self.shared.interval)
            .field("timeout", &self.shared.timeout)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Builder for [`IdleTimer`].
pub struct IdleTimerBuilder {
    interval: Duration,
    timeout: Duration,
    on_timeout: Option<TimeoutHandler>,
    schedule: Option<Schedule>,
}

impl IdleTimerBuilder {
    fn new() -> Self {
        let defaults = Config::default();
        Self {
            interval: defaults.interval(),
            timeout: defaults.timeout(),
            on_timeout: None,
            schedule: None,
        }
    }

    /// Take interval and timeout from `config`.
    #[must_use]
    pub fn config(mut self, config: &Config) -> Self {
        self.interval = config.interval();
        self.timeout = config.timeout();
        self
    }

    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the handler invoked once the idle timeout is reached.
    #[must_use]
    pub fn on_timeout<F>(mut self, on_timeout: F) -> Self
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        self.on_timeout = Some(Box::new(on_timeout));
        self
    }

    /// Schedule on a specific runtime instead of the current one.
    #[must_use]
    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Validate and start the timer.
    ///
    /// Both the sampler and the first deadline check are scheduled immediately.
    pub fn start(self) -> Result<IdleTimer, TimerError> {
        let Some(on_timeout) = self.on_timeout else {
            return Err(TimerError::InvalidArgument(
                "timer timeout handler is not set".to_string(),
            ));
        };

        check_periods(self.interval, self.timeout)?;

        // Validated - bind to a runtime
        let schedule = match self.schedule {
            Some(schedule) => schedule,
            None => Schedule::current()?,
        };

        let shared = Arc::new(Shared {
            interval: self.interval,
            timeout: self.timeout,
            schedule,
            state: Mutex::new(State {
                last_activity: Instant::now(),
                had_activity: false,
                destroyed: false,
                on_timeout: Some(on_timeout),
                sampler: None,
                deadline: None,
            }),
        });

        {
            // Scheduled tasks lock the state, so they observe both handles.
            let mut state = shared.lock();
            state.sampler = Some(shared.start_sampler());
            state.deadline = Some(shared.arm_deadline(shared.timeout));
        }

        debug!(
            "Idle timer started (interval={:?}, timeout={:?})",
            shared.interval, shared.timeout
        );

        Ok(IdleTimer { shared })
    }
}
