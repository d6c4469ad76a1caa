//! Repeating timer with one-shot acceleration.
//!
//! [`AdaptiveScheduler`] drives a callback from a single tokio task. The
//! next firing instant is the only piece of timing state; [`Reschedule`]
//! overwrites it and wakes the task, so the latest request always wins and
//! two firings can never overlap. After each firing the next instant is reset
//! to the normal interval before the callback runs, which lets the callback
//! itself ask for an earlier follow-up.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

/// Errors raised by the scheduler.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SchedulerError {
    /// Raised when `start` is called twice.
    #[error("scheduler already started")]
    AlreadyStarted,
}

/// Requests an earlier firing of the reconciliation timer.
pub trait Reschedule: Send + Sync {
    /// Moves the next firing to `now + delay`. The normal interval applies
    /// again afterwards.
    fn reschedule(&self, delay: Duration);
}

#[derive(Debug, Default)]
struct Timing {
    next_fire: Option<Instant>,
    normal_interval: Duration,
    started: bool,
    stopping: bool,
}

#[derive(Debug, Default)]
struct Shared {
    timing: Mutex<Timing>,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Single repeating timer whose next firing can be pulled forward.
#[derive(Clone, Debug, Default)]
pub struct AdaptiveScheduler {
    shared: Arc<Shared>,
}

impl AdaptiveScheduler {
    /// Creates a scheduler that has not started firing yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts invoking `on_fire` after `initial_delay` and then every
    /// `normal_interval`. Each invocation is awaited before the next one is
    /// considered.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyStarted`] when the scheduler is
    /// already running or has been stopped.
    pub fn start<F, Fut>(
        &self,
        initial_delay: Duration,
        normal_interval: Duration,
        on_fire: F,
    ) -> Result<(), SchedulerError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        {
            let mut timing = lock(&self.shared.timing);
            if timing.started {
                return Err(SchedulerError::AlreadyStarted);
            }
            timing.started = true;
            timing.normal_interval = normal_interval;
            timing.next_fire = Some(Instant::now() + initial_delay);
        }

        let task = tokio::spawn(run(Arc::clone(&self.shared), on_fire));
        *lock(&self.shared.task) = Some(task);
        debug!(?initial_delay, ?normal_interval, "scheduler started");
        Ok(())
    }

    /// Time remaining until the next firing, if one is pending.
    #[must_use]
    pub fn next_fire_in(&self) -> Option<Duration> {
        lock(&self.shared.timing)
            .next_fire
            .map(|next| next.saturating_duration_since(Instant::now()))
    }

    /// Stops the timer. No further firings happen; a firing already in
    /// progress is allowed to finish before this returns.
    pub async fn stop(&self) {
        {
            let mut timing = lock(&self.shared.timing);
            timing.stopping = true;
            timing.next_fire = None;
        }
        self.shared.wake.notify_one();

        let handle = lock(&self.shared.task).take();
        if let Some(task) = handle
            && let Err(err) = task.await
        {
            warn!(error = %err, "scheduler task ended abnormally");
        }
        debug!("scheduler stopped");
    }
}

impl Reschedule for AdaptiveScheduler {
    fn reschedule(&self, delay: Duration) {
        {
            let mut timing = lock(&self.shared.timing);
            if !timing.started || timing.stopping {
                debug!(?delay, "scheduler is not running; reschedule ignored");
                return;
            }
            timing.next_fire = Some(Instant::now() + delay);
        }
        debug!(?delay, "next reconciliation rescheduled");
        self.shared.wake.notify_one();
    }
}

async fn run<F, Fut>(shared: Arc<Shared>, mut on_fire: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let next_fire = {
            let timing = lock(&shared.timing);
            if timing.stopping {
                break;
            }
            timing.next_fire
        };

        let Some(deadline) = next_fire else {
            shared.wake.notified().await;
            continue;
        };

        tokio::select! {
            () = sleep_until(deadline) => {}
            () = shared.wake.notified() => continue,
        }

        let due = {
            let mut timing = lock(&shared.timing);
            let now = Instant::now();
            if timing.stopping {
                break;
            }
            let due = timing.next_fire.is_some_and(|next| next <= now);
            if due {
                timing.next_fire = Some(now + timing.normal_interval);
            }
            due
        };

        if due {
            on_fire().await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
