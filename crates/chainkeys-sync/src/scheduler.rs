//! Periodic scheduling of update passes.
//!
//! - [`PassGuard`] keeps passes from overlapping: a tick that finds a pass
//!   still running is skipped, not queued.
//! - [`Watchdog`] terminates the process when no pass has succeeded within
//!   its deadline; a supervisor is expected to restart it.
//! - [`SyncScheduler`] ties both to a fixed interval.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use chainkeys_core::config::SyncConfig;
use chainkeys_core::error::{Result, SyncError};

/// A unit of periodic work.
#[async_trait]
pub trait Tickable: Send + Sync {
    /// Name used in log fields.
    fn name(&self) -> &str;

    async fn tick(&self) -> Result<()>;
}

// ─── PassGuard ────────────────────────────────────────────────────────────────

/// Non-blocking mutual exclusion for one concurrent pass.
#[derive(Debug, Default)]
pub struct PassGuard {
    busy: AtomicBool,
}

impl PassGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard, or `None` if a pass is already running.
    pub fn try_enter(&self) -> Option<PassPermit<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassPermit { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the duration of a pass; releases the guard on drop.
#[derive(Debug)]
pub struct PassPermit<'a> {
    guard: &'a PassGuard,
}

impl Drop for PassPermit<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

// ─── Watchdog ─────────────────────────────────────────────────────────────────

pub type ExpireHook = Arc<dyn Fn() + Send + Sync>;
pub type FatalHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

fn exit_on_expire() -> ExpireHook {
    Arc::new(|| {
        error!("no successful pass within the watchdog deadline, exiting");
        std::process::exit(1);
    })
}

fn exit_on_fatal() -> FatalHook {
    Arc::new(|e: &SyncError| {
        error!(error = %e, "fatal synchronization error, exiting");
        std::process::exit(1);
    })
}

/// Deadline timer armed at the start of a pass and disarmed on success.
pub struct Watchdog {
    timeout: Duration,
    on_expire: ExpireHook,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// A watchdog that exits the process on expiry.
    pub fn new(timeout: Duration) -> Self {
        Self::with_hook(timeout, exit_on_expire())
    }

    pub fn with_hook(timeout: Duration, on_expire: ExpireHook) -> Self {
        Self {
            timeout,
            on_expire,
            timer: Mutex::new(None),
        }
    }

    /// Start the deadline unless one is already running.
    ///
    /// A failing pass leaves the timer armed, so consecutive failures are
    /// measured from the first one.
    pub fn arm(&self) {
        let mut timer = self.timer.lock().unwrap();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let timeout = self.timeout;
        let hook = Arc::clone(&self.on_expire);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            hook();
        }));
    }

    pub fn disarm(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

// ─── SyncScheduler ────────────────────────────────────────────────────────────

/// Outcome of one scheduled tick.
#[derive(Debug)]
pub enum TickResult {
    Completed,
    /// A previous pass was still running.
    Skipped,
    Failed(SyncError),
}

/// Runs a [`Tickable`] immediately and then on every interval.
pub struct SyncScheduler<T> {
    task: T,
    interval: Duration,
    guard: PassGuard,
    watchdog: Watchdog,
    on_fatal: FatalHook,
}

impl<T: Tickable + 'static> SyncScheduler<T> {
    pub fn new(task: T, interval: Duration, watchdog_timeout: Duration) -> Self {
        Self {
            task,
            interval,
            guard: PassGuard::new(),
            watchdog: Watchdog::new(watchdog_timeout),
            on_fatal: exit_on_fatal(),
        }
    }

    /// Interval and watchdog deadline taken from `config`.
    pub fn from_config(task: T, config: &SyncConfig) -> Self {
        Self::new(task, config.poll_interval(), config.watchdog_timeout())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_fatal_hook(mut self, on_fatal: FatalHook) -> Self {
        self.on_fatal = on_fatal;
        self
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Run one guarded pass.
    pub async fn tick(&self) -> TickResult {
        let Some(_permit) = self.guard.try_enter() else {
            warn!(task = self.task.name(), "previous pass still running, skipping tick");
            return TickResult::Skipped;
        };

        self.watchdog.arm();
        match self.task.tick().await {
            Ok(()) => {
                self.watchdog.disarm();
                TickResult::Completed
            }
            Err(e) => {
                error!(task = self.task.name(), error = %e, "pass failed");
                if e.is_fatal() {
                    (self.on_fatal)(&e);
                }
                TickResult::Failed(e)
            }
        }
    }

    /// Tick now and then every interval until `shutdown` resolves.
    ///
    /// Each tick runs on its own task, so a slow pass makes later ticks skip
    /// rather than pile up.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            task = self.task.name(),
            interval_ms = self.interval.as_millis() as u64,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.tick().await;
                    });
                }
            }
        }

        self.watchdog.disarm();
        info!(task = self.task.name(), "scheduler stopped");
    }
}
