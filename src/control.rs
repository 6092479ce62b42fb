//! Run flag and wakeup primitives shared by the background tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Process-wide "keep running" flag.
///
/// Long sleeps go through [`RunFlag::sleep`] so shutdown interrupts them.
#[derive(Clone, Default)]
pub struct RunFlag {
    inner: Arc<RunFlagInner>,
}

#[derive(Default)]
struct RunFlagInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    /// Requests shutdown and wakes every sleeper.
    pub fn shutdown(&self) {
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            info!("Shutdown requested");
        }
        self.inner.notify.notify_waiters();
    }

    /// Sleeps for `duration`. Returns false if interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = notified => false,
        }
    }

    /// Resolves once shutdown was requested.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

/// Why a periodic task woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Timer,
    Triggered,
    Shutdown,
}

/// Outcome of an on-demand trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Scheduled,
    AlreadyRunning,
}

/// On-demand wakeup for a periodic task (housekeeper, config reload).
///
/// A trigger that arrives while the task is busy is rejected, not queued.
pub struct Wakeup {
    name: &'static str,
    notify: Notify,
    busy: AtomicBool,
}

impl Wakeup {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            notify: Notify::new(),
            busy: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn trigger(&self) -> TriggerOutcome {
        if self.busy.load(Ordering::Acquire) {
            warn!("{} is already running, request ignored", self.name);
            return TriggerOutcome::AlreadyRunning;
        }
        info!("Forced execution of {}", self.name);
        self.notify.notify_one();
        TriggerOutcome::Scheduled
    }

    /// Waits for the timer, a trigger or shutdown. `None` waits without a timer.
    pub async fn wait(&self, run: &RunFlag, period: Option<Duration>) -> WakeReason {
        if !run.is_running() {
            return WakeReason::Shutdown;
        }
        let timer = async {
            match period {
                Some(p) => tokio::time::sleep(p).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = timer => WakeReason::Timer,
            _ = self.notify.notified() => WakeReason::Triggered,
            _ = run.stopped() => WakeReason::Shutdown,
        }
    }

    /// Marks the task busy until the guard is dropped.
    pub fn busy(&self) -> BusyGuard<'_> {
        self.busy.store(true, Ordering::Release);
        BusyGuard { wakeup: self }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

pub struct BusyGuard<'a> {
    wakeup: &'a Wakeup,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.wakeup.busy.store(false, Ordering::Release);
    }
}
