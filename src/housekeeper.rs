//! Housekeeper: bounded deletion of expired proxy rows.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use crate::control::{RunFlag, WakeReason, Wakeup};
use crate::error::{ProxyError, Result};
use crate::history::Timespec;
use crate::stats::PipelineStats;
use crate::store::{PurgeWindow, Store, Stream};

/// Retention periods one pass may delete per table.
pub const HK_MAX_DELETE_PERIODS: i64 = 4;

/// Delay before the first timed pass after start-up.
const STARTUP_DELAY: Duration = Duration::from_secs(30 * 60);

/// Period used to cap deletes when only on-demand runs are configured.
const ON_DEMAND_PERIOD_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct HousekeeperSettings {
    /// Zero disables the timer; passes then only run on demand.
    pub frequency: Duration,
    pub local_buffer_secs: i64,
    pub offline_buffer_secs: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HousekeeperReport {
    pub history: usize,
    pub discovery: usize,
    pub autoregistration: usize,
    pub tasks: usize,
    pub duration_secs: f64,
}

impl HousekeeperReport {
    pub fn total(&self) -> usize {
        self.history + self.discovery + self.autoregistration + self.tasks
    }
}

#[derive(Clone)]
pub struct Housekeeper {
    store: Arc<Store>,
    stats: Arc<PipelineStats>,
    settings: HousekeeperSettings,
    wakeup: Arc<Wakeup>,
}

impl Housekeeper {
    pub fn new(
        store: Arc<Store>,
        stats: Arc<PipelineStats>,
        settings: HousekeeperSettings,
        wakeup: Arc<Wakeup>,
    ) -> Self {
        Self {
            store,
            stats,
            settings,
            wakeup,
        }
    }

    fn period_secs(&self) -> i64 {
        match self.settings.frequency.as_secs() {
            0 => ON_DEMAND_PERIOD_SECS,
            secs => secs as i64,
        }
    }

    /// Deletes expired rows from every stream table and old finished tasks.
    ///
    /// The pass runs in one transaction; a failure on any table leaves
    /// every table untouched.
    #[instrument(level = "debug", skip(self))]
    pub fn purge_pass(&self, now: i64) -> Result<HousekeeperReport> {
        let started = Instant::now();
        let window = PurgeWindow {
            now,
            offline_buffer_secs: self.settings.offline_buffer_secs,
            local_buffer_secs: self.settings.local_buffer_secs,
            period_secs: self.period_secs(),
            max_periods: HK_MAX_DELETE_PERIODS,
        };

        let summary = self
            .store
            .purge_all(&window, now - self.settings.offline_buffer_secs)?;
        let report = HousekeeperReport {
            history: summary.deleted(Stream::History),
            discovery: summary.deleted(Stream::Discovery),
            autoregistration: summary.deleted(Stream::AutoRegistration),
            tasks: summary.tasks,
            duration_secs: started.elapsed().as_secs_f64(),
        };

        PipelineStats::add(&self.stats.housekeeper_passes, 1);
        PipelineStats::add(&self.stats.housekeeper_deleted, report.total() as u64);
        self.stats
            .housekeeper_duration_seconds
            .add_sample(report.duration_secs);
        Ok(report)
    }

    pub async fn run(self, run: RunFlag) {
        let timer = (!self.settings.frequency.is_zero()).then_some(self.settings.frequency);
        match timer {
            Some(f) => info!("Housekeeper started, every {}s", f.as_secs()),
            None => info!("Housekeeper started, on-demand only"),
        }

        let mut next_wait = timer.map(|f| f.min(STARTUP_DELAY));
        loop {
            match self.wakeup.wait(&run, next_wait).await {
                WakeReason::Shutdown => break,
                WakeReason::Timer | WakeReason::Triggered => {}
            }
            next_wait = timer;

            let _busy = self.wakeup.busy();
            info!("Executing housekeeper");
            let hk = self.clone();
            let now = Timespec::now().sec;
            let result = tokio::task::spawn_blocking(move || hk.purge_pass(now))
                .await
                .unwrap_or_else(|e| Err(ProxyError::Storage(format!("housekeeping pass aborted: {}", e))));
            match result {
                Ok(report) => info!(
                    "Housekeeper deleted {} records (history {}, discovery {}, autoregistration {}, tasks {}) in {:.6}s",
                    report.total(),
                    report.history,
                    report.discovery,
                    report.autoregistration,
                    report.tasks,
                    report.duration_secs
                ),
                Err(e) if e.is_retryable() => warn!("Housekeeping failed: {}", e),
                Err(e) => error!("Housekeeping failed: {}", e),
            }
        }
        info!("Housekeeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::TriggerOutcome;
    use crate::history::{HistoryValue, Value};

    const HOUR: i64 = 3600;

    fn housekeeper(store: Arc<Store>, local_hours: i64, offline_hours: i64) -> Housekeeper {
        Housekeeper::new(
            store,
            Arc::new(PipelineStats::default()),
            HousekeeperSettings {
                frequency: Duration::from_secs(HOUR as u64),
                local_buffer_secs: local_hours * HOUR,
                offline_buffer_secs: offline_hours * HOUR,
            },
            Arc::new(Wakeup::new("housekeeper")),
        )
    }

    fn seed(store: &Store, clocks: impl Iterator<Item = i64>) {
        let values: Vec<HistoryValue> = clocks
            .map(|c| HistoryValue::new(1, Timespec::new(c, 0), Value::Uint(1)))
            .collect();
        store.insert_history(&values).unwrap();
    }

    #[test]
    fn test_empty_tables_are_noop() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let report = housekeeper(store, 0, 1).purge_pass(100_000).unwrap();
        assert_eq!(report.total(), 0);
    }

    #[test]
    fn test_unacknowledged_rows_kept_until_offline_buffer() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = 100 * HOUR;
        // One row per hour over the last 10 hours, plus one fresh row.
        seed(&store, (0..10).map(|h| now - (10 - h) * HOUR));
        seed(&store, std::iter::once(now));

        // Nothing acknowledged: only rows older than 6h go.
        let hk = housekeeper(store.clone(), 0, 6);
        let report = hk.purge_pass(now).unwrap();
        assert_eq!(report.history, 4);

        // Acknowledged rows go once past the local buffer, four periods
        // per pass.
        store.commit_delivery(&[(Stream::History, 11)], &[]).unwrap();
        assert_eq!(hk.purge_pass(now).unwrap().history, 4);
        assert_eq!(hk.purge_pass(now).unwrap().history, 2);
        // The row holding the max id always survives.
        assert_eq!(store.row_count(Stream::History).unwrap(), 1);
    }

    #[test]
    fn test_pass_deletes_at_most_four_periods() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let start = 1_000 * HOUR;
        let periods = 10 * HK_MAX_DELETE_PERIODS;
        seed(&store, (0..periods).map(|h| start + h * HOUR));
        let now = start + 1_000 * HOUR;
        seed(&store, std::iter::once(now));

        let hk = housekeeper(store.clone(), 0, 1);
        let first = hk.purge_pass(now).unwrap();
        assert_eq!(first.history, HK_MAX_DELETE_PERIODS as usize);

        let mut passes = 1;
        while hk.purge_pass(now).unwrap().history > 0 {
            passes += 1;
        }
        assert_eq!(passes, 10);
        assert_eq!(store.row_count(Stream::History).unwrap(), 1);
    }

    #[test]
    fn test_failed_pass_deletes_nothing() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = 100 * HOUR;
        seed(&store, (0..10).map(|h| now - (10 - h) * HOUR));
        seed(&store, std::iter::once(now));
        store.commit_delivery(&[(Stream::History, 11)], &[]).unwrap();
        store.with_connection(|conn| {
            conn.execute_batch("ALTER TABLE proxy_dhistory RENAME TO proxy_dhistory_old")
                .unwrap()
        });

        let hk = housekeeper(store.clone(), 0, 1);
        assert!(hk.purge_pass(now).is_err());
        assert_eq!(store.row_count(Stream::History).unwrap(), 11);
    }

    #[test]
    fn test_finished_tasks_purged() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = 100 * HOUR;
        let old = store
            .insert_task(crate::protocol::TaskType::CheckNow, None, now - 10 * HOUR, 0, "")
            .unwrap();
        store.commit_delivery(&[], &[old]).unwrap();
        store
            .insert_task(crate::protocol::TaskType::CheckNow, None, now - 10 * HOUR, 0, "")
            .unwrap();

        let report = housekeeper(store, 0, 1).purge_pass(now).unwrap();
        assert_eq!(report.tasks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_run_and_busy_rejection() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let wakeup = Arc::new(Wakeup::new("housekeeper"));
        let stats = Arc::new(PipelineStats::default());
        let hk = Housekeeper::new(
            store,
            stats.clone(),
            HousekeeperSettings {
                frequency: Duration::ZERO,
                local_buffer_secs: 0,
                offline_buffer_secs: HOUR,
            },
            wakeup.clone(),
        );
        let run = RunFlag::new();
        let task = tokio::spawn(hk.run(run.clone()));
        tokio::task::yield_now().await;

        assert_eq!(wakeup.trigger(), TriggerOutcome::Scheduled);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stats.snapshot().housekeeper_passes, 1);

        {
            let _busy = wakeup.busy();
            assert_eq!(wakeup.trigger(), TriggerOutcome::AlreadyRunning);
        }

        run.shutdown();
        task.await.unwrap();
        assert_eq!(stats.snapshot().housekeeper_passes, 1);
    }
}
