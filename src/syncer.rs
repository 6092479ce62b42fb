//! History syncer: drains the write buffer into the database and the value
//! cache in bounded passes.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::configcache::ConfigCache;
use crate::control::RunFlag;
use crate::error::Result;
use crate::history::Timespec;
use crate::stats::PipelineStats;
use crate::store::Store;
use crate::valuecache::ValueCache;
use crate::writebuffer::WriteBuffer;

/// Spacing of "syncing history data" progress lines during the final flush.
const FLUSH_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Value cache entries not read for this long are dropped.
const VALUE_CACHE_IDLE_SECS: i64 = 24 * 60 * 60;

/// How often idle value cache entries are looked for.
const IDLE_CHECK_INTERVAL_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub values_synced: usize,
    pub triggers_affected: usize,
    pub more_pending: bool,
}

/// Schedule of time-based trigger re-evaluations.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(i64, u64)>>,
    periods: HashMap<u64, u64>,
    revision: u64,
}

impl TimerQueue {
    /// Rebuilds the schedule from `(triggerid, period_secs)` pairs.
    pub fn load(&mut self, timers: &[(u64, u64)], now: i64, revision: u64) {
        self.heap.clear();
        self.periods.clear();
        for &(triggerid, period) in timers {
            if period == 0 {
                continue;
            }
            self.periods.insert(triggerid, period);
            self.heap.push(Reverse((next_check(now, period), triggerid)));
        }
        self.revision = revision;
    }

    /// Pops every timer due at `now` and schedules its next run.
    pub fn pop_due(&mut self, now: i64) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some(Reverse((at, triggerid))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            due.push(triggerid);
            if let Some(&period) = self.periods.get(&triggerid) {
                self.heap.push(Reverse((next_check(now, period), triggerid)));
            }
        }
        due
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.periods.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// Next multiple of `period` strictly after `now`.
fn next_check(now: i64, period: u64) -> i64 {
    let period = period as i64;
    now - now.rem_euclid(period) + period
}

pub struct HistorySyncer {
    buffer: WriteBuffer,
    store: Arc<Store>,
    cache: ValueCache,
    config: Arc<ConfigCache>,
    stats: Arc<PipelineStats>,
    batch_size: usize,
    timers: TimerQueue,
    accepting_timers: bool,
    last_idle_check: i64,
}

impl HistorySyncer {
    pub fn new(
        buffer: WriteBuffer,
        store: Arc<Store>,
        cache: ValueCache,
        config: Arc<ConfigCache>,
        stats: Arc<PipelineStats>,
        batch_size: usize,
    ) -> Self {
        Self {
            buffer,
            store,
            cache,
            config,
            stats,
            batch_size: batch_size.max(1),
            timers: TimerQueue::default(),
            accepting_timers: true,
            last_idle_check: 0,
        }
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    /// Syncs up to one batch.
    ///
    /// Values are written to the database first; a failure puts the batch
    /// back at the head of the buffer and fails the pass.
    #[instrument(level = "debug", skip(self))]
    pub fn sync_pass(&mut self, now: i64) -> Result<SyncOutcome> {
        let started = Instant::now();
        let mut triggers: HashSet<u64> = HashSet::new();

        if self.accepting_timers {
            let revision = self.config.revision();
            if revision != self.timers.revision() {
                self.timers.load(&self.config.timer_triggers(), now, revision);
            }
            triggers.extend(self.timers.pop_due(now));
        }

        let batch = self.buffer.take(self.batch_size);
        if batch.is_empty() {
            return Ok(SyncOutcome {
                values_synced: 0,
                triggers_affected: triggers.len(),
                more_pending: false,
            });
        }

        PipelineStats::add(&self.stats.sync_passes, 1);
        if let Err(e) = self.store.insert_history(&batch) {
            PipelineStats::add(&self.stats.sync_failures, 1);
            warn!("Cannot write {} history values: {}", batch.len(), e);
            self.buffer.requeue_front(batch);
            return Err(e);
        }

        let synced = batch.len();
        for value in batch {
            triggers.extend(self.config.triggers_of(value.itemid));
            let itemid = value.itemid;
            if let Err(e) = self.cache.put(itemid, value.ts, value.value) {
                debug!("Value of item {} not cached: {}", itemid, e);
            }
        }

        if now - self.last_idle_check >= IDLE_CHECK_INTERVAL_SECS {
            self.cache.expire_idle(now, VALUE_CACHE_IDLE_SECS);
            self.last_idle_check = now;
        }

        let outcome = SyncOutcome {
            values_synced: synced,
            triggers_affected: triggers.len(),
            more_pending: !self.buffer.is_empty(),
        };
        PipelineStats::add(&self.stats.values_synced, synced as u64);
        PipelineStats::add(&self.stats.triggers_affected, outcome.triggers_affected as u64);
        self.stats
            .sync_duration_seconds
            .add_sample(started.elapsed().as_secs_f64());
        debug!(
            "Synced {} values, {} triggers affected",
            outcome.values_synced, outcome.triggers_affected
        );
        Ok(outcome)
    }

    /// Stops timer work immediately; buffered values are still flushed.
    pub fn begin_shutdown(&mut self) {
        self.accepting_timers = false;
        if !self.timers.is_empty() {
            debug!("Dropping {} pending trigger timers", self.timers.len());
        }
        self.timers.clear();
    }

    /// Flushes everything left in the buffer, logging progress.
    pub async fn flush(&mut self) -> Result<usize> {
        let total = self.buffer.len();
        if total == 0 {
            return Ok(0);
        }
        info!("Syncing history data...");
        let mut synced = 0;
        let mut last_log = Instant::now();
        let mut failures = 0;
        loop {
            match self.sync_pass(Timespec::now().sec) {
                Ok(outcome) => {
                    synced += outcome.values_synced;
                    failures = 0;
                    if !outcome.more_pending {
                        break;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= 3 {
                        error!(
                            "Giving up syncing history data, {} values remain: {}",
                            self.buffer.len(),
                            e
                        );
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            if last_log.elapsed() >= FLUSH_PROGRESS_INTERVAL {
                info!(
                    "Syncing history data... {:.1}%",
                    synced as f64 * 100.0 / total.max(1) as f64
                );
                last_log = Instant::now();
            }
        }
        info!("Syncing history data... 100.0%, done ({} values)", synced);
        Ok(synced)
    }

    /// Runs passes until shutdown, then flushes the remaining buffer.
    pub async fn run(mut self, run: RunFlag, delay: Duration) {
        info!("History syncer started");
        while run.is_running() {
            // Database writes run off the async workers.
            let now = Timespec::now().sec;
            let pass = tokio::task::spawn_blocking(move || {
                let result = self.sync_pass(now);
                (self, result)
            })
            .await;
            let result = match pass {
                Ok((syncer, result)) => {
                    self = syncer;
                    result
                }
                Err(e) => {
                    error!("History syncer aborted: {}", e);
                    return;
                }
            };
            let more = match result {
                Ok(outcome) => outcome.more_pending,
                Err(e) => {
                    error!("History sync pass failed: {}", e);
                    false
                }
            };
            if !more && !run.sleep(delay).await {
                break;
            }
            if more {
                tokio::task::yield_now().await;
            }
        }
        self.begin_shutdown();
        if let Err(e) = self.flush().await {
            error!("History flush failed: {}", e);
        }
        info!("History syncer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configcache::{ItemConfig, TriggerConfig};
    use crate::history::{HistoryValue, Value, ValueType};
    use crate::valuecache::ValueRange;

    fn setup(batch: usize) -> (HistorySyncer, WriteBuffer, Arc<Store>, ValueCache) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let buffer = WriteBuffer::create(1 << 20);
        let cache = ValueCache::create(1 << 20, 1 << 20, 100, store.clone());
        let config = Arc::new(ConfigCache::new());
        config.reload(vec![ItemConfig {
            itemid: 1,
            hostid: 1,
            host: "h".into(),
            key: "agent.ping".into(),
            value_type: ValueType::Uint,
            delay_secs: 1,
            triggers: vec![
                TriggerConfig {
                    triggerid: 10,
                    period_secs: 0,
                },
                TriggerConfig {
                    triggerid: 11,
                    period_secs: 60,
                },
            ],
        }]);
        let syncer = HistorySyncer::new(
            buffer.clone(),
            store.clone(),
            cache.clone(),
            config,
            Arc::new(PipelineStats::default()),
            batch,
        );
        (syncer, buffer, store, cache)
    }

    fn hv(itemid: u64, sec: i64) -> HistoryValue {
        HistoryValue::new(itemid, Timespec::new(sec, 0), Value::Uint(sec as u64))
    }

    #[test]
    fn test_empty_pass_is_noop() {
        let (mut syncer, _, _, _) = setup(10);
        let outcome = syncer.sync_pass(30).unwrap();
        assert_eq!(outcome.values_synced, 0);
        assert!(!outcome.more_pending);
    }

    #[test]
    fn test_pass_writes_db_and_cache_in_batches() {
        let (mut syncer, buffer, store, cache) = setup(3);
        for sec in 100..105 {
            buffer.add(hv(1, sec)).unwrap();
        }
        buffer.add(hv(2, 100)).unwrap();

        let first = syncer.sync_pass(110).unwrap();
        assert_eq!(first.values_synced, 3);
        assert!(first.more_pending);
        assert_eq!(first.triggers_affected, 2);

        let second = syncer.sync_pass(110).unwrap();
        assert_eq!(second.values_synced, 3);
        assert!(!second.more_pending);

        assert_eq!(store.history_since(1, 0).unwrap().len(), 5);
        let cached = cache.get(1, ValueRange::Count(2), 110).unwrap();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[1].ts.sec, 104);
    }

    #[test]
    fn test_failed_pass_requeues_batch() {
        let (mut syncer, buffer, store, _) = setup(10);
        for sec in 0..4 {
            buffer.add(hv(1, sec)).unwrap();
        }
        store.with_connection(|c| c.execute_batch("ALTER TABLE proxy_history RENAME TO broken").unwrap());
        assert!(syncer.sync_pass(10).is_err());
        assert_eq!(buffer.len(), 4);

        store.with_connection(|c| c.execute_batch("ALTER TABLE broken RENAME TO proxy_history").unwrap());
        let outcome = syncer.sync_pass(10).unwrap();
        assert_eq!(outcome.values_synced, 4);
        let secs: Vec<i64> = store.history_since(1, 0).unwrap().iter().map(|v| v.ts.sec).collect();
        assert_eq!(secs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_timer_triggers_fire_and_clear_on_shutdown() {
        let (mut syncer, _, _, _) = setup(10);
        // Loads timers: trigger 11 next due at 60.
        assert_eq!(syncer.sync_pass(30).unwrap().triggers_affected, 0);
        assert_eq!(syncer.sync_pass(60).unwrap().triggers_affected, 1);
        assert_eq!(syncer.timers().len(), 1);

        syncer.begin_shutdown();
        assert!(syncer.timers().is_empty());
        assert_eq!(syncer.sync_pass(500).unwrap().triggers_affected, 0);
    }

    #[test]
    fn test_next_check_alignment() {
        assert_eq!(next_check(30, 60), 60);
        assert_eq!(next_check(60, 60), 120);
        assert_eq!(next_check(-1, 60), 0);
    }

    #[tokio::test]
    async fn test_flush_drains_buffer() {
        let (mut syncer, buffer, store, _) = setup(2);
        for sec in 0..7 {
            buffer.add(hv(1, sec)).unwrap();
        }
        syncer.begin_shutdown();
        assert_eq!(syncer.flush().await.unwrap(), 7);
        assert!(buffer.is_empty());
        assert_eq!(store.history_since(1, 0).unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_run_syncs_until_shutdown() {
        let (syncer, buffer, store, cache) = setup(2);
        for sec in 0..5 {
            buffer.add(hv(1, sec)).unwrap();
        }
        let run = RunFlag::new();
        let task = tokio::spawn(syncer.run(run.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        run.shutdown();
        task.await.unwrap();

        assert!(buffer.is_empty());
        assert_eq!(store.history_since(1, 0).unwrap().len(), 5);
        assert!(cache.contains(1));
    }
}
