//! Internal pipeline statistics.
//!
//! Components bump these counters as they work; the admin listener turns
//! them into Prometheus metrics and the `/stats` document.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Running statistics for a single metric.
#[derive(Clone, Copy, Default)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    last: f64,
}

impl RunningStat {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
            self.last = value;
            self.sum = value;
            self.count = 1;
            return;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / (self.count as f64)
        }
    }
}

/// Thread-safe wrapper for running statistics.
#[derive(Default)]
pub struct Stat {
    inner: Mutex<RunningStat>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatSnapshot {
    pub last: f64,
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub count: u64,
}

impl Stat {
    pub fn add_sample(&self, value: f64) {
        if let Ok(mut s) = self.inner.lock() {
            s.add(value);
        }
    }

    pub fn snapshot(&self) -> StatSnapshot {
        if let Ok(s) = self.inner.lock() {
            StatSnapshot {
                last: s.last,
                avg: s.avg(),
                max: s.max,
                min: s.min,
                count: s.count,
            }
        } else {
            StatSnapshot::default()
        }
    }
}

/// Counters shared by all pipeline tasks.
#[derive(Default)]
pub struct PipelineStats {
    // Poller
    pub polls: AtomicU64,
    pub poll_errors: AtomicU64,
    pub buffer_rejections: AtomicU64,

    // History syncer
    pub values_synced: AtomicU64,
    pub sync_passes: AtomicU64,
    pub sync_failures: AtomicU64,
    pub triggers_affected: AtomicU64,
    pub sync_duration_seconds: Stat,

    // Data sender
    pub envelopes_sent: AtomicU64,
    pub envelopes_failed: AtomicU64,
    pub availability_sent: AtomicU64,
    pub history_sent: AtomicU64,
    pub discovery_sent: AtomicU64,
    pub autoregistration_sent: AtomicU64,
    pub tasks_sent: AtomicU64,
    pub send_duration_seconds: Stat,

    // Heartbeat
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_failed: AtomicU64,

    // Housekeeper
    pub housekeeper_passes: AtomicU64,
    pub housekeeper_deleted: AtomicU64,
    pub housekeeper_duration_seconds: Stat,
}

/// Serializable copy of [`PipelineStats`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub polls: u64,
    pub poll_errors: u64,
    pub buffer_rejections: u64,
    pub values_synced: u64,
    pub sync_passes: u64,
    pub sync_failures: u64,
    pub triggers_affected: u64,
    pub sync_duration_seconds: StatSnapshot,
    pub envelopes_sent: u64,
    pub envelopes_failed: u64,
    pub availability_sent: u64,
    pub history_sent: u64,
    pub discovery_sent: u64,
    pub autoregistration_sent: u64,
    pub tasks_sent: u64,
    pub send_duration_seconds: StatSnapshot,
    pub heartbeats_sent: u64,
    pub heartbeats_failed: u64,
    pub housekeeper_passes: u64,
    pub housekeeper_deleted: u64,
    pub housekeeper_duration_seconds: StatSnapshot,
}

fn load(v: &AtomicU64) -> u64 {
    v.load(Ordering::Relaxed)
}

impl PipelineStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            polls: load(&self.polls),
            poll_errors: load(&self.poll_errors),
            buffer_rejections: load(&self.buffer_rejections),
            values_synced: load(&self.values_synced),
            sync_passes: load(&self.sync_passes),
            sync_failures: load(&self.sync_failures),
            triggers_affected: load(&self.triggers_affected),
            sync_duration_seconds: self.sync_duration_seconds.snapshot(),
            envelopes_sent: load(&self.envelopes_sent),
            envelopes_failed: load(&self.envelopes_failed),
            availability_sent: load(&self.availability_sent),
            history_sent: load(&self.history_sent),
            discovery_sent: load(&self.discovery_sent),
            autoregistration_sent: load(&self.autoregistration_sent),
            tasks_sent: load(&self.tasks_sent),
            send_duration_seconds: self.send_duration_seconds.snapshot(),
            heartbeats_sent: load(&self.heartbeats_sent),
            heartbeats_failed: load(&self.heartbeats_failed),
            housekeeper_passes: load(&self.housekeeper_passes),
            housekeeper_deleted: load(&self.housekeeper_deleted),
            housekeeper_duration_seconds: self.housekeeper_duration_seconds.snapshot(),
        }
    }
}
