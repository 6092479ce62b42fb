//! Disk I/O statistics collector.
//!
//! Reads /proc/diskstats once per second and keeps, for every device that
//! was asked for, a rolling history of counters from which 1, 5 and 15
//! minute read/write rates are derived.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::control::RunFlag;
use crate::ringbuffer::Ringbuffer;
use crate::shm::{Attachment, SharedRegion};

/// Samples kept per device: 15 minutes at one per second, plus one.
pub const MAX_COLLECTOR_HISTORY: usize = 15 * 60 + 1;

/// Devices not queried for this long are dropped.
pub const DEFAULT_DEVICE_TTL_SECS: i64 = 3 * 60 * 60;

const SECTOR_SIZE: u64 = 512;

/// Averaging windows in seconds (1, 5 and 15 minutes).
const WINDOWS: [i64; 3] = [60, 5 * 60, 15 * 60];

/// Raw counters of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
}

/// Parses /proc/diskstats content.
///
/// Format: major minor name read_ios read_merges read_sectors read_ticks write_ios write_merges write_sectors ...
pub fn parse_diskstats(content: &str) -> HashMap<String, DiskStats> {
    let mut stats = HashMap::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue; // Skip malformed lines
        }

        let disk_stat = DiskStats {
            reads_completed: parts[3].parse().unwrap_or(0),
            sectors_read: parts[5].parse().unwrap_or(0),
            writes_completed: parts[7].parse().unwrap_or(0),
            sectors_written: parts[9].parse().unwrap_or(0),
        };

        stats.insert(parts[2].to_string(), disk_stat);
    }

    stats
}

/// Reads disk statistics from /proc/diskstats.
pub fn read_diskstats() -> Result<HashMap<String, DiskStats>, String> {
    let content = fs::read_to_string("/proc/diskstats")
        .map_err(|e| format!("Failed to read /proc/diskstats: {}", e))?;
    Ok(parse_diskstats(&content))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Counter a rate is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateKind {
    /// Sectors per second.
    Sectors,
    /// Operations per second.
    Operations,
    /// Bytes per second.
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Avg1,
    Avg5,
    Avg15,
}

impl RateWindow {
    fn index(self) -> usize {
        match self {
            RateWindow::Avg1 => 0,
            RateWindow::Avg5 => 1,
            RateWindow::Avg15 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    clock: i64,
    r_sect: u64,
    r_oper: u64,
    w_sect: u64,
    w_oper: u64,
}

impl Sample {
    fn counter(&self, direction: Direction, kind: RateKind) -> u64 {
        match (direction, kind) {
            (Direction::Read, RateKind::Operations) => self.r_oper,
            (Direction::Read, _) => self.r_sect,
            (Direction::Write, RateKind::Operations) => self.w_oper,
            (Direction::Write, _) => self.w_sect,
        }
    }
}

/// Per-window rates of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub sps: [f64; 3],
    pub ops: [f64; 3],
    pub bps: [f64; 3],
}

/// Rolling statistics of one device.
pub struct DiskDeviceStats {
    name: String,
    history: Ringbuffer<Sample>,
    read: Rates,
    write: Rates,
    last_polled: i64,
}

impl DiskDeviceStats {
    pub fn new(name: &str, now: i64) -> Self {
        Self {
            name: name.to_string(),
            history: Ringbuffer::new(MAX_COLLECTOR_HISTORY),
            read: Rates::default(),
            write: Rates::default(),
            last_polled: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }

    /// Records one reading and recomputes the window averages.
    pub fn apply(&mut self, clock: i64, stats: &DiskStats) {
        self.history.push(Sample {
            clock,
            r_sect: stats.sectors_read,
            r_oper: stats.reads_completed,
            w_sect: stats.sectors_written,
            w_oper: stats.writes_completed,
        });
        self.read = self.compute(Direction::Read);
        self.write = self.compute(Direction::Write);
    }

    fn compute(&self, direction: Direction) -> Rates {
        let mut rates = Rates::default();
        let Some(newest) = self.history.newest() else {
            return rates;
        };

        for (w, window) in WINDOWS.iter().enumerate() {
            // Oldest sample still inside the window; the boundary sample counts.
            let Some(oldest) = self
                .history
                .iter()
                .find(|s| s.clock >= newest.clock - window)
            else {
                continue;
            };
            let elapsed = newest.clock - oldest.clock;
            if elapsed <= 0 {
                continue;
            }
            let elapsed = elapsed as f64;
            let sect = newest
                .counter(direction, RateKind::Sectors)
                .saturating_sub(oldest.counter(direction, RateKind::Sectors)) as f64;
            let oper = newest
                .counter(direction, RateKind::Operations)
                .saturating_sub(oldest.counter(direction, RateKind::Operations)) as f64;
            rates.sps[w] = sect / elapsed;
            rates.ops[w] = oper / elapsed;
            rates.bps[w] = sect * SECTOR_SIZE as f64 / elapsed;
        }
        rates
    }

    pub fn rate(&self, direction: Direction, kind: RateKind, window: RateWindow) -> f64 {
        let rates = match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        };
        let i = window.index();
        match kind {
            RateKind::Sectors => rates.sps[i],
            RateKind::Operations => rates.ops[i],
            RateKind::Bytes => rates.bps[i],
        }
    }
}

#[derive(Default)]
pub struct DiskRegistry {
    devices: HashMap<String, DiskDeviceStats>,
}

/// Shared registry of watched devices. Clones share the region.
#[derive(Clone)]
pub struct DiskCollector {
    region: Attachment<DiskRegistry>,
    ttl_secs: i64,
}

impl DiskCollector {
    pub fn new(ttl_secs: i64) -> Self {
        let region = SharedRegion::create("disk devices", 0, DiskRegistry::default());
        Self {
            region: region.attach(),
            ttl_secs,
        }
    }

    /// Returns the current rate for a device, starting to watch it on first use.
    ///
    /// A device seen for the first time reports 0 until samples accumulate.
    pub fn rate(
        &self,
        device: &str,
        direction: Direction,
        kind: RateKind,
        window: RateWindow,
        now: i64,
    ) -> f64 {
        let device = device.strip_prefix("/dev/").unwrap_or(device);
        let mut registry = self.region.lock();
        match registry.devices.get_mut(device) {
            Some(stats) => {
                stats.last_polled = now;
                stats.rate(direction, kind, window)
            }
            None => {
                debug!("Watching disk device '{}'", device);
                registry
                    .devices
                    .insert(device.to_string(), DiskDeviceStats::new(device, now));
                0.0
            }
        }
    }

    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.region.lock().devices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Feeds one reading to every watched device and drops stale ones.
    pub fn update(&self, now: i64, readings: &HashMap<String, DiskStats>) {
        let mut registry = self.region.lock();
        let ttl = self.ttl_secs;
        registry.devices.retain(|name, dev| {
            let keep = now - dev.last_polled <= ttl;
            if !keep {
                info!("Removing disk device '{}' (not polled for {}s)", name, now - dev.last_polled);
            }
            keep
        });
        for (name, dev) in registry.devices.iter_mut() {
            if let Some(stats) = readings.get(name) {
                dev.apply(now, stats);
            }
        }
    }

    /// Sample count of a watched device, if watched.
    pub fn samples(&self, device: &str) -> Option<usize> {
        self.region.lock().devices.get(device).map(DiskDeviceStats::samples)
    }
}

/// Collects once per second until shutdown.
pub async fn run_collector(collector: Arc<DiskCollector>, run: RunFlag) {
    let mut warned = false;
    while run.is_running() {
        match read_diskstats() {
            Ok(readings) => collector.update(chrono::Utc::now().timestamp(), &readings),
            Err(e) if !warned => {
                warn!("Disk statistics unavailable: {}", e);
                warned = true;
            }
            Err(e) => debug!("{}", e),
        }
        if !run.sleep(Duration::from_secs(1)).await {
            break;
        }
    }
    debug!("Disk collector stopped");
}
