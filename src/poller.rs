//! Item poller: collects due items into the write buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collectors::{parse_item_key, MetricSource};
use crate::configcache::{ConfigCache, ItemConfig};
use crate::control::RunFlag;
use crate::error::Result;
use crate::history::{HistoryValue, Timespec, Value};
use crate::protocol::AvailabilityRecord;
use crate::stats::PipelineStats;
use crate::store::Store;
use crate::writebuffer::WriteBuffer;

pub const HOST_AVAILABLE: i32 = 1;
pub const HOST_UNAVAILABLE: i32 = 2;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub polled: usize,
    pub errors: usize,
    pub queued: usize,
    /// Values still held back because the write buffer was full.
    pub held: usize,
    /// True if the cycle was skipped to wait for buffer space.
    pub deferred: bool,
}

pub struct Poller {
    config: Arc<ConfigCache>,
    source: Arc<dyn MetricSource>,
    buffer: WriteBuffer,
    store: Arc<Store>,
    stats: Arc<PipelineStats>,
    next_check: HashMap<u64, i64>,
    held: VecDeque<HistoryValue>,
    availability: HashMap<u64, (i32, String)>,
}

/// Converts a collected value to the item's configured type.
fn coerce(item: &ItemConfig, value: Value) -> std::result::Result<Value, String> {
    if value.value_type() == item.value_type {
        return Ok(value);
    }
    let text = value.as_text();
    Value::parse(item.value_type, &text).ok_or_else(|| {
        format!(
            "Value \"{}\" of type \"{:?}\" is not suitable for value type \"{:?}\".",
            text,
            value.value_type(),
            item.value_type
        )
    })
}

impl Poller {
    pub fn new(
        config: Arc<ConfigCache>,
        source: Arc<dyn MetricSource>,
        buffer: WriteBuffer,
        store: Arc<Store>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            source,
            buffer,
            store,
            stats,
            next_check: HashMap::new(),
            held: VecDeque::new(),
            availability: HashMap::new(),
        }
    }

    /// Queues held-back values first, then polls every due item.
    ///
    /// While values from an earlier cycle are still held, no new values are
    /// collected, so at most one cycle's worth lives outside the buffer.
    pub fn poll_due(&mut self, now: Timespec) -> Result<PollOutcome> {
        let mut outcome = PollOutcome::default();
        self.flush_held(&mut outcome);
        if !self.held.is_empty() {
            outcome.held = self.held.len();
            outcome.deferred = true;
            debug!("Write buffer full, {} values held, skipping poll", self.held.len());
            return Ok(outcome);
        }

        let items = self.config.items();
        self.next_check
            .retain(|itemid, _| items.iter().any(|i| i.itemid == *itemid));

        // hostid -> (any success, last error)
        let mut hosts: HashMap<u64, (bool, String)> = HashMap::new();
        for item in &items {
            if item.delay_secs == 0 {
                continue;
            }
            let due = self.next_check.get(&item.itemid).copied().unwrap_or(i64::MIN);
            if due > now.sec {
                continue;
            }
            self.next_check
                .insert(item.itemid, now.sec + item.delay_secs as i64);

            outcome.polled += 1;
            let host = hosts.entry(item.hostid).or_insert((false, String::new()));
            let collected = parse_item_key(&item.key)
                .and_then(|key| self.source.collect(&key.name, &key.params))
                .and_then(|value| coerce(item, value));
            match collected {
                Ok(value) => {
                    host.0 = true;
                    let value = HistoryValue::new(item.itemid, now, value);
                    if self.held.is_empty() {
                        self.queue(value, &mut outcome);
                    } else {
                        self.held.push_back(value);
                    }
                }
                Err(e) => {
                    outcome.errors += 1;
                    debug!("Item \"{}\" on \"{}\" became not supported: {}", item.key, item.host, e);
                    host.1 = e;
                }
            }
        }

        for (hostid, (ok, error)) in hosts {
            let state = if ok {
                (HOST_AVAILABLE, String::new())
            } else {
                (HOST_UNAVAILABLE, error)
            };
            if self.availability.get(&hostid) == Some(&state) {
                continue;
            }
            let rec = AvailabilityRecord {
                hostid,
                available: state.0,
                error: state.1.clone(),
            };
            self.store.upsert_availability(&rec, now.sec)?;
            self.availability.insert(hostid, state);
        }

        outcome.held = self.held.len();
        PipelineStats::add(&self.stats.polls, outcome.polled as u64);
        PipelineStats::add(&self.stats.poll_errors, outcome.errors as u64);
        Ok(outcome)
    }

    fn queue(&mut self, value: HistoryValue, outcome: &mut PollOutcome) {
        match self.buffer.add(value.clone()) {
            Ok(()) => outcome.queued += 1,
            Err(e) => {
                PipelineStats::add(&self.stats.buffer_rejections, 1);
                if self.held.is_empty() {
                    warn!("{}; holding values until the syncer catches up", e);
                }
                self.held.push_back(value);
            }
        }
    }

    fn flush_held(&mut self, outcome: &mut PollOutcome) {
        while let Some(value) = self.held.pop_front() {
            if self.buffer.add(value.clone()).is_err() {
                PipelineStats::add(&self.stats.buffer_rejections, 1);
                self.held.push_front(value);
                return;
            }
            outcome.queued += 1;
        }
    }

    pub async fn run(mut self, run: RunFlag) {
        info!("Poller started, {} items", self.config.len());
        while run.is_running() {
            if let Err(e) = self.poll_due(Timespec::now()) {
                warn!("Poll cycle failed: {}", e);
            }
            if !run.sleep(POLL_INTERVAL).await {
                break;
            }
        }
        if !self.held.is_empty() {
            warn!("Poller stopped with {} values not buffered", self.held.len());
        } else {
            info!("Poller stopped");
        }
    }
}
