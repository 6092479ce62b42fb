//! In-memory configuration cache: monitored items and their triggers.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

use crate::hashindex::ShardedHashIndex;
use crate::history::ValueType;

/// Trigger depending on an item. A non-zero `period_secs` makes it
/// time-based: it is re-evaluated on a timer as well as on new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub triggerid: u64,
    #[serde(default)]
    pub period_secs: u64,
}

/// One polled item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConfig {
    pub itemid: u64,
    pub hostid: u64,
    pub host: String,
    pub key: String,
    pub value_type: ValueType,
    #[serde(default = "default_delay")]
    pub delay_secs: u64,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

fn default_delay() -> u64 {
    60
}

/// Result of a reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

pub struct ConfigCache {
    items: DashMap<u64, ItemConfig>,
    /// Value type code -> number of items.
    type_counts: Mutex<ShardedHashIndex>,
    /// Item id -> number of dependent triggers.
    trigger_index: Mutex<ShardedHashIndex>,
    revision: AtomicU64,
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            type_counts: Mutex::new(ShardedHashIndex::default()),
            trigger_index: Mutex::new(ShardedHashIndex::default()),
            revision: AtomicU64::new(0),
        }
    }

    /// Replaces the item set.
    pub fn reload(&self, items: Vec<ItemConfig>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let incoming: HashSet<u64> = items.iter().map(|i| i.itemid).collect();

        self.items.retain(|itemid, _| {
            let keep = incoming.contains(itemid);
            if !keep {
                summary.removed += 1;
            }
            keep
        });

        for item in items {
            match self.items.insert(item.itemid, item.clone()) {
                None => summary.added += 1,
                Some(old) if old != item => summary.updated += 1,
                Some(_) => {}
            }
        }

        self.rebuild_indexes();
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            "Configuration cache revision {}: {} items ({} added, {} updated, {} removed)",
            revision,
            self.items.len(),
            summary.added,
            summary.updated,
            summary.removed
        );
        summary
    }

    fn rebuild_indexes(&self) {
        let mut counts = self.type_counts.lock().unwrap_or_else(|p| p.into_inner());
        let mut triggers = self.trigger_index.lock().unwrap_or_else(|p| p.into_inner());
        counts.clear();
        triggers.clear();
        for item in self.items.iter() {
            counts.increment(item.value_type.code() as u64, 1);
            if !item.triggers.is_empty() {
                triggers.set(item.itemid, item.triggers.len() as i64);
            }
        }
    }

    pub fn item(&self, itemid: u64) -> Option<ItemConfig> {
        self.items.get(&itemid).map(|i| i.value().clone())
    }

    /// Snapshot of all items ordered by id.
    pub fn items(&self) -> Vec<ItemConfig> {
        let mut items: Vec<ItemConfig> = self.items.iter().map(|i| i.value().clone()).collect();
        items.sort_by_key(|i| i.itemid);
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn count_by_type(&self, value_type: ValueType) -> i64 {
        self.type_counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(value_type.code() as u64))
            .unwrap_or(0)
    }

    pub fn trigger_count(&self, itemid: u64) -> i64 {
        self.trigger_index
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&itemid)
            .unwrap_or(0)
    }

    pub fn triggers_of(&self, itemid: u64) -> Vec<u64> {
        self.items
            .get(&itemid)
            .map(|i| i.triggers.iter().map(|t| t.triggerid).collect())
            .unwrap_or_default()
    }

    /// Time-based triggers as `(triggerid, period_secs)`.
    pub fn timer_triggers(&self) -> Vec<(u64, u64)> {
        let mut timers: Vec<(u64, u64)> = self
            .items
            .iter()
            .flat_map(|i| {
                i.triggers
                    .iter()
                    .filter(|t| t.period_secs > 0)
                    .map(|t| (t.triggerid, t.period_secs))
                    .collect::<Vec<_>>()
            })
            .collect();
        timers.sort_unstable();
        timers.dedup_by_key(|t| t.0);
        timers
    }
}
