//! Per-item value cache serving "last N values" and "values in window"
//! queries without a database round-trip.
//!
//! Every entry keeps a ring of recent values plus `cached_from`, the second
//! from which the ring is known to hold every value of the item. Requests
//! reaching further back are backfilled from the [`HistorySource`] and merged
//! into the entry. Memory is byte-accounted; when the region is full it is
//! grown up to the configured maximum, after that whole entries are evicted
//! in least-recently-used order.

use ahash::AHashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProxyError, Result};
use crate::history::{CachedValue, Timespec, Value};
use crate::ringbuffer::Ringbuffer;
use crate::shm::{Attachment, SharedRegion};
use crate::store::Store;

/// Initial ring size of a new entry; doubles up to `values_per_item`.
pub const MIN_RING_SLOTS: usize = 8;

/// Attempts to reconcile a backfill with concurrent writers before the
/// request is answered straight from the database.
const MAX_FETCH_ATTEMPTS: usize = 4;

/// Backing store consulted on cache misses.
pub trait HistorySource: Send + Sync {
    /// Values with `clock >= from`, ascending.
    fn fetch_range(&self, itemid: u64, from: i64) -> Result<Vec<CachedValue>>;

    /// Newest `count` values with `clock < before` (all if `None`), extended
    /// to the complete oldest second, ascending.
    fn fetch_last(&self, itemid: u64, count: usize, before: Option<i64>) -> Result<Vec<CachedValue>>;
}

impl HistorySource for Store {
    fn fetch_range(&self, itemid: u64, from: i64) -> Result<Vec<CachedValue>> {
        self.history_since(itemid, from)
    }

    fn fetch_last(&self, itemid: u64, count: usize, before: Option<i64>) -> Result<Vec<CachedValue>> {
        self.history_last(itemid, count, before)
    }
}

/// Requested slice of an item's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRange {
    /// Values of the last `n` seconds: `now - n < clock <= now`.
    Period(i64),
    /// The last `n` values with `clock <= now`.
    Count(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Normal,
    LowMemory,
}

/// How much of a request an entry can answer by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Partial,
    Full,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValueCacheStats {
    pub total_size: usize,
    pub free_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub mode: CacheMode,
    pub items: usize,
    pub values: usize,
}

struct CacheEntry {
    values: Ringbuffer<CachedValue>,
    /// Every value with `ts.sec >= cached_from` is in `values`.
    cached_from: i64,
    /// The source holds nothing older than `cached_from`.
    exhausted: bool,
    last_seq: u64,
    last_access: i64,
    size: usize,
}

const ENTRY_BASE_SIZE: usize = std::mem::size_of::<CacheEntry>();

impl CacheEntry {
    /// Answers `range` from the entry alone, if it covers it.
    fn serve(&self, range: ValueRange, now: i64) -> Option<Vec<CachedValue>> {
        select(
            self.values.iter(),
            self.cached_from,
            self.exhausted,
            range,
            now,
        )
    }

    fn trusted(&self) -> impl Iterator<Item = &CachedValue> + '_ {
        let from = self.cached_from;
        self.values.iter().filter(move |v| v.ts.sec >= from)
    }
}

fn select<'a, I>(
    values: I,
    cached_from: i64,
    exhausted: bool,
    range: ValueRange,
    now: i64,
) -> Option<Vec<CachedValue>>
where
    I: DoubleEndedIterator<Item = &'a CachedValue>,
{
    match range {
        ValueRange::Period(secs) => {
            if secs <= 0 {
                return Some(Vec::new());
            }
            let from = now - secs + 1;
            if cached_from > from && !exhausted {
                return None;
            }
            Some(
                values
                    .filter(|v| v.ts.sec >= from && v.ts.sec <= now)
                    .cloned()
                    .collect(),
            )
        }
        ValueRange::Count(n) => {
            if n == 0 {
                return Some(Vec::new());
            }
            let mut picked: Vec<CachedValue> = values
                .rev()
                .filter(|v| v.ts.sec >= cached_from && v.ts.sec <= now)
                .take(n)
                .cloned()
                .collect();
            if picked.len() < n && !exhausted {
                return None;
            }
            picked.reverse();
            Some(picked)
        }
    }
}

/// Cache contents; lives inside a [`SharedRegion`].
pub struct CacheState {
    entries: AHashMap<u64, CacheEntry>,
    total_size: usize,
    hits: u64,
    misses: u64,
    mode: CacheMode,
    seq: u64,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            entries: AHashMap::new(),
            total_size: 0,
            hits: 0,
            misses: 0,
            mode: CacheMode::Normal,
            seq: 0,
        }
    }
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn drop_entry(&mut self, itemid: u64) -> Option<usize> {
        let entry = self.entries.remove(&itemid)?;
        self.total_size -= entry.size;
        Some(entry.size)
    }

    fn lru_victim(&self, protect: Option<u64>) -> Option<u64> {
        self.entries
            .iter()
            .filter(|(id, _)| Some(**id) != protect)
            .min_by_key(|(_, e)| e.last_seq)
            .map(|(id, _)| *id)
    }
}

enum PutAction {
    Create,
    Append { overwritten: usize },
    Drop,
}

/// Handle on the value cache. Clones share the same region.
pub struct ValueCache {
    region: Attachment<CacheState>,
    source: Arc<dyn HistorySource>,
    max_size: usize,
    values_per_item: usize,
}

impl ValueCache {
    /// Creates a cache region of `size` bytes that may grow to `max_size`.
    pub fn create(
        size: usize,
        max_size: usize,
        values_per_item: usize,
        source: Arc<dyn HistorySource>,
    ) -> Self {
        let region = SharedRegion::create("value cache", size, CacheState::default());
        Self {
            region: region.attach(),
            source,
            max_size: max_size.max(size),
            values_per_item: values_per_item.max(1),
        }
    }

    /// Returns the values of `itemid` in `range` as of `now`, ascending.
    ///
    /// Fails only when a needed database lookup fails.
    #[instrument(level = "trace", skip(self))]
    pub fn get(&self, itemid: u64, range: ValueRange, now: i64) -> Result<Vec<CachedValue>> {
        for _ in 0..MAX_FETCH_ATTEMPTS {
            let (cut, need) = {
                let mut guard = self.region.lock();
                let state = &mut *guard;
                let seq = state.next_seq();
                match state.entries.get_mut(&itemid) {
                    Some(entry) => {
                        entry.last_seq = seq;
                        entry.last_access = now;
                        if let Some(values) = entry.serve(range, now) {
                            state.hits += values.len() as u64;
                            return Ok(values);
                        }
                        let need = match range {
                            ValueRange::Count(n) => {
                                n - entry.trusted().filter(|v| v.ts.sec <= now).count()
                            }
                            ValueRange::Period(_) => 0,
                        };
                        (Some(entry.cached_from), need)
                    }
                    None => {
                        let need = match range {
                            ValueRange::Count(n) => n,
                            ValueRange::Period(_) => 0,
                        };
                        (None, need)
                    }
                }
            };

            let fetched = match range {
                ValueRange::Period(secs) => self.source.fetch_range(itemid, now - secs + 1)?,
                ValueRange::Count(_) => self.source.fetch_last(itemid, need, cut)?,
            };

            let mut guard = self.region.lock();
            let state = &mut *guard;
            state.misses += fetched.len() as u64;
            let current_cut = state.entries.get(&itemid).map(|e| e.cached_from);

            let (cached_from, exhausted) = match range {
                ValueRange::Period(secs) => {
                    let from = now - secs + 1;
                    let exhausted = state.entries.get(&itemid).is_some_and(|e| e.exhausted);
                    (from.min(current_cut.unwrap_or(i64::MAX)), exhausted)
                }
                ValueRange::Count(_) => {
                    if current_cut != cut {
                        debug!("Item {} changed during backfill, retrying", itemid);
                        continue;
                    }
                    let exhausted = fetched.len() < need;
                    let cached_from = fetched
                        .first()
                        .filter(|_| !exhausted)
                        .map_or(i64::MIN, |oldest| oldest.ts.sec);
                    (cached_from, exhausted)
                }
            };

            // Union of the fetched rows and whatever the entry holds in the
            // covered range; the source copy wins on equal timestamps.
            let mut merged = fetched;
            if let Some(entry) = state.entries.get(&itemid) {
                merged.extend(entry.values.iter().filter(|v| v.ts.sec >= cached_from).cloned());
            }
            merged.sort_by_key(|v| v.ts);
            merged.dedup_by_key(|v| v.ts);

            let result = select(merged.iter(), cached_from, exhausted, range, now);
            let seq = state.next_seq();
            self.store_entry(state, itemid, merged, cached_from, exhausted, seq, now);

            if let Some(values) = result {
                return Ok(values);
            }
        }

        debug!("Serving item {} directly from the database", itemid);
        self.fetch_uncached(itemid, range, now)
    }

    fn fetch_uncached(&self, itemid: u64, range: ValueRange, now: i64) -> Result<Vec<CachedValue>> {
        let values = match range {
            ValueRange::Period(secs) if secs <= 0 => Vec::new(),
            ValueRange::Period(secs) => self
                .source
                .fetch_range(itemid, now - secs + 1)?
                .into_iter()
                .filter(|v| v.ts.sec <= now)
                .collect(),
            ValueRange::Count(0) => Vec::new(),
            ValueRange::Count(n) => {
                let mut values = self.source.fetch_last(itemid, n, Some(now + 1))?;
                let skip = values.len().saturating_sub(n);
                values.drain(..skip);
                values
            }
        };
        self.region.lock().misses += values.len() as u64;
        Ok(values)
    }

    /// Replaces an entry with backfilled contents. Returns false if the
    /// contents could not be cached.
    #[allow(clippy::too_many_arguments)]
    fn store_entry(
        &self,
        state: &mut CacheState,
        itemid: u64,
        merged: Vec<CachedValue>,
        cached_from: i64,
        exhausted: bool,
        seq: u64,
        now: i64,
    ) -> bool {
        // The whole backfilled window is kept; `values_per_item` only limits
        // ring growth on puts and memory pressure bounds the rest.
        let slots = ring_slots(merged.len(), self.values_per_item).max(merged.len());
        let mut ring = Ringbuffer::new(slots);
        let mut size = ENTRY_BASE_SIZE;
        for v in merged {
            size += v.size();
            ring.push(v);
        }

        state.drop_entry(itemid);
        if self.reserve(state, size, None).is_err() {
            debug!("No room to cache item {}", itemid);
            return false;
        }

        state.entries.insert(
            itemid,
            CacheEntry {
                values: ring,
                cached_from,
                exhausted,
                last_seq: seq,
                last_access: now,
                size,
            },
        );
        state.total_size += size;
        true
    }

    /// Appends one value of an item.
    ///
    /// A value equal to the newest cached timestamp is a duplicate and
    /// ignored. An older value invalidates the entry, which is rebuilt from
    /// the database on the next read.
    pub fn put(&self, itemid: u64, ts: Timespec, value: Value) -> Result<()> {
        let value = CachedValue { ts, value };
        let vsize = value.size();
        let mut guard = self.region.lock();
        let state = &mut *guard;
        let seq = state.next_seq();

        let action = match state.entries.get(&itemid) {
            None => PutAction::Create,
            Some(entry) => match entry.values.newest() {
                Some(newest) if value.ts == newest.ts => return Ok(()),
                Some(newest) if value.ts < newest.ts => PutAction::Drop,
                _ => {
                    let overwrites = entry.values.is_full()
                        && entry.values.capacity() >= self.values_per_item;
                    let overwritten = if overwrites {
                        entry.values.oldest().map_or(0, |v| v.size())
                    } else {
                        0
                    };
                    PutAction::Append { overwritten }
                }
            },
        };

        match action {
            PutAction::Drop => {
                debug!(
                    "Out of order value for item {} at {}.{:09}, dropping cached entry",
                    itemid, ts.sec, ts.ns
                );
                state.drop_entry(itemid);
                Ok(())
            }
            PutAction::Create => {
                if state.mode == CacheMode::LowMemory {
                    return Ok(());
                }
                let size = ENTRY_BASE_SIZE + vsize;
                self.reserve(state, size, None)?;
                let mut values = Ringbuffer::new(ring_slots(1, self.values_per_item));
                let cached_from = ts.sec + 1;
                values.push(value);
                state.entries.insert(
                    itemid,
                    CacheEntry {
                        values,
                        cached_from,
                        exhausted: false,
                        last_seq: seq,
                        last_access: ts.sec,
                        size,
                    },
                );
                state.total_size += size;
                Ok(())
            }
            PutAction::Append { overwritten } => {
                let needed = vsize.saturating_sub(overwritten);
                if let Err(e) = self.reserve(state, needed, Some(itemid)) {
                    state.drop_entry(itemid);
                    return Err(e);
                }
                let values_per_item = self.values_per_item;
                let Some(entry) = state.entries.get_mut(&itemid) else {
                    return Ok(());
                };
                if entry.values.is_full() && entry.values.capacity() < values_per_item {
                    let slots = (entry.values.capacity() * 2).min(values_per_item);
                    entry.values.resize(slots);
                }
                entry.last_seq = seq;
                let mut delta = vsize as isize;
                if let Some(evicted) = entry.values.push(value) {
                    entry.cached_from = entry.cached_from.max(evicted.ts.sec + 1);
                    entry.exhausted = false;
                    delta -= evicted.size() as isize;
                }
                entry.size = (entry.size as isize + delta) as usize;
                state.total_size = (state.total_size as isize + delta) as usize;
                self.update_mode(state);
                Ok(())
            }
        }
    }

    /// Makes room for `bytes` more: grows the region first, then evicts
    /// least-recently-used entries other than `protect`.
    fn reserve(&self, state: &mut CacheState, bytes: usize, protect: Option<u64>) -> Result<()> {
        loop {
            let region = self.region.region();
            let capacity = region.capacity();
            if state.total_size + bytes <= capacity {
                return Ok(());
            }
            if capacity < self.max_size {
                let wanted = (capacity * 2)
                    .max(state.total_size + bytes)
                    .min(self.max_size);
                region.grow(wanted);
                continue;
            }
            match state.lru_victim(protect) {
                Some(victim) => {
                    let freed = state.drop_entry(victim).unwrap_or(0);
                    debug!("Evicted item {} from value cache ({} bytes)", victim, freed);
                }
                None => {
                    if state.mode == CacheMode::Normal {
                        warn!(
                            "Value cache is full ({} of {} bytes used), switching to low memory mode",
                            state.total_size, capacity
                        );
                        state.mode = CacheMode::LowMemory;
                    }
                    return Err(ProxyError::Capacity(format!(
                        "value cache cannot fit {} more bytes",
                        bytes
                    )));
                }
            }
        }
    }

    fn update_mode(&self, state: &mut CacheState) {
        if state.mode == CacheMode::LowMemory
            && state.total_size < self.region.region().capacity() / 2
        {
            info!("Value cache has recovered from low memory mode");
            state.mode = CacheMode::Normal;
        }
    }

    /// Removes whole entries in LRU order until usage is at most `target_bytes`.
    /// Returns the number of bytes freed.
    pub fn evict(&self, target_bytes: usize) -> usize {
        let mut guard = self.region.lock();
        let state = &mut *guard;
        let mut freed = 0;
        while state.total_size > target_bytes {
            let Some(victim) = state.lru_victim(None) else {
                break;
            };
            freed += state.drop_entry(victim).unwrap_or(0);
        }
        self.update_mode(state);
        freed
    }

    /// Drops entries not read since `now - idle_secs`.
    pub fn expire_idle(&self, now: i64, idle_secs: i64) -> usize {
        let mut guard = self.region.lock();
        let state = &mut *guard;
        let cutoff = now - idle_secs;
        let idle: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, e)| e.last_access < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for itemid in &idle {
            state.drop_entry(*itemid);
        }
        if !idle.is_empty() {
            debug!("Removed {} idle items from value cache", idle.len());
        }
        self.update_mode(state);
        idle.len()
    }

    pub fn remove(&self, itemid: u64) -> bool {
        let mut guard = self.region.lock();
        let removed = guard.drop_entry(itemid).is_some();
        self.update_mode(&mut guard);
        removed
    }

    pub fn clear(&self) {
        let mut state = self.region.lock();
        state.entries.clear();
        state.total_size = 0;
        self.update_mode(&mut state);
    }

    pub fn entry_state(&self, itemid: u64, range: ValueRange, now: i64) -> EntryState {
        let state = self.region.lock();
        match state.entries.get(&itemid) {
            None => EntryState::Empty,
            Some(entry) if entry.serve(range, now).is_some() => EntryState::Full,
            Some(_) => EntryState::Partial,
        }
    }

    pub fn contains(&self, itemid: u64) -> bool {
        self.region.lock().entries.contains_key(&itemid)
    }

    pub fn stats(&self) -> ValueCacheStats {
        let state = self.region.lock();
        let capacity = self.region.region().capacity();
        ValueCacheStats {
            total_size: state.total_size,
            free_size: capacity.saturating_sub(state.total_size),
            hits: state.hits,
            misses: state.misses,
            mode: state.mode,
            items: state.entries.len(),
            values: state.entries.values().map(|e| e.values.len()).sum(),
        }
    }
}

impl Clone for ValueCache {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            source: Arc::clone(&self.source),
            max_size: self.max_size,
            values_per_item: self.values_per_item,
        }
    }
}

fn ring_slots(len: usize, values_per_item: usize) -> usize {
    let mut slots = MIN_RING_SLOTS;
    while slots < len {
        slots *= 2;
    }
    slots.min(values_per_item).max(len.min(values_per_item)).max(1)
}
