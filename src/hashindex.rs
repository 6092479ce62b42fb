//! Bucketed hash index mapping `u64` keys to small integer values.
//!
//! Used for internal bookkeeping such as item counts per value type and the
//! per-item trigger index. Buckets are plain vectors scanned linearly.
//!
//! Removal swaps the removed slot with the last entry of its bucket, so it
//! does not preserve iteration order.

use std::hash::Hash;

/// Bucket count used when `set` is called on an uninitialised index.
pub const DEFAULT_BUCKETS: usize = 10;

/// Rehash when `num_entries >= num_buckets * LOAD_FACTOR`.
pub const LOAD_FACTOR: usize = 5;

/// Initial slot count of a bucket's entry list; doubles when full.
pub const BUCKET_INITIAL_SLOTS: usize = 6;

/// Growth factor numerator/denominator for bucket count (x1.5).
const GROWTH_NUM: usize = 3;
const GROWTH_DEN: usize = 2;

/// Fixed seeds so bucket placement is reproducible across runs.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

/// Key hashing function.
pub type HashFn<K> = fn(&K) -> u64;
/// Key equality function.
pub type CompareFn<K> = fn(&K, &K) -> bool;

fn default_hash<K: Hash>(key: &K) -> u64 {
    let state = ahash::RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    state.hash_one(key)
}

fn default_compare<K: PartialEq>(a: &K, b: &K) -> bool {
    a == b
}

/// Returns true if `n` is prime.
pub fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }
    let mut i = 3;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// Smallest prime `>= n`.
pub fn next_prime(n: usize) -> usize {
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

/// Hash index with injected hashing and comparison.
pub struct ShardedHashIndex<K = u64> {
    buckets: Vec<Vec<(K, i64)>>,
    num_entries: usize,
    rehashes: usize,
    hash_fn: HashFn<K>,
    compare_fn: CompareFn<K>,
}

impl ShardedHashIndex<u64> {
    /// Creates an index with `initial_size` rounded up to the next prime.
    pub fn create(initial_size: usize) -> Self {
        Self::with_functions(initial_size, default_hash::<u64>, default_compare::<u64>)
    }
}

impl Default for ShardedHashIndex<u64> {
    /// Uninitialised index (zero buckets); the first `set` allocates.
    fn default() -> Self {
        Self::with_functions(0, default_hash::<u64>, default_compare::<u64>)
    }
}

impl<K: Clone> ShardedHashIndex<K> {
    /// Creates an index for an arbitrary key type.
    ///
    /// `initial_size == 0` leaves the index uninitialised.
    pub fn with_functions(initial_size: usize, hash_fn: HashFn<K>, compare_fn: CompareFn<K>) -> Self {
        let buckets = if initial_size == 0 {
            Vec::new()
        } else {
            new_buckets(next_prime(initial_size))
        };
        Self {
            buckets,
            num_entries: 0,
            rehashes: 0,
            hash_fn,
            compare_fn,
        }
    }

    fn bucket_of(&self, key: &K) -> usize {
        ((self.hash_fn)(key) % self.buckets.len() as u64) as usize
    }

    /// Looks up a key. An uninitialised index simply reports not found.
    pub fn get(&self, key: &K) -> Option<i64> {
        if self.buckets.is_empty() {
            return None;
        }
        let bucket = &self.buckets[self.bucket_of(key)];
        bucket
            .iter()
            .find(|(k, _)| (self.compare_fn)(k, key))
            .map(|(_, v)| *v)
    }

    /// Inserts or overwrites a key.
    pub fn set(&mut self, key: K, value: i64) {
        if self.buckets.is_empty() {
            self.buckets = new_buckets(next_prime(DEFAULT_BUCKETS));
        }

        let idx = self.bucket_of(&key);
        let compare = self.compare_fn;
        if let Some(slot) = self.buckets[idx].iter_mut().find(|(k, _)| compare(k, &key)) {
            slot.1 = value;
            return;
        }

        if self.num_entries >= self.buckets.len() * LOAD_FACTOR {
            self.rehash();
        }

        let idx = self.bucket_of(&key);
        push_entry(&mut self.buckets[idx], (key, value));
        self.num_entries += 1;
    }

    /// Adds `delta` to the value of `key`, inserting it with `delta` if absent.
    pub fn increment(&mut self, key: K, delta: i64) -> i64 {
        let value = self.get(&key).unwrap_or(0) + delta;
        self.set(key, value);
        value
    }

    /// Removes a key, returning its value. Does not preserve order.
    pub fn remove(&mut self, key: &K) -> Option<i64> {
        if self.buckets.is_empty() {
            return None;
        }
        let idx = self.bucket_of(key);
        let compare = self.compare_fn;
        let bucket = &mut self.buckets[idx];
        let pos = bucket.iter().position(|(k, _)| compare(k, key))?;
        let (_, value) = bucket.swap_remove(pos);
        self.num_entries -= 1;
        Some(value)
    }

    /// Resets the entry count, keeping the bucket array for reuse.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.clear();
        }
        self.num_entries = 0;
    }

    pub fn len(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Number of rehashes performed so far.
    pub fn rehashes(&self) -> usize {
        self.rehashes
    }

    /// Iterates all entries in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, i64)> + '_ {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|(k, v)| (k, *v)))
    }

    fn rehash(&mut self) {
        let new_size = next_prime(self.buckets.len() * GROWTH_NUM / GROWTH_DEN);
        let old = std::mem::replace(&mut self.buckets, new_buckets(new_size));
        for bucket in old {
            for entry in bucket {
                let idx = self.bucket_of(&entry.0);
                push_entry(&mut self.buckets[idx], entry);
            }
        }
        self.rehashes += 1;
    }
}

fn new_buckets<K>(count: usize) -> Vec<Vec<(K, i64)>> {
    let mut buckets = Vec::with_capacity(count);
    buckets.resize_with(count, Vec::new);
    buckets
}

/// Appends to a bucket, growing its slot list geometrically (6, 12, 24, ...).
fn push_entry<K>(bucket: &mut Vec<(K, i64)>, entry: (K, i64)) {
    if bucket.capacity() == 0 {
        bucket.reserve_exact(BUCKET_INITIAL_SLOTS);
    } else if bucket.len() == bucket.capacity() {
        let cap = bucket.capacity();
        bucket.reserve_exact(cap);
    }
    bucket.push(entry);
}
