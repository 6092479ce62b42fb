//! Shared memory region abstraction.
//!
//! A region holds state that several components (pollers, syncers, senders,
//! readers of aggregate functions) mutate concurrently. All access goes
//! through one mutex; contention blocks rather than retries.
//!
//! The region carries a generation counter. Whoever grows the region bumps
//! it, and every attachment notices the change on its next `lock()` and
//! remaps (refreshes its view of capacity).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// A named, capacity-bounded, mutex-guarded region.
pub struct SharedRegion<T> {
    name: String,
    state: Mutex<T>,
    capacity: AtomicUsize,
    generation: AtomicU64,
    attached: AtomicUsize,
}

impl<T> SharedRegion<T> {
    /// Initialises a region of `capacity` bytes holding `state`.
    pub fn create(name: &str, capacity: usize, state: T) -> Arc<Self> {
        debug!("Creating shared region '{}' with {} bytes", name, capacity);
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(state),
            capacity: AtomicUsize::new(capacity),
            generation: AtomicU64::new(0),
            attached: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Number of live attachments.
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Attaches a new user to the region.
    pub fn attach(self: &Arc<Self>) -> Attachment<T> {
        self.attached.fetch_add(1, Ordering::AcqRel);
        Attachment {
            region: Arc::clone(self),
            seen_generation: AtomicU64::new(self.generation()),
            seen_capacity: AtomicUsize::new(self.capacity()),
        }
    }

    /// Locks the region, recovering from a poisoned mutex.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Grows the region. Must be called while holding the lock, by the
    /// first user that detects insufficient capacity.
    ///
    /// Returns false if `new_capacity` is not larger than the current one.
    pub fn grow(&self, new_capacity: usize) -> bool {
        let old = self.capacity();
        if new_capacity <= old {
            return false;
        }
        self.capacity.store(new_capacity, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            "Shared region '{}' grown from {} to {} bytes (generation {})",
            self.name, old, new_capacity, generation
        );
        true
    }
}

/// One user's handle on a shared region.
///
/// Dropping the attachment detaches it.
pub struct Attachment<T> {
    region: Arc<SharedRegion<T>>,
    seen_generation: AtomicU64,
    seen_capacity: AtomicUsize,
}

impl<T> Attachment<T> {
    /// Locks the region, remapping first if it was resized since the last access.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = self.region.lock();
        if self.needs_remap() {
            self.remap();
        }
        guard
    }

    /// True if the region generation moved since this attachment last mapped it.
    pub fn needs_remap(&self) -> bool {
        self.seen_generation.load(Ordering::Acquire) != self.region.generation()
    }

    fn remap(&self) {
        let generation = self.region.generation();
        let capacity = self.region.capacity();
        self.seen_generation.store(generation, Ordering::Release);
        self.seen_capacity.store(capacity, Ordering::Release);
        debug!(
            "Remapped shared region '{}' (generation {}, {} bytes)",
            self.region.name, generation, capacity
        );
    }

    /// Capacity as of the last (re)map.
    pub fn mapped_capacity(&self) -> usize {
        self.seen_capacity.load(Ordering::Acquire)
    }

    pub fn region(&self) -> &Arc<SharedRegion<T>> {
        &self.region
    }
}

impl<T> Clone for Attachment<T> {
    fn clone(&self) -> Self {
        self.region.attach()
    }
}

impl<T> Drop for Attachment<T> {
    fn drop(&mut self) {
        self.region.attached.fetch_sub(1, Ordering::AcqRel);
    }
}
