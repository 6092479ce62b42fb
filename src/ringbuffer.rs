//! Ringbuffer module for per-item and per-device history.
//!
//! This module provides a fixed-capacity circular buffer with predictable
//! memory usage. When full, pushing overwrites the oldest slot.

/// A circular buffer storing entries in insertion order.
#[derive(Debug, Clone)]
pub struct Ringbuffer<T> {
    entries: Vec<Option<T>>,
    capacity: usize,
    write_index: usize,
    count: usize,
}

impl<T> Ringbuffer<T> {
    /// Creates a new ringbuffer with the specified capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);

        Self {
            entries,
            capacity,
            write_index: 0,
            count: 0,
        }
    }

    /// Pushes a new entry into the ringbuffer.
    ///
    /// If the buffer is full, the oldest entry is overwritten and returned.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = self.entries[self.write_index].replace(entry);
        self.write_index = (self.write_index + 1) % self.capacity;

        if self.count < self.capacity {
            self.count += 1;
            None
        } else {
            evicted
        }
    }

    /// Physical slot index of the i-th oldest entry.
    fn slot(&self, i: usize) -> usize {
        let start = if self.count < self.capacity {
            0
        } else {
            self.write_index
        };
        (start + i) % self.capacity
    }

    /// Returns the i-th entry counting from the oldest.
    pub fn get(&self, i: usize) -> Option<&T> {
        if i >= self.count {
            return None;
        }
        self.entries[self.slot(i)].as_ref()
    }

    /// Returns the oldest entry.
    pub fn oldest(&self) -> Option<&T> {
        self.get(0)
    }

    /// Returns the newest entry.
    pub fn newest(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        self.get(self.count - 1)
    }

    /// Iterates entries in chronological order (oldest to newest).
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |i| self.entries[self.slot(i)].as_ref())
    }

    /// Index of the slot the next push will write.
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Returns the current number of entries in the buffer.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns the maximum capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if the next push overwrites the oldest entry.
    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    /// Removes all entries, keeping the allocation.
    pub fn clear(&mut self) {
        for slot in self.entries.iter_mut() {
            *slot = None;
        }
        self.write_index = 0;
        self.count = 0;
    }

    /// Consumes the buffer, returning entries oldest to newest.
    pub fn into_vec(mut self) -> Vec<T> {
        let count = self.count;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let idx = self.slot(i);
            if let Some(v) = self.entries[idx].take() {
                out.push(v);
            }
        }
        out
    }

    /// Rebuilds the buffer with a new capacity, keeping the newest entries.
    ///
    /// Returns entries that no longer fit (oldest first).
    pub fn resize(&mut self, new_capacity: usize) -> Vec<T> {
        let old = std::mem::replace(self, Ringbuffer::new(new_capacity));
        let mut values = old.into_vec();
        let overflow = values.len().saturating_sub(self.capacity);
        let dropped: Vec<T> = values.drain(..overflow).collect();
        for v in values {
            self.push(v);
        }
        dropped
    }
}

impl<T: Clone> Ringbuffer<T> {
    /// Returns all entries in chronological order (oldest to newest).
    pub fn get_history(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
