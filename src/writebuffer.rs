//! Bounded write-ahead buffer between the pollers and the history syncer.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::history::HistoryValue;
use crate::shm::{Attachment, SharedRegion};

#[derive(Default)]
pub struct BufferState {
    queue: VecDeque<HistoryValue>,
    used: usize,
    rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteBufferStats {
    pub queued: usize,
    pub used_size: usize,
    pub free_size: usize,
    pub rejected: u64,
}

/// FIFO of collected values waiting to be synced. Clones share the region.
#[derive(Clone)]
pub struct WriteBuffer {
    region: Attachment<BufferState>,
}

impl WriteBuffer {
    pub fn create(capacity_bytes: usize) -> Self {
        let region = SharedRegion::create("history cache", capacity_bytes, BufferState::default());
        Self {
            region: region.attach(),
        }
    }

    /// Queues one value. Fails with `Capacity` when it does not fit; the
    /// caller keeps the value and retries later.
    pub fn add(&self, value: HistoryValue) -> Result<()> {
        let size = value.size();
        let capacity = self.region.region().capacity();
        let mut state = self.region.lock();
        if state.used + size > capacity {
            state.rejected += 1;
            return Err(ProxyError::Capacity(format!(
                "history cache is full ({} of {} bytes used)",
                state.used, capacity
            )));
        }
        state.used += size;
        state.queue.push_back(value);
        Ok(())
    }

    /// Removes up to `limit` of the oldest values.
    pub fn take(&self, limit: usize) -> Vec<HistoryValue> {
        let mut state = self.region.lock();
        let n = limit.min(state.queue.len());
        let batch: Vec<HistoryValue> = state.queue.drain(..n).collect();
        let freed: usize = batch.iter().map(HistoryValue::size).sum();
        state.used -= freed;
        batch
    }

    /// Puts a batch back at the head of the queue, preserving its order.
    ///
    /// Requeued values are never rejected, even if that overshoots capacity.
    pub fn requeue_front(&self, batch: Vec<HistoryValue>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.region.lock();
        debug!("Requeueing {} values", batch.len());
        for value in batch.into_iter().rev() {
            state.used += value.size();
            state.queue.push_front(value);
        }
    }

    pub fn len(&self) -> usize {
        self.region.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.lock().queue.is_empty()
    }

    pub fn stats(&self) -> WriteBufferStats {
        let capacity = self.region.region().capacity();
        let state = self.region.lock();
        WriteBufferStats {
            queued: state.queue.len(),
            used_size: state.used,
            free_size: capacity.saturating_sub(state.used),
            rejected: state.rejected,
        }
    }
}
