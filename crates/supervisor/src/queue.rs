//! FIFO request queue with optional backpressure
//!
//! The queue is owned by the supervisor task, so a plain `VecDeque` is enough:
//! there is never more than one thread touching it. Insertion order is
//! dispatch order; there is no priority and no reordering.

use std::collections::VecDeque;

use crate::pending::PendingRequest;
use toolgate_common::METRICS;
use tracing::trace;

/// Requests awaiting dispatch
#[derive(Debug)]
pub struct RequestQueue {
    entries: VecDeque<PendingRequest>,

    /// Maximum queued entries (None = unbounded)
    max_size: Option<usize>,
}

impl RequestQueue {
    /// Create a new queue
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size,
        }
    }

    /// Append an entry at the tail
    ///
    /// Hands the entry back if the queue is full, so the caller can complete it.
    pub fn push(&mut self, entry: PendingRequest) -> std::result::Result<(), PendingRequest> {
        if self.max_size.is_some_and(|max| self.entries.len() >= max) {
            return Err(entry);
        }

        self.entries.push_back(entry);
        self.update_depth();

        trace!("Request queued, queue depth: {}", self.entries.len());

        Ok(())
    }

    /// Remove the oldest entry
    pub fn pop(&mut self) -> Option<PendingRequest> {
        let entry = self.entries.pop_front()?;
        self.update_depth();

        METRICS
            .requests
            .queue_wait
            .observe(entry.enqueued_at().elapsed().as_secs_f64());

        Some(entry)
    }

    /// Remove every entry, oldest first
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        let drained: Vec<_> = self.entries.drain(..).collect();
        self.update_depth();
        drained
    }

    /// Get the current queue depth
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    fn update_depth(&self) {
        METRICS.requests.queue_depth.set(self.entries.len() as i64);
    }
}
