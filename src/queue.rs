//! Duplicate-aware max-heap driving crawl order.
//!
//! Entries beyond the current crawl horizon are never pruned; the full
//! queue is snapshotted into control metadata and becomes the resumption
//! point of the next session.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::SampleId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueEntry {
    pub score: f64,
    pub id: SampleId,
    pub depth: u32,
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher score pops first; ties break toward the smaller ID so pop
        // order is deterministic across runs.
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
            .then_with(|| other.depth.cmp(&self.depth))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct CrawlQueue {
    heap: BinaryHeap<QueueEntry>,
    enqueued: HashSet<SampleId>,
}

impl CrawlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue unless the ID is already pending. Returns true on insert.
    pub fn push(&mut self, score: f64, id: SampleId, depth: u32) -> bool {
        if !self.enqueued.insert(id) {
            return false;
        }
        self.heap.push(QueueEntry { score, id, depth });
        true
    }

    /// Pop the highest-priority entry. The ID becomes enqueueable again;
    /// callers re-push on transient fetch failure.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        let entry = self.heap.pop()?;
        self.enqueued.remove(&entry.id);
        Some(entry)
    }

    pub fn contains(&self, id: SampleId) -> bool {
        self.enqueued.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Deterministic snapshot for control metadata, best-first.
    pub fn snapshot(&self) -> Vec<(f64, SampleId, u32)> {
        let mut entries: Vec<QueueEntry> = self.heap.iter().copied().collect();
        entries.sort_unstable_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| (e.score, e.id, e.depth)).collect()
    }

    pub fn restore(entries: &[(f64, SampleId, u32)]) -> Self {
        let mut queue = Self::new();
        for &(score, id, depth) in entries {
            queue.push(score, id, depth);
        }
        queue
    }
}
