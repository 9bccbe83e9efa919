//! Priority queue of pending subagent tasks with time-based aging.
//!
//! A binary min-heap stored in a `Vec` and maintained with explicit
//! sift-up/sift-down. Entries are keyed by their *effective* priority:
//!
//! ```text
//! effective = max(1, priority - floor(age / aging_interval))
//! ```
//!
//! so the longer an entry waits, the more urgent it becomes. Effective
//! priorities are recomputed lazily on [`TaskQueue::dequeue`]; the heap is
//! rebuilt only when at least one value changed. Ties go to the entry that
//! was enqueued first.

use std::time::Duration;

use tokio::time::Instant;

/// One queued task id with its ordering key.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: String,
    /// Priority as dispatched. Never modified by aging.
    pub priority: u32,
    pub enqueued_at: Instant,
    effective: u32,
    seq: u64,
}

impl QueueEntry {
    pub const fn effective_priority(&self) -> u32 {
        self.effective
    }

    const fn key(&self) -> (u32, u64) {
        (self.effective, self.seq)
    }
}

/// Effective priority of an entry enqueued at `enqueued_at`, observed at `now`.
pub fn aged_priority(priority: u32, enqueued_at: Instant, now: Instant, interval: Duration) -> u32 {
    let floor = priority.max(1);
    if interval.is_zero() {
        return floor;
    }
    let steps = now.saturating_duration_since(enqueued_at).as_millis() / interval.as_millis();
    let steps = u32::try_from(steps).unwrap_or(u32::MAX);
    floor.saturating_sub(steps).max(1)
}

/// Array-backed min-heap of queued tasks.
#[derive(Debug)]
pub struct TaskQueue {
    heap: Vec<QueueEntry>,
    aging_interval: Duration,
    next_seq: u64,
    /// Instant of the last effective-priority refresh.
    refreshed_at: Option<Instant>,
}

impl TaskQueue {
    pub const fn new(aging_interval: Duration) -> Self {
        Self {
            heap: Vec::new(),
            aging_interval,
            next_seq: 0,
            refreshed_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.heap.iter().any(|e| e.task_id == task_id)
    }

    /// Insert a task. O(log n).
    pub fn enqueue(&mut self, task_id: impl Into<String>, priority: u32, now: Instant) {
        let entry = QueueEntry {
            task_id: task_id.into(),
            priority,
            enqueued_at: now,
            effective: priority.max(1),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.heap.push(entry);
        let last = self.heap.len() - 1;
        self.sift_up(last);
    }

    /// Pop the most urgent entry after applying aging as of `now`.
    pub fn dequeue(&mut self, now: Instant) -> Option<QueueEntry> {
        if self.heap.len() > 1 && self.refreshed_at.is_none_or(|at| now > at) {
            self.refresh(now);
        }
        if self.heap.is_empty() {
            return None;
        }
        let entry = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(entry)
    }

    /// Effective priority of the entry [`dequeue`](Self::dequeue) would
    /// return, without aging.
    pub fn peek_effective_priority(&self) -> Option<u32> {
        self.heap.first().map(QueueEntry::effective_priority)
    }

    /// Remove a still-queued task. O(n) scan plus O(log n) fix-up.
    pub fn remove(&mut self, task_id: &str) -> Option<QueueEntry> {
        let pos = self.heap.iter().position(|e| e.task_id == task_id)?;
        let entry = self.heap.swap_remove(pos);
        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        Some(entry)
    }

    fn refresh(&mut self, now: Instant) {
        let interval = self.aging_interval;
        let mut changed = false;
        for entry in &mut self.heap {
            let effective = aged_priority(entry.priority, entry.enqueued_at, now, interval);
            if effective != entry.effective {
                entry.effective = effective;
                changed = true;
            }
        }
        if changed {
            for i in (0..self.heap.len() / 2).rev() {
                self.sift_down(i);
            }
        }
        self.refreshed_at = Some(now);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].key() >= self.heap[parent].key() {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < len && self.heap[left].key() < self.heap[smallest].key() {
                smallest = left;
            }
            if right < len && self.heap[right].key() < self.heap[smallest].key() {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }
}
