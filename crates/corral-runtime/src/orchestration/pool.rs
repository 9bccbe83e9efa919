//! Auto-scaling worker slot accounting for the task scheduler.
//!
//! The [`WorkerPool`] does not own threads or tasks. It tracks how many
//! workers are active against a target size and decides when that target
//! grows or shrinks. Resizing only moves the target; running workers are
//! never preempted, so a shrink below the active count simply stops new
//! slots from being handed out until enough workers finish.

use corral_core::SchedulerConfig;
use tokio::time::Instant;
use tracing::{debug, info};

/// Outcome of a resize attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    Grew { from: usize, to: usize },
    Shrank { from: usize, to: usize },
}

/// Worker slot counter with utilization-driven resizing.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    min: usize,
    max: usize,
    active: usize,
    last_resize: Option<Instant>,
    config: SchedulerConfig,
}

impl WorkerPool {
    /// Create a pool bounded by `[config.min_pool_size, max]`.
    ///
    /// The initial size is clamped into those bounds.
    pub fn new(config: SchedulerConfig, max: usize) -> Self {
        let max = max.max(1);
        let min = config.min_pool_size.clamp(1, max);
        let size = config.initial_pool_size.clamp(min, max);

        info!(size, min, max, "WorkerPool created");

        Self {
            size,
            min,
            max,
            active: 0,
            last_resize: None,
            config,
        }
    }

    /// Take a slot if one is free.
    pub const fn try_acquire(&mut self) -> bool {
        if self.has_capacity() {
            self.active += 1;
            true
        } else {
            false
        }
    }

    /// Return a slot taken with [`try_acquire`](Self::try_acquire).
    pub fn release(&mut self) {
        self.active = self.active.saturating_sub(1);
        debug!(active = self.active, size = self.size, "Worker slot released");
    }

    pub const fn has_capacity(&self) -> bool {
        self.active < self.size
    }

    pub const fn active(&self) -> usize {
        self.active
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.active as f64 / self.size as f64
    }

    /// Grow or shrink the target size based on utilization.
    ///
    /// Above the scale-up threshold the pool grows by half (at least one)
    /// up to `max`; below the scale-down threshold it shrinks by a quarter
    /// (at least one) down to `min`. At most one resize per cooldown.
    pub fn maybe_resize(&mut self, now: Instant) -> Option<Resize> {
        if let Some(last) = self.last_resize
            && now.saturating_duration_since(last) < self.config.scale_cooldown()
        {
            return None;
        }

        let utilization = self.utilization();
        let from = self.size;
        let resize = if utilization > self.config.scale_up_threshold && self.size < self.max {
            let step = (self.size / 2).max(1);
            self.size = (self.size + step).min(self.max);
            Resize::Grew {
                from,
                to: self.size,
            }
        } else if utilization < self.config.scale_down_threshold && self.size > self.min {
            let step = (self.size / 4).max(1);
            self.size = self.size.saturating_sub(step).max(self.min);
            Resize::Shrank {
                from,
                to: self.size,
            }
        } else {
            return None;
        };

        self.last_resize = Some(now);
        info!(from, to = self.size, utilization, "WorkerPool resized");
        Some(resize)
    }
}
