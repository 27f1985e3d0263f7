//! Loop Guard - short-horizon memory of processed message ids
//!
//! Stops a flooded packet from bouncing around the mesh forever. Entries
//! expire a fixed horizon after they were first seen; the set lives in
//! process memory only.

use lifeline_core::{now_ms, DedupConfig, MessageId};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Tracks ids seen within the horizon.
#[derive(Debug)]
pub struct LoopGuard {
    /// id -> first-seen timestamp
    first_seen: HashMap<MessageId, u64>,
    /// Insertion order, oldest first. May hold stale entries for ids that
    /// expired and were seen again; those are skipped on pop.
    order: VecDeque<(u64, MessageId)>,
    horizon_ms: u64,
    capacity: usize,
}

impl LoopGuard {
    pub fn new(horizon_ms: u64, capacity: usize) -> Self {
        Self {
            first_seen: HashMap::new(),
            order: VecDeque::new(),
            horizon_ms,
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.horizon_ms, config.capacity)
    }

    /// `false` the first time `id` shows up within the horizon, `true` after.
    pub fn seen(&mut self, id: &str) -> bool {
        self.seen_at(id, now_ms())
    }

    pub fn seen_at(&mut self, id: &str, now: u64) -> bool {
        self.prune(now);

        if let Some(first) = self.first_seen.get(id) {
            if now.saturating_sub(*first) < self.horizon_ms {
                return true;
            }
        }

        self.first_seen.insert(id.to_string(), now);
        self.order.push_back((now, id.to_string()));
        self.evict_over_capacity();
        false
    }

    /// Ids currently tracked.
    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }

    fn prune(&mut self, now: u64) {
        while let Some((at, _)) = self.order.front() {
            if now.saturating_sub(*at) < self.horizon_ms {
                break;
            }
            if let Some((at, id)) = self.order.pop_front() {
                self.forget(&id, at);
            }
        }
    }

    fn evict_over_capacity(&mut self) {
        while self.first_seen.len() > self.capacity {
            match self.order.pop_front() {
                Some((at, id)) => {
                    if self.forget(&id, at) {
                        trace!(id = %id, "Loop guard evicted oldest id");
                    }
                }
                None => break,
            }
        }
    }

    /// Drop `id` if its entry is the one recorded at `at`.
    fn forget(&mut self, id: &str, at: u64) -> bool {
        if self.first_seen.get(id) == Some(&at) {
            self.first_seen.remove(id);
            true
        } else {
            false
        }
    }
}
