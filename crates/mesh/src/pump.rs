//! Retry Pump - periodic redelivery with priority lanes and backoff
//!
//! Every tick, items that are due are handed back to the outbound path.
//! Lanes only set the first delay; afterwards every item follows the same
//! backoff schedule, never shorter than one radio duty cycle.
//!
//! ```text
//! Pending ──due──▶ attempt ──▶ Pending (tries+1, next = now + backoff)
//!    │                                   │
//!    ├── record marked sent ──▶ Sent     │
//!    └── older than max lifetime ──▶ Expired
//! ```

use crate::queue::QueueRecord;
use lifeline_core::{MessageId, MessageKind, PumpConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Priority lane of a retry item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Sos,
    Normal,
    Background,
}

impl Lane {
    /// Lane a message kind is pumped on.
    pub fn for_kind(kind: &MessageKind) -> Self {
        match kind {
            k if k.is_sos() => Lane::Sos,
            MessageKind::Presence | MessageKind::ConvoyPing | MessageKind::PackChunk => {
                Lane::Background
            }
            _ => Lane::Normal,
        }
    }

    /// Delay before the first attempt.
    pub fn initial_delay_ms(self, config: &PumpConfig) -> u64 {
        match self {
            Lane::Sos => config.sos_initial_delay_ms,
            Lane::Normal => config.normal_initial_delay_ms,
            Lane::Background => config.background_initial_delay_ms,
        }
    }
}

/// One item owned by the pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryItem {
    pub id: MessageId,
    pub kind: MessageKind,
    pub payload: Value,
    pub lane: Lane,
    pub enqueued_at: u64,
    pub tries: u32,
    pub next_attempt_at: u64,
}

/// What a tick did.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Items to hand to the outbound path now
    pub due: Vec<RetryItem>,
    /// Items dropped for exceeding the max lifetime
    pub expired: Vec<MessageId>,
    /// Items whose record was marked sent
    pub completed: Vec<MessageId>,
}

/// Retry/backoff scheduler.
#[derive(Debug)]
pub struct RetryPump {
    items: HashMap<MessageId, RetryItem>,
    config: PumpConfig,
    floor_ms: u64,
}

impl RetryPump {
    /// `floor_ms` is the current radio duty cycle length.
    pub fn new(config: PumpConfig, floor_ms: u64) -> Self {
        Self {
            items: HashMap::new(),
            config,
            floor_ms,
        }
    }

    /// Follow a power profile change.
    pub fn set_floor(&mut self, floor_ms: u64) {
        self.floor_ms = floor_ms;
    }

    /// Track `record` for redelivery. Already-tracked ids are left alone.
    pub fn schedule(&mut self, record: &QueueRecord, now: u64) -> bool {
        if self.items.contains_key(&record.id) {
            return false;
        }
        let lane = Lane::for_kind(&record.kind);
        let item = RetryItem {
            id: record.id.clone(),
            kind: record.kind.clone(),
            payload: record.payload.clone(),
            lane,
            enqueued_at: now,
            tries: 0,
            next_attempt_at: now + lane.initial_delay_ms(&self.config),
        };
        trace!(id = %item.id, lane = ?lane, next = item.next_attempt_at, "Retry item scheduled");
        self.items.insert(item.id.clone(), item);
        true
    }

    /// Rebuild from the queue's pending records after a restart.
    ///
    /// Age is measured from each record's creation time, so items that were
    /// already near the end of their life do not get a fresh 24 hours.
    pub fn restore<'a, I>(&mut self, pending: I, now: u64) -> usize
    where
        I: IntoIterator<Item = &'a QueueRecord>,
    {
        let mut restored = 0;
        for record in pending.into_iter().filter(|r| !r.sent) {
            if self.schedule(record, now) {
                if let Some(item) = self.items.get_mut(&record.id) {
                    item.enqueued_at = record.created_at.min(now);
                }
                restored += 1;
            }
        }
        debug!(restored, "Retry pump restored from queue");
        restored
    }

    /// Wait after the `tries`-th failed attempt.
    pub fn backoff_for(&self, tries: u32) -> u64 {
        let schedule = &self.config.backoff_schedule_ms;
        let step = schedule
            .get((tries.max(1) - 1) as usize)
            .or_else(|| schedule.last())
            .copied()
            .unwrap_or(0);
        step.max(self.floor_ms)
    }

    /// Run one pump pass at `now`. `is_sent` reports whether the record
    /// behind an id has been marked sent.
    pub fn tick<F>(&mut self, now: u64, is_sent: F) -> TickOutcome
    where
        F: Fn(&str) -> bool,
    {
        let mut outcome = TickOutcome::default();
        let max_lifetime = self.config.max_lifetime_ms;

        let ids: Vec<MessageId> = self.items.keys().cloned().collect();
        for id in ids {
            if is_sent(&id) {
                self.items.remove(&id);
                outcome.completed.push(id);
                continue;
            }
            let Some(item) = self.items.get(&id) else {
                continue;
            };
            if now.saturating_sub(item.enqueued_at) >= max_lifetime {
                self.items.remove(&id);
                outcome.expired.push(id);
                continue;
            }
            if item.next_attempt_at > now {
                continue;
            }
            let tries = item.tries + 1;
            let wait = self.backoff_for(tries);
            if let Some(item) = self.items.get_mut(&id) {
                item.tries = tries;
                item.next_attempt_at = now + wait;
                outcome.due.push(item.clone());
            }
        }

        outcome
            .due
            .sort_by_key(|item| (lane_rank(item.lane), item.enqueued_at));
        if !outcome.due.is_empty() || !outcome.expired.is_empty() {
            debug!(
                due = outcome.due.len(),
                expired = outcome.expired.len(),
                completed = outcome.completed.len(),
                tracked = self.items.len(),
                "Pump tick"
            );
        }
        outcome
    }

    /// Ids currently tracked.
    pub fn ids(&self) -> Vec<MessageId> {
        self.items.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&RetryItem> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn lane_rank(lane: Lane) -> u8 {
    match lane {
        Lane::Sos => 0,
        Lane::Normal => 1,
        Lane::Background => 2,
    }
}
