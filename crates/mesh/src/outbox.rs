//! Outbox - packets staged for the next peer contacts
//!
//! Fed by `send_local` and by pump attempts. Entries are offered to every
//! peer met while they are fresh and leave by age or capacity, not on send.

use crate::bundle::CourierPacket;
use crate::pump::Lane;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, Clone)]
struct OutboxEntry {
    packet: CourierPacket,
    staged_at: u64,
}

/// Bounded, time-limited packet staging area.
#[derive(Debug)]
pub struct Outbox {
    entries: VecDeque<OutboxEntry>,
    capacity: usize,
    ttl_ms: u64,
}

impl Outbox {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            ttl_ms,
        }
    }

    /// Stage `packet`. Restaging an id refreshes its age.
    pub fn push(&mut self, packet: CourierPacket, now: u64) {
        self.prune(now);
        self.entries.retain(|e| e.packet.id != packet.id);
        self.entries.push_back(OutboxEntry {
            packet,
            staged_at: now,
        });
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                trace!(id = %evicted.packet.id, "Outbox full, oldest entry evicted");
            }
        }
    }

    /// Fresh packets, sos lane first, then newest first.
    pub fn snapshot(&mut self, now: u64) -> Vec<CourierPacket> {
        self.prune(now);
        let mut packets: Vec<(u8, u64, CourierPacket)> = self
            .entries
            .iter()
            .map(|e| {
                let rank = match Lane::for_kind(&e.packet.kind) {
                    Lane::Sos => 0,
                    _ => 1,
                };
                (rank, e.staged_at, e.packet.clone())
            })
            .collect();
        packets.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        packets.into_iter().map(|(_, _, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self, now: u64) {
        let ttl = self.ttl_ms;
        self.entries
            .retain(|e| now.saturating_sub(e.staged_at) < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_core::MessageKind;
    use serde_json::json;

    fn packet(id: &str, kind: MessageKind) -> CourierPacket {
        CourierPacket {
            v: 1,
            id: id.to_string(),
            created_at: 0,
            kind,
            payload: json!({}),
            integrity_hash: String::new(),
            hop: 0,
            max_hop: 8,
        }
    }

    fn ids(packets: &[CourierPacket]) -> Vec<&str> {
        packets.iter().map(|p| p.id.as_str()).collect()
    }

    #[test]
    fn test_sos_first_then_newest() {
        let mut outbox = Outbox::new(8, 1_000);
        outbox.push(packet("n1", MessageKind::Note), 1);
        outbox.push(packet("s1", MessageKind::Sos), 2);
        outbox.push(packet("n2", MessageKind::Note), 3);

        let snapshot = outbox.snapshot(4);
        assert_eq!(ids(&snapshot), vec!["s1", "n2", "n1"]);
        // Snapshots do not consume entries.
        assert_eq!(outbox.len(), 3);
    }

    #[test]
    fn test_entries_expire() {
        let mut outbox = Outbox::new(8, 1_000);
        outbox.push(packet("a", MessageKind::Note), 0);
        outbox.push(packet("b", MessageKind::Note), 500);

        assert_eq!(ids(&outbox.snapshot(1_200)), vec!["b"]);
        assert!(outbox.snapshot(1_500).is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut outbox = Outbox::new(2, 1_000);
        outbox.push(packet("a", MessageKind::Note), 0);
        outbox.push(packet("b", MessageKind::Note), 1);
        outbox.push(packet("c", MessageKind::Note), 2);
        assert_eq!(ids(&outbox.snapshot(3)), vec!["c", "b"]);
    }

    #[test]
    fn test_restage_refreshes_age() {
        let mut outbox = Outbox::new(8, 1_000);
        outbox.push(packet("a", MessageKind::Note), 0);
        outbox.push(packet("a", MessageKind::Note), 900);
        assert_eq!(outbox.len(), 1);
        assert_eq!(ids(&outbox.snapshot(1_500)), vec!["a"]);
    }
}
