//! Durable Queue - append-only record log
//!
//! The single source of truth for what must eventually leave this device.
//! Records live one JSON object per line in a log file; every mutation
//! rewrites the log through a temp file and an atomic rename, so a crash
//! mid-write never damages records that were already committed.
//!
//! # Guarantees
//!
//! - Append order is preserved across restarts
//! - `sent` only ever moves from false to true
//! - A line that fails to parse is skipped on load, never fatal
//! - Pending records are never dropped; only sent records past the retention
//!   window are removed by [`DurableQueue::compact`]

use crate::bundle::{CourierPacket, DEFAULT_MAX_HOP};
use crate::error::{MeshError, MeshResult};
use crate::store::{ensure_parent, write_atomic};
use lifeline_core::{integrity_hash, new_message_id_at, now_ms, MessageId, MessageKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current on-disk record schema
pub const SCHEMA_VERSION: u32 = 1;

fn default_max_hop() -> u8 {
    DEFAULT_MAX_HOP
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Produced on this device
    #[default]
    Local,
    /// Copy of a packet received from a peer, queued for onward relay
    Relay,
}

/// One entry of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub id: MessageId,
    pub created_at: u64,
    pub kind: MessageKind,
    pub payload: Value,
    pub schema_version: u32,
    pub integrity_hash: String,
    pub sent: bool,
    #[serde(default)]
    pub hop: u8,
    #[serde(default = "default_max_hop")]
    pub max_hop: u8,
    #[serde(default)]
    pub origin: RecordOrigin,
}

impl QueueRecord {
    /// Recompute the integrity hash and compare.
    pub fn verify(&self) -> bool {
        integrity_hash(&self.id, self.created_at, &self.kind, &self.payload)
            .map(|hash| hash == self.integrity_hash)
            .unwrap_or(false)
    }
}

/// Queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_count: usize,
    pub pending_count: usize,
    pub last_timestamp: Option<u64>,
}

/// Result of an integrity sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub bad: usize,
    pub bad_ids: Vec<MessageId>,
}

/// Append-only durable queue.
#[derive(Debug)]
pub struct DurableQueue {
    path: PathBuf,
    records: Vec<QueueRecord>,
    ids: HashSet<MessageId>,
    skipped_on_load: usize,
}

impl DurableQueue {
    /// Open (or create) the log at `path`.
    ///
    /// Fails only if the file exists but cannot be read.
    pub fn open<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path)?;

        let mut queue = Self {
            path,
            records: Vec::new(),
            ids: HashSet::new(),
            skipped_on_load: 0,
        };

        if queue.path.exists() {
            let content = std::fs::read_to_string(&queue.path)?;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueueRecord>(line) {
                    Ok(record) if queue.ids.contains(&record.id) => {
                        warn!(line = line_no + 1, id = %record.id, "Duplicate queue record skipped");
                        queue.skipped_on_load += 1;
                    }
                    Ok(record) => {
                        queue.ids.insert(record.id.clone());
                        queue.records.push(record);
                    }
                    Err(e) => {
                        warn!(line = line_no + 1, error = %e, "Corrupt queue record skipped");
                        queue.skipped_on_load += 1;
                    }
                }
            }
        }

        info!(
            path = %queue.path.display(),
            records = queue.records.len(),
            skipped = queue.skipped_on_load,
            "Durable queue opened"
        );
        Ok(queue)
    }

    /// Append a locally produced record.
    pub fn append(&mut self, kind: MessageKind, payload: Value) -> MeshResult<QueueRecord> {
        self.append_at(kind, payload, now_ms())
    }

    /// Append with an explicit creation time.
    pub fn append_at(
        &mut self,
        kind: MessageKind,
        payload: Value,
        created_at: u64,
    ) -> MeshResult<QueueRecord> {
        let id = new_message_id_at(created_at);
        let integrity_hash = integrity_hash(&id, created_at, &kind, &payload)?;
        let record = QueueRecord {
            id,
            created_at,
            kind,
            payload,
            schema_version: SCHEMA_VERSION,
            integrity_hash,
            sent: false,
            hop: 0,
            max_hop: DEFAULT_MAX_HOP,
            origin: RecordOrigin::Local,
        };
        self.push(record.clone())?;
        debug!(id = %record.id, kind = %record.kind, "Record appended");
        Ok(record)
    }

    /// Queue a relay copy of a received packet.
    ///
    /// Keeps the packet's id, timestamp and hash. Returns `None` if a record
    /// with this id is already in the log.
    pub fn append_relay(&mut self, packet: &CourierPacket) -> MeshResult<Option<QueueRecord>> {
        if self.ids.contains(&packet.id) {
            return Ok(None);
        }
        let record = QueueRecord {
            id: packet.id.clone(),
            created_at: packet.created_at,
            kind: packet.kind.clone(),
            payload: packet.payload.clone(),
            schema_version: SCHEMA_VERSION,
            integrity_hash: packet.integrity_hash.clone(),
            sent: false,
            hop: packet.hop,
            max_hop: packet.max_hop,
            origin: RecordOrigin::Relay,
        };
        self.push(record.clone())?;
        debug!(id = %record.id, hop = record.hop, "Relay copy appended");
        Ok(Some(record))
    }

    fn push(&mut self, record: QueueRecord) -> MeshResult<()> {
        self.ids.insert(record.id.clone());
        self.records.push(record);
        if let Err(e) = self.persist() {
            if let Some(record) = self.records.pop() {
                self.ids.remove(&record.id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// The most recent `limit` records, oldest first.
    pub fn list(&self, limit: usize, include_sent: bool) -> Vec<QueueRecord> {
        let mut tail: Vec<QueueRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| include_sent || !r.sent)
            .take(limit)
            .cloned()
            .collect();
        tail.reverse();
        tail
    }

    pub fn get(&self, id: &str) -> Option<&QueueRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Flag records as sent. Unknown ids and already-sent records are left
    /// alone; returns how many records changed.
    pub fn mark_sent<'a, I>(&mut self, ids: I) -> MeshResult<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted: HashSet<&str> = ids.into_iter().collect();
        let mut changed = Vec::new();
        for (index, record) in self.records.iter_mut().enumerate() {
            if !record.sent && wanted.contains(record.id.as_str()) {
                record.sent = true;
                changed.push(index);
            }
        }
        if changed.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist() {
            for index in &changed {
                self.records[*index].sent = false;
            }
            return Err(e);
        }
        debug!(count = changed.len(), "Records marked sent");
        Ok(changed.len())
    }

    /// Recompute hashes of the `sample_size` most recent records.
    ///
    /// Reports mismatches only; nothing is repaired.
    pub fn verify_integrity(&self, sample_size: usize) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        for record in self.records.iter().rev().take(sample_size) {
            report.checked += 1;
            if !record.verify() {
                report.bad += 1;
                report.bad_ids.push(record.id.clone());
            }
        }
        if report.bad > 0 {
            warn!(
                checked = report.checked,
                bad = report.bad,
                "Queue integrity mismatch detected"
            );
        }
        report
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total_count: self.records.len(),
            pending_count: self.records.iter().filter(|r| !r.sent).count(),
            last_timestamp: self.records.last().map(|r| r.created_at),
        }
    }

    /// Lines skipped as corrupt or duplicate when the log was opened.
    pub fn skipped_on_load(&self) -> usize {
        self.skipped_on_load
    }

    /// Drop sent records older than `retention_ms`. Returns how many went.
    pub fn compact(&mut self, retention_ms: u64, now: u64) -> MeshResult<usize> {
        let cutoff = now.saturating_sub(retention_ms);
        let snapshot = self.records.clone();
        self.records.retain(|r| !r.sent || r.created_at >= cutoff);
        let dropped = snapshot.len() - self.records.len();
        if dropped == 0 {
            return Ok(0);
        }
        if let Err(e) = self.persist() {
            self.records = snapshot;
            return Err(e);
        }
        self.ids = self.records.iter().map(|r| r.id.clone()).collect();
        info!(dropped, remaining = self.records.len(), "Queue compacted");
        Ok(dropped)
    }

    fn persist(&self) -> MeshResult<()> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())
            .map_err(|e| MeshError::QueueStorage(format!("{}: {}", self.path.display(), e)))
    }
}
