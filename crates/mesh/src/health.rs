//! Health Telemetry - mesh quality counters for field operators
//!
//! Aggregates increment events from the pump and courier into lifetime
//! totals, per-peer contact stats and 5-minute buckets over a rolling 24h
//! window. The doc is persisted as JSON and only written when dirty.

use crate::error::MeshResult;
use crate::store::{ensure_parent, write_atomic};
use lifeline_core::{now_ms, HealthConfig, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DOC_VERSION: u32 = 1;

/// Kinds of health events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEventKind {
    BundleTx,
    BundleRx,
    MsgTx,
    MsgRx,
    Relayed,
    AckTx,
    AckRx,
    DupDrop,
}

impl HealthEventKind {
    fn is_bundle(self) -> bool {
        matches!(self, HealthEventKind::BundleTx | HealthEventKind::BundleRx)
    }
}

/// One increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub kind: HealthEventKind,
    pub peer: Option<PeerId>,
    pub hop: Option<u8>,
    pub is_sos: bool,
}

impl HealthEvent {
    pub fn new(kind: HealthEventKind) -> Self {
        Self {
            kind,
            peer: None,
            hop: None,
            is_sos: false,
        }
    }

    pub fn with_peer(mut self, peer: &PeerId) -> Self {
        self.peer = Some(peer.clone());
        self
    }

    pub fn with_hop(mut self, hop: u8) -> Self {
        self.hop = Some(hop);
        self
    }

    pub fn sos(mut self, is_sos: bool) -> Self {
        self.is_sos = is_sos;
        self
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthTotals {
    pub bundles_tx: u64,
    pub bundles_rx: u64,
    pub msgs_tx: u64,
    pub msgs_rx: u64,
    pub relayed: u64,
    pub acks_tx: u64,
    pub acks_rx: u64,
    pub dedup_dropped: u64,
    pub hop_in_sum: u64,
    pub hop_in_count: u64,
    pub hop_out_sum: u64,
    pub hop_out_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStat {
    pub last_seen: u64,
    pub contact_count: u64,
}

/// Activity within one bucket window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBucket {
    pub bucket_start: u64,
    pub tx: u64,
    pub rx: u64,
    pub sos_count: u64,
}

/// Persisted telemetry document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthDoc {
    pub version: u32,
    pub totals: HealthTotals,
    pub peers: BTreeMap<String, PeerStat>,
    pub buckets: Vec<HealthBucket>,
    pub last_gc_at: u64,
    pub peers_seen_24h: usize,
}

impl Default for HealthDoc {
    fn default() -> Self {
        Self {
            version: DOC_VERSION,
            totals: HealthTotals::default(),
            peers: BTreeMap::new(),
            buckets: Vec::new(),
            last_gc_at: 0,
            peers_seen_24h: 0,
        }
    }
}

/// Peer entry in a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub last_seen: u64,
    pub contact_count: u64,
}

/// Read-only view returned by [`HealthTelemetry::read`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub totals: HealthTotals,
    pub success_rate: f64,
    pub avg_hop_out: f64,
    pub avg_hop_in: f64,
    pub peers: Vec<PeerSummary>,
    pub buckets: Vec<HealthBucket>,
    pub peers_seen_24h: usize,
    pub last_gc_at: u64,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Telemetry aggregator.
#[derive(Debug)]
pub struct HealthTelemetry {
    path: Option<PathBuf>,
    doc: HealthDoc,
    config: HealthConfig,
    dirty: bool,
}

impl HealthTelemetry {
    /// Load the doc at `path`, starting fresh if missing or corrupt.
    pub fn open<P: AsRef<Path>>(path: P, config: HealthConfig) -> MeshResult<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent(&path)?;

        let (doc, dirty) = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<HealthDoc>(&content) {
                Ok(doc) => (doc, false),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt health doc replaced");
                    (HealthDoc::default(), true)
                }
            }
        } else {
            (HealthDoc::default(), false)
        };

        info!(
            path = %path.display(),
            peers = doc.peers.len(),
            buckets = doc.buckets.len(),
            "Health telemetry opened"
        );
        Ok(Self {
            path: Some(path),
            doc,
            config,
            dirty,
        })
    }

    /// Aggregator without a backing file.
    pub fn in_memory(config: HealthConfig) -> Self {
        Self {
            path: None,
            doc: HealthDoc::default(),
            config,
            dirty: false,
        }
    }

    pub fn increment(&mut self, event: HealthEvent) {
        self.increment_at(event, now_ms());
    }

    pub fn increment_at(&mut self, event: HealthEvent, now: u64) {
        let totals = &mut self.doc.totals;
        match event.kind {
            HealthEventKind::BundleTx => totals.bundles_tx += 1,
            HealthEventKind::BundleRx => totals.bundles_rx += 1,
            HealthEventKind::MsgTx => totals.msgs_tx += 1,
            HealthEventKind::MsgRx => {
                totals.msgs_rx += 1;
                if let Some(hop) = event.hop {
                    totals.hop_in_sum += u64::from(hop);
                    totals.hop_in_count += 1;
                }
            }
            HealthEventKind::Relayed => {
                totals.relayed += 1;
                if let Some(hop) = event.hop {
                    totals.hop_out_sum += u64::from(hop);
                    totals.hop_out_count += 1;
                }
            }
            HealthEventKind::AckTx => totals.acks_tx += 1,
            HealthEventKind::AckRx => totals.acks_rx += 1,
            HealthEventKind::DupDrop => totals.dedup_dropped += 1,
        }

        if let Some(peer) = &event.peer {
            self.touch_peer(peer, now, event.kind.is_bundle());
        }

        let (tx, rx) = match event.kind {
            HealthEventKind::MsgTx | HealthEventKind::Relayed => (1, 0),
            HealthEventKind::MsgRx => (0, 1),
            _ => (0, 0),
        };
        let sos = u64::from(event.is_sos);
        if tx + rx + sos > 0 {
            let bucket = self.bucket_mut(now);
            bucket.tx += tx;
            bucket.rx += rx;
            bucket.sos_count += sos;
        }

        self.dirty = true;
        self.maybe_gc(now);
    }

    fn touch_peer(&mut self, peer: &PeerId, now: u64, contact: bool) {
        let stat = self.doc.peers.entry(peer.as_str().to_string()).or_default();
        stat.last_seen = stat.last_seen.max(now);
        if contact {
            stat.contact_count += 1;
        }

        while self.doc.peers.len() > self.config.peer_cap {
            let stalest = self
                .doc
                .peers
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(id, _)| id.clone());
            match stalest {
                Some(id) => {
                    self.doc.peers.remove(&id);
                }
                None => break,
            }
        }
    }

    fn bucket_mut(&mut self, now: u64) -> &mut HealthBucket {
        let width = self.config.bucket_width_ms.max(1);
        let start = now - now % width;
        let needs_new = self
            .doc
            .buckets
            .last()
            .map_or(true, |b| b.bucket_start != start);
        if needs_new {
            self.doc.buckets.push(HealthBucket {
                bucket_start: start,
                ..HealthBucket::default()
            });
        }
        let last = self.doc.buckets.len() - 1;
        &mut self.doc.buckets[last]
    }

    fn maybe_gc(&mut self, now: u64) {
        if now.saturating_sub(self.doc.last_gc_at) >= self.config.gc_interval_ms {
            self.gc(now);
        }
    }

    /// Drop buckets past retention and recount recently seen peers.
    pub fn gc(&mut self, now: u64) {
        let cutoff = now.saturating_sub(self.config.retention_ms);
        let before = self.doc.buckets.len();
        self.doc.buckets.retain(|b| b.bucket_start >= cutoff);
        self.doc.peers_seen_24h = self
            .doc
            .peers
            .values()
            .filter(|s| s.last_seen >= cutoff)
            .count();
        self.doc.last_gc_at = now;
        self.dirty = true;
        debug!(
            dropped_buckets = before - self.doc.buckets.len(),
            peers_seen = self.doc.peers_seen_24h,
            "Health gc"
        );
    }

    /// Aggregated view. Never mutates the doc.
    pub fn read(&self) -> HealthSnapshot {
        let totals = self.doc.totals.clone();
        let mut peers: Vec<PeerSummary> = self
            .doc
            .peers
            .iter()
            .map(|(id, stat)| PeerSummary {
                peer_id: PeerId::new(id.clone()),
                last_seen: stat.last_seen,
                contact_count: stat.contact_count,
            })
            .collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers.truncate(self.config.read_peer_limit);

        HealthSnapshot {
            success_rate: ratio(totals.acks_tx, totals.msgs_tx),
            avg_hop_out: ratio(totals.hop_out_sum, totals.hop_out_count),
            avg_hop_in: ratio(totals.hop_in_sum, totals.hop_in_count),
            totals,
            peers,
            buckets: self.doc.buckets.clone(),
            peers_seen_24h: self.doc.peers_seen_24h,
            last_gc_at: self.doc.last_gc_at,
        }
    }

    pub fn doc(&self) -> &HealthDoc {
        &self.doc
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the doc if anything changed. Returns whether a write happened.
    pub fn flush(&mut self) -> MeshResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(false);
        };
        let json = serde_json::to_vec_pretty(&self.doc)?;
        write_atomic(path, &json)?;
        self.dirty = false;
        debug!(path = %path.display(), "Health doc flushed");
        Ok(true)
    }
}
