//! Received Ledger - who gave us which message, and whom we gave it to
//!
//! Persists `(message_id, from_peer)` for every packet ingested and
//! `(message_id, peer_id)` for every packet offered, so an id is never
//! offered back to the peer it came from or re-offered to a peer that
//! already has it, even across restarts.

use crate::error::MeshResult;
use lifeline_core::PeerId;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// SQLite-backed received/forwarded ledger.
#[derive(Debug)]
pub struct ReceivedLedger {
    db: Connection,
}

impl ReceivedLedger {
    /// Open the ledger at `path` (`":memory:"` for a throwaway one).
    pub fn open<P: AsRef<Path>>(path: P) -> MeshResult<Self> {
        let db = Connection::open(path)?;

        let _mode: String = db.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS received (
                message_id TEXT NOT NULL,
                from_peer TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, from_peer)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS forwarded (
                message_id TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                forwarded_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, peer_id)
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_received_at ON received(received_at)",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_forwarded_at ON forwarded(forwarded_at)",
            [],
        )?;

        Ok(Self { db })
    }

    /// Record that `from` handed us `message_id`. Returns `false` if this
    /// pair was already known.
    pub fn record_received(&self, message_id: &str, from: &PeerId, at: u64) -> MeshResult<bool> {
        let inserted = self.db.execute(
            "INSERT OR IGNORE INTO received (message_id, from_peer, received_at)
             VALUES (?1, ?2, ?3)",
            params![message_id, from.as_str(), at as i64],
        )?;
        Ok(inserted > 0)
    }

    /// Record that `ids` were offered to `peer`, in one transaction.
    pub fn mark_forwarded<'a, I>(&mut self, ids: I, peer: &PeerId, at: u64) -> MeshResult<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let tx = self.db.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO forwarded (message_id, peer_id, forwarded_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for id in ids {
                inserted += stmt.execute(params![id, peer.as_str(), at as i64])?;
            }
        }
        tx.commit()?;
        debug!(peer = %peer, inserted, "Forwarded ids recorded");
        Ok(inserted)
    }

    /// Whether `message_id` was already offered to, or received from, `peer`.
    pub fn forwarded_to(&self, message_id: &str, peer: &PeerId) -> MeshResult<bool> {
        let found: Option<i64> = self
            .db
            .query_row(
                "SELECT 1 FROM forwarded WHERE message_id = ?1 AND peer_id = ?2
                 UNION ALL
                 SELECT 1 FROM received WHERE message_id = ?1 AND from_peer = ?2
                 LIMIT 1",
                params![message_id, peer.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The subset of `ids` that `peer` already has.
    pub fn forwarded_filter<'a, I>(&self, ids: I, peer: &PeerId) -> MeshResult<HashSet<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut known = HashSet::new();
        for id in ids {
            if self.forwarded_to(id, peer)? {
                known.insert(id.to_string());
            }
        }
        Ok(known)
    }

    /// Row counts `(received, forwarded)`.
    pub fn counts(&self) -> MeshResult<(usize, usize)> {
        let received: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM received", [], |row| row.get(0))?;
        let forwarded: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM forwarded", [], |row| row.get(0))?;
        Ok((received as usize, forwarded as usize))
    }

    /// Delete rows older than `cutoff`. Returns rows removed.
    pub fn prune_before(&self, cutoff: u64) -> MeshResult<usize> {
        let cutoff = cutoff as i64;
        let received = self
            .db
            .execute("DELETE FROM received WHERE received_at < ?1", [cutoff])?;
        let forwarded = self
            .db
            .execute("DELETE FROM forwarded WHERE forwarded_at < ?1", [cutoff])?;
        Ok(received + forwarded)
    }
}
