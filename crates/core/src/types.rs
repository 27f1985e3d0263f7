//! Core types shared across the bus: message kinds, identifiers, time and
//! canonical hashing.

use crate::error::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Message identifier (time-ordered hex prefix + random suffix)
pub type MessageId = String;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a globally unique message id.
///
/// The fixed-width hex timestamp prefix keeps ids lexically ordered by
/// creation time; the random suffix separates ids minted in the same
/// millisecond on different devices.
pub fn new_message_id() -> MessageId {
    new_message_id_at(now_ms())
}

/// Generate a message id with an explicit timestamp prefix.
pub fn new_message_id_at(timestamp_ms: u64) -> MessageId {
    let mut suffix = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{:013x}-{}", timestamp_ms, hex::encode(suffix))
}

/// Short device identifier carried in advertisements and bundles.
///
/// Stable for the lifetime of a session, never tied to the radio's MAC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Length of a derived peer id in hex characters.
    pub const LEN: usize = 8;

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a fresh per-session id from random bytes and the clock.
    pub fn derive_session() -> Self {
        let mut seed = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut seed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seed);
        hasher.update(&now_ms().to_le_bytes());
        let digest = hex::encode(hasher.finalize().as_bytes());
        Self(digest[..Self::LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Message kinds carried on the bus.
///
/// The bus attaches no meaning to a kind beyond dispatch, relay eligibility
/// and lane selection. Kinds this build does not know travel as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Sos,
    Status,
    Note,
    Ack,
    Ulb,
    UlbAck,
    RouteShare,
    Presence,
    ConvoyPing,
    Task,
    Bulletin,
    Help,
    Inventory,
    Drawing,
    Road,
    Occupancy,
    Approval,
    Triage,
    PackOffer,
    PackReq,
    PackChunk,
    EewAlert,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Sos => "sos",
            MessageKind::Status => "status",
            MessageKind::Note => "note",
            MessageKind::Ack => "ack",
            MessageKind::Ulb => "ulb",
            MessageKind::UlbAck => "ulb_ack",
            MessageKind::RouteShare => "route_share",
            MessageKind::Presence => "presence",
            MessageKind::ConvoyPing => "convoy_ping",
            MessageKind::Task => "task",
            MessageKind::Bulletin => "bulletin",
            MessageKind::Help => "help",
            MessageKind::Inventory => "inventory",
            MessageKind::Drawing => "drawing",
            MessageKind::Road => "road",
            MessageKind::Occupancy => "occupancy",
            MessageKind::Approval => "approval",
            MessageKind::Triage => "triage",
            MessageKind::PackOffer => "pack_offer",
            MessageKind::PackReq => "pack_req",
            MessageKind::PackChunk => "pack_chunk",
            MessageKind::EewAlert => "eew_alert",
            MessageKind::Other(kind) => kind,
        }
    }

    /// Small, safety-relevant kinds that may be flooded onward.
    /// Bulk transfer chunks are never relayed.
    pub fn is_relayable(&self) -> bool {
        matches!(
            self,
            MessageKind::Sos
                | MessageKind::Ack
                | MessageKind::Ulb
                | MessageKind::UlbAck
                | MessageKind::RouteShare
                | MessageKind::EewAlert
                | MessageKind::PackOffer
                | MessageKind::PackReq
        )
    }

    /// Application-level acknowledgement kinds.
    pub fn is_ack(&self) -> bool {
        matches!(self, MessageKind::Ack | MessageKind::UlbAck)
    }

    /// Life-safety kinds.
    pub fn is_sos(&self) -> bool {
        matches!(self, MessageKind::Sos | MessageKind::EewAlert)
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        match value {
            "sos" => MessageKind::Sos,
            "status" => MessageKind::Status,
            "note" => MessageKind::Note,
            "ack" => MessageKind::Ack,
            "ulb" => MessageKind::Ulb,
            "ulb_ack" => MessageKind::UlbAck,
            "route_share" => MessageKind::RouteShare,
            "presence" => MessageKind::Presence,
            "convoy_ping" => MessageKind::ConvoyPing,
            "task" => MessageKind::Task,
            "bulletin" => MessageKind::Bulletin,
            "help" => MessageKind::Help,
            "inventory" => MessageKind::Inventory,
            "drawing" => MessageKind::Drawing,
            "road" => MessageKind::Road,
            "occupancy" => MessageKind::Occupancy,
            "approval" => MessageKind::Approval,
            "triage" => MessageKind::Triage,
            "pack_offer" => MessageKind::PackOffer,
            "pack_req" => MessageKind::PackReq,
            "pack_chunk" => MessageKind::PackChunk,
            "eew_alert" => MessageKind::EewAlert,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        MessageKind::from(value.as_str())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&sorted(value))?)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (key, inner) in entries {
                out.insert(key.clone(), sorted(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// BLAKE3 integrity hash over `id | created_at | kind | canonical(payload)`,
/// hex encoded.
pub fn integrity_hash(
    id: &str,
    created_at: u64,
    kind: &MessageKind,
    payload: &Value,
) -> Result<String> {
    let canonical = canonical_json(payload)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(b"|");
    hasher.update(created_at.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_ids_are_unique_and_time_ordered() {
        let a = new_message_id_at(1_000);
        let b = new_message_id_at(1_000);
        let c = new_message_id_at(2_000);
        assert_ne!(a, b);
        assert!(a < c && b < c);
    }

    #[test]
    fn test_peer_id_length() {
        let id = PeerId::derive_session();
        assert_eq!(id.as_str().len(), PeerId::LEN);
        assert_ne!(id, PeerId::derive_session());
    }

    #[test]
    fn test_kind_string_round_trip() {
        for name in ["sos", "ulb_ack", "route_share", "eew_alert", "pack_chunk"] {
            assert_eq!(MessageKind::from(name).as_str(), name);
        }
        let unknown = MessageKind::from("fam_checkin");
        assert_eq!(unknown, MessageKind::Other("fam_checkin".to_string()));
        assert_eq!(unknown.as_str(), "fam_checkin");
    }

    #[test]
    fn test_kind_serializes_as_plain_string() {
        let json = serde_json::to_string(&MessageKind::RouteShare).unwrap();
        assert_eq!(json, "\"route_share\"");
        let kind: MessageKind = serde_json::from_str("\"sos\"").unwrap();
        assert_eq!(kind, MessageKind::Sos);
    }

    #[test]
    fn test_bulk_transfer_is_not_relayable() {
        assert!(MessageKind::Sos.is_relayable());
        assert!(MessageKind::UlbAck.is_relayable());
        assert!(!MessageKind::PackChunk.is_relayable());
        assert!(!MessageKind::Note.is_relayable());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "c": [{"y": 1, "x": 2}]}});
        let canonical = canonical_json(&value).unwrap();
        assert_eq!(canonical, r#"{"a":{"c":[{"x":2,"y":1}],"z":true},"b":1}"#);
    }

    #[test]
    fn test_integrity_hash_key_order_independent() {
        let kind = MessageKind::Sos;
        let h1 = integrity_hash("m1", 10, &kind, &json!({"lat": 1.0, "lng": 2.0})).unwrap();
        let h2 = integrity_hash("m1", 10, &kind, &json!({"lng": 2.0, "lat": 1.0})).unwrap();
        let h3 = integrity_hash("m1", 11, &kind, &json!({"lat": 1.0, "lng": 2.0})).unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }
}
