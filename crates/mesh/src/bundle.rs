//! Courier wire format.
//!
//! A bundle is JSON, base64 encoded (standard alphabet), cut into fixed-size
//! frames for the radio's small per-write payload, and terminated by a frame
//! carrying base64 of `{"end":true}`. No compression, no encryption.
//!
//! ```text
//! { "v":1, "from":"a1b2c3d4",
//!   "items":[ { "v":1, "id", "ts", "kind", "payload", "hash", "hop", "maxHop" } ] }
//! ```

use crate::error::{MeshError, MeshResult};
use crate::queue::QueueRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lifeline_core::{integrity_hash, MessageId, MessageKind, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire format version
pub const WIRE_VERSION: u8 = 1;

/// Hop budget given to packets that do not carry one
pub const DEFAULT_MAX_HOP: u8 = 8;

const END_MARKER: &[u8] = br#"{"end":true}"#;

fn wire_version() -> u8 {
    WIRE_VERSION
}

fn default_max_hop() -> u8 {
    DEFAULT_MAX_HOP
}

/// Radio-compact projection of a queue record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierPacket {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub id: MessageId,
    #[serde(rename = "ts")]
    pub created_at: u64,
    pub kind: MessageKind,
    pub payload: Value,
    #[serde(rename = "hash")]
    pub integrity_hash: String,
    /// Times this packet has been relayed
    #[serde(default)]
    pub hop: u8,
    #[serde(rename = "maxHop", default = "default_max_hop")]
    pub max_hop: u8,
}

impl CourierPacket {
    /// Remaining hop budget.
    pub fn ttl(&self) -> u8 {
        self.max_hop.saturating_sub(self.hop)
    }

    /// Whether the carried hash matches the packet content.
    pub fn verify(&self) -> bool {
        integrity_hash(&self.id, self.created_at, &self.kind, &self.payload)
            .map(|hash| hash == self.integrity_hash)
            .unwrap_or(false)
    }
}

impl From<&QueueRecord> for CourierPacket {
    fn from(record: &QueueRecord) -> Self {
        Self {
            v: WIRE_VERSION,
            id: record.id.clone(),
            created_at: record.created_at,
            kind: record.kind.clone(),
            payload: record.payload.clone(),
            integrity_hash: record.integrity_hash.clone(),
            hop: record.hop,
            max_hop: record.max_hop,
        }
    }
}

/// The unit exchanged per peer contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierBundle {
    #[serde(default = "wire_version")]
    pub v: u8,
    pub from: PeerId,
    #[serde(default)]
    pub items: Vec<CourierPacket>,
}

impl CourierBundle {
    pub fn new(from: PeerId, items: Vec<CourierPacket>) -> Self {
        Self {
            v: WIRE_VERSION,
            from,
            items,
        }
    }
}

/// The terminating frame.
pub fn end_frame() -> String {
    STANDARD.encode(END_MARKER)
}

fn is_end_frame(frame: &str) -> bool {
    STANDARD
        .decode(frame)
        .map(|bytes| bytes == END_MARKER)
        .unwrap_or(false)
}

/// Serialize a bundle into radio frames, end frame included.
pub fn encode_frames(bundle: &CourierBundle, chunk_size: usize) -> MeshResult<Vec<String>> {
    if chunk_size == 0 {
        return Err(MeshError::Codec("chunk size must be > 0".to_string()));
    }
    let json = serde_json::to_vec(bundle)?;
    let encoded = STANDARD.encode(json);

    // base64 output is ASCII, so byte chunks are char chunks.
    let mut frames: Vec<String> = encoded
        .as_bytes()
        .chunks(chunk_size)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();
    frames.push(end_frame());
    Ok(frames)
}

/// Reassembles frames from one sender into a bundle.
#[derive(Debug)]
pub struct BundleAssembler {
    buffer: String,
    max_bytes: usize,
}

impl BundleAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_bytes,
        }
    }

    /// Feed one frame. Returns the bundle once the end frame arrives.
    ///
    /// On error the partial buffer is discarded.
    pub fn push(&mut self, frame: &str) -> MeshResult<Option<CourierBundle>> {
        if is_end_frame(frame) {
            let encoded = std::mem::take(&mut self.buffer);
            return decode_bundle(&encoded).map(Some);
        }
        if self.buffer.len() + frame.len() > self.max_bytes {
            let size = self.buffer.len() + frame.len();
            self.buffer.clear();
            return Err(MeshError::Codec(format!(
                "bundle exceeds {} bytes ({} buffered)",
                self.max_bytes, size
            )));
        }
        self.buffer.push_str(frame);
        Ok(None)
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_bundle(encoded: &str) -> MeshResult<CourierBundle> {
    let json = STANDARD.decode(encoded)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Reassemble a complete frame stream. `None` if the end frame never came.
pub fn decode_frames<'a, I>(frames: I, max_bytes: usize) -> MeshResult<Option<CourierBundle>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut assembler = BundleAssembler::new(max_bytes);
    for frame in frames {
        if let Some(bundle) = assembler.push(frame)? {
            return Ok(Some(bundle));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_core::new_message_id_at;
    use serde_json::json;

    fn packet(n: u64) -> CourierPacket {
        let id = new_message_id_at(1_700_000_000_000 + n);
        let kind = MessageKind::Sos;
        let payload = json!({"lat": 38.42, "lng": 27.14, "note": format!("trapped #{}", n)});
        let integrity_hash = integrity_hash(&id, 1_700_000_000_000 + n, &kind, &payload).unwrap();
        CourierPacket {
            v: WIRE_VERSION,
            id,
            created_at: 1_700_000_000_000 + n,
            kind,
            payload,
            integrity_hash,
            hop: (n % 3) as u8,
            max_hop: DEFAULT_MAX_HOP,
        }
    }

    fn round_trip(count: u64) {
        let bundle = CourierBundle::new(PeerId::from("a1b2c3d4"), (0..count).map(packet).collect());
        let frames = encode_frames(&bundle, 160).unwrap();

        assert_eq!(frames.last().unwrap(), &end_frame());
        assert!(frames[..frames.len() - 1].iter().all(|f| f.len() <= 160));

        let decoded = decode_frames(frames.iter().map(String::as_str), 64 * 1024)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, bundle);
        assert_eq!(
            serde_json::to_vec(&decoded).unwrap(),
            serde_json::to_vec(&bundle).unwrap()
        );
    }

    #[test]
    fn test_round_trip_empty_bundle() {
        round_trip(0);
    }

    #[test]
    fn test_round_trip_single_packet() {
        round_trip(1);
    }

    #[test]
    fn test_round_trip_full_bundle() {
        round_trip(12);
    }

    #[test]
    fn test_end_frame_encoding() {
        assert_eq!(end_frame(), "eyJlbmQiOnRydWV9");
    }

    #[test]
    fn test_wire_field_names() {
        let bundle = CourierBundle::new(PeerId::from("a1b2c3d4"), vec![packet(1)]);
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["from"], "a1b2c3d4");
        let item = &value["items"][0];
        for field in ["v", "id", "ts", "kind", "payload", "hash", "hop", "maxHop"] {
            assert!(item.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(item["kind"], "sos");
    }

    #[test]
    fn test_packet_without_hop_fields_gets_defaults() {
        let item = json!({
            "v": 1, "id": "m1", "ts": 5, "kind": "status",
            "payload": {"ok": true}, "hash": "00"
        });
        let packet: CourierPacket = serde_json::from_value(item).unwrap();
        assert_eq!(packet.hop, 0);
        assert_eq!(packet.max_hop, DEFAULT_MAX_HOP);
        assert_eq!(packet.ttl(), DEFAULT_MAX_HOP);
    }

    #[test]
    fn test_assembler_rejects_oversized_stream() {
        let bundle = CourierBundle::new(PeerId::from("a1b2c3d4"), (0..12).map(packet).collect());
        let frames = encode_frames(&bundle, 160).unwrap();

        let result = decode_frames(frames.iter().map(String::as_str), 512);
        assert!(matches!(result, Err(MeshError::Codec(_))));
    }

    #[test]
    fn test_garbage_before_end_frame_is_a_codec_error() {
        let frames = vec!["!!not-base64!!".to_string(), end_frame()];
        let result = decode_frames(frames.iter().map(String::as_str), 1024);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_end_frame_yields_nothing() {
        let bundle = CourierBundle::new(PeerId::from("a1b2c3d4"), vec![packet(1)]);
        let mut frames = encode_frames(&bundle, 160).unwrap();
        frames.pop();
        let result = decode_frames(frames.iter().map(String::as_str), 1024).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_packet_verify_detects_tamper() {
        let mut p = packet(7);
        assert!(p.verify());
        p.payload = json!({"lat": 0.0});
        assert!(!p.verify());
    }
}
