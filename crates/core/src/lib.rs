//! Core functionality for the Lifeline offline mesh bus.
//!
//! This crate provides the configuration, logging, error and shared types
//! used by the radio and mesh crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    BusConfig, CourierConfig, DedupConfig, DutyCycle, HealthConfig, LogFormat, NodeConfig,
    PowerConfig, PowerProfile, PumpConfig, QueueConfig,
};
pub use error::{CoreError, Result};
pub use types::{
    canonical_json, integrity_hash, new_message_id, new_message_id_at, now_ms, MessageId,
    MessageKind, PeerId,
};
