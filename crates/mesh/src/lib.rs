//! Lifeline Mesh - offline message bus over short-range radio
//!
//! Moves short emergency messages device to device, hop by hop, with no
//! internet or cellular link.
//!
//! # Core Components
//!
//! - **Durable Queue**: append-only record log, the source of truth for what must leave the device
//! - **Loop Guard**: short-horizon memory of processed ids that stops endless re-broadcast
//! - **Retry Pump**: periodic redelivery with priority lanes and capped backoff
//! - **Courier**: duty-cycled scan, connect and bundle exchange with nearby peers
//! - **Health Telemetry**: throughput, relay and peer-churn counters for the field
//!
//! # Design Principles
//!
//! 1. **Nothing silently lost**: records persist before anything is sent
//! 2. **Flood with limits**: relays pass the loop guard and a hop budget
//! 3. **Radio is flaky**: peer failures are transient, logged and counted
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use lifeline_core::{BusConfig, MessageKind};
//! use lifeline_mesh::MeshBus;
//! use lifeline_radio::SimAir;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let air = SimAir::new();
//! let bus = MeshBus::builder(BusConfig::with_data_dir("/tmp/lifeline-a"), Arc::new(air.radio("a")))
//!     .on_message(MessageKind::Sos, |packet| println!("SOS from the mesh: {}", packet.payload))
//!     .build()?;
//!
//! bus.start().await?;
//! let id = bus.enqueue(MessageKind::Sos, serde_json::json!({"people": 4})).await?;
//! println!("queued {}", id);
//!
//! let health = bus.health().await;
//! println!("relayed: {}", health.totals.relayed);
//! bus.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod bus;
pub mod courier;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod outbox;
pub mod pump;
pub mod queue;
pub mod received;
pub mod relay;
mod state;
mod store;

// Re-export main types
pub use bundle::{
    decode_frames, encode_frames, end_frame, BundleAssembler, CourierBundle, CourierPacket,
    DEFAULT_MAX_HOP, WIRE_VERSION,
};
pub use bus::{MeshBus, MeshBusBuilder};
pub use courier::{CourierPhase, ExchangeReport, IngestReport};
pub use dedup::LoopGuard;
pub use dispatch::{Dispatcher, MessageHandler};
pub use error::{MeshError, MeshResult, TransientError};
pub use health::{
    HealthBucket, HealthDoc, HealthEvent, HealthEventKind, HealthSnapshot, HealthTelemetry,
    HealthTotals, PeerStat, PeerSummary,
};
pub use outbox::Outbox;
pub use pump::{Lane, RetryItem, RetryPump, TickOutcome};
pub use queue::{DurableQueue, IntegrityReport, QueueRecord, QueueStats, RecordOrigin};
pub use received::ReceivedLedger;
pub use relay::{RelayDecision, RelayPolicy};
pub use state::{HEALTH_FILE, LEDGER_FILE, QUEUE_FILE};
