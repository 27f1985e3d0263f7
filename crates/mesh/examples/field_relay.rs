//! Field Relay - three phones in a line pass an SOS hop by hop
//!
//! ```text
//!   alpha ─── bravo ─── charlie
//! ```
//!
//! alpha and charlie cannot hear each other; bravo carries the message.
//!
//! Run with: cargo run -p lifeline-mesh --example field_relay

use lifeline_core::{logging, BusConfig, DutyCycle, MessageKind, PeerId};
use lifeline_mesh::MeshBus;
use lifeline_radio::SimAir;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let air = SimAir::new();
    air.block("alpha", "charlie");
    let root = tempfile::tempdir()?;

    let mut buses = Vec::new();
    for (name, id) in [("alpha", "a1a1a1a1"), ("bravo", "b2b2b2b2"), ("charlie", "c3c3c3c3")] {
        let mut config = BusConfig::with_data_dir(root.path().join(name));
        config.power.scan_window_ms = Some(1_000);
        config.power.sleep_window_ms = Some(2_000);

        let bus = MeshBus::builder(config, Arc::new(air.radio(name)))
            .peer_id(PeerId::from(id))
            .on_message(MessageKind::Sos, move |packet| {
                println!(
                    "[{}] SOS {} (hop {}): {}",
                    name, packet.id, packet.hop, packet.payload
                );
            })
            .build()?;
        bus.start().await?;
        buses.push(bus);
    }

    buses[0]
        .enqueue(
            MessageKind::Sos,
            json!({"lat": 38.4192, "lng": 27.1287, "people": 3, "note": "trapped, 2nd floor"}),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(10)).await;

    // Battery is low on bravo: stretch its duty cycle.
    buses[1].set_duty_cycle(DutyCycle::new(1_000, 5_000)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    for bus in &buses {
        let health = bus.health().await;
        println!(
            "[{}] rx={} relayed={} dup_drop={} peers={}",
            bus.peer_id(),
            health.totals.msgs_rx,
            health.totals.relayed,
            health.totals.dedup_dropped,
            health.peers.len()
        );
        bus.stop().await;
    }

    Ok(())
}
