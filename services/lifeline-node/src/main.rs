use anyhow::{bail, Context, Result};
use lifeline_core::{logging, BusConfig, MessageKind, PeerId};
use lifeline_mesh::MeshBus;
use lifeline_radio::SimAir;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = lifeline_mesh::WIRE_VERSION as u32;
const NODE_RUNTIME_VERSION: u32 = 1;
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[derive(Debug, Default)]
struct NodeArgs {
    config: Option<PathBuf>,
    sim_peers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let node_args = parse_args(&args)?;
    let config = match &node_args.config {
        Some(path) => BusConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => BusConfig::with_data_dir("lifeline-data"),
    };
    logging::init_with(config.node.log_format);

    let air = SimAir::new();
    let data_dir = config.node.data_dir.clone();
    let bus = MeshBus::builder(config.clone(), Arc::new(air.radio("local")))
        .on_message(MessageKind::Sos, |packet| {
            info!(id = %packet.id, hop = packet.hop, payload = %packet.payload, "SOS received");
        })
        .on_message(MessageKind::Note, |packet| {
            info!(id = %packet.id, hop = packet.hop, "Note received");
        })
        .build()
        .context("opening local mesh bus")?;

    let neighbours = spawn_sim_peers(&air, &config, node_args.sim_peers).await?;

    bus.start().await?;
    info!(
        peer_id = %bus.peer_id(),
        data_dir = %data_dir.display(),
        sim_peers = neighbours.len(),
        "lifeline-node started"
    );

    let mut health_timer = tokio::time::interval(HEALTH_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = health_timer.tick() => {
                let health = bus.health().await;
                let stats = bus.stats().await;
                let (ledger_received, ledger_forwarded) = match bus.ledger_counts().await {
                    Ok(counts) => counts,
                    Err(e) => {
                        warn!(error = %e, "Ledger counts unavailable");
                        (0, 0)
                    }
                };
                info!(
                    pending = stats.pending_count,
                    ledger_received,
                    ledger_forwarded,
                    msgs_rx = health.totals.msgs_rx,
                    relayed = health.totals.relayed,
                    dedup_dropped = health.totals.dedup_dropped,
                    peers = health.peers.len(),
                    success_rate = health.success_rate,
                    "Health"
                );
            }
        }
    }

    info!("Shutting down");
    bus.stop().await;
    for neighbour in &neighbours {
        neighbour.stop().await;
    }
    Ok(())
}

/// Start `count` simulated neighbours on the shared air. The first one
/// raises an SOS so the local node has traffic to carry.
async fn spawn_sim_peers(air: &SimAir, base: &BusConfig, count: usize) -> Result<Vec<MeshBus>> {
    let mut neighbours = Vec::with_capacity(count);
    for index in 0..count {
        let name = format!("sim-{}", index);
        let mut config = base.clone();
        config.node.data_dir = base.node.data_dir.join(&name);
        config.node.peer_id = None;

        let bus = MeshBus::builder(config, Arc::new(air.radio(name.as_str())))
            .peer_id(PeerId::new(format!("{:08x}", 0x5151_0000 + index)))
            .build()
            .with_context(|| format!("opening simulated peer {}", name))?;
        bus.start().await?;

        if index == 0 {
            bus.enqueue(
                MessageKind::Sos,
                json!({"note": "simulated distress", "people": 2}),
            )
            .await?;
        }
        neighbours.push(bus);
    }
    Ok(neighbours)
}

fn parse_args(args: &[String]) -> Result<NodeArgs> {
    let mut parsed = NodeArgs::default();
    let mut args_iter = args.iter().skip(1);
    while let Some(arg) = args_iter.next() {
        match arg.as_str() {
            "--config" => match args_iter.next() {
                Some(path) => parsed.config = Some(PathBuf::from(path)),
                None => bail!("--config was provided without a path"),
            },
            "--sim-peers" => match args_iter.next() {
                Some(count) => {
                    parsed.sim_peers = count
                        .parse()
                        .with_context(|| format!("invalid --sim-peers value {:?}", count))?
                }
                None => bail!("--sim-peers was provided without a count"),
            },
            other => bail!("unknown argument {:?}", other),
        }
    }
    Ok(parsed)
}
