//! Test utilities for multi-node mesh scenarios

use lifeline_core::{BusConfig, MessageKind, PeerId};
use lifeline_mesh::{MeshBus, MeshResult};
use lifeline_radio::SimAir;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Duration;

/// Scan window used by every test node
pub const SCAN_MS: u64 = 1_000;
/// Sleep window used by every test node
pub const SLEEP_MS: u64 = 2_000;

/// Install a test-friendly subscriber once. Later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Default bus config rooted at `dir` with short duty windows.
pub fn test_config(dir: &TempDir) -> BusConfig {
    let mut config = BusConfig::with_data_dir(dir.path());
    config.power.scan_window_ms = Some(SCAN_MS);
    config.power.sleep_window_ms = Some(SLEEP_MS);
    config.courier.io_timeout_ms = 500;
    config.courier.connect_timeout_ms = 500;
    config
}

/// One simulated phone: a bus on the shared air, its storage and a counter
/// of SOS handler calls.
pub struct TestNode {
    pub name: &'static str,
    pub peer_id: PeerId,
    pub bus: MeshBus,
    pub sos_calls: Arc<AtomicUsize>,
    air: SimAir,
    dir: TempDir,
}

impl TestNode {
    pub fn new(air: &SimAir, name: &'static str, peer_id: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sos_calls = Arc::new(AtomicUsize::new(0));
        let peer_id = PeerId::from(peer_id);
        let bus = Self::open(air, name, &peer_id, &dir, sos_calls.clone()).unwrap();
        Self {
            name,
            peer_id,
            bus,
            sos_calls,
            air: air.clone(),
            dir,
        }
    }

    fn open(
        air: &SimAir,
        name: &'static str,
        peer_id: &PeerId,
        dir: &TempDir,
        calls: Arc<AtomicUsize>,
    ) -> MeshResult<MeshBus> {
        MeshBus::builder(test_config(dir), Arc::new(air.radio(name)))
            .peer_id(peer_id.clone())
            .on_message(MessageKind::Sos, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .build()
    }

    /// Stop the bus and open a fresh one over the same storage.
    pub async fn restart(&mut self) -> MeshResult<()> {
        self.bus.stop().await;
        self.bus = Self::open(
            &self.air,
            self.name,
            &self.peer_id,
            &self.dir,
            self.sos_calls.clone(),
        )?;
        Ok(())
    }

    pub fn sos_calls(&self) -> usize {
        self.sos_calls.load(Ordering::SeqCst)
    }
}

/// Start every node's bus.
pub async fn start_all(nodes: &[&TestNode]) {
    for node in nodes {
        node.bus.start().await.unwrap();
    }
}

/// Stop every node's bus.
pub async fn stop_all(nodes: &[&TestNode]) {
    for node in nodes {
        node.bus.stop().await;
    }
}

/// Let `cycles` full duty cycles elapse.
pub async fn run_cycles(cycles: u64) {
    tokio::time::sleep(Duration::from_millis(cycles * (SCAN_MS + SLEEP_MS))).await;
}

/// Block every pair of `names` not listed in `links`.
pub fn topology(air: &SimAir, names: &[&str], links: &[(&str, &str)]) {
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            let linked = links
                .iter()
                .any(|(x, y)| (x == a && y == b) || (x == b && y == a));
            if !linked {
                air.block(a, b);
            }
        }
    }
}
