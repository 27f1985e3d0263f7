//! Stores shared by the courier, the pump and the bus facade.
//!
//! Each store has its own async mutex. Callers lock one store at a time and
//! never hold a guard across a radio operation.

use crate::bundle::CourierPacket;
use crate::dedup::LoopGuard;
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::error::MeshResult;
use crate::health::{HealthEvent, HealthTelemetry};
use crate::outbox::Outbox;
use crate::pump::RetryPump;
use crate::queue::DurableQueue;
use crate::received::ReceivedLedger;
use crate::relay::RelayPolicy;
use lifeline_core::{now_ms, BusConfig, MessageKind, PeerId};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::info;

pub const QUEUE_FILE: &str = "queue.log";
pub const LEDGER_FILE: &str = "received.db";
pub const HEALTH_FILE: &str = "health.json";

pub(crate) struct MeshState {
    pub(crate) local_id: PeerId,
    pub(crate) config: BusConfig,
    pub(crate) relay: RelayPolicy,
    dispatcher: RwLock<Dispatcher>,
    pub(crate) queue: Mutex<DurableQueue>,
    pub(crate) ledger: Mutex<ReceivedLedger>,
    pub(crate) guard: Mutex<LoopGuard>,
    pub(crate) outbox: Mutex<Outbox>,
    pub(crate) health: Mutex<HealthTelemetry>,
    pub(crate) pump: Mutex<RetryPump>,
    exchange_failures: AtomicU64,
}

impl MeshState {
    /// Open every store under `config.node.data_dir`, compact the queue and
    /// rebuild the pump from pending records.
    pub(crate) fn open(
        config: BusConfig,
        local_id: PeerId,
        dispatcher: Dispatcher,
    ) -> MeshResult<Self> {
        let dir: &Path = &config.node.data_dir;
        std::fs::create_dir_all(dir)?;
        let now = now_ms();

        let mut queue = DurableQueue::open(dir.join(QUEUE_FILE))?;
        queue.compact(config.queue.retention_ms, now)?;

        let ledger = ReceivedLedger::open(dir.join(LEDGER_FILE))?;
        ledger.prune_before(now.saturating_sub(config.queue.retention_ms))?;

        let health = HealthTelemetry::open(dir.join(HEALTH_FILE), config.health.clone())?;

        let mut pump = RetryPump::new(config.pump.clone(), config.power.duty_cycle().cycle_ms());
        let pending = queue.list(usize::MAX, false);
        pump.restore(&pending, now);

        info!(
            peer_id = %local_id,
            data_dir = %dir.display(),
            pending = pending.len(),
            "Mesh stores opened"
        );

        Ok(Self {
            relay: RelayPolicy::from_config(&config.courier),
            guard: Mutex::new(LoopGuard::from_config(&config.dedup)),
            outbox: Mutex::new(Outbox::new(
                config.courier.outbox_capacity,
                config.courier.outbox_ttl_ms,
            )),
            queue: Mutex::new(queue),
            ledger: Mutex::new(ledger),
            health: Mutex::new(health),
            pump: Mutex::new(pump),
            exchange_failures: AtomicU64::new(0),
            local_id,
            config,
            dispatcher: RwLock::new(dispatcher),
        })
    }

    pub(crate) async fn record(&self, event: HealthEvent, now: u64) {
        self.health.lock().await.increment_at(event, now);
    }

    pub(crate) fn register(&self, kind: MessageKind, handler: MessageHandler) {
        self.dispatcher
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(kind, handler);
    }

    /// Run the handlers for `packet`. No store lock is held here.
    pub(crate) fn dispatch(&self, packet: &CourierPacket) -> usize {
        self.dispatcher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatch(packet)
    }

    pub(crate) fn note_exchange_failure(&self) {
        self.exchange_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn exchange_failures(&self) -> u64 {
        self.exchange_failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MeshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshState")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}
