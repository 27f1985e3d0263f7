//! Mesh Bus - the facade producers and consumers talk to
//!
//! Owns the shared stores and the two background tasks: the courier cycle
//! and the retry pump. Both stop on the same cancellation token.
//!
//! # Example
//!
//! ```no_run
//! use lifeline_core::{BusConfig, MessageKind};
//! use lifeline_mesh::MeshBus;
//! use lifeline_radio::SimAir;
//! use std::sync::Arc;
//!
//! # async fn run() -> lifeline_mesh::MeshResult<()> {
//! let air = SimAir::new();
//! let bus = MeshBus::builder(BusConfig::with_data_dir("./node-a"), Arc::new(air.radio("a")))
//!     .on_message(MessageKind::Sos, |packet| println!("sos {}", packet.id))
//!     .build()?;
//! bus.start().await?;
//! bus.enqueue(MessageKind::Sos, serde_json::json!({"people": 3})).await?;
//! bus.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::bundle::CourierPacket;
use crate::courier::{Courier, CourierPhase};
use crate::dispatch::Dispatcher;
use crate::error::{MeshError, MeshResult};
use crate::health::{HealthEvent, HealthEventKind, HealthSnapshot};
use crate::pump::TickOutcome;
use crate::queue::{IntegrityReport, QueueRecord, QueueStats};
use crate::state::MeshState;
use lifeline_core::{
    integrity_hash, new_message_id_at, now_ms, BusConfig, DutyCycle, MessageId, MessageKind,
    PeerId, PowerProfile,
};
use lifeline_radio::Radio;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builder for [`MeshBus`].
pub struct MeshBusBuilder {
    config: BusConfig,
    radio: Arc<dyn Radio>,
    dispatcher: Dispatcher,
    peer_id: Option<PeerId>,
}

impl MeshBusBuilder {
    /// Register a consumer for `kind`.
    pub fn on_message<F>(mut self, kind: impl Into<MessageKind>, handler: F) -> Self
    where
        F: Fn(&CourierPacket) + Send + Sync + 'static,
    {
        self.dispatcher.register(kind.into(), Arc::new(handler));
        self
    }

    /// Use a fixed peer id instead of the configured or derived one.
    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Validate the config and open the stores.
    pub fn build(self) -> MeshResult<MeshBus> {
        self.config.validate()?;

        let peer_id = self
            .peer_id
            .or_else(|| self.config.node.peer_id.as_deref().map(PeerId::from))
            .unwrap_or_else(PeerId::derive_session);
        let duty = self.config.power.duty_cycle();

        let state = MeshState::open(self.config, peer_id, self.dispatcher)?;
        let (duty_tx, _) = watch::channel(duty);
        let (phase_tx, phase_rx) = watch::channel(CourierPhase::Idle);

        Ok(MeshBus {
            state: Arc::new(state),
            radio: self.radio,
            duty_tx,
            phase_tx: Arc::new(phase_tx),
            phase_rx,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Offline mesh message bus.
pub struct MeshBus {
    state: Arc<MeshState>,
    radio: Arc<dyn Radio>,
    duty_tx: watch::Sender<DutyCycle>,
    phase_tx: Arc<watch::Sender<CourierPhase>>,
    phase_rx: watch::Receiver<CourierPhase>,
    running: Mutex<Option<Running>>,
}

impl MeshBus {
    pub fn builder(config: BusConfig, radio: Arc<dyn Radio>) -> MeshBusBuilder {
        MeshBusBuilder {
            config,
            radio,
            dispatcher: Dispatcher::new(),
            peer_id: None,
        }
    }

    /// This device's session peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.state.local_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.state.config
    }

    /// Persist a record and schedule it for delivery. Returns its id.
    pub async fn enqueue(&self, kind: MessageKind, payload: Value) -> MeshResult<MessageId> {
        let now = now_ms();
        let record = self.state.queue.lock().await.append_at(kind, payload, now)?;
        self.state.pump.lock().await.schedule(&record, now);
        if record.kind.is_ack() {
            self.state
                .record(HealthEvent::new(HealthEventKind::AckTx), now)
                .await;
        }
        debug!(id = %record.id, kind = %record.kind, "Enqueued");
        Ok(record.id)
    }

    /// Stage a packet for the next peer contacts without persisting it.
    pub async fn send_local(&self, kind: MessageKind, payload: Value) -> MeshResult<MessageId> {
        let now = now_ms();
        let id = new_message_id_at(now);
        let hash = integrity_hash(&id, now, &kind, &payload)?;
        let max_hop = self.state.config.courier.max_hop;
        let packet = CourierPacket {
            v: crate::bundle::WIRE_VERSION,
            id: id.clone(),
            created_at: now,
            kind,
            payload,
            integrity_hash: hash,
            hop: 0,
            max_hop,
        };
        let is_sos = packet.kind.is_sos();
        self.state.outbox.lock().await.push(packet, now);
        self.state
            .record(HealthEvent::new(HealthEventKind::MsgTx).sos(is_sos), now)
            .await;
        Ok(id)
    }

    /// Register a consumer for `kind` on a built bus.
    pub fn on_message<F>(&self, kind: impl Into<MessageKind>, handler: F)
    where
        F: Fn(&CourierPacket) + Send + Sync + 'static,
    {
        self.state.register(kind.into(), Arc::new(handler));
    }

    /// Spawn the courier cycle and the retry pump.
    pub async fn start(&self) -> MeshResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(MeshError::InvalidState("bus already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let courier = Courier::new(
            self.state.clone(),
            self.radio.clone(),
            self.duty_tx.subscribe(),
            self.phase_tx.clone(),
        );
        let courier_task = tokio::spawn(courier.run(cancel.clone()));
        let pump_task = tokio::spawn(run_pump(self.state.clone(), cancel.clone()));

        *running = Some(Running {
            cancel,
            tasks: vec![courier_task, pump_task],
        });
        info!(peer_id = %self.state.local_id, "Mesh bus started");
        Ok(())
    }

    /// Cancel both tasks, wait for them, then flush health.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Bus task ended abnormally");
            }
        }
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Health flush on stop failed");
        }
        info!(peer_id = %self.state.local_id, "Mesh bus stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Apply new scan/sleep windows. Takes effect at the next cycle.
    pub async fn set_duty_cycle(&self, duty: DutyCycle) {
        self.duty_tx.send_replace(duty);
        self.state.pump.lock().await.set_floor(duty.cycle_ms());
        info!(
            scan_ms = duty.scan_window_ms,
            sleep_ms = duty.sleep_window_ms,
            "Duty cycle updated"
        );
    }

    pub async fn set_power_profile(&self, profile: PowerProfile) {
        self.set_duty_cycle(profile.duty_cycle()).await;
    }

    pub fn duty_cycle(&self) -> DutyCycle {
        *self.duty_tx.borrow()
    }

    pub fn phase(&self) -> CourierPhase {
        *self.phase_rx.borrow()
    }

    pub async fn health(&self) -> HealthSnapshot {
        self.state.health.lock().await.read()
    }

    pub async fn stats(&self) -> QueueStats {
        self.state.queue.lock().await.stats()
    }

    pub async fn list(&self, limit: usize, include_sent: bool) -> Vec<QueueRecord> {
        self.state.queue.lock().await.list(limit, include_sent)
    }

    pub async fn verify_integrity(&self, sample_size: usize) -> IntegrityReport {
        self.state.queue.lock().await.verify_integrity(sample_size)
    }

    /// Drop sent records past the configured retention.
    pub async fn compact(&self) -> MeshResult<usize> {
        let retention = self.state.config.queue.retention_ms;
        self.state.queue.lock().await.compact(retention, now_ms())
    }

    /// Write the health doc if it changed.
    pub async fn flush(&self) -> MeshResult<bool> {
        self.state.health.lock().await.flush()
    }

    /// Run one pump pass now.
    pub async fn tick_pump(&self) -> TickOutcome {
        pump_tick(&self.state, now_ms()).await
    }

    /// Peer exchanges abandoned since startup.
    pub fn exchange_failures(&self) -> u64 {
        self.state.exchange_failures()
    }

    /// Rows in the received/forwarded ledger as `(received, forwarded)`.
    pub async fn ledger_counts(&self) -> MeshResult<(usize, usize)> {
        self.state.ledger.lock().await.counts()
    }
}

impl std::fmt::Debug for MeshBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshBus")
            .field("state", &self.state)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

async fn pump_tick(state: &MeshState, now: u64) -> TickOutcome {
    let tracked = state.pump.lock().await.ids();
    let sent: HashSet<MessageId> = {
        let queue = state.queue.lock().await;
        tracked
            .into_iter()
            .filter(|id| queue.get(id).map_or(true, |r| r.sent))
            .collect()
    };

    let outcome = state.pump.lock().await.tick(now, |id| sent.contains(id));

    for item in &outcome.due {
        let record = state.queue.lock().await.get(&item.id).cloned();
        let Some(record) = record else {
            continue;
        };
        state
            .outbox
            .lock()
            .await
            .push(CourierPacket::from(&record), now);
        state
            .record(
                HealthEvent::new(HealthEventKind::MsgTx).sos(record.kind.is_sos()),
                now,
            )
            .await;
    }
    for id in &outcome.expired {
        info!(id = %id, "Retry item expired without delivery");
    }
    outcome
}

async fn run_pump(state: Arc<MeshState>, cancel: CancellationToken) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(state.config.pump.tick_interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let flush_every = state.config.health.flush_interval_ms;
    let mut last_flush = now_ms();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = now_ms();
        pump_tick(&state, now).await;

        if now.saturating_sub(last_flush) >= flush_every {
            if let Err(e) = state.health.lock().await.flush() {
                warn!(error = %e, "Health flush failed");
            }
            last_flush = now;
        }
    }
    debug!("Pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_radio::SimAir;
    use serde_json::json;

    fn bus(dir: &tempfile::TempDir, air: &SimAir, address: &str) -> MeshBus {
        MeshBus::builder(BusConfig::with_data_dir(dir.path()), Arc::new(air.radio(address)))
            .peer_id(PeerId::from("aaaa0001"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_persists_and_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let bus = bus(&dir, &air, "a");

        let id = bus.enqueue(MessageKind::Sos, json!({"people": 2})).await.unwrap();
        assert_eq!(bus.stats().await.pending_count, 1);

        let outcome = bus.tick_pump().await;
        assert_eq!(outcome.due.len(), 1);
        assert_eq!(outcome.due[0].id, id);
        assert_eq!(bus.health().await.totals.msgs_tx, 1);
    }

    #[tokio::test]
    async fn test_ack_enqueue_counts_ack_tx() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let bus = bus(&dir, &air, "a");

        bus.enqueue(MessageKind::Ack, json!({"ref": "m1"})).await.unwrap();
        assert_eq!(bus.health().await.totals.acks_tx, 1);
    }

    #[tokio::test]
    async fn test_send_local_stages_without_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let bus = bus(&dir, &air, "a");

        bus.send_local(MessageKind::Presence, json!({})).await.unwrap();
        assert_eq!(bus.stats().await.total_count, 0);
        assert_eq!(bus.state.outbox.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pump_restored_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let id = {
            let bus = bus(&dir, &air, "a");
            bus.enqueue(MessageKind::Sos, json!({})).await.unwrap()
        };

        let air = SimAir::new();
        let bus = bus(&dir, &air, "a");
        let outcome = bus.tick_pump().await;
        assert_eq!(outcome.due.first().map(|i| i.id.clone()), Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let bus = bus(&dir, &air, "a");

        bus.start().await.unwrap();
        assert!(matches!(bus.start().await, Err(MeshError::InvalidState(_))));
        tokio::time::sleep(Duration::from_secs(1)).await;

        bus.stop().await;
        assert!(!bus.is_running().await);
        assert_eq!(bus.phase(), CourierPhase::Idle);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_ledger_counts_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let bus = bus(&dir, &air, "a");

        bus.enqueue(MessageKind::Sos, json!({})).await.unwrap();
        assert_eq!(bus.ledger_counts().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_power_profile_changes_duty_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let bus = bus(&dir, &air, "a");

        bus.set_power_profile(PowerProfile::Survival).await;
        assert_eq!(bus.duty_cycle(), PowerProfile::Survival.duty_cycle());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let air = SimAir::new();
        let mut config = BusConfig::with_data_dir(dir.path());
        config.courier.chunk_size = 0;
        let result = MeshBus::builder(config, Arc::new(air.radio("a"))).build();
        assert!(matches!(result, Err(MeshError::Core(_))));
    }
}
