//! Courier - duty-cycled peer discovery and bundle exchange
//!
//! ```text
//! Idle ─▶ Scanning ─▶ Connecting ─▶ Exchanging ─▶ Sleeping ─▶ Scanning ...
//!             │           (per newly heard peer)       ▲
//!             └───────────── no peers ─────────────────┘
//! ```
//!
//! As a central the courier writes its bundle first, then reads the peer's.
//! As a peripheral it ingests bundles written into its inbox and serves its
//! own bundle from its outbox. Both sides ingest the same way:
//!
//! 1. record `(id, from_peer)` so the id is never offered back to that peer
//! 2. drop duplicates through the loop guard
//! 3. dispatch by kind
//! 4. queue a relay copy with `hop + 1` when the relay policy allows
//!
//! A peer is exchanged with once while it stays in range. It is forgotten
//! when a scan no longer hears it, and handled again when it returns. Radio
//! failures abandon the peer for this cycle only; they never escape the
//! courier.

use crate::bundle::{encode_frames, BundleAssembler, CourierBundle, CourierPacket};
use crate::error::{MeshResult, TransientError};
use crate::health::{HealthEvent, HealthEventKind};
use crate::pump::Lane;
use crate::queue::QueueRecord;
use crate::relay::RelayDecision;
use crate::state::MeshState;
use async_trait::async_trait;
use lifeline_core::{now_ms, DutyCycle, MessageId, PeerId};
use lifeline_radio::{Advertisement, DeviceAddress, Hello, Link, Peripheral, Radio, RadioError};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Where the courier is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CourierPhase {
    Idle,
    Scanning,
    Connecting,
    Exchanging,
    Sleeping,
}

/// What one inbound bundle produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Packets that passed the integrity check
    pub received: usize,
    /// Packets dropped for a hash mismatch
    pub corrupt: usize,
    /// Packets dropped by the loop guard
    pub duplicates: usize,
    /// Packets handed to the dispatcher
    pub dispatched: usize,
    /// Relay copies queued
    pub relayed: usize,
}

/// Result of a completed central-side exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReport {
    pub peer: PeerId,
    pub offered: usize,
    pub received: IngestReport,
}

/// A bundle prepared for one peer.
#[derive(Debug)]
pub(crate) struct Offer {
    pub(crate) bundle: CourierBundle,
    pub(crate) ids: Vec<MessageId>,
}

/// Await a radio operation with a deadline.
async fn timed<T, F>(op: &'static str, timeout_ms: u64, fut: F) -> Result<T, TransientError>
where
    F: Future<Output = Result<T, RadioError>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result.map_err(TransientError::from),
        Err(_) => Err(TransientError::Timeout { op, timeout_ms }),
    }
}

/// Pending records: sos lane first, then newest first.
fn prioritise(mut records: Vec<QueueRecord>) -> Vec<QueueRecord> {
    records.sort_by_key(|r| (Lane::for_kind(&r.kind) != Lane::Sos, Reverse(r.created_at)));
    records
}

impl MeshState {
    /// Build the outbound bundle for `peer`.
    ///
    /// Outbox entries come first, then queue records from the candidate
    /// window, pending before sent. Anything `peer` already has is skipped.
    pub(crate) async fn build_offer(&self, peer: Option<&PeerId>, now: u64) -> MeshResult<Offer> {
        let courier = &self.config.courier;
        let staged = self.outbox.lock().await.snapshot(now);
        let window = self.queue.lock().await.list(courier.candidate_window, true);
        let (pending, sent): (Vec<QueueRecord>, Vec<QueueRecord>) =
            window.into_iter().partition(|r| !r.sent);

        let mut candidates = staged;
        candidates.extend(prioritise(pending).iter().map(CourierPacket::from));
        candidates.extend(sent.iter().rev().map(CourierPacket::from));

        let known = match peer {
            Some(peer) => self
                .ledger
                .lock()
                .await
                .forwarded_filter(candidates.iter().map(|p| p.id.as_str()), peer)?,
            None => HashSet::new(),
        };

        let mut chosen = HashSet::new();
        let items: Vec<CourierPacket> = candidates
            .into_iter()
            .filter(|p| !known.contains(&p.id))
            .filter(|p| chosen.insert(p.id.clone()))
            .take(courier.bundle_cap)
            .collect();
        let ids = items.iter().map(|p| p.id.clone()).collect();

        Ok(Offer {
            bundle: CourierBundle::new(self.local_id.clone(), items),
            ids,
        })
    }

    /// Bookkeeping after `offer` went out: mark records sent and remember
    /// that `peer` has them.
    pub(crate) async fn record_offer(
        &self,
        offer: &Offer,
        peer: Option<&PeerId>,
        now: u64,
    ) -> MeshResult<()> {
        if !offer.ids.is_empty() {
            let ids = || offer.ids.iter().map(String::as_str);
            self.queue.lock().await.mark_sent(ids())?;
            if let Some(peer) = peer {
                self.ledger.lock().await.mark_forwarded(ids(), peer, now)?;
            }
        }

        let mut event = HealthEvent::new(HealthEventKind::BundleTx);
        if let Some(peer) = peer {
            event = event.with_peer(peer);
        }
        self.record(event, now).await;
        debug!(
            peer = peer.map(PeerId::as_str).unwrap_or("?"),
            items = offer.ids.len(),
            "Bundle offered"
        );
        Ok(())
    }

    /// Ingest a bundle received from a peer.
    pub(crate) async fn ingest(&self, bundle: CourierBundle, now: u64) -> MeshResult<IngestReport> {
        let from = bundle.from;
        let mut report = IngestReport::default();

        self.record(HealthEvent::new(HealthEventKind::BundleRx).with_peer(&from), now)
            .await;

        if from == self.local_id {
            warn!(peer = %from, "Ignoring bundle carrying our own peer id");
            return Ok(report);
        }

        for packet in bundle.items {
            if !packet.verify() {
                warn!(id = %packet.id, peer = %from, "Packet failed integrity check, dropped");
                report.corrupt += 1;
                continue;
            }
            report.received += 1;

            self.ledger
                .lock()
                .await
                .record_received(&packet.id, &from, now)?;
            self.record(
                HealthEvent::new(HealthEventKind::MsgRx)
                    .with_peer(&from)
                    .with_hop(packet.hop)
                    .sos(packet.kind.is_sos()),
                now,
            )
            .await;

            let seen = self.guard.lock().await.seen_at(&packet.id, now);
            let held = !seen && self.queue.lock().await.contains(&packet.id);
            if seen || held {
                trace!(id = %packet.id, peer = %from, "Duplicate dropped");
                report.duplicates += 1;
                self.record(
                    HealthEvent::new(HealthEventKind::DupDrop).with_peer(&from),
                    now,
                )
                .await;
                continue;
            }

            if packet.kind.is_ack() {
                self.record(HealthEvent::new(HealthEventKind::AckRx).with_peer(&from), now)
                    .await;
            }

            if self.dispatch(&packet) > 0 {
                report.dispatched += 1;
            }

            match self.relay.decide(&packet) {
                RelayDecision::Relay(copy) => {
                    let appended = self.queue.lock().await.append_relay(&copy)?;
                    if let Some(record) = appended {
                        self.pump.lock().await.schedule(&record, now);
                        self.record(
                            HealthEvent::new(HealthEventKind::Relayed)
                                .with_hop(copy.hop)
                                .sos(copy.kind.is_sos()),
                            now,
                        )
                        .await;
                        report.relayed += 1;
                    }
                }
                decision => {
                    trace!(id = %packet.id, decision = ?decision, "Not relayed");
                }
            }
        }

        if report.received + report.corrupt > 0 {
            debug!(
                peer = %from,
                received = report.received,
                duplicates = report.duplicates,
                relayed = report.relayed,
                "Bundle ingested"
            );
        }
        Ok(report)
    }
}

/// Peripheral side: inbox writes and outbox reads from connecting centrals.
///
/// A served bundle is committed (records marked sent, forwarded ledger,
/// `bundle_tx`) only once the central has read its last frame. A read that
/// stalls or a link that drops leaves the records to be offered again.
pub(crate) struct CourierPeripheral {
    state: Arc<MeshState>,
    sessions: Mutex<HashMap<DeviceAddress, InboundSession>>,
}

struct InboundSession {
    assembler: BundleAssembler,
    /// Learned from the central's bundle
    peer: Option<PeerId>,
    /// Served to the central but not yet fully read
    served: Option<Offer>,
}

impl InboundSession {
    fn new(max_bytes: usize) -> Self {
        Self {
            assembler: BundleAssembler::new(max_bytes),
            peer: None,
            served: None,
        }
    }
}

impl CourierPeripheral {
    pub(crate) fn new(state: Arc<MeshState>) -> Self {
        Self {
            state,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn serve(&self, peer: Option<&PeerId>) -> MeshResult<(Offer, Vec<String>)> {
        let offer = self.state.build_offer(peer, now_ms()).await?;
        let frames = encode_frames(&offer.bundle, self.state.config.courier.chunk_size)?;
        Ok((offer, frames))
    }
}

#[async_trait]
impl Peripheral for CourierPeripheral {
    async fn on_write(&self, central: &DeviceAddress, frame: String) {
        let completed = {
            let mut sessions = self.sessions.lock().await;
            let max_bytes = self.state.config.courier.max_bundle_bytes;
            let session = sessions
                .entry(central.clone())
                .or_insert_with(|| InboundSession::new(max_bytes));
            match session.assembler.push(&frame) {
                Ok(Some(bundle)) => {
                    session.peer = Some(bundle.from.clone());
                    Some(bundle)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(central = %central, error = %e, "Inbound bundle discarded");
                    None
                }
            }
        };

        if let Some(bundle) = completed {
            if let Err(e) = self.state.ingest(bundle, now_ms()).await {
                warn!(central = %central, error = %e, "Inbound bundle ingestion failed");
            }
        }
    }

    async fn on_read(&self, central: &DeviceAddress) -> Vec<String> {
        let peer = self
            .sessions
            .lock()
            .await
            .get(central)
            .and_then(|s| s.peer.clone());

        let (offer, frames) = match self.serve(peer.as_ref()).await {
            Ok(served) => served,
            Err(e) => {
                warn!(central = %central, error = %e, "Could not serve outbox");
                return Vec::new();
            }
        };

        let max_bytes = self.state.config.courier.max_bundle_bytes;
        self.sessions
            .lock()
            .await
            .entry(central.clone())
            .or_insert_with(|| InboundSession::new(max_bytes))
            .served = Some(offer);
        frames
    }

    async fn on_read_complete(&self, central: &DeviceAddress) {
        let served = self
            .sessions
            .lock()
            .await
            .get_mut(central)
            .and_then(|s| s.served.take().map(|offer| (offer, s.peer.clone())));

        if let Some((offer, peer)) = served {
            if let Err(e) = self.state.record_offer(&offer, peer.as_ref(), now_ms()).await {
                warn!(central = %central, error = %e, "Could not commit served bundle");
            }
        }
    }

    async fn on_disconnect(&self, central: &DeviceAddress) {
        let Some(session) = self.sessions.lock().await.remove(central) else {
            return;
        };
        if session.assembler.buffered() > 0 {
            debug!(
                central = %central,
                bytes = session.assembler.buffered(),
                "Central left mid-write, partial bundle dropped"
            );
        }
        if let Some(offer) = session.served {
            debug!(
                central = %central,
                items = offer.ids.len(),
                "Served bundle not fully read, records stay pending"
            );
        }
    }
}

/// Central side: the scan/exchange/sleep cycle.
pub(crate) struct Courier {
    state: Arc<MeshState>,
    radio: Arc<dyn Radio>,
    peripheral: Arc<dyn Peripheral>,
    duty: watch::Receiver<DutyCycle>,
    phase: Arc<watch::Sender<CourierPhase>>,
    /// Peers already exchanged with and still in range
    known_peers: HashSet<PeerId>,
}

/// Pick the advertisements worth an exchange this cycle and forget peers
/// that were not heard, so they are handled again when they come back.
///
/// Each peer appears at most once, whatever number of addresses it used.
fn fresh_peers(
    known: &mut HashSet<PeerId>,
    local: &PeerId,
    ads: Vec<Advertisement>,
) -> Vec<Advertisement> {
    let heard: HashSet<&PeerId> = ads.iter().map(|ad| &ad.hello.did).collect();
    known.retain(|peer| heard.contains(peer));

    let mut picked = HashSet::new();
    ads.into_iter()
        .filter(|ad| &ad.hello.did != local && !known.contains(&ad.hello.did))
        .filter(|ad| picked.insert(ad.hello.did.clone()))
        .collect()
}

impl Courier {
    pub(crate) fn new(
        state: Arc<MeshState>,
        radio: Arc<dyn Radio>,
        duty: watch::Receiver<DutyCycle>,
        phase: Arc<watch::Sender<CourierPhase>>,
    ) -> Self {
        let peripheral: Arc<dyn Peripheral> = Arc::new(CourierPeripheral::new(state.clone()));
        Self {
            state,
            radio,
            peripheral,
            duty,
            phase,
            known_peers: HashSet::new(),
        }
    }

    fn set_phase(&self, phase: CourierPhase) {
        self.phase.send_replace(phase);
    }

    async fn advertise(&self) {
        let pending = self.state.queue.lock().await.stats().pending_count;
        let hello = Hello::new(self.state.local_id.clone(), pending);
        if let Err(e) = self.radio.advertise(hello, self.peripheral.clone()).await {
            warn!(error = %e, "Advertising failed");
        }
    }

    /// Run cycles until `cancel` fires. In-flight radio work is dropped.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        info!(peer_id = %self.state.local_id, "Courier started");
        self.advertise().await;

        'cycle: loop {
            let duty = *self.duty.borrow_and_update();

            self.set_phase(CourierPhase::Scanning);
            let heard = tokio::select! {
                _ = cancel.cancelled() => break 'cycle,
                heard = self.radio.scan(Duration::from_millis(duty.scan_window_ms)) => heard,
            };
            let fresh = match heard {
                Ok(ads) => fresh_peers(&mut self.known_peers, &self.state.local_id, ads),
                Err(e) => {
                    warn!(error = %e, "Scan failed");
                    Vec::new()
                }
            };

            for ad in fresh {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break 'cycle,
                    outcome = self.exchange(&ad) => outcome,
                };
                match outcome {
                    Ok(report) => {
                        debug!(
                            peer = %report.peer,
                            offered = report.offered,
                            received = report.received.received,
                            "Exchange complete"
                        );
                        self.known_peers.insert(ad.hello.did.clone());
                    }
                    Err(e) => {
                        self.state.note_exchange_failure();
                        warn!(
                            peer = %ad.hello.did,
                            address = %ad.address,
                            error = %e,
                            "Exchange abandoned"
                        );
                    }
                }
            }

            self.advertise().await;
            self.set_phase(CourierPhase::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break 'cycle,
                _ = tokio::time::sleep(Duration::from_millis(duty.sleep_window_ms)) => {}
            }
        }

        self.set_phase(CourierPhase::Idle);
        if let Err(e) = self.radio.stop_advertising().await {
            warn!(error = %e, "Stop advertising failed");
        }
        info!(peer_id = %self.state.local_id, "Courier stopped");
    }

    /// Connect, swap bundles, disconnect.
    pub(crate) async fn exchange(&self, ad: &Advertisement) -> Result<ExchangeReport, TransientError> {
        let config = &self.state.config.courier;

        self.set_phase(CourierPhase::Connecting);
        let mut link = timed(
            "connect",
            config.connect_timeout_ms,
            self.radio.connect(&ad.address),
        )
        .await?;

        self.set_phase(CourierPhase::Exchanging);
        let result = self.converse(link.as_mut(), &ad.hello.did).await;

        if let Err(e) = timed("disconnect", config.disconnect_timeout_ms, link.disconnect()).await {
            debug!(address = %ad.address, error = %e, "Disconnect did not complete");
        }
        result
    }

    async fn converse(
        &self,
        link: &mut dyn Link,
        peer: &PeerId,
    ) -> Result<ExchangeReport, TransientError> {
        let config = &self.state.config.courier;

        let offer = self.state.build_offer(Some(peer), now_ms()).await?;
        let frames = encode_frames(&offer.bundle, config.chunk_size)?;
        for frame in &frames {
            timed("write", config.io_timeout_ms, link.write(frame)).await?;
        }
        self.state.record_offer(&offer, Some(peer), now_ms()).await?;

        let mut assembler = BundleAssembler::new(config.max_bundle_bytes);
        let mut inbound = None;
        while let Some(frame) = timed("read", config.io_timeout_ms, link.read()).await? {
            if let Some(bundle) = assembler
                .push(&frame)
                .map_err(|e| TransientError::Decode(e.to_string()))?
            {
                inbound = Some(bundle);
                break;
            }
        }

        let received = match inbound {
            Some(bundle) => {
                if &bundle.from != peer {
                    debug!(advertised = %peer, bundle = %bundle.from, "Peer id changed mid-session");
                }
                self.state.ingest(bundle, now_ms()).await?
            }
            None => IngestReport::default(),
        };

        Ok(ExchangeReport {
            peer: peer.clone(),
            offered: offer.ids.len(),
            received,
        })
    }
}
