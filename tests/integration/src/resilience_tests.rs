//! Flaky radios, partitions and restarts
//!
//! # Test Scenarios
//!
//! 1. **Stalled peer**: reads never complete, the exchange is abandoned and the courier moves on
//! 2. **Refused peer**: connects fail every cycle without stopping the bus
//! 3. **Partition heal**: a message waits in the queue until a peer comes into range
//! 4. **Restart**: pending records survive a stop and reopen
//! 5. **Shutdown**: stop is idempotent and leaves the courier idle
//! 6. **Known peers**: a neighbour that stays in range is handshaken once

use crate::test_utils::*;
use lifeline_core::MessageKind;
use lifeline_mesh::CourierPhase;
use lifeline_radio::{SimAir, SimFaults};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_stalled_peer_is_abandoned() {
    init_test_tracing();
    let air = SimAir::new();
    let alpha = TestNode::new(&air, "alpha", "aaaa0001");
    let bravo = TestNode::new(&air, "bravo", "bbbb0002");
    air.set_faults(
        "bravo",
        SimFaults {
            stall_reads: true,
            ..SimFaults::default()
        },
    );

    alpha
        .bus
        .enqueue(MessageKind::Sos, json!({"people": 2}))
        .await
        .unwrap();
    start_all(&[&alpha, &bravo]).await;
    run_cycles(3).await;

    assert!(alpha.bus.exchange_failures() > 0);
    assert!(alpha.bus.is_running().await);
    // the central writes before it reads, so the SOS still landed
    assert_eq!(bravo.sos_calls(), 1);

    stop_all(&[&alpha, &bravo]).await;
    assert_eq!(alpha.bus.phase(), CourierPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_refused_peer_counts_failures_each_cycle() {
    init_test_tracing();
    let air = SimAir::new();
    let alpha = TestNode::new(&air, "alpha", "aaaa0001");
    let bravo = TestNode::new(&air, "bravo", "bbbb0002");
    air.set_faults(
        "bravo",
        SimFaults {
            refuse_connect: true,
            ..SimFaults::default()
        },
    );

    start_all(&[&alpha, &bravo]).await;
    run_cycles(4).await;
    stop_all(&[&alpha, &bravo]).await;

    assert!(air.connect_count("alpha", "bravo") >= 3);
    assert!(alpha.bus.exchange_failures() >= 3);
    assert_eq!(bravo.bus.exchange_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_partition_heal_delivers_queued_message() {
    init_test_tracing();
    let air = SimAir::new();
    let alpha = TestNode::new(&air, "alpha", "aaaa0001");
    let bravo = TestNode::new(&air, "bravo", "bbbb0002");
    air.block("alpha", "bravo");

    alpha
        .bus
        .enqueue(MessageKind::Sos, json!({"people": 5}))
        .await
        .unwrap();
    start_all(&[&alpha, &bravo]).await;
    run_cycles(3).await;
    assert_eq!(bravo.sos_calls(), 0);
    assert_eq!(alpha.bus.stats().await.pending_count, 1);

    air.unblock("alpha", "bravo");
    run_cycles(3).await;
    stop_all(&[&alpha, &bravo]).await;

    assert_eq!(bravo.sos_calls(), 1);
    assert_eq!(alpha.bus.stats().await.pending_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_keeps_pending_records_and_delivers_them() {
    init_test_tracing();
    let air = SimAir::new();
    let mut alpha = TestNode::new(&air, "alpha", "aaaa0001");
    let bravo = TestNode::new(&air, "bravo", "bbbb0002");

    let id = alpha
        .bus
        .enqueue(MessageKind::Sos, json!({"note": "before restart"}))
        .await
        .unwrap();
    alpha.restart().await.unwrap();

    let pending = alpha.bus.list(10, false).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    let report = alpha.bus.verify_integrity(10).await;
    assert_eq!(report.checked, 1);
    assert_eq!(report.bad, 0);

    start_all(&[&alpha, &bravo]).await;
    run_cycles(3).await;
    stop_all(&[&alpha, &bravo]).await;
    assert_eq!(bravo.sos_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_restartable() {
    init_test_tracing();
    let air = SimAir::new();
    let alpha = TestNode::new(&air, "alpha", "aaaa0001");

    alpha.bus.start().await.unwrap();
    assert!(alpha.bus.start().await.is_err());
    run_cycles(1).await;

    alpha.bus.stop().await;
    alpha.bus.stop().await;
    assert!(!alpha.bus.is_running().await);
    assert_eq!(alpha.bus.phase(), CourierPhase::Idle);

    alpha.bus.start().await.unwrap();
    assert!(alpha.bus.is_running().await);
    alpha.bus.stop().await;
    assert_eq!(alpha.bus.phase(), CourierPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_neighbour_in_range_is_handshaken_once() {
    init_test_tracing();
    let air = SimAir::new();
    let alpha = TestNode::new(&air, "alpha", "aaaa0001");
    let bravo = TestNode::new(&air, "bravo", "bbbb0002");

    start_all(&[&alpha, &bravo]).await;
    run_cycles(5).await;
    assert_eq!(air.connect_count("alpha", "bravo"), 1);
    assert_eq!(air.connect_count("bravo", "alpha"), 1);

    // bravo leaves for a while, then comes back
    air.block("alpha", "bravo");
    run_cycles(2).await;
    air.unblock("alpha", "bravo");
    run_cycles(2).await;
    stop_all(&[&alpha, &bravo]).await;

    assert_eq!(air.connect_count("alpha", "bravo"), 2);
    assert_eq!(air.connect_count("bravo", "alpha"), 2);
}
