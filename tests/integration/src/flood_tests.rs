//! Flooding across multi-hop topologies
//!
//! # Test Scenarios
//!
//! 1. **Line relay**: alpha and charlie cannot hear each other, bravo carries the SOS
//! 2. **Diamond**: two carriers meet delta with the same message, it is consumed once
//! 3. **Origin echo**: a node never consumes its own message coming back

use crate::test_utils::*;
use lifeline_core::MessageKind;
use lifeline_radio::SimAir;
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_line_topology_relays_sos_hop_by_hop() {
    init_test_tracing();
    let air = SimAir::new();
    let alpha = TestNode::new(&air, "alpha", "aaaa0001");
    let bravo = TestNode::new(&air, "bravo", "bbbb0002");
    let charlie = TestNode::new(&air, "charlie", "cccc0003");
    topology(
        &air,
        &["alpha", "bravo", "charlie"],
        &[("alpha", "bravo"), ("bravo", "charlie")],
    );

    alpha
        .bus
        .enqueue(MessageKind::Sos, json!({"people": 3}))
        .await
        .unwrap();
    start_all(&[&alpha, &bravo, &charlie]).await;
    run_cycles(6).await;
    stop_all(&[&alpha, &bravo, &charlie]).await;

    assert_eq!(bravo.sos_calls(), 1);
    assert_eq!(charlie.sos_calls(), 1);
    assert_eq!(alpha.sos_calls(), 0);

    let bravo_health = bravo.bus.health().await;
    assert!(bravo_health.totals.relayed >= 1);
    let charlie_health = charlie.bus.health().await;
    assert!(charlie_health.totals.msgs_rx >= 1);
    assert!(charlie_health.avg_hop_in >= 1.0);

    // charlie holds a relay copy one hop further along
    let held = charlie.bus.list(10, true).await;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].hop, 2);
}

#[tokio::test(start_paused = true)]
async fn test_diamond_delivers_once_and_drops_duplicate() {
    init_test_tracing();
    let air = SimAir::new();
    let origin = TestNode::new(&air, "origin", "0e0e0e0e");
    let left = TestNode::new(&air, "left", "1e1e1e1e");
    let right = TestNode::new(&air, "right", "2e2e2e2e");
    let delta = TestNode::new(&air, "delta", "3e3e3e3e");
    topology(
        &air,
        &["origin", "left", "right", "delta"],
        &[("origin", "left"), ("origin", "right")],
    );

    let id = origin
        .bus
        .enqueue(MessageKind::Sos, json!({"note": "collapsed stairwell"}))
        .await
        .unwrap();
    let nodes = [&origin, &left, &right, &delta];
    start_all(&nodes).await;
    run_cycles(3).await;
    assert_eq!(left.sos_calls(), 1);
    assert_eq!(right.sos_calls(), 1);
    assert_eq!(delta.sos_calls(), 0);

    // delta walks into range of both carriers
    air.unblock("left", "delta");
    air.unblock("right", "delta");
    run_cycles(4).await;
    stop_all(&nodes).await;

    assert_eq!(delta.sos_calls(), 1);
    assert_eq!(left.sos_calls(), 1);
    assert_eq!(right.sos_calls(), 1);

    let mut dropped = 0;
    for node in &nodes {
        dropped += node.bus.health().await.totals.dedup_dropped;
    }
    assert!(dropped >= 1);

    // one record per node, however many copies arrived
    for node in &nodes[1..] {
        let held = node.bus.list(10, true).await;
        assert_eq!(held.len(), 1, "{} holds {:?}", node.name, held);
        assert_eq!(held[0].id, id);
    }
}

#[tokio::test(start_paused = true)]
async fn test_origin_does_not_consume_own_message() {
    init_test_tracing();
    let air = SimAir::new();
    let alpha = TestNode::new(&air, "alpha", "aaaa0001");
    let bravo = TestNode::new(&air, "bravo", "bbbb0002");
    let charlie = TestNode::new(&air, "charlie", "cccc0003");

    alpha
        .bus
        .enqueue(MessageKind::Sos, json!({"people": 1}))
        .await
        .unwrap();
    let nodes = [&alpha, &bravo, &charlie];
    start_all(&nodes).await;
    run_cycles(6).await;
    stop_all(&nodes).await;

    assert_eq!(alpha.sos_calls(), 0);
    assert_eq!(bravo.sos_calls(), 1);
    assert_eq!(charlie.sos_calls(), 1);
    assert_eq!(alpha.bus.stats().await.total_count, 1);
}
