//! Multi-node scenarios for the mesh bus
//!
//! This test suite validates, over the simulated air:
//! - Flooding with duplicate suppression when a message arrives by two paths
//! - Hop-by-hop relay across a line topology
//! - Recovery from stalled and unreachable peers
//! - Deterministic shutdown and restart from durable storage

pub mod test_utils;

#[cfg(test)]
mod flood_tests;

#[cfg(test)]
mod resilience_tests;
