//! Relay policy - which received packets are flooded onward
//!
//! The single place hop limits are enforced. A packet is relayed only if its
//! kind is relayable and its hop count is below
//! `min(packet.maxHop, configured max hop, 8)`.

use crate::bundle::{CourierPacket, DEFAULT_MAX_HOP};
use lifeline_core::CourierConfig;

/// Outcome of a relay check.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayDecision {
    /// Queue this copy (hop already incremented)
    Relay(CourierPacket),
    /// Kind is delivered locally only
    NotRelayable,
    /// Hop budget exhausted
    HopLimit,
    /// Relaying switched off
    Disabled,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayPolicy {
    enabled: bool,
    max_hop: u8,
}

impl RelayPolicy {
    pub fn new(enabled: bool, max_hop: u8) -> Self {
        Self {
            enabled,
            max_hop: max_hop.min(DEFAULT_MAX_HOP),
        }
    }

    pub fn from_config(config: &CourierConfig) -> Self {
        Self::new(config.relay_enabled, config.max_hop)
    }

    /// Effective hop limit for `packet`.
    pub fn hop_limit(&self, packet: &CourierPacket) -> u8 {
        packet.max_hop.min(self.max_hop)
    }

    pub fn decide(&self, packet: &CourierPacket) -> RelayDecision {
        if !self.enabled {
            return RelayDecision::Disabled;
        }
        if !packet.kind.is_relayable() {
            return RelayDecision::NotRelayable;
        }
        if packet.hop >= self.hop_limit(packet) {
            return RelayDecision::HopLimit;
        }
        let mut copy = packet.clone();
        copy.hop = packet.hop.saturating_add(1);
        RelayDecision::Relay(copy)
    }
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self::new(true, DEFAULT_MAX_HOP)
    }
}
