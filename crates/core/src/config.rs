//! Configuration management for Lifeline.
//!
//! Every section has defaults so a node can start from an empty file; a TOML
//! file only needs to name the values it overrides.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level bus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub node: NodeConfig,
    pub power: PowerConfig,
    pub courier: CourierConfig,
    pub pump: PumpConfig,
    pub dedup: DedupConfig,
    pub health: HealthConfig,
    pub queue: QueueConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the queue log, received ledger and health doc
    pub data_dir: PathBuf,
    /// Fixed short peer id; derived per session when absent
    pub peer_id: Option<String>,
    pub log_format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./lifeline-data"),
            peer_id: None,
            log_format: LogFormat::Pretty,
        }
    }
}

/// Named power profiles supplied by the device's battery policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerProfile {
    #[default]
    Normal,
    LowBattery,
    Survival,
}

impl PowerProfile {
    /// Scan/sleep windows for this profile.
    pub fn duty_cycle(self) -> DutyCycle {
        match self {
            PowerProfile::Normal => DutyCycle::new(8_000, 22_000),
            PowerProfile::LowBattery => DutyCycle::new(4_000, 56_000),
            PowerProfile::Survival => DutyCycle::new(2_000, 118_000),
        }
    }
}

/// Radio duty cycle: listen for `scan_window_ms`, then stay dark for
/// `sleep_window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyCycle {
    pub scan_window_ms: u64,
    pub sleep_window_ms: u64,
}

impl DutyCycle {
    pub const fn new(scan_window_ms: u64, sleep_window_ms: u64) -> Self {
        Self {
            scan_window_ms,
            sleep_window_ms,
        }
    }

    /// Length of one full scan + sleep cycle.
    pub fn cycle_ms(&self) -> u64 {
        self.scan_window_ms + self.sleep_window_ms
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub profile: PowerProfile,
    /// Explicit overrides of the profile's windows
    pub scan_window_ms: Option<u64>,
    pub sleep_window_ms: Option<u64>,
}

impl PowerConfig {
    /// Effective duty cycle after applying overrides.
    pub fn duty_cycle(&self) -> DutyCycle {
        let base = self.profile.duty_cycle();
        DutyCycle {
            scan_window_ms: self.scan_window_ms.unwrap_or(base.scan_window_ms),
            sleep_window_ms: self.sleep_window_ms.unwrap_or(base.sleep_window_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Maximum packets per bundle
    pub bundle_cap: usize,
    /// Characters of base64 per radio write
    pub chunk_size: usize,
    pub connect_timeout_ms: u64,
    /// Timeout applied to each individual chunk write/read
    pub io_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub relay_enabled: bool,
    pub max_hop: u8,
    /// How many recent queue records are considered per exchange
    pub candidate_window: usize,
    pub outbox_capacity: usize,
    pub outbox_ttl_ms: u64,
    /// Upper bound on a reassembled inbound bundle
    pub max_bundle_bytes: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            bundle_cap: 12,
            chunk_size: 160,
            connect_timeout_ms: 6_000,
            io_timeout_ms: 2_000,
            disconnect_timeout_ms: 1_000,
            relay_enabled: true,
            max_hop: 8,
            candidate_window: 200,
            outbox_capacity: 64,
            outbox_ttl_ms: 10 * 60 * 1000,
            max_bundle_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub tick_interval_ms: u64,
    pub sos_initial_delay_ms: u64,
    pub normal_initial_delay_ms: u64,
    pub background_initial_delay_ms: u64,
    pub max_lifetime_ms: u64,
    /// Delay after the n-th attempt; the last entry is the cap
    pub backoff_schedule_ms: Vec<u64>,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 15_000,
            sos_initial_delay_ms: 0,
            normal_initial_delay_ms: 10_000,
            background_initial_delay_ms: 60_000,
            max_lifetime_ms: 24 * 60 * 60 * 1000,
            backoff_schedule_ms: vec![60_000, 300_000, 1_800_000, 7_200_000],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub horizon_ms: u64,
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            horizon_ms: 60 * 60 * 1000,
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub bucket_width_ms: u64,
    pub retention_ms: u64,
    pub gc_interval_ms: u64,
    /// Peers tracked in the doc before the stalest is evicted
    pub peer_cap: usize,
    /// Peers returned by a read
    pub read_peer_limit: usize,
    pub flush_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bucket_width_ms: 5 * 60 * 1000,
            retention_ms: 24 * 60 * 60 * 1000,
            gc_interval_ms: 10 * 60 * 1000,
            peer_cap: 256,
            read_peer_limit: 50,
            flush_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Sent records older than this are dropped on compaction
    pub retention_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retention_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl BusConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir<P: Into<PathBuf>>(data_dir: P) -> Self {
        let mut config = Self::default();
        config.node.data_dir = data_dir.into();
        config
    }

    /// Reject values the bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        let duty = self.power.duty_cycle();
        if duty.scan_window_ms == 0 {
            return Err(CoreError::Config("scan_window_ms must be > 0".to_string()));
        }
        if self.courier.chunk_size == 0 {
            return Err(CoreError::Config("chunk_size must be > 0".to_string()));
        }
        if self.courier.bundle_cap == 0 {
            return Err(CoreError::Config("bundle_cap must be > 0".to_string()));
        }
        if self.courier.max_hop == 0 {
            return Err(CoreError::Config("max_hop must be > 0".to_string()));
        }
        if self.pump.tick_interval_ms == 0 {
            return Err(CoreError::Config("tick_interval_ms must be > 0".to_string()));
        }
        if self.pump.backoff_schedule_ms.is_empty() {
            return Err(CoreError::Config(
                "backoff_schedule_ms must not be empty".to_string(),
            ));
        }
        if self
            .pump
            .backoff_schedule_ms
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err(CoreError::Config(
                "backoff_schedule_ms must be non-decreasing".to_string(),
            ));
        }
        if self.health.bucket_width_ms == 0 {
            return Err(CoreError::Config("bucket_width_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.courier.bundle_cap, 12);
        assert_eq!(config.courier.chunk_size, 160);
        assert_eq!(config.courier.max_hop, 8);
        assert_eq!(config.dedup.horizon_ms, 3_600_000);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = BusConfig::from_toml_str(
            r#"
            [node]
            data_dir = "/var/lib/lifeline"
            log_format = "json"

            [power]
            profile = "low_battery"
            sleep_window_ms = 30000

            [courier]
            relay_enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/lifeline"));
        assert_eq!(config.node.log_format, LogFormat::Json);
        assert_eq!(config.power.duty_cycle(), DutyCycle::new(4_000, 30_000));
        assert!(!config.courier.relay_enabled);
        assert_eq!(config.pump.tick_interval_ms, 15_000);
    }

    #[test]
    fn test_reject_decreasing_backoff() {
        let result = BusConfig::from_toml_str(
            r#"
            [pump]
            backoff_schedule_ms = [60000, 1000]
            "#,
        );
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_reject_zero_scan_window() {
        let result = BusConfig::from_toml_str(
            r#"
            [power]
            scan_window_ms = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[pump]\ntick_interval_ms = 5000\n").unwrap();

        let config = BusConfig::from_file(&path).unwrap();
        assert_eq!(config.pump.tick_interval_ms, 5_000);
    }

    #[test]
    fn test_profiles_shrink_radio_time() {
        let normal = PowerProfile::Normal.duty_cycle();
        let survival = PowerProfile::Survival.duty_cycle();
        assert!(survival.scan_window_ms < normal.scan_window_ms);
        assert!(survival.sleep_window_ms > normal.sleep_window_ms);
    }
}
