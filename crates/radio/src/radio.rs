//! Short-range radio seam.
//!
//! The courier talks to the platform radio (BLE GATT on phones) only through
//! these traits. A device plays both roles: as a central it scans and
//! connects to peers; as a peripheral it advertises a [`Hello`] and serves
//! reads and writes on its inbox/outbox characteristics.

use async_trait::async_trait;
use lifeline_core::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Radio-level device address (rotates on real hardware; never used as a
/// stable identity).
pub type DeviceAddress = String;

/// Small advertisement payload announcing a bus participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version
    pub v: u8,
    /// Short session peer id
    pub did: PeerId,
    /// Pending record count, a hint for peers deciding whom to connect to
    pub p: usize,
}

impl Hello {
    pub fn new(did: PeerId, pending: usize) -> Self {
        Self {
            v: 1,
            did,
            p: pending,
        }
    }
}

/// A peer heard during a scan window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub hello: Hello,
}

/// Radio errors. All of these are transient from the bus's point of view.
#[derive(Debug, Error)]
pub enum RadioError {
    /// Radio is off or not permitted
    #[error("Radio unavailable: {0}")]
    Unavailable(String),

    /// Connection attempt failed
    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed {
        address: DeviceAddress,
        reason: String,
    },

    /// Link dropped mid-exchange
    #[error("Link to {0} lost")]
    Disconnected(DeviceAddress),

    /// Characteristic write failed
    #[error("Write failed: {0}")]
    Write(String),

    /// Characteristic read failed
    #[error("Read failed: {0}")]
    Read(String),
}

/// Central-side radio operations.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Start (or refresh) advertising `hello` and route incoming GATT traffic
    /// to `peripheral`.
    async fn advertise(
        &self,
        hello: Hello,
        peripheral: Arc<dyn Peripheral>,
    ) -> Result<(), RadioError>;

    /// Stop advertising and serving.
    async fn stop_advertising(&self) -> Result<(), RadioError>;

    /// Listen for advertisements for `window`, then stop and report what was
    /// heard. Radio-on time is bounded by `window`.
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, RadioError>;

    /// Open a link to a peer.
    async fn connect(&self, address: &DeviceAddress) -> Result<Box<dyn Link>, RadioError>;
}

/// An open link to a peer's inbox/outbox characteristics.
#[async_trait]
pub trait Link: Send {
    fn address(&self) -> &DeviceAddress;

    /// Write one frame to the peer's inbox (write without response).
    async fn write(&mut self, frame: &str) -> Result<(), RadioError>;

    /// Read the next frame from the peer's outbox; `None` once it has
    /// nothing more to serve.
    async fn read(&mut self) -> Result<Option<String>, RadioError>;

    async fn disconnect(&mut self) -> Result<(), RadioError>;
}

/// Peripheral-side callbacks invoked when a central talks to us.
#[async_trait]
pub trait Peripheral: Send + Sync {
    /// A frame written into our inbox by `central`.
    async fn on_write(&self, central: &DeviceAddress, frame: String);

    /// Frames to serve from our outbox to `central`.
    async fn on_read(&self, central: &DeviceAddress) -> Vec<String>;

    /// `central` has read the last frame served by `on_read`. Until this
    /// fires, nothing served can be assumed delivered.
    async fn on_read_complete(&self, _central: &DeviceAddress) {}

    /// `central` went away; drop any partial state kept for it.
    async fn on_disconnect(&self, _central: &DeviceAddress) {}
}
