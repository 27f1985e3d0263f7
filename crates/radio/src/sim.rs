//! In-memory air interface.
//!
//! Lets several bus instances in one process discover and exchange with each
//! other without hardware. Range can be cut per device pair to build line or
//! partitioned topologies, and per-device faults simulate flaky peers.

use crate::radio::{Advertisement, DeviceAddress, Hello, Link, Peripheral, Radio, RadioError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Fault switches for one simulated device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Every connection attempt to this device fails
    pub refuse_connect: bool,
    /// Writes to this device fail
    pub fail_writes: bool,
    /// Reads from this device never complete
    pub stall_reads: bool,
}

struct SimNode {
    hello: Option<Hello>,
    peripheral: Option<Arc<dyn Peripheral>>,
    faults: SimFaults,
}

#[derive(Default)]
struct AirState {
    nodes: HashMap<DeviceAddress, SimNode>,
    /// Unordered device pairs that cannot hear each other
    blocked: HashSet<(DeviceAddress, DeviceAddress)>,
    connects: HashMap<(DeviceAddress, DeviceAddress), usize>,
}

impl AirState {
    fn in_range(&self, a: &str, b: &str) -> bool {
        !self.blocked.contains(&pair(a, b))
    }
}

fn pair(a: &str, b: &str) -> (DeviceAddress, DeviceAddress) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared medium all simulated radios attach to.
#[derive(Clone, Default)]
pub struct SimAir {
    state: Arc<Mutex<AirState>>,
}

impl SimAir {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a radio at `address`.
    pub fn radio(&self, address: impl Into<DeviceAddress>) -> SimRadio {
        let address = address.into();
        self.state().nodes.entry(address.clone()).or_insert(SimNode {
            hello: None,
            peripheral: None,
            faults: SimFaults::default(),
        });
        SimRadio {
            air: self.clone(),
            address,
        }
    }

    /// Put two devices out of range of each other.
    pub fn block(&self, a: &str, b: &str) {
        self.state().blocked.insert(pair(a, b));
    }

    /// Bring two devices back into range.
    pub fn unblock(&self, a: &str, b: &str) {
        self.state().blocked.remove(&pair(a, b));
    }

    pub fn set_faults(&self, address: &str, faults: SimFaults) {
        if let Some(node) = self.state().nodes.get_mut(address) {
            node.faults = faults;
        }
    }

    /// Number of connection attempts `from` made to `to`.
    pub fn connect_count(&self, from: &str, to: &str) -> usize {
        self.state()
            .connects
            .get(&(from.to_string(), to.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// One device's radio on the simulated air.
pub struct SimRadio {
    air: SimAir,
    address: DeviceAddress,
}

impl SimRadio {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn advertise(
        &self,
        hello: Hello,
        peripheral: Arc<dyn Peripheral>,
    ) -> Result<(), RadioError> {
        let mut state = self.air.state();
        let node = state
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| RadioError::Unavailable(format!("{} detached", self.address)))?;
        node.hello = Some(hello);
        node.peripheral = Some(peripheral);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        if let Some(node) = self.air.state().nodes.get_mut(&self.address) {
            node.hello = None;
            node.peripheral = None;
        }
        Ok(())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, RadioError> {
        tokio::time::sleep(window).await;

        let state = self.air.state();
        let mut heard: Vec<Advertisement> = state
            .nodes
            .iter()
            .filter(|(address, _)| **address != self.address)
            .filter(|(address, _)| state.in_range(&self.address, address))
            .filter_map(|(address, node)| {
                node.hello.clone().map(|hello| Advertisement {
                    address: address.clone(),
                    hello,
                })
            })
            .collect();
        heard.sort_by(|a, b| a.address.cmp(&b.address));
        trace!(address = %self.address, heard = heard.len(), "Sim scan window closed");
        Ok(heard)
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<Box<dyn Link>, RadioError> {
        let mut state = self.air.state();
        *state
            .connects
            .entry((self.address.clone(), address.clone()))
            .or_insert(0) += 1;

        let reachable = state.in_range(&self.address, address);
        let node = state
            .nodes
            .get(address)
            .filter(|_| reachable)
            .ok_or_else(|| RadioError::ConnectFailed {
                address: address.clone(),
                reason: "out of range".to_string(),
            })?;
        if node.faults.refuse_connect {
            return Err(RadioError::ConnectFailed {
                address: address.clone(),
                reason: "refused".to_string(),
            });
        }
        let peripheral = node
            .peripheral
            .clone()
            .ok_or_else(|| RadioError::ConnectFailed {
                address: address.clone(),
                reason: "not advertising".to_string(),
            })?;

        Ok(Box::new(SimLink {
            local: self.address.clone(),
            remote: address.clone(),
            peripheral,
            faults: node.faults,
            outbox: None,
        }))
    }
}

struct SimLink {
    local: DeviceAddress,
    remote: DeviceAddress,
    peripheral: Arc<dyn Peripheral>,
    faults: SimFaults,
    outbox: Option<VecDeque<String>>,
}

#[async_trait]
impl Link for SimLink {
    fn address(&self) -> &DeviceAddress {
        &self.remote
    }

    async fn write(&mut self, frame: &str) -> Result<(), RadioError> {
        if self.faults.fail_writes {
            return Err(RadioError::Write(format!("{} rejected write", self.remote)));
        }
        self.peripheral.on_write(&self.local, frame.to_string()).await;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<String>, RadioError> {
        if self.faults.stall_reads {
            std::future::pending::<()>().await;
        }
        if self.outbox.is_none() {
            let frames = self.peripheral.on_read(&self.local).await;
            self.outbox = Some(frames.into());
        }
        let frame = self.outbox.as_mut().and_then(VecDeque::pop_front);
        if frame.is_some() && self.outbox.as_ref().is_some_and(VecDeque::is_empty) {
            self.peripheral.on_read_complete(&self.local).await;
        }
        Ok(frame)
    }

    async fn disconnect(&mut self) -> Result<(), RadioError> {
        self.peripheral.on_disconnect(&self.local).await;
        Ok(())
    }
}
