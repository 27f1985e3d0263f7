//! Lifeline Radio - short-range radio abstraction for the mesh courier.
//!
//! Platform radios (BLE GATT, Wi-Fi Aware, ...) implement [`Radio`],
//! [`Link`] and call back into a [`Peripheral`]. [`sim`] provides an
//! in-memory air interface for tests and field simulations.

pub mod radio;
pub mod sim;

pub use radio::{Advertisement, DeviceAddress, Hello, Link, Peripheral, Radio, RadioError};
pub use sim::{SimAir, SimFaults, SimRadio};
