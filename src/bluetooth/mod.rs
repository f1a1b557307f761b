//! Bluetooth communication layer for the ESPIR remote.
//!
//! This module defines the transport contract the link is written against
//! and its BLE GATT implementation.

pub mod gatt;
#[cfg(test)]
pub(crate) mod mock;
pub mod transport;
