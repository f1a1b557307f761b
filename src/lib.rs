//! Control core for ESPIR infrared blasters.
//!
//! The remote device is driven over a single Bluetooth LE characteristic
//! carrying JSON envelopes. [`link`] owns the connection and correlates
//! responses with requests, [`store`] keeps device profiles and their IR
//! codes, and [`service`] ties both together behind caller-facing
//! operations.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod link;
pub mod remote;
pub mod service;
pub mod store;
