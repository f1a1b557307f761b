//! Wire protocol spoken with the ESPIR firmware.
//!
//! Requests and responses are JSON envelopes written to, and notified from,
//! a single GATT characteristic.

pub mod codec;
pub mod protocol;
