//! Transport adapter contract.
//!
//! A transport owns one physical channel to the remote device. It reports
//! link changes and inbound payloads through an ordered event channel
//! handed over on each [`Transport::connect`].

use std::future::Future;

use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::error::Result;

/// Raw payload of a single notification or write.
pub type Packet = Vec<u8>;

/// Events reported by a transport, delivered strictly in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
   Connected,
   Disconnected(SmolStr),
   BytesReceived(Packet),
}

/// Sending half of the transport event channel.
pub type TransportEventTx = mpsc::Sender<TransportEvent>;

/// Physical channel to the remote device.
///
/// Every `connect` call is handed a fresh event channel and reports the
/// outcome of the attempt on it as [`TransportEvent::Connected`] or
/// [`TransportEvent::Disconnected`]; an `Err` return is treated as an
/// immediate disconnect. `disconnect` closes whatever the last attempt
/// opened, including a half-established link, and completes once the
/// physical link is down. Events sent after that are ignored.
pub trait Transport: Send + Sync + 'static {
   fn connect(&self, events: TransportEventTx) -> impl Future<Output = Result<()>> + Send;

   fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;

   fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;
}
