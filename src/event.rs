//! Event handling system for link and repository changes.
//!
//! Connection state transitions, unsolicited notifications from the remote
//! device and repository mutations are all published through an
//! [`EventBus`]. Emission is synchronous and ordered; every subscriber sees
//! every event exactly once, in emission order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{link::LinkState, remote::protocol::Envelope, store::model::DeviceId};

/// Events that can be emitted by the ESPIR core.
#[derive(Debug, Clone)]
pub enum Event {
   /// The connection state machine entered a new state.
   StateChanged(LinkState),
   /// A message arrived that no outstanding request was waiting for.
   Notification(Envelope),
   /// The device list changed.
   DevicesChanged,
   /// The command list of a device changed.
   CommandsChanged(DeviceId),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: Event);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Fan-out bus handing each subscriber its own unbounded queue.
///
/// Unbounded queues never drop or coalesce, so slow subscribers still
/// observe the full ordered history.
#[derive(Default)]
pub struct Subscribers {
   senders: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl Subscribers {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Registers a new subscriber. Events emitted before this call are not
   /// replayed.
   pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
      let (tx, rx) = mpsc::unbounded_channel();
      self.senders.lock().push(tx);
      rx
   }

   pub fn len(&self) -> usize {
      self.senders.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

impl EventBus for Subscribers {
   fn emit(&self, event: Event) {
      // Closed receivers are pruned on the way.
      self
         .senders
         .lock()
         .retain(|tx| tx.send(event.clone()).is_ok());
   }
}
