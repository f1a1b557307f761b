//! Connection state machine.
//!
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`
//! are the only legal edges. Transport events that do not fit the current
//! state reset the link to `Disconnected`.

use serde::Serialize;

use crate::error::{EspirError, Result};

/// Lifecycle state of the single physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
pub enum LinkState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// Inputs driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
   RequestConnect,
   RequestDisconnect,
   TransportConnected,
   TransportDisconnected,
}

/// Outcome of feeding a trigger into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
   /// Follow a legal edge into the given state.
   Enter(LinkState),
   /// Nothing changes.
   Stay,
   /// Unexpected transport event; drop whatever is in progress and go to
   /// `Disconnected`.
   Reset,
}

impl LinkState {
   /// Computes the step for `trigger`.
   ///
   /// Only caller requests can fail; transport triggers always yield a step.
   pub fn step(self, trigger: Trigger) -> Result<Step> {
      Ok(match (self, trigger) {
         (Self::Disconnected, Trigger::RequestConnect) => Step::Enter(Self::Connecting),
         (_, Trigger::RequestConnect) => return Err(EspirError::AlreadyActive),

         (Self::Connecting | Self::Connected, Trigger::RequestDisconnect) => {
            Step::Enter(Self::Disconnecting)
         },
         (Self::Disconnected | Self::Disconnecting, Trigger::RequestDisconnect) => Step::Stay,

         (Self::Connecting, Trigger::TransportConnected) => Step::Enter(Self::Connected),
         (_, Trigger::TransportConnected) => Step::Reset,

         (Self::Disconnecting, Trigger::TransportDisconnected) => Step::Enter(Self::Disconnected),
         (Self::Disconnected, Trigger::TransportDisconnected) => Step::Stay,
         (Self::Connecting | Self::Connected, Trigger::TransportDisconnected) => Step::Reset,
      })
   }

   /// Writes are only allowed on an established link.
   pub const fn can_write(self) -> bool {
      matches!(self, Self::Connected)
   }

   /// Inbound payloads are still routed while a disconnect is in flight.
   pub const fn accepts_inbound(self) -> bool {
      matches!(self, Self::Connected | Self::Disconnecting)
   }
}
