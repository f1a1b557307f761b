//! Persisted records: device profiles and their IR commands.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{EspirError, Result},
   remote::protocol::Command,
};

pub type DeviceId = u32;
pub type CommandId = u32;

/// Carrier frequency assumed when none is given, in Hz
pub const DEFAULT_FREQUENCY: u32 = 38_000;
/// Longest name the firmware accepts, in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Rejects names the remote device could not store.
pub fn validate_name(name: &str) -> Result<()> {
   if name.is_empty() || name.len() > MAX_NAME_LEN {
      return Err(EspirError::InvalidName(SmolStr::new(name)));
   }
   Ok(())
}

/// A remote-controlled appliance profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
   pub id: DeviceId,
   /// Unique, case-sensitive lookup key shared with the remote device.
   pub name: SmolStr,
   #[serde(rename = "type")]
   pub kind: SmolStr,
   pub manufacturer: Option<SmolStr>,
   pub model: Option<SmolStr>,
}

impl Device {
   /// The remote command announcing this profile to the firmware.
   pub fn add_command(&self) -> Command {
      Command::AddDevice {
         name: self.name.clone(),
         kind: self.kind.clone(),
         manufacturer: self.manufacturer.clone(),
         model: self.model.clone(),
      }
   }
}

/// Insert form of [`Device`]; the id is assigned by the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
   pub name: SmolStr,
   pub kind: SmolStr,
   pub manufacturer: Option<SmolStr>,
   pub model: Option<SmolStr>,
}

impl NewDevice {
   pub fn new(name: impl Into<SmolStr>, kind: impl Into<SmolStr>) -> Self {
      Self {
         name: name.into(),
         kind: kind.into(),
         manufacturer: None,
         model: None,
      }
   }

   pub fn manufacturer(mut self, manufacturer: impl Into<SmolStr>) -> Self {
      self.manufacturer = Some(manufacturer.into());
      self
   }

   pub fn model(mut self, model: impl Into<SmolStr>) -> Self {
      self.model = Some(model.into());
      self
   }

   pub(crate) fn into_device(self, id: DeviceId) -> Device {
      Device {
         id,
         name: self.name,
         kind: self.kind,
         manufacturer: self.manufacturer,
         model: self.model,
      }
   }
}

/// A stored IR code belonging to exactly one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrCommand {
   pub id: CommandId,
   pub device_id: DeviceId,
   /// Unique within its device.
   pub name: SmolStr,
   pub description: Option<SmolStr>,
   /// Opaque encoded payload, replayed as-is.
   pub code: String,
   pub protocol: Option<SmolStr>,
   pub frequency: u32,
}

/// Insert form of [`IrCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommand {
   pub name: SmolStr,
   pub description: Option<SmolStr>,
   pub code: String,
   pub protocol: Option<SmolStr>,
   pub frequency: u32,
}

impl NewCommand {
   pub fn new(name: impl Into<SmolStr>, code: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         description: None,
         code: code.into(),
         protocol: None,
         frequency: DEFAULT_FREQUENCY,
      }
   }

   pub fn description(mut self, description: impl Into<SmolStr>) -> Self {
      self.description = Some(description.into());
      self
   }

   pub fn protocol(mut self, protocol: impl Into<SmolStr>) -> Self {
      self.protocol = Some(protocol.into());
      self
   }

   pub const fn frequency(mut self, hz: u32) -> Self {
      self.frequency = hz;
      self
   }

   pub(crate) fn into_command(self, id: CommandId, device_id: DeviceId) -> IrCommand {
      IrCommand {
         id,
         device_id,
         name: self.name,
         description: self.description,
         code: self.code,
         protocol: self.protocol,
         frequency: self.frequency,
      }
   }
}

/// A device joined with all of its commands, ordered by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceWithCommands {
   pub device: Device,
   pub commands: Vec<IrCommand>,
}
