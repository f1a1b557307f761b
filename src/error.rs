//! Error types for the ESPIR control core.
//!
//! This module defines every error that can surface from the link, the
//! repository and the caller-facing service, including Bluetooth, storage,
//! protocol and synchronization failures.

use smol_str::SmolStr;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{
   remote::{
      codec::DecodeError,
      protocol::{Command, CommandKind, ResponseStatus},
   },
   store,
};

/// Main error type for the ESPIR core.
#[derive(Error, Debug)]
pub enum EspirError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error(transparent)]
   Store(#[from] store::Error),

   #[error("Transport error: {0}")]
   Transport(SmolStr),

   #[error("Not connected")]
   NotConnected,

   #[error("Link already active")]
   AlreadyActive,

   #[error("Connection attempt failed: {0}")]
   ConnectionFailed(SmolStr),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("No response to {command} in time")]
   Timeout { command: CommandKind },

   #[error("Malformed message: {0}")]
   Decode(#[from] DecodeError),

   #[error("Failed to encode request: {0}")]
   Encode(serde_json::Error),

   #[error("Remote device answered {status}: {message}")]
   Rejected {
      status: ResponseStatus,
      message: String,
   },

   #[error("{} succeeded locally but was not propagated: {source}", .command.kind())]
   RemoteSyncFailed {
      command: Command,
      source: Box<EspirError>,
   },

   #[error("Name already in use: {0}")]
   DuplicateName(SmolStr),

   #[error("Invalid name: {0:?}")]
   InvalidName(SmolStr),

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("Command {command} not found for device {device}")]
   CommandNotFound { device: SmolStr, command: SmolStr },

   #[error("ESPIR characteristic not found on remote device")]
   CharacteristicNotFound,

   #[error("Remote device {0} not found nearby")]
   DiscoveryTimeout(SmolStr),

   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("Invalid UUID: {0}")]
   InvalidUuid(#[from] uuid::Error),

   #[error("Link has been shut down")]
   LinkShutdown,

   #[error("Background task panicked: {0}")]
   TaskPanicked(JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl EspirError {
   /// Whether this error means the request never got an answer because of
   /// the link, as opposed to a local or remote rejection.
   pub const fn is_link_failure(&self) -> bool {
      matches!(
         self,
         Self::NotConnected
            | Self::ConnectionLost
            | Self::Timeout { .. }
            | Self::Transport(_)
            | Self::Bluetooth(_)
      )
   }
}

/// Convenience type alias for Results with `EspirError`.
pub type Result<T> = std::result::Result<T, EspirError>;
