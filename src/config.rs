//! Configuration management for the ESPIR control core.
//!
//! This module handles loading and saving configuration from disk,
//! including how the remote device is located, protocol timeouts and
//! where the repository lives.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   bluetooth::gatt::SERVICE_RESOLVE_TIMEOUT,
   error::{EspirError, Result},
   link::LinkConfig,
   store::Repository,
};

/// Main configuration structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// Advertised name scanned for when no address is configured.
   #[serde(default = "default_device_name")]
   pub device_name: SmolStr,

   /// Fixed Bluetooth address of the remote device; skips discovery.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub device_address: Option<String>,

   #[serde(default = "default_service_uuid")]
   pub service_uuid: String,

   #[serde(default = "default_characteristic_uuid")]
   pub characteristic_uuid: String,

   #[serde(default = "default_request_timeout")]
   pub request_timeout_ms: u64,

   #[serde(default = "default_learn_timeout")]
   pub learn_timeout_ms: u64,

   #[serde(default = "default_learn_grace")]
   pub learn_grace_ms: u64,

   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_sec: u64,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub database_path: Option<PathBuf>,
}

fn default_device_name() -> SmolStr {
   SmolStr::new_static("ESPIR-Device")
}

fn default_service_uuid() -> String {
   "12345678-1234-1234-1234-123456789abc".to_string()
}

fn default_characteristic_uuid() -> String {
   "87654321-4321-4321-4321-cba987654321".to_string()
}

const fn default_request_timeout() -> u64 {
   5000
}

const fn default_learn_timeout() -> u64 {
   15000
}

const fn default_learn_grace() -> u64 {
   5000
}

const fn default_connect_timeout() -> u64 {
   10
}

const fn default_discovery_timeout() -> u64 {
   15
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device_name: default_device_name(),
         device_address: None,
         service_uuid: default_service_uuid(),
         characteristic_uuid: default_characteristic_uuid(),
         request_timeout_ms: default_request_timeout(),
         learn_timeout_ms: default_learn_timeout(),
         learn_grace_ms: default_learn_grace(),
         connect_timeout_sec: default_connect_timeout(),
         discovery_timeout_sec: default_discovery_timeout(),
         database_path: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there first if
   /// the file does not exist.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(espir_home) = env::var("ESPIR_HOME") {
         PathBuf::from(espir_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(EspirError::ConfigDirNotFound);
      };

      Ok(config_dir.join("espir").join("config.toml"))
   }

   /// Repository directory, falling back to the default data location.
   pub fn database_path(&self) -> Result<PathBuf> {
      match &self.database_path {
         Some(path) => Ok(path.clone()),
         None => Repository::default_path(),
      }
   }

   /// Capture window used when LEARN is started without an explicit one.
   pub const fn learn_timeout(&self) -> Duration {
      Duration::from_millis(self.learn_timeout_ms)
   }

   /// Longest a whole connection attempt may take: discovery, the
   /// connection itself and GATT service resolution.
   pub fn attempt_timeout(&self) -> Duration {
      Duration::from_secs(self.discovery_timeout_sec + self.connect_timeout_sec)
         + SERVICE_RESOLVE_TIMEOUT
   }

   pub fn link_config(&self) -> LinkConfig {
      LinkConfig {
         request_timeout: Duration::from_millis(self.request_timeout_ms),
         learn_grace: Duration::from_millis(self.learn_grace_ms),
         connect_timeout: self.attempt_timeout(),
         disconnect_timeout: Duration::from_secs(self.connect_timeout_sec),
      }
   }
}
