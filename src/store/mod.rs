//! Persistent device/command repository using heed (LMDB).
//!
//! Device names and per-device command names are kept in index databases
//! next to the records, so every uniqueness check and every cascade happens
//! inside one LMDB write transaction. Writes are serialized and their change
//! events are published in commit order.

pub mod model;

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{
   Database, Env, EnvOpenOptions, RoTxn, RwTxn,
   types::{Bytes, SerdeBincode, Str},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::{SmolStr, ToSmolStr};
use thiserror::Error;

use self::model::{
   CommandId, Device, DeviceId, DeviceWithCommands, IrCommand, NewCommand, NewDevice,
   validate_name,
};
use crate::{
   error::{EspirError, Result},
   event::{Event, EventSender},
};

/// Errors raised by the storage engine itself.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

/// Key of the next free device id in the meta database
const NEXT_DEVICE_ID: &str = "next_device_id";
/// Key of the next free command id in the meta database
const NEXT_COMMAND_ID: &str = "next_command_id";

struct IdCodec;

impl<'a> heed::BytesEncode<'a> for IdCodec {
   type EItem = u32;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Owned(item.to_be_bytes().to_vec()))
   }
}

impl<'a> heed::BytesDecode<'a> for IdCodec {
   type DItem = u32;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(raw) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid id",
         )));
      };
      Ok(u32::from_be_bytes(raw))
   }
}

/// `device_id` (big endian) followed by the command name, so a prefix scan
/// yields one device's commands in name order.
fn command_key(device_id: DeviceId, name: &str) -> Vec<u8> {
   let mut key = device_id.to_be_bytes().to_vec();
   key.extend_from_slice(name.as_bytes());
   key
}

/// Database layout
struct Db {
   env: Env,
   /// id -> `Device`
   devices: Database<IdCodec, SerdeBincode<Device>>,
   /// name -> device id
   device_names: Database<Str, IdCodec>,
   /// id -> `IrCommand`
   commands: Database<IdCodec, SerdeBincode<IrCommand>>,
   /// `command_key` -> command id
   command_names: Database<Bytes, IdCodec>,
   /// id counters
   meta: Database<Str, IdCodec>,
   events: EventSender,
   write_gate: Mutex<()>,
}

impl Db {
   fn read<R>(&self, f: impl FnOnce(&RoTxn) -> Result<R>) -> Result<R> {
      let rtxn = self.env.read_txn().map_err(Error::Transaction)?;
      f(&rtxn)
   }

   /// Runs `f` in a write transaction and publishes the events it returns
   /// once the transaction has committed. An error aborts the transaction.
   fn write<R>(&self, f: impl FnOnce(&mut RwTxn) -> Result<(R, Vec<Event>)>) -> Result<R> {
      let _gate = self.write_gate.lock();
      let mut wtxn = self.env.write_txn().map_err(Error::Transaction)?;
      let (value, events) = f(&mut wtxn)?;
      wtxn.commit().map_err(Error::Transaction)?;
      for event in events {
         self.events.emit(event);
      }
      Ok(value)
   }

   fn next_id(&self, wtxn: &mut RwTxn, counter: &str) -> Result<u32> {
      let id = self
         .meta
         .get(wtxn, counter)
         .map_err(Error::DatabaseOperation)?
         .unwrap_or(1);
      self
         .meta
         .put(wtxn, counter, &(id + 1))
         .map_err(Error::DatabaseOperation)?;
      Ok(id)
   }

   // === Devices ===

   fn device(&self, txn: &RoTxn, id: DeviceId) -> Result<Option<Device>> {
      Ok(self.devices.get(txn, &id).map_err(Error::DatabaseOperation)?)
   }

   fn device_by_name(&self, txn: &RoTxn, name: &str) -> Result<Option<Device>> {
      match self
         .device_names
         .get(txn, name)
         .map_err(Error::DatabaseOperation)?
      {
         Some(id) => self.device(txn, id),
         None => Ok(None),
      }
   }

   fn all_devices(&self, txn: &RoTxn) -> Result<Vec<Device>> {
      let ids = self
         .device_names
         .iter(txn)
         .map_err(Error::DatabaseOperation)?
         .map(|entry| entry.map(|(_, id)| id))
         .collect::<heed::Result<Vec<_>>>()
         .map_err(Error::DatabaseOperation)?;

      let mut devices = Vec::with_capacity(ids.len());
      for id in ids {
         match self.device(txn, id)? {
            Some(device) => devices.push(device),
            None => warn!("Name index points at missing device {id}"),
         }
      }
      Ok(devices)
   }

   fn insert_device(&self, wtxn: &mut RwTxn, new: NewDevice) -> Result<Device> {
      validate_name(&new.name)?;
      if self
         .device_names
         .get(wtxn, new.name.as_str())
         .map_err(Error::DatabaseOperation)?
         .is_some()
      {
         return Err(EspirError::DuplicateName(new.name));
      }

      let device = new.into_device(self.next_id(wtxn, NEXT_DEVICE_ID)?);
      self
         .devices
         .put(wtxn, &device.id, &device)
         .map_err(Error::DatabaseOperation)?;
      self
         .device_names
         .put(wtxn, device.name.as_str(), &device.id)
         .map_err(Error::DatabaseOperation)?;
      Ok(device)
   }

   fn replace_device(&self, wtxn: &mut RwTxn, device: &Device) -> Result<()> {
      validate_name(&device.name)?;
      let Some(existing) = self.device(wtxn, device.id)? else {
         return Err(EspirError::DeviceNotFound(device.id.to_smolstr()));
      };

      if existing.name != device.name {
         if self
            .device_names
            .get(wtxn, device.name.as_str())
            .map_err(Error::DatabaseOperation)?
            .is_some()
         {
            return Err(EspirError::DuplicateName(device.name.clone()));
         }
         self
            .device_names
            .delete(wtxn, existing.name.as_str())
            .map_err(Error::DatabaseOperation)?;
         self
            .device_names
            .put(wtxn, device.name.as_str(), &device.id)
            .map_err(Error::DatabaseOperation)?;
      }
      self
         .devices
         .put(wtxn, &device.id, device)
         .map_err(Error::DatabaseOperation)?;
      Ok(())
   }

   /// Removes a device and every command it owns.
   fn remove_device(&self, wtxn: &mut RwTxn, device: &Device) -> Result<usize> {
      let removed = self.remove_commands_of(wtxn, device.id)?;
      self
         .device_names
         .delete(wtxn, device.name.as_str())
         .map_err(Error::DatabaseOperation)?;
      self
         .devices
         .delete(wtxn, &device.id)
         .map_err(Error::DatabaseOperation)?;
      Ok(removed)
   }

   // === Commands ===

   fn command_index(&self, txn: &RoTxn, device_id: DeviceId) -> Result<Vec<(Vec<u8>, CommandId)>> {
      let prefix = device_id.to_be_bytes();
      let entries = self
         .command_names
         .prefix_iter(txn, &prefix[..])
         .map_err(Error::DatabaseOperation)?
         .map(|entry| entry.map(|(key, id)| (key.to_vec(), id)))
         .collect::<heed::Result<Vec<_>>>()
         .map_err(Error::DatabaseOperation)?;
      Ok(entries)
   }

   fn command(&self, txn: &RoTxn, id: CommandId) -> Result<Option<IrCommand>> {
      Ok(self.commands.get(txn, &id).map_err(Error::DatabaseOperation)?)
   }

   fn commands_of(&self, txn: &RoTxn, device_id: DeviceId) -> Result<Vec<IrCommand>> {
      let mut commands = Vec::new();
      for (_, id) in self.command_index(txn, device_id)? {
         match self.command(txn, id)? {
            Some(command) => commands.push(command),
            None => warn!("Name index points at missing command {id}"),
         }
      }
      Ok(commands)
   }

   fn command_by_name(&self, txn: &RoTxn, device_id: DeviceId, name: &str) -> Result<Option<IrCommand>> {
      match self
         .command_names
         .get(txn, &command_key(device_id, name))
         .map_err(Error::DatabaseOperation)?
      {
         Some(id) => self.command(txn, id),
         None => Ok(None),
      }
   }

   fn ensure_command_name_free(&self, txn: &RoTxn, device_id: DeviceId, name: &SmolStr) -> Result<()> {
      if self
         .command_names
         .get(txn, &command_key(device_id, name))
         .map_err(Error::DatabaseOperation)?
         .is_some()
      {
         return Err(EspirError::DuplicateName(name.clone()));
      }
      Ok(())
   }

   fn insert_command(&self, wtxn: &mut RwTxn, device_id: DeviceId, new: NewCommand) -> Result<IrCommand> {
      validate_name(&new.name)?;
      if self.device(wtxn, device_id)?.is_none() {
         return Err(EspirError::DeviceNotFound(device_id.to_smolstr()));
      }
      self.ensure_command_name_free(wtxn, device_id, &new.name)?;

      let command = new.into_command(self.next_id(wtxn, NEXT_COMMAND_ID)?, device_id);
      self
         .commands
         .put(wtxn, &command.id, &command)
         .map_err(Error::DatabaseOperation)?;
      self
         .command_names
         .put(wtxn, &command_key(device_id, &command.name), &command.id)
         .map_err(Error::DatabaseOperation)?;
      Ok(command)
   }

   fn replace_command(&self, wtxn: &mut RwTxn, command: &IrCommand) -> Result<Vec<DeviceId>> {
      validate_name(&command.name)?;
      let Some(existing) = self.command(wtxn, command.id)? else {
         return Err(EspirError::CommandNotFound {
            device: command.device_id.to_smolstr(),
            command: command.name.clone(),
         });
      };

      let moved = existing.device_id != command.device_id;
      if moved && self.device(wtxn, command.device_id)?.is_none() {
         return Err(EspirError::DeviceNotFound(command.device_id.to_smolstr()));
      }
      if moved || existing.name != command.name {
         self.ensure_command_name_free(wtxn, command.device_id, &command.name)?;
         self
            .command_names
            .delete(wtxn, &command_key(existing.device_id, &existing.name))
            .map_err(Error::DatabaseOperation)?;
         self
            .command_names
            .put(wtxn, &command_key(command.device_id, &command.name), &command.id)
            .map_err(Error::DatabaseOperation)?;
      }
      self
         .commands
         .put(wtxn, &command.id, command)
         .map_err(Error::DatabaseOperation)?;

      let mut touched = vec![command.device_id];
      if moved {
         touched.push(existing.device_id);
      }
      Ok(touched)
   }

   fn remove_command(&self, wtxn: &mut RwTxn, command: &IrCommand) -> Result<()> {
      self
         .command_names
         .delete(wtxn, &command_key(command.device_id, &command.name))
         .map_err(Error::DatabaseOperation)?;
      self
         .commands
         .delete(wtxn, &command.id)
         .map_err(Error::DatabaseOperation)?;
      Ok(())
   }

   fn remove_commands_of(&self, wtxn: &mut RwTxn, device_id: DeviceId) -> Result<usize> {
      let index = self.command_index(wtxn, device_id)?;
      for (key, id) in &index {
         self
            .command_names
            .delete(wtxn, key)
            .map_err(Error::DatabaseOperation)?;
         self
            .commands
            .delete(wtxn, id)
            .map_err(Error::DatabaseOperation)?;
      }
      Ok(index.len())
   }
}

/// Device and command repository. Cheap to clone.
///
/// Every operation runs on the blocking thread pool, so callers on the
/// async runtime are never stalled by disk I/O.
#[derive(Clone)]
pub struct Repository {
   db: Arc<Db>,
}

impl Repository {
   /// Opens or creates the repository in directory `path`.
   pub fn open(path: &Path, events: EventSender) -> Result<Self> {
      std::fs::create_dir_all(path)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(16 * 1024 * 1024)
            .max_dbs(5)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let devices = env
         .create_database(&mut wtxn, Some("devices"))
         .map_err(Error::DatabaseOperation)?;
      let device_names = env
         .create_database(&mut wtxn, Some("device_names"))
         .map_err(Error::DatabaseOperation)?;
      let commands = env
         .create_database(&mut wtxn, Some("commands"))
         .map_err(Error::DatabaseOperation)?;
      let command_names = env
         .create_database(&mut wtxn, Some("command_names"))
         .map_err(Error::DatabaseOperation)?;
      let meta = env
         .create_database(&mut wtxn, Some("meta"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      info!("Opened repository at {}", path.display());
      Ok(Self {
         db: Arc::new(Db {
            env,
            devices,
            device_names,
            commands,
            command_names,
            meta,
            events,
            write_gate: Mutex::new(()),
         }),
      })
   }

   /// Default location: `$ESPIR_DB_PATH`, else `<data dir>/espir/espir.mdb`.
   pub fn default_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("ESPIR_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("espir").join("espir.mdb"))
   }

   async fn run<R, F>(&self, f: F) -> Result<R>
   where
      F: FnOnce(&Db) -> Result<R> + Send + 'static,
      R: Send + 'static,
   {
      let db = self.db.clone();
      tokio::task::spawn_blocking(move || f(&db))
         .await
         .map_err(EspirError::TaskPanicked)?
   }

   // === Device queries ===

   /// All devices ordered by name.
   pub async fn list_devices(&self) -> Result<Vec<Device>> {
      self.run(|db| db.read(|txn| db.all_devices(txn))).await
   }

   pub async fn get_device(&self, id: DeviceId) -> Result<Option<Device>> {
      self.run(move |db| db.read(|txn| db.device(txn, id))).await
   }

   pub async fn get_device_by_name(&self, name: &str) -> Result<Option<Device>> {
      let name = SmolStr::new(name);
      self
         .run(move |db| db.read(|txn| db.device_by_name(txn, &name)))
         .await
   }

   /// A device together with its commands.
   pub async fn device_with_commands(&self, name: &str) -> Result<Option<DeviceWithCommands>> {
      let name = SmolStr::new(name);
      self
         .run(move |db| {
            db.read(|txn| {
               let Some(device) = db.device_by_name(txn, &name)? else {
                  return Ok(None);
               };
               let commands = db.commands_of(txn, device.id)?;
               Ok(Some(DeviceWithCommands { device, commands }))
            })
         })
         .await
   }

   /// Every device with its commands, ordered by device name.
   pub async fn devices_with_commands(&self) -> Result<Vec<DeviceWithCommands>> {
      self
         .run(|db| {
            db.read(|txn| {
               db.all_devices(txn)?
                  .into_iter()
                  .map(|device| {
                     let commands = db.commands_of(txn, device.id)?;
                     Ok(DeviceWithCommands { device, commands })
                  })
                  .collect::<Result<Vec<_>>>()
            })
         })
         .await
   }

   // === Device mutations ===

   /// Inserts a device. Fails with `DuplicateName` if the name is taken.
   pub async fn add_device(&self, new: NewDevice) -> Result<Device> {
      self
         .run(move |db| {
            db.write(|wtxn| {
               let device = db.insert_device(wtxn, new)?;
               debug!("Stored device {} as #{}", device.name, device.id);
               Ok((device, vec![Event::DevicesChanged]))
            })
         })
         .await
   }

   /// Overwrites a device, re-checking name uniqueness on rename.
   pub async fn update_device(&self, device: Device) -> Result<()> {
      self
         .run(move |db| {
            db.write(|wtxn| {
               db.replace_device(wtxn, &device)?;
               Ok(((), vec![Event::DevicesChanged]))
            })
         })
         .await
   }

   /// Deletes a device and all its commands atomically.
   ///
   /// Returns `false` if there was nothing to delete.
   pub async fn delete_device(&self, id: DeviceId) -> Result<bool> {
      self
         .run(move |db| {
            db.write(|wtxn| match db.device(wtxn, id)? {
               Some(device) => {
                  let events = db.cascade(wtxn, &device)?;
                  Ok((true, events))
               },
               None => Ok((false, Vec::new())),
            })
         })
         .await
   }

   /// Looks a device up by name and deletes it with its commands in the same
   /// transaction. Returns the removed device, if any.
   pub async fn delete_device_by_name(&self, name: &str) -> Result<Option<Device>> {
      let name = SmolStr::new(name);
      self
         .run(move |db| {
            db.write(|wtxn| match db.device_by_name(wtxn, &name)? {
               Some(device) => {
                  let events = db.cascade(wtxn, &device)?;
                  Ok((Some(device), events))
               },
               None => Ok((None, Vec::new())),
            })
         })
         .await
   }

   // === Command queries ===

   /// Commands of a device ordered by name.
   pub async fn list_commands(&self, device_id: DeviceId) -> Result<Vec<IrCommand>> {
      self
         .run(move |db| db.read(|txn| db.commands_of(txn, device_id)))
         .await
   }

   pub async fn get_command(&self, id: CommandId) -> Result<Option<IrCommand>> {
      self.run(move |db| db.read(|txn| db.command(txn, id))).await
   }

   pub async fn get_command_by_name(&self, device_id: DeviceId, name: &str) -> Result<Option<IrCommand>> {
      let name = SmolStr::new(name);
      self
         .run(move |db| db.read(|txn| db.command_by_name(txn, device_id, &name)))
         .await
   }

   // === Command mutations ===

   /// Inserts a command for an existing device. Fails with `DuplicateName`
   /// if the device already has a command with that name.
   pub async fn add_command(&self, device_id: DeviceId, new: NewCommand) -> Result<IrCommand> {
      self
         .run(move |db| {
            db.write(|wtxn| {
               let command = db.insert_command(wtxn, device_id, new)?;
               debug!("Stored command {} as #{}", command.name, command.id);
               Ok((command, vec![Event::CommandsChanged(device_id)]))
            })
         })
         .await
   }

   pub async fn update_command(&self, command: IrCommand) -> Result<()> {
      self
         .run(move |db| {
            db.write(|wtxn| {
               let touched = db.replace_command(wtxn, &command)?;
               Ok(((), touched.into_iter().map(Event::CommandsChanged).collect()))
            })
         })
         .await
   }

   /// Returns `false` if there was nothing to delete.
   pub async fn delete_command(&self, id: CommandId) -> Result<bool> {
      self
         .run(move |db| {
            db.write(|wtxn| match db.command(wtxn, id)? {
               Some(command) => {
                  db.remove_command(wtxn, &command)?;
                  Ok((true, vec![Event::CommandsChanged(command.device_id)]))
               },
               None => Ok((false, Vec::new())),
            })
         })
         .await
   }

   /// Deletes every command of a device, keeping the device itself.
   pub async fn delete_commands_for_device(&self, device_id: DeviceId) -> Result<usize> {
      self
         .run(move |db| {
            db.write(|wtxn| {
               let removed = db.remove_commands_of(wtxn, device_id)?;
               let events = if removed > 0 {
                  vec![Event::CommandsChanged(device_id)]
               } else {
                  Vec::new()
               };
               Ok((removed, events))
            })
         })
         .await
   }
}

impl Db {
   fn cascade(&self, wtxn: &mut RwTxn, device: &Device) -> Result<Vec<Event>> {
      let removed = self.remove_device(wtxn, device)?;
      debug!("Deleted device {} with {removed} command(s)", device.name);
      let mut events = Vec::with_capacity(2);
      if removed > 0 {
         events.push(Event::CommandsChanged(device.id));
      }
      events.push(Event::DevicesChanged);
      Ok(events)
   }
}
