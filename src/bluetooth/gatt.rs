//! BLE GATT transport for the ESPIR remote.
//!
//! The firmware exposes a single characteristic that accepts request writes
//! and pushes responses and status updates as notifications.

use std::{pin::pin, str::FromStr, time::Duration};

use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session,
   gatt::remote::Characteristic,
};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{sync::RwLock, task::JoinSet, time};
use uuid::Uuid;

use crate::{
   bluetooth::transport::{Transport, TransportEvent, TransportEventTx},
   config::Config,
   error::{EspirError, Result},
};

/// Timeout for characteristic writes
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for GATT service resolution
const SERVICE_RESOLVE_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on waiting for GATT service resolution after connecting
pub const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How the remote device is located.
#[derive(Debug, Clone)]
enum Target {
   Address(Address),
   Name(SmolStr),
}

/// Internal state for an established GATT link.
#[derive(Debug)]
struct GattLink {
   characteristic: Characteristic,
   jset: JoinSet<()>,
}

impl Drop for GattLink {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// [`Transport`] talking to the firmware over a BlueZ GATT client.
pub struct GattTransport {
   _session: Session,
   adapter: Adapter,
   target: Target,
   service_uuid: Uuid,
   characteristic_uuid: Uuid,
   discovery_timeout: Duration,
   connect_timeout: Duration,
   /// Device of the latest attempt, recorded as soon as it is found so a
   /// half-established connection can still be closed.
   device: Mutex<Option<Device>>,
   link: RwLock<Option<GattLink>>,
}

impl GattTransport {
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = session.default_adapter().await?;
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }

      let target = match &config.device_address {
         Some(addr) => Target::Address(
            Address::from_str(addr).map_err(|_| EspirError::InvalidAddress(addr.clone()))?,
         ),
         None => Target::Name(config.device_name.clone()),
      };

      Ok(Self {
         _session: session,
         adapter,
         target,
         service_uuid: Uuid::parse_str(&config.service_uuid)?,
         characteristic_uuid: Uuid::parse_str(&config.characteristic_uuid)?,
         discovery_timeout: Duration::from_secs(config.discovery_timeout_sec),
         connect_timeout: Duration::from_secs(config.connect_timeout_sec),
         device: Mutex::new(None),
         link: RwLock::new(None),
      })
   }

   async fn find_device(&self) -> Result<Device> {
      match &self.target {
         Target::Address(address) => Ok(self.adapter.device(*address)?),
         Target::Name(name) => time::timeout(self.discovery_timeout, self.discover(name))
            .await
            .map_err(|_| EspirError::DiscoveryTimeout(name.clone()))?,
      }
   }

   async fn discover(&self, name: &SmolStr) -> Result<Device> {
      for address in self.adapter.device_addresses().await? {
         let device = self.adapter.device(address)?;
         if device.name().await?.as_deref() == Some(name.as_str()) {
            debug!("Found known {name} at {address}");
            return Ok(device);
         }
      }

      info!("Scanning for {name}...");
      let mut discovery = pin!(self.adapter.discover_devices().await?);
      while let Some(event) = discovery.next().await {
         if let AdapterEvent::DeviceAdded(address) = event {
            let device = self.adapter.device(address)?;
            if device.name().await.ok().flatten().as_deref() == Some(name.as_str()) {
               info!("Found {name} at {address}");
               return Ok(device);
            }
         }
      }
      Err(EspirError::DiscoveryTimeout(name.clone()))
   }

   async fn find_characteristic(&self, device: &Device) -> Result<Characteristic> {
      let resolved = time::timeout(SERVICE_RESOLVE_TIMEOUT, async {
         while !device.is_services_resolved().await? {
            time::sleep(SERVICE_RESOLVE_INTERVAL).await;
         }
         Ok::<_, EspirError>(())
      })
      .await;
      match resolved {
         Ok(result) => result?,
         Err(_) => warn!("{}: services still unresolved, looking anyway", device.address()),
      }

      for service in device.services().await? {
         if service.uuid().await? != self.service_uuid {
            continue;
         }
         for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == self.characteristic_uuid {
               return Ok(characteristic);
            }
         }
      }
      Err(EspirError::CharacteristicNotFound)
   }

   /// Connects `device` and locates the ESPIR characteristic on it.
   async fn open(&self, device: &Device) -> Result<Characteristic> {
      if !device.is_connected().await? {
         info!("Connecting to {}", device.address());
         time::timeout(self.connect_timeout, device.connect())
            .await
            .map_err(|_| EspirError::Transport(SmolStr::new_static("connect timed out")))??;
      }
      self.find_characteristic(device).await
   }

   /// Drops the record of `device` and closes its connection if it is up.
   async fn release(&self, device: &Device) -> Result<()> {
      self.device.lock().take();
      if device.is_connected().await? {
         info!("Disconnecting from {}", device.address());
         device.disconnect().await?;
      }
      Ok(())
   }
}

impl Transport for GattTransport {
   async fn connect(&self, events: TransportEventTx) -> Result<()> {
      let mut link = self.link.write().await;
      let _ = link.take();

      let device = self.find_device().await?;
      let address = device.address();
      *self.device.lock() = Some(device.clone());

      let opened = async {
         let characteristic = self.open(&device).await?;
         let notifications = characteristic.notify().await?;
         let device_events = device.events().await?;
         Ok::<_, EspirError>((characteristic, notifications, device_events))
      }
      .await;
      let (characteristic, notifications, device_events) = match opened {
         Ok(opened) => opened,
         Err(e) => {
            if let Err(release) = self.release(&device).await {
               debug!("{address}: cleanup after failed setup: {release}");
            }
            return Err(e);
         },
      };

      // Writes block on the link lock until it is stored below.
      let _ = events.send(TransportEvent::Connected).await;

      let mut jset = JoinSet::new();
      jset.spawn(forward_notifications(address, notifications, events.clone()));
      jset.spawn(watch_link(address, device_events, events));
      *link = Some(GattLink {
         characteristic,
         jset,
      });

      info!("{address}: GATT link established");
      Ok(())
   }

   async fn disconnect(&self) -> Result<()> {
      // Waits for an attempt still holding the lock to be aborted.
      drop(self.link.write().await.take());

      let device = self.device.lock().clone();
      match device {
         Some(device) => self.release(&device).await,
         None => Ok(()),
      }
   }

   async fn write(&self, bytes: &[u8]) -> Result<()> {
      let link = self.link.read().await;
      let Some(link) = link.as_ref() else {
         return Err(EspirError::Transport(SmolStr::new_static("no active GATT link")));
      };

      time::timeout(WRITE_TIMEOUT, link.characteristic.write(bytes))
         .await
         .map_err(|_| EspirError::Transport(SmolStr::new_static("write timed out")))??;
      Ok(())
   }
}

async fn forward_notifications(
   address: Address,
   stream: impl Stream<Item = Vec<u8>>,
   tx: TransportEventTx,
) {
   let mut stream = pin!(stream);
   while let Some(value) = stream.next().await {
      debug!("← {address}: {} bytes", value.len());
      if tx.send(TransportEvent::BytesReceived(value)).await.is_err() {
         return;
      }
   }
   warn!("{address}: notification stream closed");
   let _ = tx
      .send(TransportEvent::Disconnected(SmolStr::new_static(
         "notification stream closed",
      )))
      .await;
}

async fn watch_link(address: Address, stream: impl Stream<Item = DeviceEvent>, tx: TransportEventTx) {
   let mut stream = pin!(stream);
   while let Some(event) = stream.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
         warn!("{address}: link lost");
         let _ = tx
            .send(TransportEvent::Disconnected(SmolStr::new_static("link lost")))
            .await;
         return;
      }
   }
}
