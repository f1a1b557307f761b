//! Caller-facing operations.
//!
//! Combines the link and the repository. Operations that change a device
//! profile write the repository first and then propagate the change to the
//! remote device; a failed propagation never rolls the local write back and
//! is reported as [`EspirError::RemoteSyncFailed`] so it can be retried.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{sync::mpsc, time};

use crate::{
   error::{EspirError, Result},
   event::{Event, Subscribers},
   link::{Link, LinkState},
   remote::protocol::{Command, CommandKind, Envelope, LearnedCode, ResponseStatus},
   store::{
      Repository,
      model::{Device, IrCommand, NewCommand, NewDevice},
   },
};

/// Entry point for UI and CLI front-ends.
#[derive(Clone)]
pub struct IrService {
   link: Link,
   repository: Repository,
   events: Arc<Subscribers>,
}

impl IrService {
   /// `events` must be the bus the link publishes to; LEARN listens on it
   /// for the capture result.
   pub const fn new(link: Link, repository: Repository, events: Arc<Subscribers>) -> Self {
      Self {
         link,
         repository,
         events,
      }
   }

   pub const fn repository(&self) -> &Repository {
      &self.repository
   }

   pub fn state(&self) -> LinkState {
      self.link.state()
   }

   pub async fn connect(&self) -> Result<()> {
      self.link.connect().await
   }

   pub async fn disconnect(&self) -> Result<()> {
      self.link.disconnect().await
   }

   /// Sends `command` and turns a non-OK answer into `Rejected`.
   async fn execute(&self, command: Command) -> Result<Envelope> {
      debug!("Executing {command}");
      let response = self.link.request(command).await?;
      if response.is_success() {
         Ok(response)
      } else {
         Err(rejection(&response))
      }
   }

   /// Propagates a local change; any failure is attributed to `command`.
   async fn sync(&self, command: Command) -> Result<()> {
      match self.execute(command.clone()).await {
         Ok(_) => Ok(()),
         Err(source) => {
            if source.is_link_failure() {
               warn!("{command} not propagated, remote unreachable: {source}");
            } else {
               warn!("{command} not propagated: {source}");
            }
            Err(EspirError::RemoteSyncFailed {
               command,
               source: Box::new(source),
            })
         },
      }
   }

   /// Replays a stored IR command through the remote device.
   pub async fn send_transmit(&self, device: &str, command: &str) -> Result<Envelope> {
      let Some(profile) = self.repository.get_device_by_name(device).await? else {
         return Err(EspirError::DeviceNotFound(SmolStr::new(device)));
      };
      let Some(stored) = self
         .repository
         .get_command_by_name(profile.id, command)
         .await?
      else {
         return Err(EspirError::CommandNotFound {
            device: profile.name,
            command: SmolStr::new(command),
         });
      };

      info!("Transmitting {}/{}", profile.name, stored.name);
      self
         .execute(Command::Transmit {
            device: profile.name,
            command: stored.name,
         })
         .await
   }

   /// Puts the remote device into learn mode and returns its first answer.
   pub async fn start_learning(&self, timeout: Duration) -> Result<Envelope> {
      self.execute(Command::Learn { timeout }).await
   }

   /// Learns a code and stores it as command `name` of `device`.
   ///
   /// The firmware may acknowledge LEARN first and push the captured code
   /// later as a separate message; both shapes are handled.
   pub async fn learn_command(&self, device: &str, name: &str, timeout: Duration) -> Result<IrCommand> {
      let Some(profile) = self.repository.get_device_by_name(device).await? else {
         return Err(EspirError::DeviceNotFound(SmolStr::new(device)));
      };
      if self
         .repository
         .get_command_by_name(profile.id, name)
         .await?
         .is_some()
      {
         return Err(EspirError::DuplicateName(SmolStr::new(name)));
      }

      let learn = Command::Learn { timeout };
      let window = self.link.config().response_window(&learn);
      // Subscribed before sending so the follow-up cannot slip past.
      let mut events = self.events.subscribe();
      let ack = self.execute(learn).await?;

      let learned = match ack.learned_code() {
         Some(learned) => learned,
         None => {
            info!("Waiting up to {window:?} for an IR signal...");
            time::timeout(window, wait_for_capture(&mut events))
               .await
               .map_err(|_| EspirError::Timeout {
                  command: CommandKind::Learn,
               })??
         },
      };

      let mut new = NewCommand::new(name, learned.code);
      if let Some(protocol) = learned.protocol {
         new = new.protocol(protocol);
      }
      let stored = self.repository.add_command(profile.id, new).await?;
      info!("Learned {}/{}", profile.name, stored.name);
      Ok(stored)
   }

   /// Stores a device locally, then announces it to the remote device.
   pub async fn add_device(&self, new: NewDevice) -> Result<Device> {
      let device = self.repository.add_device(new).await?;
      info!("Added device {}", device.name);
      self.sync(device.add_command()).await?;
      Ok(device)
   }

   /// Deletes a device with all its commands, then tells the remote device.
   ///
   /// Deleting an unknown device succeeds without contacting the remote.
   pub async fn delete_device(&self, name: &str) -> Result<Option<Device>> {
      let Some(device) = self.repository.delete_device_by_name(name).await? else {
         debug!("Device {name} not stored, nothing to delete");
         return Ok(None);
      };
      info!("Deleted device {}", device.name);
      self
         .sync(Command::DeleteDevice {
            name: device.name.clone(),
         })
         .await?;
      Ok(Some(device))
   }

   /// Stores an IR command locally. The remote device has no counterpart.
   pub async fn add_command(&self, device: &str, new: NewCommand) -> Result<IrCommand> {
      let Some(profile) = self.repository.get_device_by_name(device).await? else {
         return Err(EspirError::DeviceNotFound(SmolStr::new(device)));
      };
      self.repository.add_command(profile.id, new).await
   }

   /// Removes an IR command locally. Returns `false` if it did not exist.
   pub async fn delete_command(&self, device: &str, name: &str) -> Result<bool> {
      let Some(profile) = self.repository.get_device_by_name(device).await? else {
         return Ok(false);
      };
      match self.repository.get_command_by_name(profile.id, name).await? {
         Some(command) => self.repository.delete_command(command.id).await,
         None => Ok(false),
      }
   }

   pub async fn get_status(&self) -> Result<Envelope> {
      self.execute(Command::GetStatus).await
   }

   /// Re-sends a command whose propagation failed earlier.
   pub async fn retry_sync(&self, command: Command) -> Result<()> {
      self.sync(command).await
   }
}

fn rejection(response: &Envelope) -> EspirError {
   EspirError::Rejected {
      status: response.status.unwrap_or(ResponseStatus::Unknown),
      message: response.failure_message(),
   }
}

async fn wait_for_capture(events: &mut mpsc::UnboundedReceiver<Event>) -> Result<LearnedCode> {
   while let Some(event) = events.recv().await {
      match event {
         Event::Notification(envelope) => {
            if let Some(learned) = envelope.learned_code() {
               return Ok(learned);
            }
            if !envelope.is_success() {
               return Err(rejection(&envelope));
            }
         },
         Event::StateChanged(LinkState::Disconnected) => return Err(EspirError::ConnectionLost),
         _ => {},
      }
   }
   Err(EspirError::LinkShutdown)
}

#[cfg(test)]
mod tests {
   use serde_json::json;
   use tempfile::TempDir;

   use super::*;
   use crate::{
      bluetooth::{
         mock::{MockTransport, Reply, ok_response},
         transport::TransportEvent,
      },
      link::LinkConfig,
   };

   struct Harness {
      service: IrService,
      mock: Arc<MockTransport>,
      _dir: TempDir,
   }

   fn harness(mock: MockTransport) -> Harness {
      let dir = TempDir::new().unwrap();
      let bus = Subscribers::new();
      let mock = mock.into_arc();
      let config = LinkConfig {
         request_timeout: Duration::from_millis(300),
         learn_grace: Duration::from_millis(100),
         connect_timeout: Duration::from_millis(300),
         disconnect_timeout: Duration::from_millis(300),
      };
      let link = Link::spawn(mock.clone(), config, bus.clone());
      let repository = Repository::open(dir.path(), bus.clone()).unwrap();
      Harness {
         service: IrService::new(link, repository, bus),
         mock,
         _dir: dir,
      }
   }

   fn answering(status: ResponseStatus, data: serde_json::Value) -> MockTransport {
      MockTransport::new().with_reply(Reply::Respond(Box::new(move |req| {
         let mut resp = ok_response(req, data.clone());
         resp.status = Some(status);
         Some(resp)
      })))
   }

   #[tokio::test]
   async fn test_add_device_offline_keeps_local_row() {
      let h = harness(MockTransport::answering_ok());

      let result = h.service.add_device(NewDevice::new("TV", "television")).await;
      let Err(EspirError::RemoteSyncFailed { command, source }) = result else {
         panic!("expected RemoteSyncFailed");
      };
      assert_eq!(command.kind(), CommandKind::AddDevice);
      assert!(matches!(*source, EspirError::NotConnected));

      let stored = h.service.repository().get_device_by_name("TV").await.unwrap();
      assert!(stored.is_some());
      assert!(h.mock.writes().is_empty());
   }

   #[tokio::test]
   async fn test_add_device_online_propagates() {
      let h = harness(MockTransport::answering_ok());
      h.service.connect().await.unwrap();

      let device = h
         .service
         .add_device(NewDevice::new("TV", "television").manufacturer("Sony"))
         .await
         .unwrap();
      assert_eq!(device.name, "TV");

      let sent = h.mock.requests();
      assert_eq!(sent.len(), 1);
      assert_eq!(sent[0].command, "ADD_DEVICE");
      assert_eq!(sent[0].parameters["name"], "TV");
      assert_eq!(sent[0].parameters["type"], "television");
      assert_eq!(sent[0].parameters["manufacturer"], "Sony");
   }

   #[tokio::test]
   async fn test_duplicate_device_never_reaches_remote() {
      let h = harness(MockTransport::answering_ok());
      h.service.connect().await.unwrap();
      h.service
         .add_device(NewDevice::new("TV", "television"))
         .await
         .unwrap();

      assert!(matches!(
         h.service.add_device(NewDevice::new("TV", "television")).await,
         Err(EspirError::DuplicateName(_))
      ));
      assert_eq!(h.mock.writes().len(), 1);
   }

   #[tokio::test]
   async fn test_remote_rejection_is_sync_failure() {
      let h = harness(answering(
         ResponseStatus::Error,
         json!({"error": "STORAGE_FULL"}),
      ));
      h.service.connect().await.unwrap();

      let result = h.service.add_device(NewDevice::new("TV", "television")).await;
      let Err(EspirError::RemoteSyncFailed { source, .. }) = result else {
         panic!("expected RemoteSyncFailed");
      };
      assert!(matches!(
         *source,
         EspirError::Rejected {
            status: ResponseStatus::Error,
            ..
         }
      ));
      assert!(
         h.service
            .repository()
            .get_device_by_name("TV")
            .await
            .unwrap()
            .is_some()
      );
   }

   #[tokio::test]
   async fn test_retry_after_reconnect() {
      let h = harness(MockTransport::answering_ok());
      let Err(EspirError::RemoteSyncFailed { command, .. }) =
         h.service.add_device(NewDevice::new("TV", "television")).await
      else {
         panic!("expected RemoteSyncFailed");
      };

      h.service.connect().await.unwrap();
      h.service.retry_sync(command).await.unwrap();
      assert_eq!(h.mock.requests()[0].command, "ADD_DEVICE");
      assert_eq!(h.service.repository().list_devices().await.unwrap().len(), 1);
   }

   #[tokio::test]
   async fn test_delete_device_cascades_and_propagates() {
      let h = harness(MockTransport::answering_ok());
      let _ = h.service.add_device(NewDevice::new("TV", "television")).await;
      h.service
         .add_command("TV", NewCommand::new("power", "{}"))
         .await
         .unwrap();
      h.service.connect().await.unwrap();

      let removed = h.service.delete_device("TV").await.unwrap().unwrap();
      assert!(
         h.service
            .repository()
            .list_commands(removed.id)
            .await
            .unwrap()
            .is_empty()
      );
      let sent = h.mock.requests();
      assert_eq!(sent.len(), 1);
      assert_eq!(sent[0].command, "DELETE_DEVICE");
      assert_eq!(sent[0].parameters["name"], "TV");
   }

   #[tokio::test]
   async fn test_delete_unknown_device_is_silent() {
      let h = harness(MockTransport::answering_ok());
      h.service.connect().await.unwrap();
      assert!(h.service.delete_device("Radio").await.unwrap().is_none());
      assert!(h.mock.writes().is_empty());
   }

   #[tokio::test]
   async fn test_transmit_resolves_names_first() {
      let h = harness(MockTransport::answering_ok());
      let _ = h.service.add_device(NewDevice::new("TV", "television")).await;
      h.service
         .add_command("TV", NewCommand::new("power", "{}"))
         .await
         .unwrap();
      h.service.connect().await.unwrap();

      assert!(matches!(
         h.service.send_transmit("Radio", "power").await,
         Err(EspirError::DeviceNotFound(_))
      ));
      assert!(matches!(
         h.service.send_transmit("TV", "mute").await,
         Err(EspirError::CommandNotFound { .. })
      ));
      assert!(h.mock.writes().is_empty());

      let response = h.service.send_transmit("TV", "power").await.unwrap();
      assert!(response.is_success());
      let sent = h.mock.requests();
      assert_eq!(sent[0].command, "TRANSMIT");
      assert_eq!(sent[0].parameters["device"], "TV");
      assert_eq!(sent[0].parameters["command"], "power");
   }

   #[tokio::test]
   async fn test_transmit_not_found_on_remote() {
      let h = harness(answering(
         ResponseStatus::NotFound,
         json!({"error": "COMMAND_NOT_FOUND"}),
      ));
      let _ = h.service.add_device(NewDevice::new("TV", "television")).await;
      h.service
         .add_command("TV", NewCommand::new("power", "{}"))
         .await
         .unwrap();
      h.service.connect().await.unwrap();

      let result = h.service.send_transmit("TV", "power").await;
      let Err(EspirError::Rejected { status, message }) = result else {
         panic!("expected Rejected");
      };
      assert_eq!(status, ResponseStatus::NotFound);
      assert!(message.contains("COMMAND_NOT_FOUND"));
   }

   #[tokio::test]
   async fn test_learn_with_code_in_response() {
      let h = harness(answering(
         ResponseStatus::Ok,
         json!({"protocol": "NEC", "value": "20df10ef", "bits": 32}),
      ));
      let _ = h.service.add_device(NewDevice::new("TV", "television")).await;
      h.service.connect().await.unwrap();

      let stored = h
         .service
         .learn_command("TV", "power", Duration::from_millis(200))
         .await
         .unwrap();
      assert_eq!(stored.protocol.as_deref(), Some("NEC"));
      let code: serde_json::Value = serde_json::from_str(&stored.code).unwrap();
      assert_eq!(code["value"], "20df10ef");

      let sent = h.mock.requests();
      let learn = sent.iter().find(|r| r.command == "LEARN").unwrap();
      assert_eq!(learn.parameters["timeout"], "200");
   }

   #[tokio::test]
   async fn test_learn_with_code_pushed_later() {
      let h = harness(answering(
         ResponseStatus::Ok,
         json!({"status": "learning", "timeout": 200}),
      ));
      let _ = h.service.add_device(NewDevice::new("TV", "television")).await;
      h.service.connect().await.unwrap();

      let learning = {
         let service = h.service.clone();
         tokio::spawn(async move {
            service
               .learn_command("TV", "power", Duration::from_millis(200))
               .await
         })
      };
      for _ in 0..100 {
         if h.mock.requests().iter().any(|r| r.command == "LEARN") {
            break;
         }
         time::sleep(Duration::from_millis(5)).await;
      }
      h.mock
         .inject(TransportEvent::BytesReceived(
            br#"{"status":"OK","message":"IR code learned successfully","data":{"protocol":"SONY","value":"a90","bits":12}}"#
               .to_vec(),
         ))
         .await;

      let stored = learning.await.unwrap().unwrap();
      assert_eq!(stored.protocol.as_deref(), Some("SONY"));
      let tv = h
         .service
         .repository()
         .device_with_commands("TV")
         .await
         .unwrap()
         .unwrap();
      assert_eq!(tv.commands.len(), 1);
   }

   #[tokio::test]
   async fn test_learn_without_signal_times_out() {
      let h = harness(answering(
         ResponseStatus::Ok,
         json!({"status": "learning", "timeout": 100}),
      ));
      let _ = h.service.add_device(NewDevice::new("TV", "television")).await;
      h.service.connect().await.unwrap();

      assert!(matches!(
         h.service
            .learn_command("TV", "power", Duration::from_millis(100))
            .await,
         Err(EspirError::Timeout {
            command: CommandKind::Learn
         })
      ));
      assert!(
         h.service
            .repository()
            .get_device_by_name("TV")
            .await
            .unwrap()
            .is_some()
      );
   }

   #[tokio::test]
   async fn test_start_learning_returns_acknowledgement() {
      let h = harness(answering(
         ResponseStatus::Ok,
         json!({"status": "learning", "timeout": 5000}),
      ));
      h.service.connect().await.unwrap();

      let ack = h
         .service
         .start_learning(Duration::from_secs(5))
         .await
         .unwrap();
      assert_eq!(ack.data.as_ref().unwrap()["status"], "learning");
      assert!(ack.learned_code().is_none());

      let sent = h.mock.requests();
      assert_eq!(sent.len(), 1);
      assert_eq!(sent[0].command, "LEARN");
      assert_eq!(sent[0].parameters["timeout"], "5000");
   }

   #[tokio::test]
   async fn test_start_learning_busy_is_rejected() {
      let h = harness(answering(ResponseStatus::Error, json!({"error": "BUSY"})));
      h.service.connect().await.unwrap();

      let result = h.service.start_learning(Duration::from_secs(5)).await;
      let Err(EspirError::Rejected { status, .. }) = result else {
         panic!("expected Rejected");
      };
      assert_eq!(status, ResponseStatus::Error);
   }

   #[tokio::test]
   async fn test_status_while_disconnected() {
      let h = harness(MockTransport::answering_ok());
      assert!(matches!(
         h.service.get_status().await,
         Err(EspirError::NotConnected)
      ));
      assert_eq!(h.service.state(), LinkState::Disconnected);
   }
}
