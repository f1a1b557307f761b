//! ESPIR command-line front-end.
//!
//! Manages the local device/command repository and drives the remote
//! infrared blaster over Bluetooth LE.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use espir::{
   bluetooth::gatt::GattTransport,
   config::Config,
   error::{EspirError, Result},
   event::{Event, Subscribers},
   link::Link,
   remote::protocol::Command,
   service::IrService,
   store::{
      Repository,
      model::{DEFAULT_FREQUENCY, NewCommand, NewDevice},
   },
};

/// Exit status when a local change was stored but the remote device was
/// not updated.
const EXIT_UNSYNCED: u8 = 2;

#[derive(Parser)]
#[command(name = "espir", version)]
#[command(about = "Control an ESPIR infrared blaster over Bluetooth LE")]
struct Cli {
   /// Configuration file [default: $ESPIR_HOME/espir/config.toml]
   #[arg(short, long, global = true)]
   config: Option<PathBuf>,

   #[command(subcommand)]
   action: Action,
}

#[derive(Subcommand)]
enum Action {
   /// Manage device profiles
   #[command(subcommand)]
   Devices(DeviceAction),
   /// Manage stored IR commands
   #[command(subcommand)]
   Commands(CommandAction),
   /// Replay a stored IR command through the remote device
   Transmit { device: String, command: String },
   /// Capture an IR signal and store it as a new command
   Learn {
      device: String,
      name: String,
      /// Capture window in milliseconds
      #[arg(short, long)]
      timeout_ms: Option<u64>,
   },
   /// Query the remote device status
   Status,
}

#[derive(Subcommand)]
enum DeviceAction {
   /// List all devices with their commands
   List,
   /// Show a single device
   Show { name: String },
   /// Add a device profile and announce it to the remote device
   Add {
      name: String,
      #[arg(value_name = "TYPE")]
      kind: String,
      #[arg(long)]
      manufacturer: Option<String>,
      #[arg(long)]
      model: Option<String>,
      /// Only touch the local repository
      #[arg(long)]
      offline: bool,
   },
   /// Remove a device profile and all of its commands
   Remove {
      name: String,
      /// Only touch the local repository
      #[arg(long)]
      offline: bool,
   },
}

#[derive(Subcommand)]
enum CommandAction {
   /// List the commands of a device
   List { device: String },
   /// Store an already encoded IR code
   Add {
      device: String,
      name: String,
      code: String,
      #[arg(long)]
      protocol: Option<String>,
      #[arg(long, default_value_t = DEFAULT_FREQUENCY)]
      frequency: u32,
      #[arg(long)]
      description: Option<String>,
   },
   /// Remove a stored command
   Remove { device: String, name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   match run(Cli::parse()).await {
      Ok(code) => code,
      Err(e) => {
         error!("{e}");
         ExitCode::FAILURE
      },
   }
}

async fn run(cli: Cli) -> Result<ExitCode> {
   let config = match &cli.config {
      Some(path) => Config::load_from(path)?,
      None => Config::load()?,
   };

   let bus = Subscribers::new();
   let repository = Repository::open(&config.database_path()?, bus.clone())?;

   match cli.action {
      Action::Devices(action) => devices(action, &config, repository, bus).await,
      Action::Commands(action) => commands(action, &repository).await,
      Action::Transmit { device, command } => {
         let service = connect(&config, repository, bus).await?;
         let result = service.send_transmit(&device, &command).await;
         finish(&service, result).await
      },
      Action::Learn {
         device,
         name,
         timeout_ms,
      } => {
         let timeout = timeout_ms.map_or_else(|| config.learn_timeout(), Duration::from_millis);
         let service = connect(&config, repository, bus).await?;
         info!("Point the remote at the receiver and press the button...");
         let result = service.learn_command(&device, &name, timeout).await;
         finish(&service, result).await
      },
      Action::Status => {
         let service = connect(&config, repository, bus).await?;
         let result = service.get_status().await;
         finish(&service, result).await
      },
   }
}

async fn devices(
   action: DeviceAction,
   config: &Config,
   repository: Repository,
   bus: Arc<Subscribers>,
) -> Result<ExitCode> {
   match action {
      DeviceAction::List => print_json(&repository.devices_with_commands().await?),
      DeviceAction::Show { name } => match repository.device_with_commands(&name).await? {
         Some(device) => print_json(&device),
         None => Err(EspirError::DeviceNotFound(name.into())),
      },
      DeviceAction::Add {
         name,
         kind,
         manufacturer,
         model,
         offline,
      } => {
         let mut new = NewDevice::new(name.as_str(), kind);
         new.manufacturer = manufacturer.map(Into::into);
         new.model = model.map(Into::into);

         if offline {
            return print_json(&repository.add_device(new).await?);
         }
         let service = open_service(config, repository.clone(), bus).await?;
         if let Err(e) = service.connect().await {
            warn!("Remote device unavailable: {e}");
         }
         match service.add_device(new).await {
            Err(EspirError::RemoteSyncFailed { command, source }) => {
               disconnect(&service).await;
               let stored = repository.get_device_by_name(&name).await?;
               report_unsynced(&stored, &command, &source)
            },
            result => finish(&service, result).await,
         }
      },
      DeviceAction::Remove { name, offline } => {
         if offline {
            return match repository.delete_device_by_name(&name).await? {
               Some(device) => print_json(&device),
               None => Ok(ExitCode::SUCCESS),
            };
         }
         let existing = repository.get_device_by_name(&name).await?;
         let service = open_service(config, repository, bus).await?;
         if let Err(e) = service.connect().await {
            warn!("Remote device unavailable: {e}");
         }
         match service.delete_device(&name).await {
            Err(EspirError::RemoteSyncFailed { command, source }) => {
               disconnect(&service).await;
               report_unsynced(&existing, &command, &source)
            },
            result => finish(&service, result).await,
         }
      },
   }
}

async fn commands(action: CommandAction, repository: &Repository) -> Result<ExitCode> {
   match action {
      CommandAction::List { device } => match repository.device_with_commands(&device).await? {
         Some(device) => print_json(&device.commands),
         None => Err(EspirError::DeviceNotFound(device.into())),
      },
      CommandAction::Add {
         device,
         name,
         code,
         protocol,
         frequency,
         description,
      } => {
         let Some(profile) = repository.get_device_by_name(&device).await? else {
            return Err(EspirError::DeviceNotFound(device.into()));
         };
         let mut new = NewCommand::new(name, code).frequency(frequency);
         new.protocol = protocol.map(Into::into);
         new.description = description.map(Into::into);
         print_json(&repository.add_command(profile.id, new).await?)
      },
      CommandAction::Remove { device, name } => {
         let Some(profile) = repository.get_device_by_name(&device).await? else {
            return Ok(ExitCode::SUCCESS);
         };
         if let Some(command) = repository.get_command_by_name(profile.id, &name).await? {
            repository.delete_command(command.id).await?;
         }
         Ok(ExitCode::SUCCESS)
      },
   }
}

async fn open_service(config: &Config, repository: Repository, bus: Arc<Subscribers>) -> Result<IrService> {
   spawn_event_logger(bus.subscribe());
   let transport = Arc::new(GattTransport::new(config).await?);
   let link = Link::spawn(transport, config.link_config(), bus.clone());
   Ok(IrService::new(link, repository, bus))
}

async fn connect(config: &Config, repository: Repository, bus: Arc<Subscribers>) -> Result<IrService> {
   let service = open_service(config, repository, bus).await?;
   service.connect().await?;
   Ok(service)
}

async fn disconnect(service: &IrService) {
   if let Err(e) = service.disconnect().await {
      warn!("Failed to disconnect cleanly: {e}");
   }
}

/// Prints the outcome and closes the link.
async fn finish<T: Serialize>(service: &IrService, result: Result<T>) -> Result<ExitCode> {
   disconnect(service).await;
   print_json(&result?)
}

/// The local write already happened; prints what was stored next to the
/// command that still has to reach the remote device.
fn report_unsynced(local: &impl Serialize, command: &Command, source: &EspirError) -> Result<ExitCode> {
   if source.is_link_failure() {
      warn!("{} not sent, remote device unreachable: {source}", command.kind());
   } else {
      warn!("{} refused by remote device: {source}", command.kind());
   }
   print_json(&unsynced_report(local, command, source))?;
   Ok(ExitCode::from(EXIT_UNSYNCED))
}

fn unsynced_report(local: &impl Serialize, command: &Command, source: &EspirError) -> serde_json::Value {
   json!({
      "local": local,
      "unsynced": command.kind().as_str(),
      "error": source.to_string(),
   })
}

fn print_json(value: &impl Serialize) -> Result<ExitCode> {
   let text = serde_json::to_string_pretty(value).map_err(EspirError::Encode)?;
   println!("{text}");
   Ok(ExitCode::SUCCESS)
}

fn spawn_event_logger(mut events: mpsc::UnboundedReceiver<Event>) {
   tokio::spawn(async move {
      while let Some(event) = events.recv().await {
         match event {
            Event::StateChanged(state) => info!("Link {state}"),
            Event::Notification(envelope) => info!(
               "Remote: {}",
               envelope
                  .message
                  .as_deref()
                  .unwrap_or(envelope.command.as_str())
            ),
            Event::DevicesChanged => debug!("Device list changed"),
            Event::CommandsChanged(id) => debug!("Commands of device #{id} changed"),
         }
      }
   });
}

#[cfg(test)]
mod tests {
   use espir::store::model::Device;

   use super::*;

   #[test]
   fn test_unsynced_report_keeps_local_record() {
      let device = Device {
         id: 7,
         name: "TV".into(),
         kind: "television".into(),
         manufacturer: Some("LG".into()),
         model: None,
      };
      let report = unsynced_report(
         &Some(&device),
         &device.add_command(),
         &EspirError::NotConnected,
      );

      assert_eq!(report["local"]["id"], 7);
      assert_eq!(report["local"]["name"], "TV");
      assert_eq!(report["local"]["type"], "television");
      assert_eq!(report["unsynced"], "ADD_DEVICE");
      assert_eq!(report["error"], "Not connected");
   }

   #[test]
   fn test_unsynced_report_after_delete() {
      let report = unsynced_report(
         &None::<()>,
         &Command::DeleteDevice { name: "TV".into() },
         &EspirError::ConnectionLost,
      );
      assert!(report["local"].is_null());
      assert_eq!(report["unsynced"], "DELETE_DEVICE");
   }
}
