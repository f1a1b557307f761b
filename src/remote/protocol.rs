//! ESPIR protocol definitions and data structures.
//!
//! This module contains the closed set of logical commands understood by the
//! firmware, the envelope exchanged on the wire, and the response status
//! vocabulary.

use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use smol_str::{SmolStr, ToSmolStr};

/// Named string parameters carried by an envelope.
pub type Parameters = BTreeMap<String, String>;

/// Wire names of the logical commands.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
   Transmit,
   Learn,
   AddDevice,
   DeleteDevice,
   GetStatus,
}

impl CommandKind {
   pub fn as_str(self) -> &'static str {
      self.into()
   }
}

/// A logical command addressed to the remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
   /// Replay the stored code `command` of `device`.
   Transmit { device: SmolStr, command: SmolStr },
   /// Capture the next IR signal seen within `timeout`.
   Learn { timeout: Duration },
   AddDevice {
      name: SmolStr,
      kind: SmolStr,
      manufacturer: Option<SmolStr>,
      model: Option<SmolStr>,
   },
   DeleteDevice { name: SmolStr },
   GetStatus,
}

impl Command {
   pub const fn kind(&self) -> CommandKind {
      match self {
         Self::Transmit { .. } => CommandKind::Transmit,
         Self::Learn { .. } => CommandKind::Learn,
         Self::AddDevice { .. } => CommandKind::AddDevice,
         Self::DeleteDevice { .. } => CommandKind::DeleteDevice,
         Self::GetStatus => CommandKind::GetStatus,
      }
   }

   /// Renders the command arguments as envelope parameters.
   pub fn parameters(&self) -> Parameters {
      let mut params = Parameters::new();
      match self {
         Self::Transmit { device, command } => {
            params.insert("device".into(), device.to_string());
            params.insert("command".into(), command.to_string());
         },
         Self::Learn { timeout } => {
            params.insert("timeout".into(), timeout.as_millis().to_string());
         },
         Self::AddDevice {
            name,
            kind,
            manufacturer,
            model,
         } => {
            params.insert("name".into(), name.to_string());
            params.insert("type".into(), kind.to_string());
            if let Some(manufacturer) = manufacturer {
               params.insert("manufacturer".into(), manufacturer.to_string());
            }
            if let Some(model) = model {
               params.insert("model".into(), model.to_string());
            }
         },
         Self::DeleteDevice { name } => {
            params.insert("name".into(), name.to_string());
         },
         Self::GetStatus => {},
      }
      params
   }
}

impl fmt::Display for Command {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Transmit { device, command } => write!(f, "TRANSMIT({device}, {command})"),
         Self::Learn { timeout } => write!(f, "LEARN({}ms)", timeout.as_millis()),
         Self::AddDevice { name, kind, .. } => write!(f, "ADD_DEVICE({name}, {kind})"),
         Self::DeleteDevice { name } => write!(f, "DELETE_DEVICE({name})"),
         Self::GetStatus => f.write_str("GET_STATUS()"),
      }
   }
}

/// Correlation identifier shared by a request and its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(SmolStr);

impl RequestId {
   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl From<u64> for RequestId {
   fn from(n: u64) -> Self {
      Self(n.to_smolstr())
   }
}

impl From<&str> for RequestId {
   fn from(s: &str) -> Self {
      Self(SmolStr::new(s))
   }
}

impl fmt::Display for RequestId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl<'de> Deserialize<'de> for RequestId {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      // Firmware builds may echo the id back as a bare number.
      #[derive(Deserialize)]
      #[serde(untagged)]
      enum Raw {
         Text(SmolStr),
         Number(u64),
      }
      Ok(match Raw::deserialize(deserializer)? {
         Raw::Text(s) => Self(s),
         Raw::Number(n) => Self::from(n),
      })
   }
}

/// Result indicator attached to responses by the firmware.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
   Ok,
   Error,
   Timeout,
   NotFound,
   Invalid,
   #[serde(other)]
   Unknown,
}

/// Structured message exchanged with the remote device.
///
/// Requests fill `command`, `parameters` and `request_id`. Responses and
/// notifications use the same shape and may add `status`, `message` and an
/// opaque `data` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
   #[serde(default)]
   pub command: SmolStr,

   #[serde(default, deserialize_with = "lenient_parameters")]
   pub parameters: Parameters,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub request_id: Option<RequestId>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub status: Option<ResponseStatus>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub message: Option<String>,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub data: Option<Value>,
}

/// Accepts scalar parameter values of any JSON type and keeps their text.
fn lenient_parameters<'de, D>(deserializer: D) -> Result<Parameters, D::Error>
where
   D: Deserializer<'de>,
{
   let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?;
   Ok(raw
      .unwrap_or_default()
      .into_iter()
      .map(|(k, v)| {
         let v = match v {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
         };
         (k, v)
      })
      .collect())
}

/// An IR code captured by a LEARN operation, kept as an opaque blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedCode {
   pub code: String,
   pub protocol: Option<SmolStr>,
}

impl Envelope {
   /// Builds the request envelope for `command`.
   pub fn request(command: &Command, request_id: RequestId) -> Self {
      Self {
         command: command.kind().as_str().into(),
         parameters: command.parameters(),
         request_id: Some(request_id),
         status: None,
         message: None,
         data: None,
      }
   }

   /// Responses without an explicit status are treated as successful.
   pub fn is_success(&self) -> bool {
      matches!(self.status, None | Some(ResponseStatus::Ok))
   }

   /// Human readable description of a failed response.
   pub fn failure_message(&self) -> String {
      let mut parts: Vec<&str> = Vec::new();
      if let Some(message) = self.message.as_deref() {
         parts.push(message);
      }
      if let Some(data) = &self.data {
         for key in ["error", "details"] {
            if let Some(text) = data.get(key).and_then(Value::as_str) {
               parts.push(text);
            }
         }
      }
      if parts.is_empty() {
         "no details".to_string()
      } else {
         parts.join(": ")
      }
   }

   /// Extracts the captured code from a LEARN response.
   ///
   /// The whole `data` object is kept as the code payload; only its
   /// `protocol` tag is looked at.
   pub fn learned_code(&self) -> Option<LearnedCode> {
      let data = self.data.as_ref()?;
      data.get("value")?;
      let protocol = data
         .get("protocol")
         .and_then(Value::as_str)
         .map(SmolStr::new);
      Some(LearnedCode {
         code: data.to_string(),
         protocol,
      })
   }
}
