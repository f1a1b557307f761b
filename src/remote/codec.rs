//! Envelope encoding and decoding.
//!
//! Outgoing envelopes are serialized as compact JSON. Incoming notification
//! payloads are parsed leniently: the firmware terminates strings with NUL
//! and may omit fields that carry no information.

use std::str;

use thiserror::Error;

use crate::{
   error::{EspirError, Result},
   remote::protocol::Envelope,
};

/// Error type for inbound payload decoding.
#[derive(Error, Debug)]
pub enum DecodeError {
   /// Nothing but padding was received
   #[error("empty payload")]
   Empty,

   /// Payload is not valid UTF-8
   #[error("payload is not UTF-8: {0}")]
   NotUtf8(#[from] str::Utf8Error),

   /// Payload is not a JSON envelope, or was cut short
   #[error("malformed envelope: {0}")]
   Json(#[from] serde_json::Error),

   /// Parsed object carries none of the envelope fields
   #[error("payload carries no command, request id or status")]
   NotAnEnvelope,
}

/// Serializes an envelope for the wire.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
   serde_json::to_vec(envelope).map_err(EspirError::Encode)
}

/// Parses a notification payload into an envelope.
pub fn decode(bytes: &[u8]) -> std::result::Result<Envelope, DecodeError> {
   let text = str::from_utf8(bytes)?.trim_end_matches('\0').trim();
   if text.is_empty() {
      return Err(DecodeError::Empty);
   }

   let envelope: Envelope = serde_json::from_str(text)?;
   if envelope.command.is_empty() && envelope.request_id.is_none() && envelope.status.is_none() {
      return Err(DecodeError::NotAnEnvelope);
   }
   Ok(envelope)
}

/// Short printable preview of a payload for log lines.
pub fn preview(bytes: &[u8]) -> String {
   match str::from_utf8(bytes) {
      Ok(text) if text.len() <= 96 => text.to_string(),
      Ok(text) => {
         let cut = text.char_indices().nth(96).map_or(text.len(), |(i, _)| i);
         format!("{}..", &text[..cut])
      },
      Err(_) if bytes.len() <= 32 => hex::encode(bytes),
      Err(_) => format!("{}..", hex::encode(&bytes[..32])),
   }
}
