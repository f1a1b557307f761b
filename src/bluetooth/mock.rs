//! Scripted in-memory transport for tests.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   bluetooth::transport::{Packet, Transport, TransportEvent, TransportEventTx},
   error::{EspirError, Result},
   remote::{
      codec,
      protocol::{Envelope, ResponseStatus},
   },
};

pub type Responder = Box<dyn Fn(&Envelope) -> Option<Envelope> + Send + Sync>;

/// What the mock does with each successful write.
pub enum Reply {
   /// Nothing comes back.
   Silent,
   /// The written bytes are notified back unchanged.
   Echo,
   /// The decoded request is answered by a closure.
   Respond(Responder),
}

pub struct MockTransport {
   events: Mutex<Option<TransportEventTx>>,
   writes: Mutex<Vec<Packet>>,
   reply: Mutex<Reply>,
   auto_connect: bool,
   refuse_connect: bool,
   fail_writes: AtomicBool,
   disconnect_delay: Duration,
   write_delay: Duration,
   connects: Mutex<usize>,
}

impl MockTransport {
   /// A transport that connects immediately and never answers.
   pub fn new() -> Self {
      Self {
         events: Mutex::new(None),
         writes: Mutex::new(Vec::new()),
         reply: Mutex::new(Reply::Silent),
         auto_connect: true,
         refuse_connect: false,
         fail_writes: AtomicBool::new(false),
         disconnect_delay: Duration::ZERO,
         write_delay: Duration::ZERO,
         connects: Mutex::new(0),
      }
   }

   /// Connection attempts stay pending until an event is injected.
   pub fn manual() -> Self {
      Self {
         auto_connect: false,
         ..Self::new()
      }
   }

   /// Connection attempts fail straight away.
   pub fn refusing() -> Self {
      Self {
         refuse_connect: true,
         ..Self::new()
      }
   }

   /// `disconnect` takes `delay` before it reports back.
   pub fn with_disconnect_delay(self, delay: Duration) -> Self {
      Self {
         disconnect_delay: delay,
         ..self
      }
   }

   /// Every write takes `delay` before it lands.
   pub fn with_write_delay(self, delay: Duration) -> Self {
      Self {
         write_delay: delay,
         ..self
      }
   }

   pub fn with_reply(self, reply: Reply) -> Self {
      *self.reply.lock() = reply;
      self
   }

   /// Answers every request with `OK`, echoing its id and command.
   pub fn answering_ok() -> Self {
      Self::new().with_reply(Reply::Respond(Box::new(|req| {
         Some(ok_response(req, serde_json::json!({})))
      })))
   }

   pub fn into_arc(self) -> Arc<Self> {
      Arc::new(self)
   }

   pub fn set_fail_writes(&self, fail: bool) {
      self.fail_writes.store(fail, Ordering::Relaxed);
   }

   /// Number of connection attempts started so far.
   pub fn connects(&self) -> usize {
      *self.connects.lock()
   }

   pub fn writes(&self) -> Vec<Packet> {
      self.writes.lock().clone()
   }

   /// Written payloads decoded back into envelopes.
   pub fn requests(&self) -> Vec<Envelope> {
      self
         .writes()
         .iter()
         .filter_map(|bytes| codec::decode(bytes).ok())
         .collect()
   }

   /// Pushes an arbitrary event into the link as if the transport had
   /// reported it.
   pub async fn inject(&self, event: TransportEvent) {
      let tx = self.events.lock().clone();
      if let Some(tx) = tx {
         let _ = tx.send(event).await;
      }
   }
}

/// Builds an `OK` response to `request` carrying `data`.
pub fn ok_response(request: &Envelope, data: serde_json::Value) -> Envelope {
   Envelope {
      command: request.command.clone(),
      parameters: request.parameters.clone(),
      request_id: request.request_id.clone(),
      status: Some(ResponseStatus::Ok),
      message: Some("done".into()),
      data: Some(data),
   }
}

impl Transport for MockTransport {
   async fn connect(&self, events: TransportEventTx) -> Result<()> {
      *self.events.lock() = Some(events.clone());
      *self.connects.lock() += 1;
      if self.refuse_connect {
         return Err(EspirError::Transport(SmolStr::new_static("connection refused")));
      }
      if self.auto_connect {
         let _ = events.send(TransportEvent::Connected).await;
      }
      Ok(())
   }

   async fn disconnect(&self) -> Result<()> {
      if !self.disconnect_delay.is_zero() {
         tokio::time::sleep(self.disconnect_delay).await;
      }
      self
         .inject(TransportEvent::Disconnected(SmolStr::new_static("requested")))
         .await;
      Ok(())
   }

   async fn write(&self, bytes: &[u8]) -> Result<()> {
      if !self.write_delay.is_zero() {
         tokio::time::sleep(self.write_delay).await;
      }
      if self.fail_writes.load(Ordering::Relaxed) {
         return Err(EspirError::Transport(SmolStr::new_static("write rejected")));
      }
      self.writes.lock().push(bytes.to_vec());

      let answer = match &*self.reply.lock() {
         Reply::Silent => None,
         Reply::Echo => Some(bytes.to_vec()),
         Reply::Respond(respond) => codec::decode(bytes)
            .ok()
            .and_then(|req| respond(&req))
            .and_then(|resp| codec::encode(&resp).ok()),
      };
      if let Some(answer) = answer {
         self.inject(TransportEvent::BytesReceived(answer)).await;
      }
      Ok(())
   }
}
