//! Request/response correlation.
//!
//! Every request in flight owns one entry in the [`PendingTable`], keyed by
//! its [`RequestId`]. An entry is removed by exactly one of: its matching
//! response, its deadline passing, or the link dropping.

use std::{collections::HashMap, time::Duration};

use log::debug;
use tokio::{sync::oneshot, time::Instant};

use crate::{
   error::{EspirError, Result},
   remote::protocol::{CommandKind, Envelope, RequestId},
};

/// Delivers the eventual outcome to the original caller.
pub type Reply = oneshot::Sender<Result<Envelope>>;

#[derive(Debug)]
pub struct PendingRequest {
   pub command: CommandKind,
   pub issued: Instant,
   pub deadline: Instant,
   reply: Reply,
}

impl PendingRequest {
   pub fn new(command: CommandKind, window: Duration, reply: Reply) -> Self {
      let issued = Instant::now();
      Self {
         command,
         issued,
         deadline: issued + window,
         reply,
      }
   }

   fn complete(self, result: Result<Envelope>) {
      // The caller may have given up waiting; nothing to do then.
      let _ = self.reply.send(result);
   }
}

#[derive(Debug, Default)]
pub struct PendingTable {
   entries: HashMap<RequestId, PendingRequest>,
}

impl PendingTable {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn register(&mut self, id: RequestId, request: PendingRequest) {
      debug!("Awaiting {} #{id}", request.command);
      if let Some(previous) = self.entries.insert(id, request) {
         // Ids are checked against the table before use; this only happens
         // if a caller bypasses `RequestIds`.
         previous.complete(Err(EspirError::ConnectionLost));
      }
   }

   pub fn contains(&self, id: &RequestId) -> bool {
      self.entries.contains_key(id)
   }

   pub fn len(&self) -> usize {
      self.entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.entries.is_empty()
   }

   /// Routes an inbound envelope to its waiter.
   ///
   /// Returns the envelope back when nobody was waiting for it, so the caller
   /// can publish it as an unsolicited notification.
   pub fn resolve(&mut self, envelope: Envelope) -> Option<Envelope> {
      let Some(id) = envelope.request_id.as_ref() else {
         return Some(envelope);
      };
      let Some(pending) = self.entries.remove(id) else {
         return Some(envelope);
      };
      debug!(
         "{} #{id} answered after {:?}",
         pending.command,
         pending.issued.elapsed()
      );
      pending.complete(Ok(envelope));
      None
   }

   /// Resolves a single request with `err`. Returns whether it was pending.
   pub fn fail(&mut self, id: &RequestId, err: EspirError) -> bool {
      match self.entries.remove(id) {
         Some(pending) => {
            pending.complete(Err(err));
            true
         },
         None => false,
      }
   }

   /// Times out every entry whose deadline is at or before `now`.
   pub fn expire(&mut self, now: Instant) -> usize {
      let expired: Vec<RequestId> = self
         .entries
         .iter()
         .filter(|(_, pending)| pending.deadline <= now)
         .map(|(id, _)| id.clone())
         .collect();

      for id in &expired {
         if let Some(pending) = self.entries.remove(id) {
            let command = pending.command;
            pending.complete(Err(EspirError::Timeout { command }));
         }
      }
      expired.len()
   }

   /// Resolves every entry with an error built by `err` and empties the table.
   pub fn cancel_all(&mut self, err: impl Fn() -> EspirError) -> usize {
      let count = self.entries.len();
      for (_, pending) in self.entries.drain() {
         pending.complete(Err(err()));
      }
      count
   }

   /// Earliest deadline among pending entries.
   pub fn next_deadline(&self) -> Option<Instant> {
      self.entries.values().map(|pending| pending.deadline).min()
   }
}

/// Monotonic request-id generator.
#[derive(Debug)]
pub struct RequestIds {
   next: u64,
}

impl Default for RequestIds {
   fn default() -> Self {
      Self { next: 1 }
   }
}

impl RequestIds {
   /// Hands out the next id that is not currently pending.
   pub fn next(&mut self, pending: &PendingTable) -> RequestId {
      loop {
         let id = RequestId::from(self.next);
         self.next = self.next.wrapping_add(1).max(1);
         if !pending.contains(&id) {
            return id;
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use crate::remote::protocol::Command;

   use super::*;

   const WINDOW: Duration = Duration::from_secs(5);

   fn pending(command: CommandKind) -> (PendingRequest, oneshot::Receiver<Result<Envelope>>) {
      let (tx, rx) = oneshot::channel();
      (PendingRequest::new(command, WINDOW, tx), rx)
   }

   fn response(id: &RequestId) -> Envelope {
      let mut env = Envelope::request(&Command::GetStatus, id.clone());
      env.status = Some(crate::remote::protocol::ResponseStatus::Ok);
      env
   }

   #[tokio::test]
   async fn test_resolve_matches_by_id() {
      let mut table = PendingTable::new();
      let (req, rx) = pending(CommandKind::GetStatus);
      let id = RequestId::from(3);
      table.register(id.clone(), req);

      assert!(table.resolve(response(&id)).is_none());
      assert!(table.is_empty());
      let env = rx.await.unwrap().unwrap();
      assert_eq!(env.request_id, Some(id));
   }

   #[test]
   fn test_unknown_and_untagged_messages_are_unsolicited() {
      let mut table = PendingTable::new();
      let (req, _rx) = pending(CommandKind::Transmit);
      table.register(RequestId::from(1), req);

      assert!(table.resolve(response(&RequestId::from(2))).is_some());
      let mut untagged = response(&RequestId::from(1));
      untagged.request_id = None;
      assert!(table.resolve(untagged).is_some());
      assert_eq!(table.len(), 1);
   }

   #[tokio::test]
   async fn test_late_response_after_resolution_is_unsolicited() {
      let mut table = PendingTable::new();
      let (req, rx) = pending(CommandKind::Transmit);
      let id = RequestId::from(8);
      table.register(id.clone(), req);

      assert!(table.resolve(response(&id)).is_none());
      assert!(table.resolve(response(&id)).is_some());
      assert!(rx.await.unwrap().is_ok());
   }

   #[tokio::test]
   async fn test_expire_only_past_deadlines() {
      let mut table = PendingTable::new();
      let (short, short_rx) = {
         let (tx, rx) = oneshot::channel();
         (
            PendingRequest::new(CommandKind::GetStatus, Duration::from_millis(10), tx),
            rx,
         )
      };
      let (long, _long_rx) = pending(CommandKind::Learn);
      table.register(RequestId::from(1), short);
      table.register(RequestId::from(2), long);

      let soon = Instant::now() + Duration::from_millis(20);
      assert_eq!(table.next_deadline().map(|d| d <= soon), Some(true));
      assert_eq!(table.expire(soon), 1);
      assert_eq!(table.len(), 1);
      assert!(matches!(
         short_rx.await.unwrap(),
         Err(EspirError::Timeout {
            command: CommandKind::GetStatus
         })
      ));
   }

   #[tokio::test]
   async fn test_cancel_all_resolves_everyone_once() {
      let mut table = PendingTable::new();
      let mut receivers = Vec::new();
      for n in 1..=3 {
         let (req, rx) = pending(CommandKind::Transmit);
         table.register(RequestId::from(n), req);
         receivers.push(rx);
      }

      assert_eq!(table.cancel_all(|| EspirError::ConnectionLost), 3);
      assert!(table.is_empty());
      assert_eq!(table.next_deadline(), None);
      for rx in receivers {
         assert!(matches!(rx.await.unwrap(), Err(EspirError::ConnectionLost)));
      }
      assert_eq!(table.cancel_all(|| EspirError::ConnectionLost), 0);
   }

   #[tokio::test]
   async fn test_fail_single_request() {
      let mut table = PendingTable::new();
      let (req, rx) = pending(CommandKind::AddDevice);
      let id = RequestId::from(5);
      table.register(id.clone(), req);

      assert!(table.fail(&id, EspirError::NotConnected));
      assert!(!table.fail(&id, EspirError::NotConnected));
      assert!(matches!(rx.await.unwrap(), Err(EspirError::NotConnected)));
   }

   #[test]
   fn test_request_ids_skip_pending() {
      let mut table = PendingTable::new();
      let mut ids = RequestIds::default();
      assert_eq!(ids.next(&table).as_str(), "1");

      let (req, _rx) = pending(CommandKind::GetStatus);
      table.register(RequestId::from(2), req);
      assert_eq!(ids.next(&table).as_str(), "3");
      assert_eq!(ids.next(&table).as_str(), "4");
   }
}
