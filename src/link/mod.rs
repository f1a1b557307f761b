//! Link to the remote device.
//!
//! A single actor task owns the connection state machine, the pending
//! request table and the writer for the active session. Transport events,
//! caller commands and timer expiries are all funnelled through its select
//! loop, so state changes, response routing and cancellation observe one
//! global order.
//!
//! Every connection attempt gets its own transport event channel, dropped
//! when the attempt ends. A physical teardown runs in the background and
//! must report back before the next attempt is started.

pub mod correlator;
pub mod state;

use std::{future, sync::Arc, time::Duration};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::{JoinHandle, JoinSet},
   time::{self, Instant},
};

pub use self::state::LinkState;
use self::{
   correlator::{PendingRequest, PendingTable, RequestIds},
   state::{Step, Trigger},
};
use crate::{
   bluetooth::transport::{Packet, Transport, TransportEvent},
   error::{EspirError, Result},
   event::{Event, EventSender},
   remote::{
      codec,
      protocol::{Command, Envelope, RequestId},
   },
};

/// Buffer size of the per-attempt transport event channel
const TRANSPORT_BUFFER_SIZE: usize = 256;
/// Buffer size of the caller command channel
const INBOX_BUFFER_SIZE: usize = 64;

/// Timing knobs of the link.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
   /// Response window for every command but LEARN.
   pub request_timeout: Duration,
   /// Slack added on top of the LEARN capture window.
   pub learn_grace: Duration,
   /// Watchdog for `Connecting`. Covers discovery, connection and service
   /// resolution of the whole attempt.
   pub connect_timeout: Duration,
   /// Watchdog for `Disconnecting`; also bounds a background teardown.
   pub disconnect_timeout: Duration,
}

impl Default for LinkConfig {
   fn default() -> Self {
      Self {
         request_timeout: Duration::from_secs(5),
         learn_grace: Duration::from_secs(5),
         connect_timeout: Duration::from_secs(35),
         disconnect_timeout: Duration::from_secs(10),
      }
   }
}

impl LinkConfig {
   /// How long a response to `command` is waited for.
   pub fn response_window(&self, command: &Command) -> Duration {
      match command {
         Command::Learn { timeout } => self.request_timeout.max(*timeout) + self.learn_grace,
         _ => self.request_timeout,
      }
   }
}

enum LinkCommand {
   Connect(oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<Result<()>>),
   Request(Command, oneshot::Sender<Result<Envelope>>),
   PendingCount(oneshot::Sender<usize>),
}

enum Loopback {
   WriteFailed(RequestId, EspirError),
   /// The background teardown of the physical link finished.
   TornDown,
}

struct WriteJob {
   id: RequestId,
   bytes: Vec<u8>,
}

/// Writer of an established session.
struct Session {
   writer: mpsc::UnboundedSender<WriteJob>,
   jset: JoinSet<()>,
}

impl Drop for Session {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// Handle to the link actor. Cheap to clone.
#[derive(Clone)]
pub struct Link {
   inbox: mpsc::Sender<LinkCommand>,
   state: Arc<AtomicCell<LinkState>>,
   config: LinkConfig,
}

impl Link {
   /// Starts the link actor on the current runtime.
   pub fn spawn<T: Transport>(transport: Arc<T>, config: LinkConfig, events: EventSender) -> Self {
      let (inbox, inbox_rx) = mpsc::channel(INBOX_BUFFER_SIZE);
      let state = Arc::new(AtomicCell::new(LinkState::Disconnected));
      tokio::spawn(LinkActor::new(transport, config, events, inbox_rx, state.clone()).run());
      Self {
         inbox,
         state,
         config,
      }
   }

   /// Current connection state.
   pub fn state(&self) -> LinkState {
      self.state.load()
   }

   pub const fn config(&self) -> LinkConfig {
      self.config
   }

   /// Opens the link and waits until it is `Connected`.
   pub async fn connect(&self) -> Result<()> {
      self.call(LinkCommand::Connect).await?
   }

   /// Closes the link and waits until it is `Disconnected`.
   pub async fn disconnect(&self) -> Result<()> {
      self.call(LinkCommand::Disconnect).await?
   }

   /// Sends `command` and waits for its response, timeout or link loss.
   pub async fn request(&self, command: Command) -> Result<Envelope> {
      self.call(|tx| LinkCommand::Request(command, tx)).await?
   }

   /// Number of requests currently awaiting a response.
   pub async fn pending_count(&self) -> Result<usize> {
      self.call(LinkCommand::PendingCount).await
   }

   async fn call<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> LinkCommand) -> Result<R> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(build(tx))
         .await
         .map_err(|_| EspirError::LinkShutdown)?;
      rx.await.map_err(|_| EspirError::LinkShutdown)
   }
}

struct LinkActor<T: Transport> {
   transport: Arc<T>,
   config: LinkConfig,
   events: EventSender,
   state: Arc<AtomicCell<LinkState>>,

   inbox: mpsc::Receiver<LinkCommand>,
   /// Events of the current attempt; `None` while `Disconnected`.
   transport_rx: Option<mpsc::Receiver<TransportEvent>>,
   loopback_tx: mpsc::UnboundedSender<Loopback>,
   loopback_rx: mpsc::UnboundedReceiver<Loopback>,

   pending: PendingTable,
   ids: RequestIds,
   session: Option<Session>,
   attempt: Option<JoinHandle<()>>,
   tearing_down: bool,
   transition_deadline: Option<Instant>,
   connect_waiters: Vec<oneshot::Sender<Result<()>>>,
   disconnect_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl<T: Transport> LinkActor<T> {
   fn new(
      transport: Arc<T>,
      config: LinkConfig,
      events: EventSender,
      inbox: mpsc::Receiver<LinkCommand>,
      state: Arc<AtomicCell<LinkState>>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
      Self {
         transport,
         config,
         events,
         state,
         inbox,
         transport_rx: None,
         loopback_tx,
         loopback_rx,
         pending: PendingTable::new(),
         ids: RequestIds::default(),
         session: None,
         attempt: None,
         tearing_down: false,
         transition_deadline: None,
         connect_waiters: Vec::new(),
         disconnect_waiters: Vec::new(),
      }
   }

   async fn run(mut self) {
      debug!("Link actor started");
      loop {
         let deadline = self.next_deadline();
         select! {
            biased;
            event = next_event(&mut self.transport_rx) => self.on_transport(event),
            Some(msg) = self.loopback_rx.recv() => self.on_loopback(msg),
            cmd = self.inbox.recv() => {
               let Some(cmd) = cmd else {
                  break;
               };
               self.on_command(cmd);
            },
            () = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
               self.on_deadline();
            },
         }
      }

      info!("Link shutting down");
      self.pending.cancel_all(|| EspirError::LinkShutdown);
      if let Some(attempt) = self.attempt.take() {
         attempt.abort();
      }
      if self.current() != LinkState::Disconnected || self.tearing_down {
         self.session = None;
         if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to close transport on shutdown: {e}");
         }
      }
   }

   fn current(&self) -> LinkState {
      self.state.load()
   }

   /// No timer is armed unless something is pending or a transition is in
   /// flight.
   fn next_deadline(&self) -> Option<Instant> {
      match (self.pending.next_deadline(), self.transition_deadline) {
         (Some(a), Some(b)) => Some(a.min(b)),
         (a, b) => a.or(b),
      }
   }

   fn enter(&mut self, next: LinkState) {
      let prev = self.state.swap(next);
      if prev == next {
         return;
      }
      info!("Link {prev} → {next}");
      self.events.emit(Event::StateChanged(next));
   }

   fn enter_connected(&mut self) {
      // The attempt may still be finishing its setup, so it is detached
      // rather than aborted.
      self.attempt = None;
      self.transition_deadline = None;

      let (writer, jobs) = mpsc::unbounded_channel();
      let mut jset = JoinSet::new();
      jset.spawn(write_loop(
         self.transport.clone(),
         self.state.clone(),
         jobs,
         self.loopback_tx.clone(),
      ));
      self.session = Some(Session { writer, jset });

      self.enter(LinkState::Connected);
      for waiter in self.connect_waiters.drain(..) {
         let _ = waiter.send(Ok(()));
      }
   }

   fn enter_disconnected(&mut self, reason: SmolStr) {
      if let Some(attempt) = self.attempt.take() {
         attempt.abort();
      }
      self.transition_deadline = None;
      self.session = None;
      // Whatever the old attempt still reports is stale from here on.
      self.transport_rx = None;

      let cancelled = self.pending.cancel_all(|| EspirError::ConnectionLost);
      if cancelled > 0 {
         warn!("Link dropped ({reason}), cancelled {cancelled} pending request(s)");
      }

      self.enter(LinkState::Disconnected);
      for waiter in self.connect_waiters.drain(..) {
         let _ = waiter.send(Err(EspirError::ConnectionFailed(reason.clone())));
      }
      for waiter in self.disconnect_waiters.drain(..) {
         let _ = waiter.send(Ok(()));
      }
   }

   fn start_attempt(&mut self) {
      let (events, rx) = mpsc::channel(TRANSPORT_BUFFER_SIZE);
      self.transport_rx = Some(rx);

      let transport = self.transport.clone();
      self.attempt = Some(tokio::spawn(async move {
         if let Err(e) = transport.connect(events.clone()).await {
            warn!("Connection attempt failed: {e}");
            let _ = events
               .send(TransportEvent::Disconnected(e.to_smolstr()))
               .await;
         }
      }));
   }

   /// Closes the physical link in the background. At most one teardown runs
   /// at a time and it always reports [`Loopback::TornDown`].
   fn begin_teardown(&mut self) {
      if self.tearing_down {
         return;
      }
      self.tearing_down = true;

      let transport = self.transport.clone();
      let loopback = self.loopback_tx.clone();
      let limit = self.config.disconnect_timeout;
      tokio::spawn(async move {
         match time::timeout(limit, transport.disconnect()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("Transport disconnect failed: {e}"),
            Err(_) => warn!("Transport disconnect still running after {limit:?}, giving up"),
         }
         let _ = loopback.send(Loopback::TornDown);
      });
   }

   fn on_command(&mut self, cmd: LinkCommand) {
      match cmd {
         LinkCommand::Connect(reply) => match self.current().step(Trigger::RequestConnect) {
            Ok(Step::Enter(next)) => {
               self.connect_waiters.push(reply);
               self.enter(next);
               self.transition_deadline = Some(Instant::now() + self.config.connect_timeout);
               if self.tearing_down {
                  debug!("Previous link still closing, attempt deferred");
               } else {
                  self.start_attempt();
               }
            },
            Ok(_) => {
               let _ = reply.send(Err(EspirError::AlreadyActive));
            },
            Err(e) => {
               let _ = reply.send(Err(e));
            },
         },
         LinkCommand::Disconnect(reply) => match self.current().step(Trigger::RequestDisconnect) {
            Ok(Step::Enter(next)) => {
               self.disconnect_waiters.push(reply);
               if let Some(attempt) = self.attempt.take() {
                  attempt.abort();
               }
               self.enter(next);
               self.transition_deadline = Some(Instant::now() + self.config.disconnect_timeout);
               self.begin_teardown();
            },
            Ok(_) if self.current() == LinkState::Disconnecting => {
               self.disconnect_waiters.push(reply);
            },
            Ok(_) => {
               let _ = reply.send(Ok(()));
            },
            Err(e) => {
               let _ = reply.send(Err(e));
            },
         },
         LinkCommand::Request(command, reply) => self.send_request(command, reply),
         LinkCommand::PendingCount(reply) => {
            let _ = reply.send(self.pending.len());
         },
      }
   }

   fn send_request(&mut self, command: Command, reply: oneshot::Sender<Result<Envelope>>) {
      let state = self.current();
      let Some(session) = self.session.as_ref().filter(|_| state.can_write()) else {
         debug!("Refusing {command} while {state}");
         let _ = reply.send(Err(EspirError::NotConnected));
         return;
      };

      let id = self.ids.next(&self.pending);
      let bytes = match codec::encode(&Envelope::request(&command, id.clone())) {
         Ok(bytes) => bytes,
         Err(e) => {
            let _ = reply.send(Err(e));
            return;
         },
      };

      // Registered before the write is queued so a fast response always
      // finds its waiter.
      let window = self.config.response_window(&command);
      self
         .pending
         .register(id.clone(), PendingRequest::new(command.kind(), window, reply));
      if session.writer.send(WriteJob { id: id.clone(), bytes }).is_err() {
         self.pending.fail(&id, EspirError::LinkShutdown);
      }
   }

   fn on_transport(&mut self, event: Option<TransportEvent>) {
      match event {
         Some(TransportEvent::Connected) => {
            self.apply(Trigger::TransportConnected, SmolStr::new_static("unexpected connect"));
         },
         Some(TransportEvent::Disconnected(reason)) => {
            self.apply(Trigger::TransportDisconnected, reason);
         },
         Some(TransportEvent::BytesReceived(bytes)) => self.on_bytes(&bytes),
         None => {
            self.transport_rx = None;
            self.apply(
               Trigger::TransportDisconnected,
               SmolStr::new_static("transport closed its event channel"),
            );
         },
      }
   }

   fn apply(&mut self, trigger: Trigger, reason: SmolStr) {
      let state = self.current();
      let step = match state.step(trigger) {
         Ok(step) => step,
         Err(e) => {
            warn!("Ignoring {trigger:?} while {state}: {e}");
            return;
         },
      };

      match step {
         Step::Enter(LinkState::Connected) => self.enter_connected(),
         Step::Enter(LinkState::Disconnected) => self.enter_disconnected(reason),
         Step::Enter(next) => self.enter(next),
         Step::Stay => debug!("{trigger:?} while {state}, nothing to do"),
         Step::Reset => {
            warn!("Unexpected {trigger:?} while {state} ({reason}), resetting link");
            self.enter_disconnected(reason);
            if trigger == Trigger::TransportConnected {
               self.begin_teardown();
            }
         },
      }
   }

   fn on_bytes(&mut self, bytes: &Packet) {
      let state = self.current();
      if !state.accepts_inbound() {
         debug!("Dropping {} bytes received while {state}", bytes.len());
         return;
      }

      debug!("← {}", codec::preview(bytes));
      match codec::decode(bytes) {
         Ok(envelope) => {
            if let Some(unsolicited) = self.pending.resolve(envelope) {
               debug!("Unsolicited message: {}", unsolicited.command);
               self.events.emit(Event::Notification(unsolicited));
            }
         },
         Err(e) => warn!("Dropping malformed message ({e}): {}", codec::preview(bytes)),
      }
   }

   fn on_loopback(&mut self, msg: Loopback) {
      match msg {
         Loopback::WriteFailed(id, err) => {
            // Writes of a session that already ended were cancelled with it.
            if !self.pending.fail(&id, err) {
               return;
            }
            if self.current().can_write() {
               self.enter_disconnected(SmolStr::new_static("write failed"));
               self.begin_teardown();
            }
         },
         Loopback::TornDown => {
            self.tearing_down = false;
            match self.current() {
               LinkState::Disconnecting => {
                  self.enter_disconnected(SmolStr::new_static("disconnect requested"));
               },
               LinkState::Connecting if self.attempt.is_none() => {
                  debug!("Previous link closed, starting deferred attempt");
                  self.start_attempt();
               },
               _ => {},
            }
         },
      }
   }

   fn on_deadline(&mut self) {
      let now = Instant::now();
      let expired = self.pending.expire(now);
      if expired > 0 {
         warn!("{expired} request(s) timed out");
      }

      if let Some(deadline) = self.transition_deadline
         && deadline <= now
      {
         let state = self.current();
         warn!("Link stuck in {state}, forcing disconnect");
         self.enter_disconnected(format!("{state} timed out").into());
         self.begin_teardown();
      }
   }
}

/// Next event of the current attempt. Pends forever while there is none.
async fn next_event(rx: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
   match rx {
      Some(rx) => rx.recv().await,
      None => future::pending().await,
   }
}

/// Drains queued writes one at a time so the channel never sees two
/// interleaved payloads. Jobs still queued once the link stops being
/// writable are refused instead of written.
async fn write_loop<T: Transport>(
   transport: Arc<T>,
   state: Arc<AtomicCell<LinkState>>,
   mut jobs: mpsc::UnboundedReceiver<WriteJob>,
   loopback: mpsc::UnboundedSender<Loopback>,
) {
   while let Some(WriteJob { id, bytes }) = jobs.recv().await {
      if !state.load().can_write() {
         debug!("Dropping write of #{id}, link no longer writable");
         let _ = loopback.send(Loopback::WriteFailed(id, EspirError::NotConnected));
         continue;
      }
      debug!("→ #{id}: {}", codec::preview(&bytes));
      if let Err(e) = transport.write(&bytes).await {
         warn!("Write of #{id} failed: {e}");
         let _ = loopback.send(Loopback::WriteFailed(id, e));
      }
   }
}
