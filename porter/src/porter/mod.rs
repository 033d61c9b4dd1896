//! The stanza porter: a full-duplex dispatcher layered over a
//! [`FramedConnection`].
//!
//! Ties together FIFO outbound serialisation, priority-ordered inbound
//! dispatch, IQ request/response correlation, and the two-sided graceful
//! close described in the crate's top-level documentation.

pub mod dispatch;
pub mod handler;
mod iq;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};

/// A subset-matching rule for a handler's expected stanza payload. See
/// [`dispatch::MatchTemplate`] for its documentation.
pub use dispatch::MatchTemplate;
/// A `from` wildcard pattern for handler registration. See
/// [`handler::FromPattern`] for its documentation.
pub use handler::FromPattern;
/// An opaque handle to a registered handler. See [`handler::HandlerId`] for
/// its documentation.
pub use handler::HandlerId;
use handler::{HandlerRegistry, HandlerSpec};
use iq::IqTable;

use jid::Jid;

use crate::cancel::CancelToken;
use crate::connection::{ConnectionError, FramedConnection, InboundEvent, OutboundItem};
use crate::error::{IqFailure, PorterError};
use crate::stanza::{Kind, Stanza, SubKind};

/// A `remote-error` signal payload: an inbound read failed before the peer
/// cleanly closed the stream.
#[derive(Debug, Clone)]
pub struct RemoteError {
    /// A short, stable category for the failure (e.g. `"connection"`).
    pub domain: &'static str,
    /// An implementation-defined numeric code, for callers that want to
    /// switch on it without string matching.
    pub code: u32,
    /// A human-readable description, generally the `Display` of the
    /// underlying [`ConnectionError`].
    pub message: String,
}

enum Command {
    Send {
        stanza: Stanza,
        cancel: Option<CancelToken>,
        reply: oneshot::Sender<Result<(), PorterError>>,
    },
    SendIq {
        stanza: Stanza,
        cancel: Option<CancelToken>,
        reply: oneshot::Sender<Result<Stanza, IqFailure>>,
    },
    RegisterHandler {
        spec: HandlerSpec,
        reply: oneshot::Sender<HandlerId>,
    },
    UnregisterHandler(HandlerId),
    SetAccount(Jid),
    ForgetIq(String),
    Close {
        cancel: Option<CancelToken>,
        reply: oneshot::Sender<Result<(), PorterError>>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CloseState {
    Open,
    Flushing,
    LocalClosed,
    Closed,
}

struct PendingClose {
    cancel: Option<CancelToken>,
    reply: oneshot::Sender<Result<(), PorterError>>,
}

struct Startup<C> {
    connection: C,
    commands: mpsc::UnboundedReceiver<Command>,
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    remote_closed: broadcast::Sender<()>,
    remote_error: broadcast::Sender<RemoteError>,
    started: AtomicBool,
}

/// A full-duplex XMPP stanza dispatcher over a [`FramedConnection`].
///
/// Cheap to clone: every clone shares the same underlying run loop and
/// state. Dropping every clone cancels the pending receive and fails all
/// outstanding work, the same as an explicit close.
pub struct Porter<C> {
    shared: std::sync::Arc<Shared>,
    startup: std::sync::Arc<Mutex<Option<Startup<C>>>>,
}

impl<C> Clone for Porter<C> {
    fn clone(&self) -> Self {
        Porter { shared: self.shared.clone(), startup: self.startup.clone() }
    }
}

impl<C: FramedConnection + Send + 'static> Porter<C> {
    /// Builds a porter around `connection`. Does not start I/O: no handler
    /// fires, no reply resolves, and no close completes until [`start`](Self::start) is called.
    pub fn new(connection: C) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (remote_closed, _) = broadcast::channel(1);
        let (remote_error, _) = broadcast::channel(1);
        Porter {
            shared: std::sync::Arc::new(Shared {
                commands: commands_tx,
                remote_closed,
                remote_error,
                started: AtomicBool::new(false),
            }),
            startup: std::sync::Arc::new(Mutex::new(Some(Startup { connection, commands: commands_rx }))),
        }
    }

    /// Begins the receive loop. Idempotent: calling this more than once on
    /// the same porter (or a clone of it) is a no-op after the first call.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Startup { connection, commands } =
            self.startup.lock().expect("startup mutex poisoned").take().expect(
                "started flag guarantees this branch is only reached once",
            );
        let remote_closed = self.shared.remote_closed.clone();
        let remote_error = self.shared.remote_error.clone();
        let commands_tx = self.shared.commands.clone();
        tokio::spawn(run_loop(connection, commands, commands_tx, remote_closed, remote_error));
    }

    /// Subscribes to the `remote-closed` signal: fires once, when the peer
    /// cleanly closes its side of the stream.
    pub fn on_remote_closed(&self) -> broadcast::Receiver<()> {
        self.shared.remote_closed.subscribe()
    }

    /// Subscribes to the `remote-error` signal: fires when an inbound read
    /// fails before the peer's stream close is observed.
    pub fn on_remote_error(&self) -> broadcast::Receiver<RemoteError> {
        self.shared.remote_error.subscribe()
    }

    /// Records the account's own JID, widening the IQ spoof check for
    /// requests sent with no explicit `to` (see [`send_iq_async`](Self::send_iq_async)).
    /// Typically called once resource binding completes.
    pub fn set_account(&self, account: Jid) {
        let _ = self.shared.commands.send(Command::SetAccount(account));
    }

    /// Enqueues `stanza` for sending; resolves once its bytes have been
    /// handed to the connection.
    pub async fn send(&self, stanza: Stanza) -> Result<(), PorterError> {
        self.send_async(stanza, None).await
    }

    /// As [`send`](Self::send), with an optional cancellation token. Fails
    /// with [`PorterError::Cancelled`] if `cancel` fires before
    /// serialisation starts; once serialisation has begun, cancellation is
    /// a no-op for this stanza.
    pub async fn send_async(&self, stanza: Stanza, cancel: Option<CancelToken>) -> Result<(), PorterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .commands
            .send(Command::Send { stanza, cancel, reply: reply_tx })
            .is_err()
        {
            return Err(PorterError::Closed);
        }
        reply_rx.await.unwrap_or(Err(PorterError::Closed))
    }

    /// Sends an IQ `get`/`set` and resolves with the matching `result` or
    /// `error` reply.
    ///
    /// Fails with [`IqFailure::Send`]`(`[`PorterError::NotIq`]`)` if
    /// `stanza` is not `kind=iq` with `sub_kind` `get` or `set`.
    pub async fn send_iq_async(
        &self,
        stanza: Stanza,
        cancel: Option<CancelToken>,
    ) -> Result<Stanza, IqFailure> {
        if stanza.kind != Kind::Iq || !matches!(stanza.sub_kind, SubKind::Get | SubKind::Set) {
            return Err(IqFailure::Send(PorterError::NotIq));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .commands
            .send(Command::SendIq { stanza, cancel, reply: reply_tx })
            .is_err()
        {
            return Err(IqFailure::LostPorter);
        }
        reply_rx.await.unwrap_or(Err(IqFailure::LostPorter))
    }

    /// Registers an inbound-stanza handler.
    ///
    /// `callback` runs synchronously on the porter's run loop (see the
    /// crate's concurrency model): return `true` to claim the stanza
    /// (stopping dispatch) or `false` to let the next-highest-priority
    /// matching handler try. Higher `priority` numbers are tried first;
    /// ties keep registration order.
    pub async fn register_handler(
        &self,
        kind: Kind,
        sub_kind: Option<SubKind>,
        from: Option<FromPattern>,
        priority: i32,
        match_template: Option<MatchTemplate>,
        callback: impl FnMut(&Stanza) -> bool + Send + 'static,
    ) -> Result<HandlerId, PorterError> {
        let spec = HandlerSpec { kind, sub_kind, from, match_template, priority, callback: Box::new(callback) };
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .shared
            .commands
            .send(Command::RegisterHandler { spec, reply: reply_tx })
            .is_err()
        {
            return Err(PorterError::Closed);
        }
        reply_rx.await.map_err(|_| PorterError::Closed)
    }

    /// Unregisters a previously-registered handler. A stale or
    /// already-unregistered `id` is a no-op.
    pub fn unregister_handler(&self, id: HandlerId) {
        let _ = self.shared.commands.send(Command::UnregisterHandler(id));
    }

    /// Flushes the outbound queue, emits the closing stream tag, and waits
    /// for the peer's stream close (unless already observed).
    pub async fn close_async(&self, cancel: Option<CancelToken>) -> Result<(), PorterError> {
        if !self.shared.started.load(Ordering::SeqCst) {
            return Err(PorterError::NotStarted);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.shared.commands.send(Command::Close { cancel, reply: reply_tx }).is_err() {
            return Err(PorterError::Closed);
        }
        reply_rx.await.unwrap_or(Err(PorterError::Closed))
    }
}

async fn run_loop<C: FramedConnection>(
    mut connection: C,
    mut commands: mpsc::UnboundedReceiver<Command>,
    commands_tx: mpsc::UnboundedSender<Command>,
    remote_closed: broadcast::Sender<()>,
    remote_error: broadcast::Sender<RemoteError>,
) {
    let mut registry = HandlerRegistry::new();
    let mut iq_table = IqTable::new();
    let mut state = CloseState::Open;
    let mut remote_closed_seen = false;
    let mut receiving = true;
    let mut dead: Option<PorterError> = None;
    let mut pending_close: Option<PendingClose> = None;

    loop {
        if dead.is_some() && pending_close.is_none() {
            // Nothing left that can make progress: drain remaining commands
            // with the dead error and exit once the channel is empty.
            match commands.recv().await {
                Some(cmd) => fail_command(cmd, dead.as_ref().unwrap()),
                None => break,
            }
            continue;
        }

        tokio::select! {
            biased;

            _ = pending_close_cancelled(&pending_close) => {
                let PendingClose { reply, .. } = pending_close.take().expect("guarded by the future above");
                let _ = reply.send(Err(PorterError::Cancelled));
            }

            event = connection.next(), if receiving => {
                match event {
                    None => {
                        log::warn!("connection stream ended without a stream close");
                        receiving = false;
                        remote_closed_seen = true;
                        iq_table.fail_all(|| IqFailure::LostPorter);
                        dead = Some(PorterError::Closed);
                        if let Some(close) = pending_close.take() {
                            let _ = close.reply.send(Err(PorterError::Closed));
                        }
                    }
                    Some(Ok(InboundEvent::Stanza(stanza))) => {
                        log::trace!("dispatching inbound stanza: {:?}", stanza.element);
                        let intercepted = (stanza.kind == Kind::Iq
                            && matches!(stanza.sub_kind, SubKind::Result | SubKind::Error))
                            && iq_table.try_complete(&stanza);
                        if !intercepted && !registry.dispatch(&stanza) {
                            log::debug!("no handler matched inbound stanza {:?}", stanza.id);
                        }
                    }
                    Some(Ok(InboundEvent::Raw(element))) => {
                        log::trace!("ignoring non-stanza element at porter level: {:?}", element.name());
                    }
                    Some(Ok(InboundEvent::StreamOpen { .. })) => {
                        log::debug!("ignoring stream (re)open seen by an already-running porter");
                    }
                    Some(Ok(InboundEvent::StreamClose)) => {
                        log::debug!("peer closed the stream");
                        remote_closed_seen = true;
                        receiving = false;
                        let _ = remote_closed.send(());
                        if let Some(close) = pending_close.take() {
                            state = CloseState::Closed;
                            let _ = close.reply.send(Ok(()));
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("inbound read failed: {}", e);
                        receiving = false;
                        remote_closed_seen = true;
                        let _ = remote_error.send(RemoteError {
                            domain: "connection",
                            code: 0,
                            message: e.to_string(),
                        });
                        iq_table.fail_all(|| IqFailure::LostPorter);
                        dead = Some(PorterError::Connection(e));
                        if let Some(close) = pending_close.take() {
                            let _ = close.reply.send(Err(dead.as_ref().unwrap().clone_display()));
                        }
                    }
                }
            }

            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::SetAccount(jid) => iq_table.set_account(jid),

                    Command::ForgetIq(id) => iq_table.forget(&id),

                    Command::RegisterHandler { spec, reply } => {
                        let id = registry.register(spec);
                        let _ = reply.send(id);
                    }

                    Command::UnregisterHandler(id) => registry.unregister(id),

                    Command::Send { stanza, cancel, reply } => {
                        if let Some(err) = &dead {
                            let _ = reply.send(Err(err.clone_display()));
                            continue;
                        }
                        if let Some(err) = closing_error(state) {
                            let _ = reply.send(Err(err));
                            continue;
                        }
                        if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                            let _ = reply.send(Err(PorterError::Cancelled));
                            continue;
                        }
                        match connection.send(OutboundItem::Stanza(stanza)).await {
                            Ok(()) => { let _ = reply.send(Ok(())); }
                            Err(e) => {
                                log::warn!("outbound send failed: {}", e);
                                iq_table.fail_all(|| IqFailure::LostPorter);
                                dead = Some(PorterError::Connection(e));
                                let _ = reply.send(Err(dead.as_ref().unwrap().clone_display()));
                            }
                        }
                    }

                    Command::SendIq { mut stanza, cancel, reply } => {
                        if let Some(err) = &dead {
                            let _ = reply.send(Err(IqFailure::Send(err.clone_display())));
                            continue;
                        }
                        if let Some(err) = closing_error(state) {
                            let _ = reply.send(Err(IqFailure::Send(err)));
                            continue;
                        }
                        if cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false) {
                            let _ = reply.send(Err(IqFailure::Cancelled));
                            continue;
                        }
                        let id = fresh_id(&mut connection);
                        stanza.id = Some(id.clone());
                        let to = stanza.to.clone();
                        let rx = iq_table.register(to, id.clone());
                        match connection.send(OutboundItem::Stanza(stanza)).await {
                            Ok(()) => {
                                tokio::spawn(forward_iq_reply(id, rx, reply, cancel, commands_tx.clone()));
                            }
                            Err(e) => {
                                log::warn!("outbound IQ send failed: {}", e);
                                iq_table.forget(&id);
                                let _ = reply.send(Err(IqFailure::Send(PorterError::Connection(e))));
                            }
                        }
                    }

                    Command::Close { cancel, reply } => {
                        if dead.is_some() {
                            let _ = reply.send(Err(dead.as_ref().unwrap().clone_display()));
                            continue;
                        }
                        if state == CloseState::Closed {
                            let _ = reply.send(Err(PorterError::Closed));
                            continue;
                        }
                        if pending_close.is_some() {
                            let _ = reply.send(Err(PorterError::Pending));
                            continue;
                        }
                        if state == CloseState::LocalClosed {
                            // The local close frame was already sent by an earlier
                            // `close_async` call whose own wait got cancelled; don't
                            // emit a second closing tag, just (re-)wait for the peer.
                            if remote_closed_seen {
                                state = CloseState::Closed;
                                let _ = reply.send(Ok(()));
                            } else {
                                pending_close = Some(PendingClose { cancel, reply });
                            }
                            continue;
                        }
                        state = CloseState::Flushing;
                        match connection.send(OutboundItem::Close).await {
                            Ok(()) => {
                                state = CloseState::LocalClosed;
                                if remote_closed_seen {
                                    state = CloseState::Closed;
                                    let _ = reply.send(Ok(()));
                                } else {
                                    pending_close = Some(PendingClose { cancel, reply });
                                }
                            }
                            Err(e) => {
                                iq_table.fail_all(|| IqFailure::LostPorter);
                                dead = Some(PorterError::Connection(e));
                                let _ = reply.send(Err(dead.as_ref().unwrap().clone_display()));
                            }
                        }
                    }
                }
            }
        }
    }

    iq_table.fail_all(|| IqFailure::LostPorter);
}

fn closing_error(state: CloseState) -> Option<PorterError> {
    match state {
        CloseState::Open => None,
        CloseState::Flushing | CloseState::LocalClosed => Some(PorterError::Closing),
        CloseState::Closed => Some(PorterError::Closed),
    }
}

fn fail_command(cmd: Command, err: &PorterError) {
    match cmd {
        Command::Send { reply, .. } => {
            let _ = reply.send(Err(err.clone_display()));
        }
        Command::SendIq { reply, .. } => {
            let _ = reply.send(Err(IqFailure::Send(err.clone_display())));
        }
        Command::Close { reply, .. } => {
            let _ = reply.send(Err(err.clone_display()));
        }
        Command::RegisterHandler { reply, .. } => {
            // A dead porter still hands back a (useless) handle rather than
            // silently dropping the registration: callers that only
            // `unregister` on drop don't need a special case.
            drop(reply);
        }
        Command::UnregisterHandler(_) | Command::SetAccount(_) | Command::ForgetIq(_) => {}
    }
}

async fn pending_close_cancelled(pending: &Option<PendingClose>) {
    match pending {
        Some(PendingClose { cancel: Some(cancel), .. }) => cancel.cancelled().await,
        _ => std::future::pending().await,
    }
}

/// Waits for either the tracked reply or the caller's cancellation,
/// whichever comes first. On cancellation the table entry is dropped via
/// [`Command::ForgetIq`] so a reply that never arrives doesn't leak a
/// pending slot forever; a reply that arrives concurrently with
/// cancellation still wins if [`IqTable::try_complete`] already consumed
/// it before the forget command is processed (the caller only ever sees
/// one outcome, since the reply oneshot can only be resolved once).
async fn forward_iq_reply(
    id: String,
    mut rx: oneshot::Receiver<Result<Stanza, IqFailure>>,
    reply: oneshot::Sender<Result<Stanza, IqFailure>>,
    cancel: Option<CancelToken>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let result = match cancel {
        Some(cancel) => {
            tokio::select! {
                biased;
                res = &mut rx => res.unwrap_or(Err(IqFailure::LostPorter)),
                _ = cancel.cancelled() => {
                    let _ = commands.send(Command::ForgetIq(id));
                    match rx.try_recv() {
                        Ok(res) => res,
                        Err(_) => Err(IqFailure::Cancelled),
                    }
                }
            }
        }
        None => rx.await.unwrap_or(Err(IqFailure::LostPorter)),
    };
    let _ = reply.send(result);
}

fn fresh_id<C: FramedConnection>(connection: &mut C) -> String {
    loop {
        let id = connection.new_id();
        if !id.is_empty() {
            return id;
        }
    }
}

impl PorterError {
    /// `PorterError` does not implement `Clone` (its `Connection` variant
    /// wraps a boxed, non-`Clone` error); this produces an equivalent error
    /// for fan-out to multiple waiters, preserving everything but the
    /// original connection error's concrete type.
    fn clone_display(&self) -> PorterError {
        match self {
            PorterError::Closed => PorterError::Closed,
            PorterError::Closing => PorterError::Closing,
            PorterError::NotStarted => PorterError::NotStarted,
            PorterError::Pending => PorterError::Pending,
            PorterError::NotIq => PorterError::NotIq,
            PorterError::Cancelled => PorterError::Cancelled,
            PorterError::Connection(e) => PorterError::Connection(ConnectionError(Box::new(
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            ))),
        }
    }
}
