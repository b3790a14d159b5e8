//! Bidirectional message connection.
//!
//! A [`Connection`] owns two transport tasks and an inbox:
//!
//! - the writer task drains the outbound queue in FIFO order through a
//!   [`FramedWrite`] backed by [`FrameCodec`];
//! - the reader task decodes inbound frames, routes replies to their
//!   pending continuations, and pushes everything else into the inbox;
//! - the inbox is drained on the [`Dispatcher`], one delivery per job,
//!   with at most one drain job queued per connection.
//!
//! Nothing here ever calls user code while holding the state lock, so
//! handlers may call back into the connection freely.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::tokio::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::codec::{self, Frame, FrameCodec, FrameHeader};
use crate::dispatch::{panic_message, Dispatcher};
use crate::ipc::event::{
    ConnectionId, ConnectionState, Event, EventHandler, InboundMessage, Origin, ReplyContinuation,
    RequestId,
};
use crate::models::{EndpointName, Value};
use crate::{AppError, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one peer relationship.
///
/// Cheap to clone; all clones refer to the same connection. The
/// connection stays alive while any handle exists or its transport is
/// still open.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    origin: Origin,
    dispatcher: Dispatcher,
    max_depth: usize,
    max_payload: usize,
    next_identifier: AtomicU64,
    cancel: CancellationToken,
    state: Mutex<ConnState>,
}

/// Non-owning handle used by listeners to track accepted connections.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

struct ConnState {
    lifecycle: ConnectionState,
    activated: bool,
    seen_traffic: bool,
    handler: Option<Box<dyn EventHandler>>,
    inbox: VecDeque<Delivery>,
    pending: HashMap<u64, ReplyContinuation>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    drain_scheduled: bool,
}

enum Delivery {
    Event(Event),
    Reply {
        request: RequestId,
        continuation: ReplyContinuation,
        result: Result<Value>,
    },
}

impl Delivery {
    fn is_reply(&self) -> bool {
        matches!(self, Self::Reply { .. })
    }
}

/// What one drain job will run.
enum Next {
    Event(Event, Box<dyn EventHandler>),
    Reply(RequestId, ReplyContinuation, Result<Value>),
}

impl ConnState {
    /// Delivery starts on activation or invalidation, whichever comes
    /// first; an invalidated connection can never be activated.
    fn gate_open(&self) -> bool {
        self.activated || self.lifecycle == ConnectionState::Invalidated
    }

    /// Replies need only an open gate; events also need a handler.
    fn has_deliverable(&self) -> bool {
        if !self.gate_open() {
            return false;
        }
        if self.handler.is_some() {
            !self.inbox.is_empty()
        } else {
            self.inbox.iter().any(Delivery::is_reply)
        }
    }

    fn take_next(&mut self) -> Option<Next> {
        if !self.gate_open() {
            return None;
        }

        let delivery = if self.handler.is_some() {
            self.inbox.pop_front()?
        } else {
            let index = self.inbox.iter().position(Delivery::is_reply)?;
            self.inbox.remove(index)?
        };

        match delivery {
            Delivery::Event(event) => {
                if let Some(handler) = self.handler.take() {
                    Some(Next::Event(event, handler))
                } else {
                    self.inbox.push_front(Delivery::Event(event));
                    None
                }
            }
            Delivery::Reply {
                request,
                continuation,
                result,
            } => Some(Next::Reply(request, continuation, result)),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl Connection {
    /// Dial the listener bound to `endpoint`.
    ///
    /// Must be called within a tokio runtime. The returned connection is in
    /// [`ConnectionState::Created`]; register a handler and
    /// [`activate`](Self::activate) it to start receiving events.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bind` if the name cannot be resolved, or
    /// `AppError::ConnectionInvalid` if no listener accepts the connection.
    pub async fn connect(dispatcher: &Dispatcher, endpoint: &EndpointName) -> Result<Self> {
        let name = endpoint.to_socket_name()?;
        let stream = LocalSocketStream::connect(name).await.map_err(|err| {
            AppError::ConnectionInvalid(format!("failed to connect to '{endpoint}': {err}"))
        })?;

        let (reader, writer) = stream.split();
        let conn = Self::attach(dispatcher, reader, writer, Origin::Dialed);
        info!(connection = %conn.id(), %endpoint, "connected");
        Ok(conn)
    }

    /// Build a connection over an arbitrary byte transport.
    ///
    /// Spawns the reader and writer tasks, so it must be called within a
    /// tokio runtime. [`connect`](Self::connect) and the listener use this
    /// with local socket halves; tests use in-memory pipes.
    pub fn attach<R, W>(dispatcher: &Dispatcher, reader: R, writer: W, origin: Origin) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let config = dispatcher.config();
        let max_frame_bytes = config.max_frame_bytes;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let conn = Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
                origin,
                dispatcher: dispatcher.clone(),
                max_depth: config.max_nesting_depth,
                max_payload: FrameCodec::new(max_frame_bytes).max_payload_bytes(),
                next_identifier: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                state: Mutex::new(ConnState {
                    lifecycle: ConnectionState::Created,
                    activated: false,
                    seen_traffic: false,
                    handler: None,
                    inbox: VecDeque::new(),
                    pending: HashMap::new(),
                    outbound: Some(outbound_tx),
                    drain_scheduled: false,
                }),
            }),
        };

        let span = info_span!("connection", id = %conn.id(), ?origin);
        tokio::spawn(
            run_writer(
                Arc::downgrade(&conn.inner),
                writer,
                outbound_rx,
                FrameCodec::new(max_frame_bytes),
            )
            .instrument(span.clone()),
        );
        tokio::spawn(run_reader(conn.clone(), reader, FrameCodec::new(max_frame_bytes)).instrument(span));

        conn
    }

    /// Process-unique id, also used as the `connection` log field.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Whether this side dialed or accepted.
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.inner.origin
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock().lifecycle
    }

    /// Number of requests still waiting on a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    /// Replace the event handler.
    ///
    /// The new handler sees every event delivered after this call returns,
    /// including ones that queued up while no handler was registered.
    pub fn set_event_handler<H>(&self, handler: H)
    where
        H: EventHandler + 'static,
    {
        let previous = {
            let mut state = self.lock();
            let previous = state.handler.replace(Box::new(handler));
            self.schedule_drain(&mut state);
            previous
        };
        drop(previous);
    }

    /// Start event delivery. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UseAfterInvalidate` if the connection is already
    /// invalidated.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.lock();
        if state.lifecycle == ConnectionState::Invalidated {
            return Err(AppError::UseAfterInvalidate(format!(
                "cannot activate {}: already invalidated",
                self.id()
            )));
        }
        if state.activated {
            return Ok(());
        }

        state.activated = true;
        state.lifecycle = if state.seen_traffic {
            ConnectionState::Established
        } else {
            ConnectionState::Activated
        };
        debug!(connection = %self.id(), "activated");
        self.schedule_drain(&mut state);
        Ok(())
    }

    /// Queue `body` for delivery to the peer and return immediately.
    ///
    /// Messages sent on one connection arrive in send order.
    ///
    /// # Errors
    ///
    /// - `AppError::UnsupportedType` if `body` has no wire representation.
    /// - `AppError::Codec` if the encoded body exceeds the frame limit.
    /// - `AppError::ConnectionInvalid` if the connection is invalidated.
    pub fn send<B>(&self, body: B) -> Result<()>
    where
        B: TryInto<Value>,
        AppError: From<B::Error>,
    {
        let body = body.try_into()?;
        self.enqueue(&body, FrameHeader::message, None).map(|_| ())
    }

    /// Queue `body` as a request; `continuation` receives the reply.
    ///
    /// The continuation runs exactly once on the dispatcher: with the
    /// reply, or with `AppError::ConnectionInvalid` if the connection is
    /// invalidated first. Replies never reach the general event handler.
    /// When this returns an error no request was registered and
    /// `continuation` is dropped unrun.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_with_reply<B, F>(&self, body: B, continuation: F) -> Result<RequestId>
    where
        B: TryInto<Value>,
        AppError: From<B::Error>,
        F: FnOnce(&Connection, Result<Value>) + Send + 'static,
    {
        let body = body.try_into()?;
        self.enqueue(&body, FrameHeader::request, Some(Box::new(continuation)))
            .map(RequestId)
    }

    /// Send a request and wait for its reply.
    ///
    /// The reply is still routed through the dispatcher, so the
    /// connection must be activated and the dispatcher running. If the
    /// connection is invalidated first, the request fails even when it
    /// was never activated.
    ///
    /// # Errors
    ///
    /// Same as [`send_with_reply`](Self::send_with_reply), plus
    /// `AppError::ConnectionInvalid` if the connection closes first and
    /// `AppError::Dispatcher` if the dispatcher stops first.
    pub async fn request<B>(&self, body: B) -> Result<Value>
    where
        B: TryInto<Value>,
        AppError: From<B::Error>,
    {
        let (tx, rx) = oneshot::channel();
        self.send_with_reply(body, move |_, result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| {
            AppError::Dispatcher("dispatcher stopped before the reply was delivered".into())
        })?
    }

    /// Answer `to`: as a correlated reply when the peer expects one,
    /// otherwise as a plain message.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn respond<B>(&self, to: &InboundMessage, body: B) -> Result<()>
    where
        B: TryInto<Value>,
        AppError: From<B::Error>,
    {
        let body = body.try_into()?;
        match to.request_id() {
            Some(request) => self.enqueue(&body, |id| FrameHeader::reply(id, request.0), None),
            None => self.enqueue(&body, FrameHeader::message, None),
        }
        .map(|_| ())
    }

    /// Close locally.
    ///
    /// Frames already queued are still written, then the transport is shut
    /// down. Pending requests fail and the handler receives
    /// [`Event::Invalidated`]. Calling this twice is a no-op.
    pub fn close(&self) {
        self.invalidate(None);
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(
        &self,
        body: &Value,
        header: impl FnOnce(u64) -> FrameHeader,
        continuation: Option<ReplyContinuation>,
    ) -> Result<u64> {
        let payload = codec::encode_value(body, self.inner.max_depth)?;
        if payload.len() > self.inner.max_payload {
            return Err(AppError::Codec(format!(
                "encoded body of {} bytes exceeds the {}-byte payload limit",
                payload.len(),
                self.inner.max_payload
            )));
        }

        let mut state = self.lock();
        let outbound = match (&state.outbound, state.lifecycle) {
            (Some(tx), lifecycle) if lifecycle != ConnectionState::Invalidated => tx.clone(),
            _ => {
                return Err(AppError::ConnectionInvalid(format!(
                    "{} is invalidated",
                    self.id()
                )))
            }
        };

        let identifier = self.inner.next_identifier.fetch_add(1, Ordering::Relaxed);
        let frame = Frame {
            header: header(identifier),
            payload,
        };
        let expects_reply = frame.header.expects_reply();

        if let Some(continuation) = continuation {
            state.pending.insert(identifier, continuation);
        }

        if outbound.send(frame).is_err() {
            let unused = state.pending.remove(&identifier);
            drop(state);
            drop(unused);
            return Err(AppError::ConnectionInvalid(format!(
                "{} writer has shut down",
                self.id()
            )));
        }

        debug!(connection = %self.id(), identifier, expects_reply, "frame queued");
        Ok(identifier)
    }

    /// Route one inbound frame into the inbox.
    fn handle_frame(&self, frame: &Frame) {
        let header = frame.header;
        let decoded = codec::decode_value(&frame.payload, self.inner.max_depth);

        let mut state = self.lock();
        if state.lifecycle == ConnectionState::Invalidated {
            return;
        }
        state.seen_traffic = true;
        if state.lifecycle == ConnectionState::Activated {
            state.lifecycle = ConnectionState::Established;
        }

        match decoded {
            Err(err) => {
                warn!(
                    connection = %self.id(),
                    identifier = header.identifier,
                    error = %err,
                    "undecodable frame body"
                );
                state
                    .inbox
                    .push_back(Delivery::Event(Event::TransportError(err)));
            }
            Ok(body) if header.is_reply() => {
                if let Some(continuation) = state.pending.remove(&header.reply_to) {
                    debug!(connection = %self.id(), reply_to = header.reply_to, "reply received");
                    state.inbox.push_back(Delivery::Reply {
                        request: RequestId(header.reply_to),
                        continuation,
                        result: Ok(body),
                    });
                } else {
                    warn!(
                        connection = %self.id(),
                        reply_to = header.reply_to,
                        "reply for unknown request, dropping"
                    );
                }
            }
            Ok(body) => {
                debug!(
                    connection = %self.id(),
                    identifier = header.identifier,
                    kind = body.type_name(),
                    "message received"
                );
                state
                    .inbox
                    .push_back(Delivery::Event(Event::Message(InboundMessage::new(
                        header, body,
                    ))));
            }
        }

        self.schedule_drain(&mut state);
    }

    /// Move to the terminal state. Only the first call has any effect.
    pub(crate) fn invalidate(&self, cause: Option<AppError>) {
        let mut state = self.lock();
        if state.lifecycle == ConnectionState::Invalidated {
            return;
        }

        state.lifecycle = ConnectionState::Invalidated;
        // Dropping the sender lets the writer flush what is queued, then exit.
        state.outbound = None;
        self.inner.cancel.cancel();

        if let Some(err) = cause {
            state
                .inbox
                .push_back(Delivery::Event(Event::TransportError(err)));
        }

        let mut pending: Vec<_> = state.pending.drain().collect();
        pending.sort_by_key(|(identifier, _)| *identifier);
        let failed = pending.len();
        for (identifier, continuation) in pending {
            state.inbox.push_back(Delivery::Reply {
                request: RequestId(identifier),
                continuation,
                result: Err(AppError::ConnectionInvalid(format!(
                    "{} invalidated before reply to request {identifier}",
                    self.id()
                ))),
            });
        }

        state.inbox.push_back(Delivery::Event(Event::Invalidated));
        info!(connection = %self.id(), failed_requests = failed, "connection invalidated");
        self.schedule_drain(&mut state);
    }

    fn schedule_drain(&self, state: &mut ConnState) {
        if state.drain_scheduled || !state.has_deliverable() {
            return;
        }

        state.drain_scheduled = true;
        let conn = self.clone();
        if !self.inner.dispatcher.post(move || conn.deliver_one()) {
            state.drain_scheduled = false;
        }
    }

    /// Run exactly one queued callback, then requeue if more are ready.
    fn deliver_one(&self) {
        let next = self.lock().take_next();
        let Some(next) = next else {
            self.finish_drain(None);
            return;
        };

        let restore = match next {
            Next::Event(event, mut handler) => {
                let last = matches!(event, Event::Invalidated);
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(self, event)));
                match outcome {
                    Ok(()) if !last => Some(handler),
                    Ok(()) => {
                        // Nothing follows the final event; release the handler
                        // and anything it captured.
                        let replacement = self.lock().handler.take();
                        drop(handler);
                        drop(replacement);
                        None
                    }
                    Err(panic) => {
                        error!(
                            connection = %self.id(),
                            panic = panic_message(&*panic),
                            "event handler panicked; handler dropped"
                        );
                        None
                    }
                }
            }
            Next::Reply(request, continuation, result) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| continuation(self, result)));
                if let Err(panic) = outcome {
                    error!(
                        connection = %self.id(),
                        %request,
                        panic = panic_message(&*panic),
                        "reply continuation panicked"
                    );
                }
                None
            }
        };

        self.finish_drain(restore);
    }

    /// Restore `handler` unless it was replaced meanwhile, then reschedule.
    fn finish_drain(&self, handler: Option<Box<dyn EventHandler>>) {
        let replaced = {
            let mut state = self.lock();
            let replaced = match handler {
                Some(handler) if state.handler.is_none() => {
                    state.handler = Some(handler);
                    None
                }
                other => other,
            };
            state.drain_scheduled = false;
            self.schedule_drain(&mut state);
            replaced
        };
        drop(replaced);
    }
}

// ── Transport tasks ───────────────────────────────────────────────────────────

/// Write queued frames in order until the queue closes or a write fails.
async fn run_writer<W>(
    conn: Weak<ConnectionInner>,
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    codec: FrameCodec,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(writer, codec);

    while let Some(frame) = outbound.recv().await {
        if let Err(err) = framed.send(frame).await {
            warn!(error = %err, "write failed, invalidating");
            if let Some(inner) = conn.upgrade() {
                Connection { inner }.invalidate(Some(AppError::ConnectionInvalid(format!(
                    "write failed: {err}"
                ))));
            }
            return;
        }
    }

    if let Err(err) = framed.close().await {
        debug!(error = %err, "transport shutdown failed");
    }
    debug!("writer finished");
}

/// Read frames until EOF, a fatal error, or cancellation.
async fn run_reader<R>(conn: Connection, reader: R, codec: FrameCodec)
where
    R: AsyncRead + Unpin + Send,
{
    let cancel = conn.inner.cancel.clone();
    let mut framed = FramedRead::new(reader, codec);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader cancelled");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("peer closed the stream");
                        conn.invalidate(None);
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "read failed, invalidating");
                        conn.invalidate(Some(err));
                        break;
                    }
                    Some(Ok(frame)) => conn.handle_frame(&frame),
                }
            }
        }
    }
}
