//! Events, identifiers, and callback traits for connections.

use std::fmt::{Display, Formatter};

use crate::codec::FrameHeader;
use crate::ipc::connection::Connection;
use crate::models::Value;
use crate::{AppError, Result};

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier correlating a request with its reply.
///
/// Unique per direction of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    /// Raw wire identifier.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Instantiated; no events flow yet.
    Created,
    /// `activate()` was called; events flow once a handler is set.
    Activated,
    /// Activated and the peer has sent traffic.
    Established,
    /// Terminal: peer closed, local close, or transport failure.
    Invalidated,
}

/// How a connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Active open via [`Connection::connect`].
    Dialed,
    /// Passive open yielded by a [`Listener`](crate::ipc::Listener).
    Accepted,
}

/// A message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    identifier: u64,
    expects_reply: bool,
    body: Value,
}

impl InboundMessage {
    pub(crate) fn new(header: FrameHeader, body: Value) -> Self {
        Self {
            identifier: header.identifier,
            expects_reply: header.expects_reply(),
            body,
        }
    }

    /// The decoded payload.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Take the decoded payload.
    #[must_use]
    pub fn into_body(self) -> Value {
        self.body
    }

    /// Whether the sender is waiting on a correlated reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    /// The id to answer with [`Connection::respond`], if a reply is expected.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.expects_reply.then_some(RequestId(self.identifier))
    }
}

/// Everything a connection's event handler can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The peer sent a message (any value type, not only dictionaries).
    Message(InboundMessage),
    /// The connection reached its terminal state. Delivered exactly once,
    /// and always last, whether or not the connection was ever activated.
    Invalidated,
    /// A non-fatal decode failure, or the cause of an imminent
    /// invalidation.
    TransportError(AppError),
}

/// Receiver of connection events.
///
/// Invoked only on the dispatcher, one event at a time per connection.
/// Implemented for every `FnMut(&Connection, Event) + Send` closure.
pub trait EventHandler: Send {
    /// Handle one event for `conn`.
    fn handle(&mut self, conn: &Connection, event: Event);
}

impl<F> EventHandler for F
where
    F: FnMut(&Connection, Event) + Send,
{
    fn handle(&mut self, conn: &Connection, event: Event) {
        self(conn, event);
    }
}

/// Receiver of connections accepted by a listener.
pub trait AcceptHandler: Send {
    /// Take ownership of a newly accepted, not yet activated connection.
    fn accept(&mut self, conn: Connection);
}

impl<F> AcceptHandler for F
where
    F: FnMut(Connection) + Send,
{
    fn accept(&mut self, conn: Connection) {
        self(conn);
    }
}

/// One-shot callback resolving a pending request.
pub type ReplyContinuation = Box<dyn FnOnce(&Connection, Result<Value>) + Send + 'static>;
