//! Local IPC channel.
//!
//! Provides named-endpoint listeners and bidirectional connections over a
//! Unix domain socket (Linux/macOS) or named pipe (Windows), with every
//! callback delivered on the [`Dispatcher`](crate::dispatch::Dispatcher).

pub mod connection;
pub mod event;
pub mod listener;

pub use connection::Connection;
pub use event::{
    AcceptHandler, ConnectionId, ConnectionState, Event, EventHandler, InboundMessage, Origin,
    ReplyContinuation, RequestId,
};
pub use listener::Listener;
