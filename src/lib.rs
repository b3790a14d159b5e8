#![forbid(unsafe_code)]

//! `dictlink` — local request/response channel exchanging string-keyed
//! dictionaries between processes.
//!
//! A [`Listener`](ipc::Listener) binds a named endpoint and yields a
//! [`Connection`](ipc::Connection) per peer; a single
//! [`Dispatcher`](dispatch::Dispatcher) runs every callback, one event at a
//! time per connection.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod service;

pub use config::{ChannelConfig, GlobalConfig};
pub use dispatch::Dispatcher;
pub use errors::{AppError, Result};
pub use ipc::{Connection, Event, Listener};
pub use models::{EndpointName, Message, Value};
