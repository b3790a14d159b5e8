//! Error types shared across the crate.

use std::convert::Infallible;
use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every channel failure mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Endpoint name invalid, unresolvable, or already owned by another process.
    Bind(String),
    /// Peer gone or transport failure; terminal for the connection.
    ConnectionInvalid(String),
    /// Truncated or malformed bytes; fails a single decode call.
    Codec(String),
    /// Operation attempted on a connection after it was invalidated.
    UseAfterInvalidate(String),
    /// Value has no wire representation.
    UnsupportedType(String),
    /// Dispatcher run loop misuse (e.g. running it twice).
    Dispatcher(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error ends the life of the connection that produced it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionInvalid(_) | Self::UseAfterInvalidate(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Bind(msg) => write!(f, "bind: {msg}"),
            Self::ConnectionInvalid(msg) => write!(f, "connection invalid: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::UseAfterInvalidate(msg) => write!(f, "use after invalidate: {msg}"),
            Self::UnsupportedType(msg) => write!(f, "unsupported type: {msg}"),
            Self::Dispatcher(msg) => write!(f, "dispatcher: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::UnsupportedType(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<Infallible> for AppError {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}
