//! Endpoint names identifying a local service.

use std::fmt::{Display, Formatter};

use interprocess::local_socket::{GenericNamespaced, Name, ToNsName};

use crate::{AppError, Result};

/// Longest accepted endpoint name in bytes.
///
/// Unix socket paths top out near 104 bytes on some platforms, and the
/// `/tmp/` prefix used outside Linux eats into that.
pub const MAX_ENDPOINT_BYTES: usize = 96;

/// A validated, immutable service name.
///
/// Resolved by the host's local socket namespace: an abstract socket on
/// Linux, a socket file under `/tmp` on other Unixes, a named pipe on
/// Windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointName(String);

impl EndpointName {
    /// Validate and wrap `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bind` if the name is empty, longer than
    /// [`MAX_ENDPOINT_BYTES`], or contains a NUL byte or `/`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(AppError::Bind("endpoint name must not be empty".into()));
        }

        if name.len() > MAX_ENDPOINT_BYTES {
            return Err(AppError::Bind(format!(
                "endpoint name '{name}' exceeds {MAX_ENDPOINT_BYTES} bytes"
            )));
        }

        if name.contains(|c| c == '\0' || c == '/') {
            return Err(AppError::Bind(format!(
                "endpoint name '{}' contains a forbidden character",
                name.escape_debug()
            )));
        }

        Ok(Self(name))
    }

    /// The raw name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve to a name in the host's local socket namespace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bind` if the platform rejects the name.
    pub fn to_socket_name(&self) -> Result<Name<'_>> {
        self.0
            .as_str()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Bind(format!("invalid endpoint name '{}': {err}", self.0)))
    }
}

impl Display for EndpointName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for EndpointName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
