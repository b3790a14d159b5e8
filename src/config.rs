//! Global configuration parsing and validation.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::models::endpoint::EndpointName;
use crate::{AppError, Result};

/// Smallest accepted frame limit; a header alone is 24 bytes.
pub const MIN_FRAME_BYTES: usize = 64;

/// Largest accepted frame limit: 64 MiB.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn default_endpoint_name() -> String {
    "dictlink.myservice".into()
}

fn default_max_frame_bytes() -> usize {
    1_048_576
}

fn default_max_nesting_depth() -> usize {
    32
}

/// Per-connection transport limits.
///
/// The [`Dispatcher`](crate::dispatch::Dispatcher) carries one copy and
/// hands it to every connection it serves.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChannelConfig {
    /// Maximum size of a single frame (header + body) in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Maximum dictionary nesting accepted when encoding or decoding.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            max_nesting_depth: default_max_nesting_depth(),
        }
    }
}

impl ChannelConfig {
    /// Check the limits against their accepted ranges.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a limit is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FRAME_BYTES..=MAX_FRAME_BYTES).contains(&self.max_frame_bytes) {
            return Err(AppError::Config(format!(
                "max_frame_bytes must be between {MIN_FRAME_BYTES} and {MAX_FRAME_BYTES}"
            )));
        }

        if self.max_nesting_depth == 0 {
            return Err(AppError::Config(
                "max_nesting_depth must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Well-known endpoint the server binds.
    #[serde(default = "default_endpoint_name")]
    pub endpoint_name: String,
    /// Transport limits.
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            endpoint_name: default_endpoint_name(),
            channel: ChannelConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The configured endpoint as a validated name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bind` if the name is not a valid endpoint.
    pub fn endpoint(&self) -> Result<EndpointName> {
        EndpointName::new(&self.endpoint_name)
    }

    fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        EndpointName::new(&self.endpoint_name)
            .map_err(|err| AppError::Config(format!("endpoint_name invalid: {err}")))?;
        Ok(())
    }
}
