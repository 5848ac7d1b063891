//! Configuration module.
//!
//! Settings for the device registry and the launcher, loadable from a JSON
//! file. Missing fields take their defaults.

use crate::frame::MAX_SERIAL_MESSAGE_SIZE;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default TCP port of the on-device agent.
pub const DEFAULT_TCP_PORT: u16 = 1534;

/// Bytes reserved for the fields of a FileSystem `write` around its data:
/// type, token, service, command, handle and offset.
pub const PUT_REQUEST_ENVELOPE: usize = 256;

/// Largest file chunk per FileSystem `write`. Its base64 text plus the
/// request envelope stays within the serial message limit.
pub const MAX_PUT_CHUNK_SIZE: usize = (MAX_SERIAL_MESSAGE_SIZE - PUT_REQUEST_ENVELOPE) / 4 * 3;

/// Settings of the device registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Delay between the last release of a device and closing it.
    pub close_grace_ms: u64,
    /// Re-enumerate periodically when set.
    pub poll_interval_ms: Option<u64>,
    /// Serial line speed.
    pub baud_rate: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { close_grace_ms: 1000, poll_interval_ms: None, baud_rate: 115_200 }
    }
}

impl RegistryConfig {
    /// [`Self::close_grace_ms`] as a duration.
    pub const fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Polling period; `None` when unset or zero.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }
}

/// Settings of the launcher actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Overall time allowed for one launcher action.
    pub timeout_ms: u64,
    /// Bytes per FileSystem `write` of a put.
    pub put_chunk_size: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000, put_chunk_size: 4096 }
    }
}

impl LauncherConfig {
    /// [`Self::timeout_ms`] as a duration.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level configuration, loaded from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodaConfig {
    /// Device registry settings.
    pub registry: RegistryConfig,
    /// Launcher settings.
    pub launcher: LauncherConfig,
}

impl CodaConfig {
    /// Read and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        let chunk = self.launcher.put_chunk_size;
        if chunk == 0 || chunk > MAX_PUT_CHUNK_SIZE {
            bail!("put_chunk_size must be between 1 and {MAX_PUT_CHUNK_SIZE}, got {chunk}");
        }
        if self.registry.baud_rate == 0 {
            bail!("baud_rate must not be zero");
        }
        Ok(())
    }
}

/// Where to reach a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionSpec {
    /// Agent listening on `host:port`.
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Agent on a serial port.
    Serial {
        /// Port path.
        path: String,
    },
}

impl FromStr for ConnectionSpec {
    type Err = anyhow::Error;

    /// `address[:port]` for TCP; device paths (`/dev/...`, `COMx`) for serial.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty connection specification");
        }
        let upper = s.to_ascii_uppercase();
        if s.starts_with('/') || s.starts_with("\\\\.\\") || (upper.starts_with("COM") && upper[3..].parse::<u32>().is_ok()) {
            return Ok(Self::Serial { path: s.to_string() });
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().with_context(|| format!("Invalid port '{port}'"))?;
                Ok(Self::Tcp { host: host.to_string(), port })
            }
            Some(_) => bail!("Missing host in '{s}'"),
            None => Ok(Self::Tcp { host: s.to_string(), port: DEFAULT_TCP_PORT }),
        }
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Serial { path } => f.write_str(path),
        }
    }
}
