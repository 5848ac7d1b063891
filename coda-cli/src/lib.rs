//! Coda CLI support library.
//!
//! Opens a connection described by a [`ConnectionSpec`] and drives a single
//! [`launcher::Action`] against the agent on the other end.

/// Action state machine.
pub mod launcher;

pub use launcher::{Action, Launcher, Outcome};

use anyhow::{Context as _, Result};
use coda_core::{CodaConfig, CodaDevice, ConnectionSpec, Framing, SharedDevice, TcpByteStream};

/// Open the stream for `spec` and bind it to a fresh engine.
///
/// TCP connections use TCP framing, device paths use serial framing. The
/// read pump is not started; [`Launcher::run`] does that once it listens.
pub fn connect(spec: &ConnectionSpec, config: &CodaConfig) -> Result<SharedDevice> {
    let device = match spec {
        ConnectionSpec::Tcp { host, port } => {
            let stream = TcpByteStream::connect(host, *port, config.launcher.timeout())
                .with_context(|| format!("Failed to connect to {spec}"))?;
            CodaDevice::with_stream(Framing::Tcp, Box::new(stream))
        }
        ConnectionSpec::Serial { path } => open_serial(path, config.registry.baud_rate)?,
    };
    log::info!("Connected to {}", spec);
    Ok(device.into_shared())
}

#[cfg(feature = "serial")]
fn open_serial(path: &str, baud_rate: u32) -> Result<CodaDevice> {
    let stream = coda_core::SerialByteStream::open(path, baud_rate)
        .with_context(|| format!("Failed to open serial port {path}"))?;
    Ok(CodaDevice::with_stream(Framing::Serial, Box::new(stream)))
}

#[cfg(not(feature = "serial"))]
fn open_serial(path: &str, _baud_rate: u32) -> Result<CodaDevice> {
    anyhow::bail!("Serial support not compiled in; cannot open {path}")
}
