//! Coda Core - CODA/TCF device communication.
//!
//! This crate implements the transport and protocol engine used to talk to
//! on-device debug agents: the value codec, TCP and serial framing, request
//! and reply correlation, typed commands and events, and a registry handing
//! out shared engines per device.

/// JSON configuration.
pub mod config;
/// The protocol engine.
pub mod device;
/// Transport framing.
pub mod frame;
/// Wire value codec.
pub mod json;
/// Messages, services, events and command types.
pub mod protocol;
/// Device enumeration and shared engines.
pub mod registry;
/// Byte streams an engine runs over.
pub mod stream;

// Re-export commonly used types
pub use config::{CodaConfig, ConnectionSpec, LauncherConfig, RegistryConfig};
pub use device::{CodaDevice, CommandCallback, EngineState, MessageType, SendQueueEntry, SharedDevice};
pub use frame::{DecodedFrame, FrameDecoder, FrameError, Framing};
pub use json::{JsonKind, JsonValue, ParamWriter};
pub use protocol::{
    CodaEvent, CommandError, CommandResult, Cookie, IncomingMessage, ReplyKind, Service,
};
pub use registry::{
    CommunicationKind, DeviceBackend, DeviceDescriptor, DeviceDiff, DeviceEvent, DeviceLease,
    DeviceRegistry,
};
#[cfg(feature = "serial")]
pub use registry::SerialPortBackend;
pub use stream::{spawn_read_pump, ByteStream, MemoryStream, MemoryStreamHandle, TcpByteStream, TransportError};
#[cfg(feature = "serial")]
pub use stream::SerialByteStream;
