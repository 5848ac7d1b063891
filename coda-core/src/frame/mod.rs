//! Frame codec module.
//!
//! Splits the inbound byte stream of a connection into protocol messages and
//! encodes outbound messages. Two framings exist, selected per connection and
//! never mixed:
//!
//! ```text
//! TCP:    <message bytes> 0x03 0x01
//! Serial: 0x01 <protocol-id> <len-hi> <len-lo> <payload[len]>
//! ```

/// Serial framing and chunking.
pub mod serial;
/// Terminator-delimited TCP framing.
pub mod tcp;

pub use serial::{
    encode_serial_frame, encode_serial_message, encode_serial_ping, SerialFramer,
    MAX_SERIAL_MESSAGE_SIZE, SERIAL_CHUNK_DATA_SIZE, SERIAL_FRAME_MAX_PAYLOAD,
    SERIAL_PROTOCOL_CODA, SERIAL_PROTOCOL_PING,
};
pub use tcp::{encode_tcp_frame, TcpFramer, MAX_TCP_MESSAGE_SIZE, TCP_MESSAGE_TERMINATOR};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output of a [`FrameDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// A complete (reassembled) CODA message.
    Message(Vec<u8>),
    /// Serial pong; carries the version text the peer appended.
    Pong(String),
    /// A frame of a sibling protocol sharing the serial link.
    Unknown { protocol_id: u8, payload: Vec<u8> },
}

/// Encode-side framing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
}

/// Trait for converting a stream of bytes into discrete frames.
pub trait FrameDecoder: Send {
    /// Ingest new bytes and return any complete frames found.
    fn push(&mut self, bytes: &[u8]) -> Vec<DecodedFrame>;

    /// Drop buffered bytes and any partial reassembly.
    fn reset(&mut self);

    /// Name of the framing, for logs.
    fn name(&self) -> &'static str;
}

/// Framing used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Framing {
    /// `0x03 0x01` terminated messages.
    #[default]
    Tcp,
    /// Length-prefixed frames, chunked above one frame.
    Serial,
}

impl Framing {
    /// A fresh decoder for this framing.
    pub fn decoder(self) -> Box<dyn FrameDecoder> {
        match self {
            Self::Tcp => Box::new(TcpFramer::new()),
            Self::Serial => Box::new(SerialFramer::new()),
        }
    }

    /// Wrap one CODA message for the wire, chunking it on serial links.
    pub fn encode(self, message: &[u8]) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Tcp => Ok(encode_tcp_frame(message)),
            Self::Serial => encode_serial_message(message),
        }
    }
}

/// A message starts with its type character and a `\0` separator, or with the
/// `0x03 0x02` sentinel of a severe peer-side error.
pub(crate) fn is_plausible_message_start(data: &[u8]) -> bool {
    matches!(data, [b'C' | b'E' | b'R' | b'N' | b'P', 0, ..] | [0x03, 0x02, ..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plausible_message_start() {
        assert!(is_plausible_message_start(b"E\0Locator"));
        assert!(is_plausible_message_start(b"R\x005\0"));
        assert!(is_plausible_message_start(b"\x03\x02{}"));
        assert!(!is_plausible_message_start(b"E"));
        assert!(!is_plausible_message_start(b"Xyz"));
        assert!(!is_plausible_message_start(b""));
    }

    #[test]
    fn test_roundtrip_both_framings() {
        let payload = b"E\0Locator\0Hello\0[\"Locator\"]\0".to_vec();
        for framing in [Framing::Tcp, Framing::Serial] {
            let wire = framing.encode(&payload).unwrap();
            let frames = framing.decoder().push(&wire);
            assert_eq!(frames, vec![DecodedFrame::Message(payload.clone())], "{framing:?}");
        }
    }
}
