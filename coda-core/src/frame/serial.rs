//! Serial framing.
//!
//! Every frame carries a 4-byte header: start byte `0x01`, a protocol id and a
//! big-endian payload length. CODA messages that do not fit in one frame are
//! chunked: each chunk payload begins with a marker (`0xFE` on the first chunk,
//! `0x00` afterwards) and the number of chunks still to follow.

use super::{DecodedFrame, FrameDecoder, FrameError};
use bytes::{Buf, BytesMut};

/// First byte of every serial frame header.
pub const SERIAL_HEADER_START: u8 = 0x01;
/// Start byte, protocol id and big-endian length.
pub const SERIAL_HEADER_SIZE: usize = 4;
/// Protocol id of CODA messages.
pub const SERIAL_PROTOCOL_CODA: u8 = 0x92;
/// Protocol id of the link-level ping/pong exchange.
pub const SERIAL_PROTOCOL_PING: u8 = 0x91;
/// Largest payload of a single frame.
pub const SERIAL_FRAME_MAX_PAYLOAD: usize = 1024;
/// Message bytes carried by one chunk (payload minus marker and counter).
pub const SERIAL_CHUNK_DATA_SIZE: usize = SERIAL_FRAME_MAX_PAYLOAD - 2;
/// Marker of the first chunk of a split message.
pub const SERIAL_CHUNK_START: u8 = 0xFE;
/// Marker of the following chunks.
pub const SERIAL_CHUNK_CONTINUATION: u8 = 0x00;
/// Largest message accepted for chunked transmission.
pub const MAX_SERIAL_MESSAGE_SIZE: usize = 0x10000;

/// Payload of a link ping.
pub const SERIAL_PING: [u8; 2] = [0xFC, 0x1F];
/// Start of a pong payload; the agent version follows.
pub const SERIAL_PONG_PREFIX: [u8; 2] = [0xFC, 0xF1];

/// Wrap a single payload in a serial header.
pub fn encode_serial_frame(protocol_id: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > SERIAL_FRAME_MAX_PAYLOAD {
        return Err(FrameError::MessageTooLarge {
            size: payload.len(),
            max: SERIAL_FRAME_MAX_PAYLOAD,
        });
    }
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::MessageTooLarge {
        size: payload.len(),
        max: SERIAL_FRAME_MAX_PAYLOAD,
    })?;
    let mut buf = Vec::with_capacity(SERIAL_HEADER_SIZE + payload.len());
    buf.push(SERIAL_HEADER_START);
    buf.push(protocol_id);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode a CODA message, splitting it into chunks when it exceeds one frame.
pub fn encode_serial_message(message: &[u8]) -> Result<Vec<u8>, FrameError> {
    if message.len() > MAX_SERIAL_MESSAGE_SIZE {
        return Err(FrameError::MessageTooLarge {
            size: message.len(),
            max: MAX_SERIAL_MESSAGE_SIZE,
        });
    }
    if message.len() <= SERIAL_CHUNK_DATA_SIZE {
        return encode_serial_frame(SERIAL_PROTOCOL_CODA, message);
    }

    let chunk_count = message.len().div_ceil(SERIAL_CHUNK_DATA_SIZE);
    let mut wire = Vec::with_capacity(message.len() + chunk_count * (SERIAL_HEADER_SIZE + 2));
    for (index, chunk) in message.chunks(SERIAL_CHUNK_DATA_SIZE).enumerate() {
        let marker = if index == 0 { SERIAL_CHUNK_START } else { SERIAL_CHUNK_CONTINUATION };
        // At most 65 chunks, so the counter always fits.
        let remaining = u8::try_from(chunk_count - 1 - index).unwrap_or(u8::MAX);
        let mut payload = Vec::with_capacity(chunk.len() + 2);
        payload.push(marker);
        payload.push(remaining);
        payload.extend_from_slice(chunk);
        wire.extend(encode_serial_frame(SERIAL_PROTOCOL_CODA, &payload)?);
    }
    Ok(wire)
}

/// The link-level ping frame: header with a two-byte length, then the ping.
pub const SERIAL_PING_FRAME: [u8; 6] = [
    SERIAL_HEADER_START,
    SERIAL_PROTOCOL_PING,
    0x00,
    0x02,
    SERIAL_PING[0],
    SERIAL_PING[1],
];

/// The link-level ping frame as an owned buffer.
pub fn encode_serial_ping() -> Vec<u8> {
    SERIAL_PING_FRAME.to_vec()
}

#[derive(Debug)]
struct Reassembly {
    /// Counter value the next continuation chunk must carry.
    expected: u8,
    data: Vec<u8>,
}

/// Decoder for header-framed serial traffic with chunk reassembly.
#[derive(Debug, Default)]
pub struct SerialFramer {
    buffer: BytesMut,
    reassembly: Option<Reassembly>,
}

impl SerialFramer {
    /// Empty decoder.
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(4096), reassembly: None }
    }

    /// Skip to the next plausible header. Returns false when more bytes are needed.
    fn sync_to_header(&mut self) -> bool {
        loop {
            if self.buffer.is_empty() {
                return false;
            }
            if self.buffer[0] != SERIAL_HEADER_START {
                let skip = self
                    .buffer
                    .iter()
                    .position(|&b| b == SERIAL_HEADER_START)
                    .unwrap_or(self.buffer.len());
                log::warn!(
                    "Discarding {} bytes of bogus serial data: {}",
                    skip,
                    hex::encode(&self.buffer[..skip])
                );
                self.buffer.advance(skip);
                continue;
            }
            if self.buffer.len() < SERIAL_HEADER_SIZE {
                return false;
            }
            let len = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
            if len > SERIAL_FRAME_MAX_PAYLOAD {
                log::warn!(
                    "Skipping implausible serial header {} (length {})",
                    hex::encode(&self.buffer[..SERIAL_HEADER_SIZE]),
                    len
                );
                self.buffer.advance(1);
                continue;
            }
            return true;
        }
    }

    fn handle_coda_payload(&mut self, payload: Vec<u8>, frames: &mut Vec<DecodedFrame>) {
        match payload.as_slice() {
            [SERIAL_CHUNK_START, remaining, data @ ..] => {
                if self.reassembly.take().is_some() {
                    log::warn!("New chunked message started; discarding incomplete one");
                }
                if *remaining == 0 {
                    frames.push(DecodedFrame::Message(data.to_vec()));
                } else {
                    self.reassembly =
                        Some(Reassembly { expected: remaining - 1, data: data.to_vec() });
                }
            }
            [SERIAL_CHUNK_CONTINUATION, remaining, data @ ..] => {
                let Some(mut partial) = self.reassembly.take() else {
                    log::warn!("Continuation chunk without a start chunk; discarded");
                    return;
                };
                if *remaining != partial.expected {
                    log::warn!(
                        "Chunk out of sequence (expected {}, got {}); discarding message",
                        partial.expected,
                        remaining
                    );
                    return;
                }
                partial.data.extend_from_slice(data);
                if partial.expected == 0 {
                    frames.push(DecodedFrame::Message(partial.data));
                } else {
                    partial.expected -= 1;
                    self.reassembly = Some(partial);
                }
            }
            [] => log::debug!("Skipping empty serial message"),
            _ => {
                if self.reassembly.take().is_some() {
                    log::warn!("Unchunked message interrupted a chunked one; discarding partial");
                }
                frames.push(DecodedFrame::Message(payload));
            }
        }
    }
}

impl FrameDecoder for SerialFramer {
    fn push(&mut self, bytes: &[u8]) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while self.sync_to_header() {
            let protocol_id = self.buffer[1];
            let len = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
            if self.buffer.len() < SERIAL_HEADER_SIZE + len {
                break;
            }
            self.buffer.advance(SERIAL_HEADER_SIZE);
            let payload = self.buffer.split_to(len).to_vec();

            match protocol_id {
                SERIAL_PROTOCOL_CODA => self.handle_coda_payload(payload, &mut frames),
                SERIAL_PROTOCOL_PING if payload.starts_with(&SERIAL_PONG_PREFIX) => {
                    let version = String::from_utf8_lossy(&payload[SERIAL_PONG_PREFIX.len()..])
                        .trim_end_matches('\0')
                        .trim()
                        .to_string();
                    frames.push(DecodedFrame::Pong(version));
                }
                _ => frames.push(DecodedFrame::Unknown { protocol_id, payload }),
            }
        }
        frames
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.reassembly = None;
    }

    fn name(&self) -> &'static str {
        "Serial"
    }
}
