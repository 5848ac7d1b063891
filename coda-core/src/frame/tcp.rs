//! TCP framing: every message is terminated by `0x03 0x01`.

use super::{is_plausible_message_start, DecodedFrame, FrameDecoder};
use bytes::{Buf, BytesMut};

/// End-of-message marker.
pub const TCP_MESSAGE_TERMINATOR: [u8; 2] = [0x03, 0x01];

/// Largest unterminated input kept while waiting for a terminator.
pub const MAX_TCP_MESSAGE_SIZE: usize = 0x10_0000;

/// Append the terminator to a message.
pub fn encode_tcp_frame(message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + TCP_MESSAGE_TERMINATOR.len());
    buf.extend_from_slice(message);
    buf.extend_from_slice(&TCP_MESSAGE_TERMINATOR);
    buf
}

/// Decoder for terminator-delimited messages.
#[derive(Debug, Default)]
pub struct TcpFramer {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no terminator.
    scanned: usize,
}

impl TcpFramer {
    /// Empty decoder.
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(4096), scanned: 0 }
    }

    fn find_terminator(&mut self) -> Option<usize> {
        let found = self.buffer[self.scanned..]
            .windows(TCP_MESSAGE_TERMINATOR.len())
            .position(|w| w == TCP_MESSAGE_TERMINATOR)
            .map(|pos| self.scanned + pos);
        // The last byte may be the first half of a split terminator.
        self.scanned = match found {
            Some(_) => 0,
            None => self.buffer.len().saturating_sub(1),
        };
        found
    }

    fn discard_overflow(&mut self) {
        if self.buffer.len() <= MAX_TCP_MESSAGE_SIZE {
            return;
        }
        let keep = usize::from(self.buffer.last() == Some(&TCP_MESSAGE_TERMINATOR[0]));
        let dropped = self.buffer.len() - keep;
        log::warn!("Discarding {} bytes of unterminated bogus data", dropped);
        self.buffer.advance(dropped);
        self.scanned = 0;
    }
}

impl FrameDecoder for TcpFramer {
    fn push(&mut self, bytes: &[u8]) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.find_terminator() {
            let message = self.buffer.split_to(pos);
            self.buffer.advance(TCP_MESSAGE_TERMINATOR.len());

            if message.is_empty() {
                log::debug!("Skipping empty TCP message");
                continue;
            }
            if is_plausible_message_start(&message) {
                frames.push(DecodedFrame::Message(message.to_vec()));
                continue;
            }
            match (1..message.len()).find(|&i| is_plausible_message_start(&message[i..])) {
                Some(start) => {
                    log::warn!(
                        "Discarding {} bytes of bogus data: {}",
                        start,
                        hex::encode(&message[..start])
                    );
                    frames.push(DecodedFrame::Message(message[start..].to_vec()));
                }
                None => {
                    log::warn!("Discarding bogus message: {}", hex::encode(&message));
                }
            }
        }
        self.discard_overflow();
        frames
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_basic() {
        let mut framer = TcpFramer::new();
        let frames = framer.push(b"E\0Locator\0Hello\0\x03\x01");
        assert_eq!(frames, vec![DecodedFrame::Message(b"E\0Locator\0Hello\0".to_vec())]);
    }

    #[test]
    fn test_tcp_split_across_pushes() {
        let mut framer = TcpFramer::new();
        assert!(framer.push(b"R\x003\0").is_empty());
        assert!(framer.push(b"\x03").is_empty());
        let frames = framer.push(b"\x01R\x004\0\x03\x01");
        assert_eq!(
            frames,
            vec![
                DecodedFrame::Message(b"R\x003\0".to_vec()),
                DecodedFrame::Message(b"R\x004\0".to_vec()),
            ]
        );
    }

    #[test]
    fn test_tcp_empty_message_skipped() {
        let mut framer = TcpFramer::new();
        let frames = framer.push(b"\x03\x01\x03\x01R\x001\0\x03\x01");
        assert_eq!(frames, vec![DecodedFrame::Message(b"R\x001\0".to_vec())]);
    }

    #[test]
    fn test_tcp_garbage_prefix_discarded() {
        let mut framer = TcpFramer::new();
        let frames = framer.push(b"junkE\0Locator\0Hello\0[]\0\x03\x01garbage\x03\x01R\x002\0\x03\x01");
        assert_eq!(
            frames,
            vec![
                DecodedFrame::Message(b"E\0Locator\0Hello\0[]\0".to_vec()),
                DecodedFrame::Message(b"R\x002\0".to_vec()),
            ]
        );
    }

    #[test]
    fn test_tcp_byte_at_a_time() {
        let mut framer = TcpFramer::new();
        let mut frames = Vec::new();
        for byte in b"R\x001\0\x03\x01E\0Locator\0Hello\0\x03\x01" {
            frames.extend(framer.push(&[*byte]));
        }
        assert_eq!(
            frames,
            vec![
                DecodedFrame::Message(b"R\x001\0".to_vec()),
                DecodedFrame::Message(b"E\0Locator\0Hello\0".to_vec()),
            ]
        );
    }

    #[test]
    fn test_tcp_unterminated_flood_discarded() {
        let mut framer = TcpFramer::new();
        let flood = vec![b'x'; 64 * 1024];
        for _ in 0..(MAX_TCP_MESSAGE_SIZE / flood.len() + 1) {
            assert!(framer.push(&flood).is_empty());
        }
        assert!(framer.buffer.len() <= MAX_TCP_MESSAGE_SIZE);

        let frames = framer.push(b"\x03\x01R\x005\0\x03\x01");
        assert_eq!(frames, vec![DecodedFrame::Message(b"R\x005\0".to_vec())]);
    }

    #[test]
    fn test_tcp_reset() {
        let mut framer = TcpFramer::new();
        framer.push(b"R\x001");
        framer.reset();
        let frames = framer.push(b"R\x002\0\x03\x01");
        assert_eq!(frames, vec![DecodedFrame::Message(b"R\x002\0".to_vec())]);
    }
}
