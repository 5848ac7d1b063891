//! Protocol engine module.
//!
//! A [`CodaDevice`] owns one byte stream. It queues outbound commands, frames
//! and writes them one at a time, correlates replies to their callbacks by
//! token and publishes inbound events to subscribers.
//!
//! Only one reply-expecting command is in flight at any time: the queue stops
//! draining until that command's reply has been processed, so replies always
//! arrive in request order. Fire-and-forget commands and queue markers drain
//! freely in between.

/// Typed builders for each service command.
pub mod commands;

use crate::frame::{encode_serial_frame, encode_serial_ping, DecodedFrame, FrameDecoder, Framing};
use crate::json::JsonValue;
use crate::protocol::{
    CodaEvent, CommandError, CommandResult, Cookie, IncomingMessage, ReplyKind, Service,
    LOCATOR_HELLO_ANSWER, NO_REPLY_TOKEN,
};
use crate::stream::ByteStream;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Completion callback; receives the engine so it can chain follow-up commands.
pub type CommandCallback = Box<dyn FnOnce(&mut CodaDevice, &CommandResult) + Send>;

/// An engine shared between its read pump and its users.
pub type SharedDevice = Arc<Mutex<CodaDevice>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How a queued entry is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Gets a token; completes on the correlated reply.
    WithReply,
    /// Completes once written.
    WithoutReply,
    /// Never written; completes locally once everything before it has.
    Noop,
}

/// Connection state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No stream bound.
    Idle,
    /// Stream attached, nothing exchanged yet.
    DeviceBound,
    /// The peer greeted us.
    Operational,
}

/// A command waiting in the outbound queue or for its reply.
pub struct SendQueueEntry {
    /// Whether a reply is expected.
    pub message_type: MessageType,
    /// Target service.
    pub service: Service,
    /// Command name within `service`.
    pub command: String,
    /// Only set for [`MessageType::WithReply`].
    pub token: Option<u32>,
    /// Caller value echoed into the result.
    pub cookie: Cookie,
    /// Request message, unframed.
    pub data: Vec<u8>,
    callback: Option<CommandCallback>,
}

impl fmt::Debug for SendQueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendQueueEntry")
            .field("message_type", &self.message_type)
            .field("service", &self.service)
            .field("command", &self.command)
            .field("token", &self.token)
            .field("cookie", &self.cookie)
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Protocol engine bound to one byte stream.
pub struct CodaDevice {
    framing: Framing,
    decoder: Box<dyn FrameDecoder>,
    stream: Option<Box<dyn ByteStream>>,
    state: EngineState,
    next_token: u32,
    queue: VecDeque<SendQueueEntry>,
    awaiting: BTreeMap<u32, SendQueueEntry>,
    draining: bool,
    ping_only: bool,
    error_string: String,
    event_tx: broadcast::Sender<CodaEvent>,
}

impl CodaDevice {
    /// Create an idle engine.
    pub fn new(framing: Framing) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            framing,
            decoder: framing.decoder(),
            stream: None,
            state: EngineState::Idle,
            next_token: 0,
            queue: VecDeque::new(),
            awaiting: BTreeMap::new(),
            draining: false,
            ping_only: false,
            error_string: String::new(),
            event_tx,
        }
    }

    /// Engine bound to `stream`.
    pub fn with_stream(framing: Framing, stream: Box<dyn ByteStream>) -> Self {
        let mut device = Self::new(framing);
        device.set_stream(stream);
        device
    }

    /// Bind a stream, replacing (and closing) any previous one.
    pub fn set_stream(&mut self, stream: Box<dyn ByteStream>) {
        if let Some(mut old) = self.stream.replace(stream) {
            old.close();
        }
        self.decoder.reset();
        self.error_string.clear();
        self.state = EngineState::DeviceBound;
        self.drain_queue();
    }

    /// Wrap for use by a read pump and other threads.
    pub fn into_shared(self) -> SharedDevice {
        Arc::new(Mutex::new(self))
    }

    /// Framing this engine encodes and decodes with.
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Whether a stream is bound and open.
    pub fn is_open(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.is_open())
    }

    /// Last engine or stream error, empty when none.
    pub fn error_string(&self) -> String {
        if !self.error_string.is_empty() {
            return self.error_string.clone();
        }
        self.stream.as_ref().map(|s| s.error_string()).unwrap_or_default()
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<CodaEvent> {
        self.event_tx.subscribe()
    }

    /// Entries not yet written.
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// Requests written and waiting for their reply.
    pub fn awaiting_count(&self) -> usize {
        self.awaiting.len()
    }

    pub(crate) fn publish(&self, event: CodaEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stream.as_mut()?.take_reader()
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.error_string = message.into();
    }

    /// Queue a command. Returns the token allocated for reply-expecting ones.
    pub fn enqueue(
        &mut self,
        service: Service,
        command: &str,
        params: Vec<u8>,
        message_type: MessageType,
        callback: Option<CommandCallback>,
        cookie: Cookie,
    ) -> Option<u32> {
        let token = (message_type == MessageType::WithReply).then(|| {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            token
        });

        let data = if message_type == MessageType::Noop {
            Vec::new()
        } else {
            let token_text = token.map_or_else(|| NO_REPLY_TOKEN.to_string(), |t| t.to_string());
            let mut data = Vec::with_capacity(params.len() + command.len() + 32);
            for field in [b"C".as_slice(), token_text.as_bytes(), service.wire_name().as_bytes(), command.as_bytes()] {
                data.extend_from_slice(field);
                data.push(0);
            }
            data.extend_from_slice(&params);
            data
        };

        self.queue.push_back(SendQueueEntry {
            message_type,
            service,
            command: command.to_string(),
            token,
            cookie,
            data,
            callback,
        });
        self.drain_queue();
        token
    }

    /// Queue a command whose reply is delivered to `callback`.
    pub fn send_command<F>(
        &mut self,
        service: Service,
        command: &str,
        params: Vec<u8>,
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.enqueue(service, command, params, MessageType::WithReply, Some(Box::new(callback)), cookie)
            .unwrap_or_default()
    }

    /// Queue a command the agent does not answer.
    pub fn send_command_without_reply(&mut self, service: Service, command: &str, params: Vec<u8>) {
        self.enqueue(service, command, params, MessageType::WithoutReply, None, 0);
    }

    /// Invoke `callback` once every command queued before it has completed.
    pub fn send_noop<F>(&mut self, callback: F, cookie: Cookie)
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.enqueue(Service::Unknown, "", Vec::new(), MessageType::Noop, Some(Box::new(callback)), cookie);
    }

    /// Link-level ping; with `ping_only` the pong is not followed by the
    /// Locator answer.
    pub fn send_serial_ping(&mut self, ping_only: bool) -> bool {
        self.ping_only = ping_only;
        self.write_raw(&encode_serial_ping())
    }

    /// Write a frame of a sibling protocol on a serial link.
    pub fn write_custom_frame(&mut self, protocol_id: u8, payload: &[u8]) -> bool {
        match encode_serial_frame(protocol_id, payload) {
            Ok(frame) => self.write_raw(&frame),
            Err(e) => {
                log::error!("Cannot frame custom payload: {}", e);
                self.record_error(e.to_string());
                false
            }
        }
    }

    /// Feed bytes read from the stream. Parses complete messages, runs
    /// callbacks and publishes events, then continues draining the queue.
    pub fn process_incoming(&mut self, bytes: &[u8]) {
        if self.state == EngineState::DeviceBound {
            self.state = EngineState::Operational;
        }
        log::trace!("<- {} ({})", hex::encode(bytes), self.decoder.name());
        for frame in self.decoder.push(bytes) {
            match frame {
                DecodedFrame::Message(message) => self.handle_message(&message),
                DecodedFrame::Pong(version) => {
                    log::info!("Serial pong: {}", version);
                    if !self.ping_only {
                        self.write_message(LOCATOR_HELLO_ANSWER);
                    }
                    self.publish(CodaEvent::SerialPong(version));
                }
                DecodedFrame::Unknown { protocol_id, payload } => {
                    log::debug!("Frame for protocol 0x{:02x} ({} bytes)", protocol_id, payload.len());
                    self.publish(CodaEvent::UnknownFrame { protocol_id, payload });
                }
            }
        }
        self.drain_queue();
    }

    /// Close the stream. Queued and awaiting commands are abandoned without
    /// running their callbacks.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            log::info!("Device closed");
        }
        let abandoned = self.queue.len() + self.awaiting.len();
        if abandoned > 0 {
            log::info!("Abandoning {} pending command(s)", abandoned);
        }
        self.queue.clear();
        self.awaiting.clear();
        self.decoder.reset();
        self.state = EngineState::Idle;
    }

    fn drain_queue(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        while self.awaiting.is_empty() {
            let needs_stream = match self.queue.front() {
                None => break,
                Some(entry) => entry.message_type != MessageType::Noop,
            };
            if needs_stream && !self.check_writable() {
                break;
            }
            let Some(mut entry) = self.queue.pop_front() else { break };
            match entry.message_type {
                MessageType::Noop => {
                    if let Some(callback) = entry.callback.take() {
                        callback(self, &CommandResult::noop(entry.cookie));
                    }
                }
                MessageType::WithoutReply => {
                    self.write_message(&entry.data);
                }
                MessageType::WithReply => {
                    if !self.write_message(&entry.data) {
                        log::warn!("Failing {} {} after unsuccessful write", entry.service, entry.command);
                        self.fail_entry(entry);
                        continue;
                    }
                    if let Some(token) = entry.token {
                        self.awaiting.insert(token, entry);
                    }
                }
            }
        }
        self.draining = false;
    }

    /// Complete `entry` with a `Fail` result carrying its request.
    fn fail_entry(&mut self, mut entry: SendQueueEntry) {
        if let Some(callback) = entry.callback.take() {
            let result = CommandResult::failed(entry.service, std::mem::take(&mut entry.data), entry.cookie);
            callback(self, &result);
        }
    }

    fn check_writable(&mut self) -> bool {
        let reason = match &self.stream {
            None => "no device bound".to_string(),
            Some(stream) if !stream.is_open() => {
                format!("device not open: {}", stream.error_string())
            }
            Some(_) => return true,
        };
        log::warn!("Refusing to write, {}", reason);
        self.error_string = reason;
        false
    }

    fn write_message(&mut self, message: &[u8]) -> bool {
        log::debug!("-> {}", printable(message));
        match self.framing.encode(message) {
            Ok(wire) => self.write_raw(&wire),
            Err(e) => {
                log::error!("Cannot send message: {}", e);
                self.record_error(e.to_string());
                false
            }
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> bool {
        if !self.check_writable() {
            return false;
        }
        let Some(stream) = self.stream.as_mut() else { return false };
        log::trace!("-> {}", hex::encode(bytes));
        match stream.write(bytes) {
            Ok(()) => {
                self.state = EngineState::Operational;
                true
            }
            Err(e) => {
                let message = format!("Write failed: {e}");
                log::error!("{}", message);
                self.error_string.clone_from(&message);
                self.publish(CodaEvent::Error(message));
                false
            }
        }
    }

    fn handle_message(&mut self, message: &[u8]) {
        log::debug!("<- {}", printable(message));
        match IncomingMessage::parse(message) {
            Ok(IncomingMessage::Reply { kind, token, fields }) => self.handle_reply(kind, &token, &fields),
            Ok(IncomingMessage::Event { service, name, fields }) => self.handle_event(&service, &name, &fields),
            Ok(IncomingMessage::Request { service, command, .. }) => {
                log::debug!("Ignoring request {} {} from peer", service, command);
            }
            Ok(IncomingMessage::SevereError(text)) => {
                let message = format!("Peer reported a severe error: {text}");
                log::error!("{}", message);
                self.error_string.clone_from(&message);
                self.publish(CodaEvent::Error(message));
            }
            Err(e) => log::warn!("Unparsable message ({}): {}", e, printable(message)),
        }
    }

    fn handle_reply(&mut self, kind: ReplyKind, token: &str, fields: &[Vec<u8>]) {
        let Ok(token) = token.parse::<u32>() else {
            log::warn!("Reply with invalid token '{}'", token);
            return;
        };
        let Some(mut entry) = self.awaiting.remove(&token) else {
            log::warn!("No pending command for reply token {}", token);
            return;
        };

        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let value = JsonValue::parse(field);
            if !value.is_valid() {
                log::warn!(
                    "Invalid value in reply to {} {}: {}",
                    entry.service,
                    entry.command,
                    String::from_utf8_lossy(field)
                );
                self.fail_entry(entry);
                return;
            }
            values.push(value);
        }

        let error = values.last().and_then(CommandError::parse);
        let kind = match (kind, &error) {
            (ReplyKind::Success, Some(_)) => ReplyKind::CommandError,
            (kind, _) => kind,
        };
        let result = CommandResult {
            kind,
            service: entry.service,
            request: std::mem::take(&mut entry.data),
            error: error.unwrap_or_default(),
            values,
            cookie: entry.cookie,
        };
        log::debug!("Reply {}: {}", token, result);
        if let Some(callback) = entry.callback.take() {
            callback(self, &result);
        }
    }

    fn handle_event(&mut self, service: &str, name: &str, fields: &[Vec<u8>]) {
        let values: Vec<JsonValue> = fields.iter().map(|f| JsonValue::parse(f)).collect();
        let Some(event) = CodaEvent::from_message(service, name, values) else {
            log::trace!("Heartbeat from {}", service);
            return;
        };
        if matches!(event, CodaEvent::LocatorHello { .. }) {
            log::info!("Locator Hello received");
            self.write_message(LOCATOR_HELLO_ANSWER);
        }
        self.publish(event);
    }
}

/// Message text with the field separators made visible.
fn printable(message: &[u8]) -> String {
    String::from_utf8_lossy(message).replace('\0', "|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TCP_MESSAGE_TERMINATOR;
    use crate::stream::{MemoryStream, MemoryStreamHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tcp_device() -> (CodaDevice, MemoryStreamHandle) {
        let (stream, handle) = MemoryStream::new();
        (CodaDevice::with_stream(Framing::Tcp, Box::new(stream)), handle)
    }

    fn tcp(message: &[u8]) -> Vec<u8> {
        let mut v = message.to_vec();
        v.extend_from_slice(&TCP_MESSAGE_TERMINATOR);
        v
    }

    #[test]
    fn test_states() {
        let mut device = CodaDevice::new(Framing::Tcp);
        assert_eq!(device.state(), EngineState::Idle);
        let (stream, _handle) = MemoryStream::new();
        device.set_stream(Box::new(stream));
        assert_eq!(device.state(), EngineState::DeviceBound);
        device.send_command_without_reply(Service::Settings, "set", Vec::new());
        assert_eq!(device.state(), EngineState::Operational);
        device.close();
        assert_eq!(device.state(), EngineState::Idle);
        assert!(!device.is_open());
    }

    #[test]
    fn test_write_refused_without_stream() {
        let mut device = CodaDevice::new(Framing::Tcp);
        device.send_command(Service::Locator, "sync", Vec::new(), |_, _| {}, 0);
        assert_eq!(device.state(), EngineState::Idle);
        assert_eq!(device.queued_count(), 1);
        assert!(device.error_string().contains("no device bound"));

        // Binding a stream flushes the queue.
        let (stream, handle) = MemoryStream::new();
        device.set_stream(Box::new(stream));
        assert_eq!(handle.written(), tcp(b"C\x000\0Locator\0sync\0"));
        assert_eq!(device.awaiting_count(), 1);
    }

    #[test]
    fn test_write_refused_on_closed_stream() {
        let mut device =
            CodaDevice::with_stream(Framing::Tcp, Box::new(MemoryStream::closed("port busy")));
        device.send_command(Service::Locator, "sync", Vec::new(), |_, _| {}, 0);
        assert_eq!(device.state(), EngineState::DeviceBound);
        assert!(device.error_string().contains("port busy"));
    }

    #[test]
    fn test_without_reply_uses_reserved_token() {
        let (mut device, handle) = tcp_device();
        device.send_command_without_reply(Service::Settings, "set", b"{}\0".to_vec());
        assert_eq!(handle.written(), tcp(b"C\0-1\0Settings\0set\0{}\0"));
        assert_eq!(device.awaiting_count(), 0);

        // Tokens are only consumed by reply-expecting commands.
        let token = device.send_command(Service::Locator, "sync", Vec::new(), |_, _| {}, 0);
        assert_eq!(token, 0);
    }

    #[test]
    fn test_single_outstanding_request() {
        let (mut device, handle) = tcp_device();
        let first = device.send_command(Service::Locator, "sync", Vec::new(), |_, _| {}, 1);
        let second = device.send_command(Service::Locator, "sync", Vec::new(), |_, _| {}, 2);
        assert_eq!((first, second), (0, 1));
        assert_eq!(handle.take_written(), tcp(b"C\x000\0Locator\0sync\0"));
        assert_eq!(device.queued_count(), 1);

        device.process_incoming(&tcp(b"R\x000\0"));
        assert_eq!(handle.take_written(), tcp(b"C\x001\0Locator\0sync\0"));
        assert_eq!(device.queued_count(), 0);
    }

    #[test]
    fn test_noop_completes_in_order() {
        let (mut device, _handle) = tcp_device();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        device.send_command(Service::Locator, "sync", Vec::new(), move |_, r| o1.lock().unwrap().push(r.cookie), 1);
        let o2 = Arc::clone(&order);
        device.send_noop(
            move |_, r| {
                assert!(r.is_success());
                o2.lock().unwrap().push(r.cookie);
            },
            2,
        );
        assert!(order.lock().unwrap().is_empty());
        device.process_incoming(&tcp(b"R\x000\0"));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_callback_chains_commands() {
        let (mut device, handle) = tcp_device();
        device.send_command(
            Service::Locator,
            "sync",
            Vec::new(),
            |device, _| {
                device.send_command(Service::RunControl, "suspend", b"\"p1\"\0".to_vec(), |_, _| {}, 0);
            },
            0,
        );
        handle.take_written();
        device.process_incoming(&tcp(b"R\x000\0"));
        assert_eq!(handle.written(), tcp(b"C\x001\0RunControl\0suspend\0\"p1\"\0"));
    }

    #[test]
    fn test_reply_kinds_and_error_hash() {
        let (mut device, _handle) = tcp_device();
        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let r = Arc::clone(&results);
            device.send_command(Service::Memory, "get", Vec::new(), move |_, res| r.lock().unwrap().push(res.clone()), 0);
        }
        device.process_incoming(&tcp(b"R\x000\0\"AAAA\"\0{\"Time\":1,\"Code\":22}\0"));
        device.process_incoming(&tcp(b"N\x001\0"));
        device.process_incoming(&tcp(b"R\x002\0{\"Code\":22}\0"));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].kind, ReplyKind::CommandError);
        assert_eq!(results[0].error.code, 22);
        assert!(!results[0].is_success());
        assert_eq!(results[1].kind, ReplyKind::Fail);
        assert_eq!(results[2].kind, ReplyKind::Success);
        assert_eq!(results[2].service, Service::Memory);
    }

    #[test]
    fn test_unknown_token_ignored_bad_value_fails_request() {
        let (mut device, _handle) = tcp_device();
        let results = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&results);
        device.send_command(
            Service::Locator,
            "sync",
            Vec::new(),
            move |_, result| r.lock().unwrap().push((result.kind, result.cookie, result.request.clone())),
            9,
        );

        device.process_incoming(&tcp(b"R\x0042\0"));
        device.process_incoming(&tcp(b"R\0abc\0"));
        assert_eq!(device.awaiting_count(), 1);
        assert!(results.lock().unwrap().is_empty());

        device.process_incoming(&tcp(b"R\x000\0{unterminated\0"));
        assert_eq!(device.awaiting_count(), 0);
        assert_eq!(
            *results.lock().unwrap(),
            vec![(ReplyKind::Fail, 9, b"C\x000\0Locator\0sync\0".to_vec())]
        );

        // A second reply for the same token no longer correlates.
        device.process_incoming(&tcp(b"R\x000\0"));
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_events_never_reach_callbacks() {
        let (mut device, _handle) = tcp_device();
        let mut rx = device.subscribe();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        device.send_command(Service::Logging, "addListener", Vec::new(), move |_, _| { c.fetch_add(1, Ordering::SeqCst); }, 0);

        device.process_incoming(&tcp(b"E\0Logging\0write\0\"p1\"\0\"out\"\0"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(rx.try_recv().unwrap(), CodaEvent::LoggingWrite { id: "p1".into(), message: "out".into() });
    }

    #[test]
    fn test_hello_answered_and_heartbeat_dropped() {
        let (mut device, handle) = tcp_device();
        let mut rx = device.subscribe();
        device.process_incoming(&tcp(b"E\0Locator\0heartbeat\0"));
        assert!(rx.try_recv().is_err());

        device.process_incoming(&tcp(b"E\0Locator\0Hello\0[\"RunControl\"]\0"));
        assert_eq!(handle.written(), tcp(LOCATOR_HELLO_ANSWER));
        assert_eq!(rx.try_recv().unwrap(), CodaEvent::LocatorHello { services: vec!["RunControl".into()] });
        assert_eq!(device.state(), EngineState::Operational);
    }

    #[test]
    fn test_severe_error_published() {
        let (mut device, _handle) = tcp_device();
        let mut rx = device.subscribe();
        device.process_incoming(&tcp(b"\x03\x02{\"Format\":\"parse error\"}"));
        assert!(matches!(rx.try_recv().unwrap(), CodaEvent::Error(msg) if msg.contains("parse error")));
    }

    #[test]
    fn test_close_abandons_callbacks() {
        let (mut device, handle) = tcp_device();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let c = Arc::clone(&calls);
            device.send_command(Service::Locator, "sync", Vec::new(), move |_, _| { c.fetch_add(1, Ordering::SeqCst); }, 0);
        }
        device.close();
        assert!(!handle.is_open());
        assert_eq!((device.queued_count(), device.awaiting_count()), (0, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_serial_ping_pong() {
        let (stream, handle) = MemoryStream::new();
        let mut device = CodaDevice::with_stream(Framing::Serial, Box::new(stream));
        let mut rx = device.subscribe();
        assert!(device.send_serial_ping(false));
        assert_eq!(handle.take_written(), encode_serial_ping());

        let pong = encode_serial_frame(0x91, b"\xFC\xF1CODA 4.0").unwrap();
        device.process_incoming(&pong);
        assert_eq!(rx.try_recv().unwrap(), CodaEvent::SerialPong("CODA 4.0".into()));
        assert_eq!(handle.take_written(), Framing::Serial.encode(LOCATOR_HELLO_ANSWER).unwrap());

        device.send_serial_ping(true);
        handle.take_written();
        device.process_incoming(&pong);
        assert!(handle.written().is_empty());
    }

    #[test]
    fn test_oversized_serial_message_rejected() {
        let (stream, handle) = MemoryStream::new();
        let mut device = CodaDevice::with_stream(Framing::Serial, Box::new(stream));
        let params = vec![b'a'; crate::frame::MAX_SERIAL_MESSAGE_SIZE];
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        device.send_command(Service::FileSystem, "write", params, move |_, r| *s.lock().unwrap() = Some((r.kind, r.cookie)), 4);
        assert!(handle.written().is_empty());
        assert_eq!(device.awaiting_count(), 0);
        assert_eq!(*seen.lock().unwrap(), Some((ReplyKind::Fail, 4)));
        assert!(device.error_string().contains("exceeds"));
    }

    #[test]
    fn test_unknown_frames_forwarded() {
        let (stream, _handle) = MemoryStream::new();
        let mut device = CodaDevice::with_stream(Framing::Serial, Box::new(stream));
        let mut rx = device.subscribe();
        assert!(device.write_custom_frame(0x90, b"x"));
        device.process_incoming(&encode_serial_frame(0x90, b"trace").unwrap());
        assert_eq!(
            rx.try_recv().unwrap(),
            CodaEvent::UnknownFrame { protocol_id: 0x90, payload: b"trace".to_vec() }
        );
    }
}
