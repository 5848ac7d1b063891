//! Protocol module.
//!
//! Wire-level vocabulary shared by the engine and its clients: service names,
//! reply kinds, command results and the classification of inbound messages.

/// Events pushed by the agent.
pub mod events;
/// Value types carried by commands and replies.
pub mod types;

pub use events::{CodaEvent, ModuleLoadEventInfo, RunControlContext, SuspendReason};
pub use types::{
    Breakpoint, BreakpointType, FileStat, FileSystemOpenFlags, ProcessStart,
    RunControlResumeMode,
};

use crate::json::{JsonKind, JsonValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque value handed back to a command's callback.
pub type Cookie = u64;

/// Canned answer to the peer's Locator `Hello`.
pub const LOCATOR_HELLO_ANSWER: &[u8] = b"E\0Locator\0Hello\0[\"Locator\"]\0";

/// Token text carried by requests that expect no reply.
pub const NO_REPLY_TOKEN: &str = "-1";

/// A functional area of the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Service {
    Locator,
    RunControl,
    Processes,
    Memory,
    Settings,
    Breakpoints,
    Registers,
    Logging,
    FileSystem,
    Install,
    OsData,
    DebugSessionControl,
    Unknown,
}

impl Service {
    /// Every known service, in wire order of the greeting.
    pub const ALL: [Self; 12] = [
        Self::Locator,
        Self::RunControl,
        Self::Processes,
        Self::Memory,
        Self::Settings,
        Self::Breakpoints,
        Self::Registers,
        Self::Logging,
        Self::FileSystem,
        Self::Install,
        Self::OsData,
        Self::DebugSessionControl,
    ];

    /// Name used on the wire.
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Locator => "Locator",
            Self::RunControl => "RunControl",
            Self::Processes => "Processes",
            Self::Memory => "Memory",
            Self::Settings => "Settings",
            Self::Breakpoints => "Breakpoints",
            Self::Registers => "Registers",
            Self::Logging => "Logging",
            Self::FileSystem => "FileSystem",
            Self::Install => "SymbianInstall",
            Self::OsData => "SymbianOSData",
            Self::DebugSessionControl => "DebugSessionControl",
            Self::Unknown => "Unknown",
        }
    }

    /// Map a wire name back; names outside the known set yield `Unknown`.
    pub fn from_wire(name: &[u8]) -> Self {
        Self::ALL
            .into_iter()
            .find(|s| s.wire_name().as_bytes() == name)
            .unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Kind of a command reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplyKind {
    /// Empty error slot.
    Success,
    /// Structurally successful reply carrying an error hash.
    CommandError,
    /// Intermediate reply; more follow.
    Progress,
    /// No usable reply: unparseable, or the request never went out.
    Fail,
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::CommandError => "Command error",
            Self::Progress => "Progress",
            Self::Fail => "Fail",
        };
        f.write_str(s)
    }
}

/// Error descriptor embedded in a reply's trailing hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandError {
    /// Agent timestamp.
    pub time: u64,
    /// CODA error code.
    pub code: i64,
    /// Message text.
    pub format: String,
    /// Platform error code, when reported.
    pub alternative_code: Option<i64>,
    /// Owner of `alternative_code`.
    pub alternative_organization: Option<String>,
}

impl CommandError {
    const KEYS: [&'static str; 3] = ["Time", "Code", "Format"];

    /// Recognise an error hash: an object with at least two of
    /// `Time`/`Code`/`Format`.
    pub fn parse(value: &JsonValue) -> Option<Self> {
        if value.kind() != JsonKind::Object || value.child_count() < 2 {
            return None;
        }
        let matching = Self::KEYS.iter().filter(|k| value.find_child(k).is_some()).count();
        if matching < 2 {
            return None;
        }
        Some(Self {
            time: value.find_child("Time").and_then(JsonValue::as_u64).unwrap_or(0),
            code: value.find_child("Code").and_then(JsonValue::as_i64).unwrap_or(0),
            format: value.find_child("Format").map(JsonValue::as_string).unwrap_or_default(),
            alternative_code: value.find_child("AltCode").and_then(JsonValue::as_i64),
            alternative_organization: value.find_child("AltOrg").map(JsonValue::as_string),
        })
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error code {}: {}", self.code, self.format)?;
        if let Some(alt) = self.alternative_code {
            write!(f, " (alternative code {alt}")?;
            if let Some(org) = &self.alternative_organization {
                write!(f, ", {org}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Outcome of a command, handed to its callback.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// How the command ended.
    pub kind: ReplyKind,
    /// Service the command addressed.
    pub service: Service,
    /// The request message as it was sent.
    pub request: Vec<u8>,
    /// Only meaningful for [`ReplyKind::CommandError`].
    pub error: CommandError,
    /// Reply values following the error slot.
    pub values: Vec<JsonValue>,
    /// Value given when the command was sent.
    pub cookie: Cookie,
}

impl CommandResult {
    /// Local completion used for queue synchronisation markers.
    pub(crate) fn noop(cookie: Cookie) -> Self {
        Self {
            kind: ReplyKind::Success,
            service: Service::Unknown,
            request: Vec::new(),
            error: CommandError::default(),
            values: Vec::new(),
            cookie,
        }
    }

    /// Completion of a request that failed locally or whose reply was unusable.
    pub(crate) fn failed(service: Service, request: Vec<u8>, cookie: Cookie) -> Self {
        Self {
            kind: ReplyKind::Fail,
            service,
            request,
            error: CommandError::default(),
            values: Vec::new(),
            cookie,
        }
    }

    /// Success or progress.
    pub const fn is_success(&self) -> bool {
        matches!(self.kind, ReplyKind::Success | ReplyKind::Progress)
    }

    /// Human-readable failure text, empty on success.
    pub fn error_message(&self) -> String {
        match self.kind {
            ReplyKind::Success | ReplyKind::Progress => String::new(),
            ReplyKind::CommandError => self.error.to_string(),
            ReplyKind::Fail => format!(
                "{} command failed: {}",
                self.service,
                String::from_utf8_lossy(&self.request).replace('\0', " ")
            ),
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.service)?;
        if self.kind == ReplyKind::CommandError {
            write!(f, ": {}", self.error)?;
        }
        for value in &self.values {
            write!(f, " {value}")?;
        }
        Ok(())
    }
}

/// Why an inbound message could not be classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("message is missing its {0} field")]
    MissingField(&'static str),
}

/// An inbound message classified by its leading type character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    /// `E`: an event.
    Event {
        /// Service name.
        service: String,
        /// Event name.
        name: String,
        /// Raw value fields, not yet parsed.
        fields: Vec<Vec<u8>>,
    },
    /// `R` or `P`: a reply to one of our requests.
    Reply {
        /// Final or progress.
        kind: ReplyKind,
        /// Token of the request.
        token: String,
        /// Error slot followed by the values.
        fields: Vec<Vec<u8>>,
    },
    /// A request from the peer; the engine does not serve any.
    Request {
        /// Peer token.
        token: String,
        /// Service name.
        service: String,
        /// Command name.
        command: String,
    },
    /// `0x03 0x02` sentinel: the peer failed to parse something we sent.
    SevereError(String),
}

impl IncomingMessage {
    /// Split one unframed message into its fields.
    pub fn parse(message: &[u8]) -> Result<Self, MessageError> {
        if let Some(rest) = message.strip_prefix(&[0x03, 0x02]) {
            return Ok(Self::SevereError(String::from_utf8_lossy(rest).into_owned()));
        }
        let type_char = *message.first().ok_or(MessageError::Empty)?;
        let mut parts = message.split(|&b| b == 0).skip(1);
        let mut field = |name: &'static str| {
            parts
                .next()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .ok_or(MessageError::MissingField(name))
        };

        let reply_kind = match type_char {
            b'E' => {
                let service = field("service")?;
                let name = field("event name")?;
                return Ok(Self::Event { service, name, fields: value_fields(message, 3) });
            }
            b'C' => {
                let token = field("token")?;
                let service = field("service")?;
                let command = field("command")?;
                return Ok(Self::Request { token, service, command });
            }
            b'R' => ReplyKind::Success,
            b'N' => ReplyKind::Fail,
            b'P' => ReplyKind::Progress,
            other => return Err(MessageError::UnknownType(other)),
        };
        let token = field("token")?;
        Ok(Self::Reply { kind: reply_kind, token, fields: value_fields(message, 2) })
    }
}

/// Non-empty `\0`-separated fields after the first `skip` ones.
fn value_fields(message: &[u8], skip: usize) -> Vec<Vec<u8>> {
    message
        .split(|&b| b == 0)
        .skip(skip)
        .filter(|f| !f.is_empty())
        .map(<[u8]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names() {
        assert_eq!(Service::from_wire(b"RunControl"), Service::RunControl);
        assert_eq!(Service::from_wire(b"SymbianInstall"), Service::Install);
        assert_eq!(Service::from_wire(b"SymbianOSData"), Service::OsData);
        assert_eq!(Service::from_wire(b"Diagnostics"), Service::Unknown);
        for s in Service::ALL {
            assert_eq!(Service::from_wire(s.wire_name().as_bytes()), s);
        }
    }

    #[test]
    fn test_classify_event() {
        let msg = IncomingMessage::parse(b"E\0Logging\0write\0\"p1\"\0\"hello\"\0").unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Event {
                service: "Logging".into(),
                name: "write".into(),
                fields: vec![b"\"p1\"".to_vec(), b"\"hello\"".to_vec()],
            }
        );
    }

    #[test]
    fn test_classify_replies() {
        for (raw, kind) in [
            (&b"R\x007\0\"ok\"\0"[..], ReplyKind::Success),
            (b"N\x007\0", ReplyKind::Fail),
            (b"P\x007\0{}\0", ReplyKind::Progress),
        ] {
            match IncomingMessage::parse(raw).unwrap() {
                IncomingMessage::Reply { kind: k, token, .. } => {
                    assert_eq!(k, kind);
                    assert_eq!(token, "7");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_classify_request_and_severe() {
        assert!(matches!(
            IncomingMessage::parse(b"C\x001\0Locator\0sync\0").unwrap(),
            IncomingMessage::Request { .. }
        ));
        assert_eq!(
            IncomingMessage::parse(b"\x03\x02{\"Format\":\"bad\"}").unwrap(),
            IncomingMessage::SevereError("{\"Format\":\"bad\"}".into())
        );
        assert_eq!(IncomingMessage::parse(b"").unwrap_err(), MessageError::Empty);
        assert_eq!(IncomingMessage::parse(b"X\0").unwrap_err(), MessageError::UnknownType(b'X'));
        assert_eq!(
            IncomingMessage::parse(b"R").unwrap_err(),
            MessageError::MissingField("token")
        );
    }

    #[test]
    fn test_error_hash_detection() {
        let two_keys = JsonValue::parse(br#"{"Time":12,"Code":5}"#);
        let err = CommandError::parse(&two_keys).unwrap();
        assert_eq!(err.code, 5);
        assert_eq!(err.time, 12);

        let one_key = JsonValue::parse(br#"{"Code":5,"Other":1}"#);
        assert!(CommandError::parse(&one_key).is_none());

        let alt = JsonValue::parse(br#"{"Code":1,"Format":"oops","AltCode":-4,"AltOrg":"POSIX"}"#);
        let err = CommandError::parse(&alt).unwrap();
        assert_eq!(err.alternative_code, Some(-4));
        assert_eq!(err.to_string(), "Error code 1: oops (alternative code -4, POSIX)");

        assert!(CommandError::parse(&JsonValue::string("Time")).is_none());
    }

    #[test]
    fn test_result_success_predicate() {
        let mut result = CommandResult::noop(3);
        assert!(result.is_success());
        result.kind = ReplyKind::Progress;
        assert!(result.is_success());
        result.kind = ReplyKind::CommandError;
        assert!(!result.is_success());
        result.kind = ReplyKind::Fail;
        assert!(!result.is_success());
    }
}
