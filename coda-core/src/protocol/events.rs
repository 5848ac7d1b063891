//! Typed events published by the engine.

use crate::json::{JsonKind, JsonValue};

/// A RunControl context (process or thread).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunControlContext {
    /// Context id, e.g. `p12.t34`.
    pub id: String,
    /// Owning process of a thread.
    pub parent_id: Option<String>,
    /// Native id on the device.
    pub os_id: Option<String>,
    /// Display name.
    pub name: Option<String>,
}

impl RunControlContext {
    /// From an object carrying at least an `ID`.
    pub fn from_value(value: &JsonValue) -> Option<Self> {
        if value.kind() != JsonKind::Object {
            return None;
        }
        let text = |key: &str| value.find_child(key).map(JsonValue::as_string);
        Some(Self {
            id: text("ID")?,
            parent_id: text("ParentID"),
            os_id: text("OSID"),
            name: text("Name"),
        })
    }

    /// Whether the id names a thread.
    pub fn is_thread(&self) -> bool {
        Self::thread_id_from_tcf_id(&self.id).is_some()
    }

    /// Context id of a process or one of its threads, e.g. `p12.t34`.
    pub fn tcf_id(process_id: u64, thread_id: Option<u64>) -> String {
        match thread_id {
            Some(tid) => format!("p{process_id}.t{tid}"),
            None => format!("p{process_id}"),
        }
    }

    /// Process number of a `p<n>` or `p<n>.t<m>` id.
    pub fn process_id_from_tcf_id(id: &str) -> Option<u64> {
        let process = id.strip_prefix('p')?;
        let end = process.find('.').unwrap_or(process.len());
        process[..end].parse().ok()
    }

    /// Thread number of a `p<n>.t<m>` id.
    pub fn thread_id_from_tcf_id(id: &str) -> Option<u64> {
        id.split_once(".t")?.1.parse().ok()
    }
}

/// Load metadata of a module-load suspension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleLoadEventInfo {
    /// Module name.
    pub name: String,
    /// Path on the device.
    pub file: String,
    /// False for an unload.
    pub loaded: bool,
    /// Load address of the code segment.
    pub code_address: u64,
    /// Load address of the data segment.
    pub data_address: u64,
    /// The agent waits for a resume before continuing.
    pub require_resume: bool,
}

impl ModuleLoadEventInfo {
    /// Missing keys read as empty or zero.
    pub fn from_value(value: &JsonValue) -> Self {
        let text = |key: &str| value.find_child(key).map(JsonValue::as_string).unwrap_or_default();
        let number = |key: &str| value.find_child(key).and_then(JsonValue::as_u64).unwrap_or(0);
        let flag = |key: &str| value.find_child(key).and_then(JsonValue::as_bool).unwrap_or(false);
        Self {
            name: text("Name"),
            file: text("File"),
            loaded: flag("Loaded"),
            code_address: number("CodeAddress"),
            data_address: number("DataAddress"),
            require_resume: flag("RequireResume"),
        }
    }
}

/// Why a context stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// Hit a planted breakpoint.
    Breakpoint,
    /// A library was loaded or unloaded.
    ModuleLoad(ModuleLoadEventInfo),
    /// Panic or exception.
    Crash,
    /// Any other reason, as sent.
    Other(String),
}

/// Events broadcast to subscribers of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodaEvent {
    /// The peer is ready to accept commands.
    LocatorHello {
        /// Services the peer offers.
        services: Vec<String>,
    },
    /// RunControl `contextAdded`.
    ContextAdded(Vec<RunControlContext>),
    /// RunControl `contextRemoved`, by id.
    ContextRemoved(Vec<String>),
    /// A process or thread stopped.
    ContextSuspended {
        /// Stopped context.
        id: String,
        /// Program counter.
        pc: u64,
        /// Why it stopped.
        reason: SuspendReason,
        /// Agent description, e.g. the panic text.
        message: String,
    },
    /// Console output of a listened-to context.
    LoggingWrite {
        /// Writing context.
        id: String,
        /// Output text.
        message: String,
    },
    /// Processes `exited`.
    ProcessExited {
        /// Exited process.
        id: String,
        /// Exit reason code.
        exit_code: i64,
    },
    /// Any event without a typed decoding.
    Generic {
        /// Service name.
        service: String,
        /// Event name.
        name: String,
        /// Event values.
        values: Vec<JsonValue>,
    },
    /// Serial link pong with the agent version.
    SerialPong(String),
    /// Serial frame of a protocol other than CODA or ping.
    UnknownFrame {
        /// Header protocol id.
        protocol_id: u8,
        /// Raw payload.
        payload: Vec<u8>,
    },
    /// Connection-level error.
    Error(String),
}

impl CodaEvent {
    /// Decode an `E` message. Heartbeats yield `None`.
    pub fn from_message(service: &str, name: &str, values: Vec<JsonValue>) -> Option<Self> {
        if name == "heartbeat" {
            return None;
        }
        let string_at = |i: usize| values.get(i).map(JsonValue::as_string).unwrap_or_default();

        let event = match (service, name) {
            ("Locator", "Hello") => Self::LocatorHello {
                services: values.first().map(JsonValue::as_string_list).unwrap_or_default(),
            },
            ("RunControl", "contextAdded") => Self::ContextAdded(
                values
                    .first()
                    .map(|list| list.children().iter().filter_map(RunControlContext::from_value).collect())
                    .unwrap_or_default(),
            ),
            ("RunControl", "contextRemoved") => Self::ContextRemoved(
                values.first().map(JsonValue::as_string_list).unwrap_or_default(),
            ),
            ("RunControl", "contextSuspended") => {
                let details = values.get(3);
                let reason = match string_at(2).as_str() {
                    "Breakpoint" => SuspendReason::Breakpoint,
                    "Shared Library" => SuspendReason::ModuleLoad(
                        details.map(ModuleLoadEventInfo::from_value).unwrap_or_default(),
                    ),
                    "Crash" | "Exception" => SuspendReason::Crash,
                    other => SuspendReason::Other(other.to_string()),
                };
                let message = details
                    .and_then(|d| d.find_child("message").or_else(|| d.find_child("Message")))
                    .map(JsonValue::as_string)
                    .unwrap_or_default();
                Self::ContextSuspended {
                    id: string_at(0),
                    pc: values.get(1).and_then(JsonValue::as_u64).unwrap_or(0),
                    reason,
                    message,
                }
            }
            ("Logging", "write") => Self::LoggingWrite { id: string_at(0), message: string_at(1) },
            ("Processes", "exited") => Self::ProcessExited {
                id: string_at(0),
                exit_code: values.get(1).and_then(JsonValue::as_i64).unwrap_or(0),
            },
            _ => Self::Generic { service: service.to_string(), name: name.to_string(), values },
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(raw: &[&[u8]]) -> Vec<JsonValue> {
        raw.iter().map(|r| JsonValue::parse(r)).collect()
    }

    #[test]
    fn test_tcf_ids() {
        assert_eq!(RunControlContext::tcf_id(12, Some(34)), "p12.t34");
        assert_eq!(RunControlContext::tcf_id(12, None), "p12");
        assert_eq!(RunControlContext::process_id_from_tcf_id("p12.t34"), Some(12));
        assert_eq!(RunControlContext::process_id_from_tcf_id("p7"), Some(7));
        assert_eq!(RunControlContext::thread_id_from_tcf_id("p12.t34"), Some(34));
        assert_eq!(RunControlContext::thread_id_from_tcf_id("p12"), None);
        assert_eq!(RunControlContext::process_id_from_tcf_id("x1"), None);
    }

    #[test]
    fn test_heartbeat_discarded() {
        assert!(CodaEvent::from_message("Locator", "heartbeat", Vec::new()).is_none());
    }

    #[test]
    fn test_hello() {
        let ev = CodaEvent::from_message("Locator", "Hello", values(&[br#"["RunControl","FileSystem"]"#]));
        assert_eq!(
            ev,
            Some(CodaEvent::LocatorHello { services: vec!["RunControl".into(), "FileSystem".into()] })
        );
    }

    #[test]
    fn test_suspend_reasons() {
        let ev = CodaEvent::from_message(
            "RunControl",
            "contextSuspended",
            values(&[b"\"p1.t2\"", b"32768", b"\"Breakpoint\"", b"{}"]),
        );
        assert_eq!(
            ev,
            Some(CodaEvent::ContextSuspended {
                id: "p1.t2".into(),
                pc: 0x8000,
                reason: SuspendReason::Breakpoint,
                message: String::new(),
            })
        );

        let ev = CodaEvent::from_message(
            "RunControl",
            "contextSuspended",
            values(&[
                b"\"p1.t2\"",
                b"0",
                b"\"Shared Library\"",
                br#"{"Name":"lib.dll","File":"z:\\sys\\bin\\lib.dll","Loaded":true,"CodeAddress":4096,"DataAddress":8192,"RequireResume":true}"#,
            ]),
        );
        let Some(CodaEvent::ContextSuspended { reason: SuspendReason::ModuleLoad(info), .. }) = ev else {
            panic!("expected module load, got {ev:?}");
        };
        assert_eq!(info.name, "lib.dll");
        assert_eq!(info.code_address, 4096);
        assert!(info.loaded && info.require_resume);

        let ev = CodaEvent::from_message(
            "RunControl",
            "contextSuspended",
            values(&[b"\"p1\"", b"0", b"\"Exception\"", br#"{"message":"KERN-EXEC 3"}"#]),
        );
        let Some(CodaEvent::ContextSuspended { reason, message, .. }) = ev else { panic!() };
        assert_eq!(reason, SuspendReason::Crash);
        assert_eq!(message, "KERN-EXEC 3");

        let ev = CodaEvent::from_message("RunControl", "contextSuspended", values(&[b"\"p1\"", b"0", b"\"Step\""]));
        let Some(CodaEvent::ContextSuspended { reason, .. }) = ev else { panic!() };
        assert_eq!(reason, SuspendReason::Other("Step".into()));
    }

    #[test]
    fn test_context_added_and_removed() {
        let ev = CodaEvent::from_message(
            "RunControl",
            "contextAdded",
            values(&[br#"[{"ID":"p1.t2","ParentID":"p1","OSID":"2"}]"#]),
        );
        let Some(CodaEvent::ContextAdded(contexts)) = ev else { panic!() };
        assert_eq!(contexts.len(), 1);
        assert!(contexts[0].is_thread());
        assert_eq!(contexts[0].parent_id.as_deref(), Some("p1"));

        let ev = CodaEvent::from_message("RunControl", "contextRemoved", values(&[br#"["p1.t2"]"#]));
        assert_eq!(ev, Some(CodaEvent::ContextRemoved(vec!["p1.t2".into()])));
    }

    #[test]
    fn test_logging_exit_and_generic() {
        assert_eq!(
            CodaEvent::from_message("Logging", "write", values(&[b"\"p1\"", b"\"hi\\n\""])),
            Some(CodaEvent::LoggingWrite { id: "p1".into(), message: "hi\n".into() })
        );
        assert_eq!(
            CodaEvent::from_message("Processes", "exited", values(&[b"\"p1\"", b"-3"])),
            Some(CodaEvent::ProcessExited { id: "p1".into(), exit_code: -3 })
        );
        let ev = CodaEvent::from_message("Diagnostics", "custom", values(&[b"1"]));
        assert!(matches!(ev, Some(CodaEvent::Generic { ref service, .. }) if service == "Diagnostics"));
    }
}
