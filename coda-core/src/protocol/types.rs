//! Parameter types for the typed command builders.

use crate::json::JsonValue;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Stepping mode of a RunControl `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum RunControlResumeMode {
    Resume = 0,
    StepOver = 1,
    StepInto = 2,
    StepOverLine = 3,
    StepIntoLine = 4,
    StepOut = 5,
    ReverseResume = 6,
    ReverseStepOver = 7,
    ReverseStepInto = 8,
    ReverseStepOverLine = 9,
    ReverseStepIntoLine = 10,
    ReverseStepOut = 11,
    StepOverRange = 12,
    StepIntoRange = 13,
    ReverseStepOverRange = 14,
    ReverseStepIntoRange = 15,
    UntilActive = 16,
    ReverseUntilActive = 17,
}

impl RunControlResumeMode {
    /// Numeric mode sent on the wire.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Range modes carry a start/end hash.
    pub const fn is_range(self) -> bool {
        matches!(
            self,
            Self::StepOverRange
                | Self::StepIntoRange
                | Self::ReverseStepOverRange
                | Self::ReverseStepIntoRange
        )
    }
}

/// Kind of breakpoint requested from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BreakpointType {
    /// Patched instruction.
    #[default]
    Software,
    /// Debug unit comparator.
    Hardware,
    /// Agent chooses.
    Auto,
}

impl BreakpointType {
    /// Name used in the breakpoint object.
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Software => "Software",
            Self::Hardware => "Hardware",
            Self::Auto => "Auto",
        }
    }
}

/// A code breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Derived from the location when absent.
    pub id: Option<String>,
    /// Software or hardware.
    pub kind: BreakpointType,
    /// Armed on creation.
    pub enabled: bool,
    /// Hits to skip before stopping.
    pub ignore_count: u32,
    /// Restrict to these contexts; all when empty.
    pub context_ids: Vec<String>,
    /// Code address.
    pub location: u64,
    /// Bytes covered.
    pub size: u32,
    /// Thumb rather than ARM instruction set.
    pub thumb: bool,
    /// Source file, informational.
    pub file: Option<String>,
    /// Source line, informational.
    pub line: Option<u32>,
    /// Expression evaluated by the agent.
    pub condition: Option<String>,
}

impl Breakpoint {
    /// Enabled software breakpoint at `location`.
    pub fn at(location: u64) -> Self {
        Self {
            id: None,
            kind: BreakpointType::Software,
            enabled: true,
            ignore_count: 0,
            context_ids: Vec::new(),
            location,
            size: 1,
            thumb: true,
            file: None,
            line: None,
            condition: None,
        }
    }

    /// Identifier used on the wire.
    pub fn wire_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| Self::id_from_location(self.location))
    }

    /// Default id, `BP_0x<location>`.
    pub fn id_from_location(location: u64) -> String {
        format!("BP_0x{location:x}")
    }

    /// Object sent by Breakpoints `add`.
    pub fn to_value(&self) -> JsonValue {
        let mut members = vec![
            ("ID", JsonValue::string(self.wire_id())),
            ("BreakpointType", JsonValue::string(self.kind.wire_name())),
            ("Enabled", JsonValue::boolean(self.enabled)),
            ("IgnoreCount", JsonValue::number(self.ignore_count)),
        ];
        if !self.context_ids.is_empty() {
            members.push(("ContextIds", JsonValue::string_array(self.context_ids.iter().map(String::as_str))));
        }
        members.push(("Location", JsonValue::string(self.location.to_string())));
        members.push(("Size", JsonValue::number(self.size)));
        members.push(("THUMB_BREAKPOINT", JsonValue::boolean(self.thumb)));
        if let Some(file) = &self.file {
            members.push(("File", JsonValue::string(file.as_str())));
        }
        if let Some(line) = self.line {
            members.push(("Line", JsonValue::number(line)));
        }
        if let Some(condition) = &self.condition {
            members.push(("Condition", JsonValue::string(condition.as_str())));
        }
        JsonValue::object(members)
    }
}

/// Parameters of a Processes `start`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessStart {
    /// Executable path on the device.
    pub binary: String,
    /// Application UID.
    pub uid: u32,
    /// Program arguments.
    pub arguments: Vec<String>,
    /// See [`Self::working_directory`].
    pub working_directory: Option<String>,
    /// Start suspended under debugger control.
    pub debug_control: bool,
    /// Sent ahead of the start as a Settings `set` when debugging.
    pub additional_libraries: Vec<String>,
}

impl ProcessStart {
    /// Start of `binary` with defaults.
    pub fn new(binary: impl Into<String>, uid: u32) -> Self {
        Self { binary: binary.into(), uid, ..Self::default() }
    }

    /// Explicit working directory, or the application's private directory.
    pub fn working_directory(&self) -> String {
        self.working_directory
            .clone()
            .unwrap_or_else(|| format!("C:\\private\\{:08x}", self.uid))
    }
}

bitflags! {
    /// Flags of a FileSystem `open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileSystemOpenFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const APPEND = 0x04;
        const CREAT = 0x08;
        const TRUNC = 0x10;
        const EXCL = 0x20;
    }
}

/// Attributes returned by a FileSystem `fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStat {
    /// Bytes.
    pub size: u64,
    /// Last access, seconds since the epoch.
    pub access_time: u64,
    /// Last change, seconds since the epoch.
    pub modification_time: u64,
}

impl FileStat {
    /// `None` without a `Size`.
    pub fn from_value(value: &JsonValue) -> Option<Self> {
        let size = value.find_child("Size")?.as_u64()?;
        Some(Self {
            size,
            access_time: value.find_child("ATime").and_then(JsonValue::as_u64).unwrap_or(0),
            modification_time: value.find_child("MTime").and_then(JsonValue::as_u64).unwrap_or(0),
        })
    }
}
