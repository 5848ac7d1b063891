//! Typed command builders and reply parsers.
//!
//! Every builder formats its parameters and hands them to the generic send
//! primitives of [`CodaDevice`]. A few commands are sent without a reply
//! because the peer never acknowledges them.

use super::CodaDevice;
use crate::json::{JsonKind, JsonValue, ParamWriter};
use crate::protocol::{
    Breakpoint, CommandResult, Cookie, FileStat, FileSystemOpenFlags, ProcessStart,
    RunControlContext, RunControlResumeMode, Service,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Listener id of the program output console.
pub const CONSOLE_LOGGER: &str = "ProgramOutputConsoleLogger";

impl CodaDevice {
    // Locator

    /// Round-trip marker: the reply arrives after everything sent before it.
    pub fn send_locator_sync<F>(&mut self, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.send_command(Service::Locator, "sync", Vec::new(), callback, cookie)
    }

    // Processes

    /// Start a process. When debugging with additional libraries, those are
    /// announced first through a Settings `set`.
    pub fn send_process_start_command<F>(&mut self, start: &ProcessStart, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        if start.debug_control && !start.additional_libraries.is_empty() {
            let libraries = JsonValue::string_array(start.additional_libraries.iter().map(String::as_str));
            self.send_settings_set_command(&JsonValue::object(vec![("AddLibraries", libraries)]));
        }
        let params = ParamWriter::new()
            .string(start.working_directory())
            .string(start.binary.as_str())
            .string_list(start.arguments.iter().map(String::as_str))
            .value(&JsonValue::array(Vec::new()))
            .boolean(start.debug_control)
            .finish();
        self.send_command(Service::Processes, "start", params, callback, cookie)
    }

    /// Start a process without debug control.
    pub fn send_run_process_command<F>(
        &mut self,
        binary: &str,
        uid: u32,
        arguments: &[String],
        working_directory: Option<&str>,
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let start = ProcessStart {
            arguments: arguments.to_vec(),
            working_directory: working_directory.map(str::to_string),
            ..ProcessStart::new(binary, uid)
        };
        self.send_process_start_command(&start, callback, cookie)
    }

    /// Kill the process with context `id`.
    pub fn send_process_terminate_command<F>(&mut self, id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(id).finish();
        self.send_command(Service::Processes, "terminate", params, callback, cookie)
    }

    // RunControl

    /// Suspend a process or thread.
    pub fn send_run_control_suspend_command<F>(&mut self, id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(id).finish();
        self.send_command(Service::RunControl, "suspend", params, callback, cookie)
    }

    /// Resume a context. The address range is only sent for range modes.
    #[allow(clippy::too_many_arguments)]
    pub fn send_run_control_resume_command<F>(
        &mut self,
        id: &str,
        mode: RunControlResumeMode,
        count: u32,
        range_start: u64,
        range_end: u64,
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let mut params = ParamWriter::new().string(id).number(mode.code()).number(count);
        if mode.is_range() {
            params = params.value(&JsonValue::object(vec![
                ("RANGE_START", JsonValue::number(range_start)),
                ("RANGE_END", JsonValue::number(range_end)),
            ]));
        }
        self.send_command(Service::RunControl, "resume", params.finish(), callback, cookie)
    }

    /// Plain resume of `id`, one step.
    pub fn send_run_control_resume<F>(&mut self, id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.send_run_control_resume_command(id, RunControlResumeMode::Resume, 1, 0, 0, callback, cookie)
    }

    /// Terminate through RunControl rather than Processes.
    pub fn send_run_control_terminate_command<F>(&mut self, id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(id).finish();
        self.send_command(Service::RunControl, "terminate", params, callback, cookie)
    }

    // Breakpoints

    /// Plant `breakpoint`; its id is derived from the location when unset.
    pub fn send_breakpoints_add_command<F>(&mut self, breakpoint: &Breakpoint, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().value(&breakpoint.to_value()).finish();
        self.send_command(Service::Breakpoints, "add", params, callback, cookie)
    }

    /// Remove breakpoints by id.
    pub fn send_breakpoints_remove_command<F>(&mut self, ids: &[String], callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string_list(ids.iter().map(String::as_str)).finish();
        self.send_command(Service::Breakpoints, "remove", params, callback, cookie)
    }

    /// Enable or disable breakpoints by id.
    pub fn send_breakpoints_enable_command<F>(
        &mut self,
        ids: &[String],
        enable: bool,
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let command = if enable { "enable" } else { "disable" };
        let params = ParamWriter::new().string_list(ids.iter().map(String::as_str)).finish();
        self.send_command(Service::Breakpoints, command, params, callback, cookie)
    }

    // Memory

    /// Read `size` bytes at `address`; see [`Self::parse_memory_get`].
    pub fn send_memory_get_command<F>(
        &mut self,
        context_id: &str,
        address: u64,
        size: u64,
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new()
            .string(context_id)
            .number(address)
            .number(1)
            .number(size)
            .number(0)
            .finish();
        self.send_command(Service::Memory, "get", params, callback, cookie)
    }

    /// Write `data` at `address`, sent base64-encoded.
    pub fn send_memory_set_command<F>(
        &mut self,
        context_id: &str,
        address: u64,
        data: &[u8],
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new()
            .string(context_id)
            .number(address)
            .number(1)
            .number(data.len())
            .number(0)
            .string(BASE64.encode(data))
            .finish();
        self.send_command(Service::Memory, "set", params, callback, cookie)
    }

    // Registers

    /// List the register ids of a context.
    pub fn send_registers_get_children_command<F>(&mut self, context_id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(context_id).finish();
        self.send_command(Service::Registers, "getChildren", params, callback, cookie)
    }

    /// Read one register.
    pub fn send_registers_get_command<F>(&mut self, register_id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(register_id).finish();
        self.send_command(Service::Registers, "get", params, callback, cookie)
    }

    /// Read several 32-bit registers in one request.
    pub fn send_registers_getm_command<F>(&mut self, register_ids: &[String], callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let locations = register_ids
            .iter()
            .map(|id| JsonValue::array(vec![JsonValue::string(id.as_str()), JsonValue::number(0), JsonValue::number(4)]))
            .collect();
        let params = ParamWriter::new().value(&JsonValue::array(locations)).finish();
        self.send_command(Service::Registers, "getm", params, callback, cookie)
    }

    /// Write one register; `value` is sent base64-encoded.
    pub fn send_registers_set_command<F>(&mut self, register_id: &str, value: &[u8], callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(register_id).string(BASE64.encode(value)).finish();
        self.send_command(Service::Registers, "set", params, callback, cookie)
    }

    // FileSystem

    /// Open a file on the device; the reply carries its handle.
    pub fn send_file_system_open_command<F>(
        &mut self,
        name: &str,
        flags: FileSystemOpenFlags,
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new()
            .string(name)
            .number(flags.bits())
            .value(&JsonValue::object(Vec::<(&str, JsonValue)>::new()))
            .finish();
        self.send_command(Service::FileSystem, "open", params, callback, cookie)
    }

    /// Attributes of an open file, see [`Self::parse_file_system_fstat`].
    pub fn send_file_system_fstat_command<F>(&mut self, handle: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(handle).finish();
        self.send_command(Service::FileSystem, "fstat", params, callback, cookie)
    }

    /// Write `data` at `offset` of an open file.
    pub fn send_file_system_write_command<F>(
        &mut self,
        handle: &str,
        offset: u64,
        data: &[u8],
        callback: F,
        cookie: Cookie,
    ) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(handle).number(offset).string(BASE64.encode(data)).finish();
        self.send_command(Service::FileSystem, "write", params, callback, cookie)
    }

    /// Close a handle returned by `open`.
    pub fn send_file_system_close_command<F>(&mut self, handle: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(handle).finish();
        self.send_command(Service::FileSystem, "close", params, callback, cookie)
    }

    // Install

    /// Interactive install of a package already on the device.
    pub fn send_install_command<F>(&mut self, file: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(file).finish();
        self.send_command(Service::Install, "install", params, callback, cookie)
    }

    /// Silent install onto `drive`.
    pub fn send_install_with_options_command<F>(&mut self, file: &str, drive: char, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(file).string(drive.to_string()).finish();
        self.send_command(Service::Install, "installWithOptions", params, callback, cookie)
    }

    /// Remove the package with `uid`.
    pub fn send_uninstall_command<F>(&mut self, uid: u32, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().number(uid).finish();
        self.send_command(Service::Install, "uninstall", params, callback, cookie)
    }

    // Logging

    /// Subscribe to Logging `write` events of `listener_id`.
    pub fn send_logging_add_listener_command<F>(&mut self, listener_id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(listener_id).finish();
        self.send_command(Service::Logging, "addListener", params, callback, cookie)
    }

    /// Stop Logging `write` events of `listener_id`.
    pub fn send_logging_remove_listener_command<F>(&mut self, listener_id: &str, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string(listener_id).finish();
        self.send_command(Service::Logging, "removeListener", params, callback, cookie)
    }

    // Settings (never acknowledged by the peer)

    /// Turn on agent-side logging.
    pub fn send_settings_enable_log_command(&mut self) {
        let settings = JsonValue::object(vec![("Logging", JsonValue::boolean(true))]);
        self.send_settings_set_command(&settings);
    }

    /// Apply an agent settings object.
    pub fn send_settings_set_command(&mut self, settings: &JsonValue) {
        let params = ParamWriter::new().value(settings).finish();
        self.send_command_without_reply(Service::Settings, "set", params);
    }

    // DebugSessionControl

    /// Open a debug session on the agent.
    pub fn send_debug_session_start_command<F>(&mut self, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.send_command(Service::DebugSessionControl, "sessionStart", Vec::new(), callback, cookie)
    }

    /// Close the debug session.
    pub fn send_debug_session_end_command<F>(&mut self, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.send_command(Service::DebugSessionControl, "sessionEnd", Vec::new(), callback, cookie)
    }

    // OSData

    /// List running processes.
    pub fn send_os_data_get_processes_command<F>(&mut self, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.send_command(Service::OsData, "getProcesses", Vec::new(), callback, cookie)
    }

    /// List the threads of `process_id`.
    pub fn send_os_data_get_threads_command<F>(&mut self, process_id: u64, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().number(process_id).finish();
        self.send_command(Service::OsData, "getThreads", params, callback, cookie)
    }

    /// Qt version installed on the device.
    pub fn send_os_data_get_qt_version_command<F>(&mut self, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.send_command(Service::OsData, "getQtVersion", Vec::new(), callback, cookie)
    }

    /// ROM build information.
    pub fn send_os_data_get_rom_info_command<F>(&mut self, callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        self.send_command(Service::OsData, "getRomInfo", Vec::new(), callback, cookie)
    }

    /// HAL attributes named by `keys`.
    pub fn send_os_data_get_hal_info_command<F>(&mut self, keys: &[String], callback: F, cookie: Cookie) -> u32
    where
        F: FnOnce(&mut Self, &CommandResult) + Send + 'static,
    {
        let params = ParamWriter::new().string_list(keys.iter().map(String::as_str)).finish();
        self.send_command(Service::OsData, "getHalInfo", params, callback, cookie)
    }

    // Reply parsers

    /// Bytes read by a Memory `get`.
    pub fn parse_memory_get(result: &CommandResult) -> Option<Vec<u8>> {
        first_of_kind(result, JsonKind::String).and_then(decode_base64)
    }

    /// Register values of a Registers `getm`, as big-endian 32-bit words.
    pub fn parse_registers_getm(result: &CommandResult) -> Option<Vec<u32>> {
        let bytes = first_of_kind(result, JsonKind::String).and_then(decode_base64)?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
                .collect(),
        )
    }

    /// Register ids from a Registers `getChildren` reply.
    pub fn parse_registers_get_children(result: &CommandResult) -> Option<Vec<String>> {
        first_of_kind(result, JsonKind::Array).map(JsonValue::as_string_list)
    }

    /// File handle returned by a FileSystem `open`.
    pub fn parse_file_system_open(result: &CommandResult) -> Option<String> {
        first_of_kind(result, JsonKind::String).map(JsonValue::as_string)
    }

    /// Attributes from a FileSystem `fstat` reply.
    pub fn parse_file_system_fstat(result: &CommandResult) -> Option<FileStat> {
        result.values.iter().find_map(FileStat::from_value)
    }

    /// Context of a process started with a Processes `start`.
    pub fn parse_process_start(result: &CommandResult) -> Option<RunControlContext> {
        result.values.iter().find_map(RunControlContext::from_value)
    }
}

fn first_of_kind(result: &CommandResult, kind: JsonKind) -> Option<&JsonValue> {
    result.values.iter().find(|v| v.kind() == kind)
}

fn decode_base64(value: &JsonValue) -> Option<Vec<u8>> {
    match BASE64.decode(value.data()) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::warn!("Invalid base64 payload: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Framing;
    use crate::protocol::{CommandError, ReplyKind};
    use crate::stream::{MemoryStream, MemoryStreamHandle};
    use std::sync::{Arc, Mutex};

    fn device() -> (CodaDevice, MemoryStreamHandle) {
        let (stream, handle) = MemoryStream::new();
        (CodaDevice::with_stream(Framing::Tcp, Box::new(stream)), handle)
    }

    /// Written messages with the TCP terminators stripped.
    fn sent(handle: &MemoryStreamHandle) -> Vec<Vec<u8>> {
        let written = handle.take_written();
        written
            .split(|&b| b == 0x01)
            .filter(|m| !m.is_empty())
            .map(|m| m.strip_suffix(&[0x03]).unwrap_or(m).to_vec())
            .collect()
    }

    fn result_with(values: &[&[u8]]) -> CommandResult {
        CommandResult {
            kind: ReplyKind::Success,
            service: Service::Unknown,
            request: Vec::new(),
            error: CommandError::default(),
            values: values.iter().map(|v| JsonValue::parse(v)).collect(),
            cookie: 0,
        }
    }

    #[test]
    fn test_resume_wire_format() {
        let (mut device, handle) = device();
        device.send_run_control_resume_command("p1.t1", RunControlResumeMode::Resume, 1, 0, 0, |_, _| {}, 0);
        assert_eq!(sent(&handle), vec![b"C\x000\0RunControl\0resume\0\"p1.t1\"\x000\x001\0".to_vec()]);
    }

    #[test]
    fn test_resume_range_hash() {
        let (mut device, handle) = device();
        device.send_run_control_resume_command("p1.t1", RunControlResumeMode::StepOverRange, 1, 16, 32, |_, _| {}, 0);
        assert_eq!(
            sent(&handle),
            vec![b"C\x000\0RunControl\0resume\0\"p1.t1\"\x0012\x001\0{\"RANGE_START\":16,\"RANGE_END\":32}\0".to_vec()]
        );
    }

    #[test]
    fn test_process_start_with_libraries() {
        let (mut device, handle) = device();
        let start = ProcessStart {
            arguments: vec!["-v".into()],
            debug_control: true,
            additional_libraries: vec!["lib.dll".into()],
            ..ProcessStart::new("C:\\sys\\bin\\app.exe", 0xE000_0001)
        };
        device.send_process_start_command(&start, |_, _| {}, 0);
        let messages = sent(&handle);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], b"C\0-1\0Settings\0set\0{\"AddLibraries\":[\"lib.dll\"]}\0".to_vec());
        assert_eq!(
            messages[1],
            b"C\x000\0Processes\0start\0\"C:\\\\private\\\\e0000001\"\0\"C:\\\\sys\\\\bin\\\\app.exe\"\0[\"-v\"]\0[]\0true\0".to_vec()
        );
    }

    #[test]
    fn test_settings_are_fire_and_forget() {
        let (mut device, handle) = device();
        device.send_settings_enable_log_command();
        assert_eq!(device.awaiting_count(), 0);
        assert_eq!(sent(&handle), vec![b"C\0-1\0Settings\0set\0{\"Logging\":true}\0".to_vec()]);
    }

    #[test]
    fn test_file_system_commands() {
        let (mut device, handle) = device();
        let flags = FileSystemOpenFlags::WRITE | FileSystemOpenFlags::CREAT | FileSystemOpenFlags::TRUNC;
        device.send_file_system_open_command("C:\\data\\a.txt", flags, |_, _| {}, 0);
        assert_eq!(
            sent(&handle),
            vec![b"C\x000\0FileSystem\0open\0\"C:\\\\data\\\\a.txt\"\x0026\0{}\0".to_vec()]
        );
        device.process_incoming(b"R\x000\0\"h1\"\0\x03\x01");
        device.send_file_system_write_command("h1", 0, b"hello", |_, _| {}, 0);
        assert_eq!(sent(&handle), vec![b"C\x001\0FileSystem\0write\0\"h1\"\x000\0\"aGVsbG8=\"\0".to_vec()]);
    }

    #[test]
    fn test_largest_put_chunk_fits_serial_frame() {
        let (stream, handle) = MemoryStream::new();
        let mut device = CodaDevice::with_stream(Framing::Serial, Box::new(stream));
        let chunk = vec![0x5a; crate::config::MAX_PUT_CHUNK_SIZE];
        device.send_file_system_write_command("h1", u64::from(u32::MAX), &chunk, |_, _| {}, 0);
        assert!(!handle.written().is_empty(), "{}", device.error_string());
        assert_eq!(device.awaiting_count(), 1);

        let mut framer = crate::frame::SerialFramer::new();
        let frames = crate::frame::FrameDecoder::push(&mut framer, &handle.take_written());
        let [crate::frame::DecodedFrame::Message(message)] = frames.as_slice() else {
            panic!("expected one reassembled message, got {frames:?}");
        };
        assert!(message.len() <= crate::frame::MAX_SERIAL_MESSAGE_SIZE);
        assert!(message.starts_with(b"C\x000\0FileSystem\0write\0\"h1\"\0"));
    }

    #[test]
    fn test_install_service_name() {
        let (mut device, handle) = device();
        device.send_install_with_options_command("C:\\app.sis", 'E', |_, _| {}, 0);
        assert_eq!(
            sent(&handle),
            vec![b"C\x000\0SymbianInstall\0installWithOptions\0\"C:\\\\app.sis\"\0\"E\"\0".to_vec()]
        );
    }

    #[test]
    fn test_callback_receives_cookie() {
        let (mut device, _handle) = device();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        device.send_locator_sync(move |_, r| *s.lock().unwrap() = Some((r.kind, r.cookie)), 77);
        device.process_incoming(b"R\x000\0\x03\x01");
        assert_eq!(*seen.lock().unwrap(), Some((ReplyKind::Success, 77)));
    }

    #[test]
    fn test_parsers() {
        assert_eq!(CodaDevice::parse_memory_get(&result_with(&[b"\"AQID\""])), Some(vec![1, 2, 3]));
        assert_eq!(
            CodaDevice::parse_registers_getm(&result_with(&[b"null", b"\"AAAAAQAAAAI=\""])),
            Some(vec![1, 2])
        );
        assert_eq!(
            CodaDevice::parse_registers_get_children(&result_with(&[br#"["R0","R1"]"#])),
            Some(vec!["R0".to_string(), "R1".to_string()])
        );
        assert_eq!(CodaDevice::parse_file_system_open(&result_with(&[b"\"h7\""])).as_deref(), Some("h7"));
        assert_eq!(
            CodaDevice::parse_file_system_fstat(&result_with(&[b"null", br#"{"Size":10}"#])).map(|s| s.size),
            Some(10)
        );
        let context = CodaDevice::parse_process_start(&result_with(&[br#"{"ID":"p42","Name":"app.exe"}"#])).unwrap();
        assert_eq!(RunControlContext::process_id_from_tcf_id(&context.id), Some(42));
        assert!(CodaDevice::parse_memory_get(&result_with(&[b"\"!!\""])).is_none());
    }
}
