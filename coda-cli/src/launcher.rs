//! Launcher state machine.
//!
//! One [`Launcher`] runs one [`Action`]. Command callbacks only forward their
//! results into a channel; follow-up commands are issued from [`Launcher::run`]
//! on the calling thread, so the engine lock is never taken re-entrantly.

use anyhow::{anyhow, bail, Context as _, Result};
use coda_core::device::commands::CONSOLE_LOGGER;
use coda_core::protocol::types::{FileStat, FileSystemOpenFlags, ProcessStart};
use coda_core::protocol::SuspendReason;
use coda_core::{spawn_read_pump, CodaDevice, CodaEvent, CommandResult, Framing, SharedDevice};
use crossbeam_channel::{select, Receiver, Sender};
use std::path::PathBuf;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the launcher should do on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Serial: link-level ping. TCP: wait for the agent's Locator Hello.
    Ping,
    /// Start a program.
    Launch {
        /// Executable path on the device.
        binary: String,
        /// Application UID.
        uid: u32,
        /// Program arguments.
        arguments: Vec<String>,
        /// Start under debug control and run until the process exits.
        debug: bool,
    },
    /// Install a package already on the device.
    Install {
        /// Package path on the device.
        file: String,
        /// Install without user interaction onto `drive`.
        silent: bool,
        /// Target drive letter.
        drive: char,
    },
    /// Remove an installed package.
    Uninstall {
        /// Package UID.
        uid: u32,
    },
    /// Copy a local file to the device.
    Put {
        /// Source file.
        local: PathBuf,
        /// Destination path on the device.
        remote: String,
        /// Bytes per FileSystem `write`.
        chunk_size: usize,
    },
    /// Size and times of a file on the device.
    Stat {
        /// Path on the device.
        remote: String,
    },
}

/// Successful end of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Serial pong with the agent version.
    Pong(String),
    /// TCP greeting with the agent's services.
    Hello(Vec<String>),
    /// Plain launch started the process.
    Launched {
        /// Context id of the process.
        process_id: String,
    },
    /// Debug launch ran to the end.
    Exited {
        /// Context id of the process.
        process_id: String,
        /// Exit reason code.
        exit_code: i64,
    },
    /// Package installed.
    Installed,
    /// Package removed.
    Uninstalled,
    /// Put finished.
    Written {
        /// File size.
        bytes: usize,
    },
    /// Attributes of the remote file.
    Stat(FileStat),
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AddListener,
    Start,
    Resume,
    Install,
    Uninstall,
    Open,
    Write,
    Fstat,
    Close,
}

struct Completion {
    step: Step,
    result: CommandResult,
}

/// Drives one [`Action`] to completion.
pub struct Launcher {
    action: Action,
    device: SharedDevice,
    framing: Framing,
    events: broadcast::Receiver<CodaEvent>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    pump: Option<JoinHandle<()>>,
    output: Box<dyn FnMut(&str)>,
    // Put / Stat
    file_handle: Option<String>,
    put_data: Vec<u8>,
    put_offset: usize,
    stat: Option<FileStat>,
    // Launch
    process_id: Option<String>,
    finished: Option<Result<Outcome>>,
}

impl Launcher {
    /// Subscribes to the device's events right away, so nothing published
    /// once the read pump runs is missed.
    pub fn new(action: Action, device: SharedDevice) -> Result<Self> {
        let (framing, events) = {
            let guard = device.lock().map_err(|_| anyhow!("Device lock poisoned"))?;
            (guard.framing(), guard.subscribe())
        };
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            action,
            device,
            framing,
            events,
            completion_tx,
            completion_rx,
            pump: None,
            output: Box::new(|text: &str| log::info!("[console] {}", text)),
            file_handle: None,
            put_data: Vec::new(),
            put_offset: 0,
            stat: None,
            process_id: None,
            finished: None,
        })
    }

    /// Where program output received during a debug launch goes.
    #[must_use]
    pub fn with_output(mut self, sink: impl FnMut(&str) + 'static) -> Self {
        self.output = Box::new(sink);
        self
    }

    /// Run the action until it finishes, fails or `timeout` elapses.
    ///
    /// `None` waits indefinitely, which a debug launch needs.
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<Outcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        if self.pump.is_none() {
            self.pump = spawn_read_pump(&self.device);
        }
        self.start()?;

        loop {
            self.drain_completions()?;
            self.poll_events()?;
            if let Some(outcome) = self.finished.take() {
                return outcome;
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        bail!("Timed out after {} ms", timeout.unwrap_or_default().as_millis());
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            select! {
                recv(self.completion_rx) -> msg => {
                    if let Ok(completion) = msg {
                        self.on_result(completion.step, &completion.result)?;
                    }
                }
                default(wait) => {}
            }
        }
    }

    fn device(&self) -> Result<MutexGuard<'_, CodaDevice>> {
        self.device.lock().map_err(|_| anyhow!("Device lock poisoned"))
    }

    fn completion(&self, step: Step) -> impl FnOnce(&mut CodaDevice, &CommandResult) + Send + 'static {
        let tx = self.completion_tx.clone();
        move |_, result| {
            let _ = tx.send(Completion { step, result: result.clone() });
        }
    }

    fn finish(&mut self, outcome: Result<Outcome>) {
        if self.finished.is_none() {
            self.finished = Some(outcome);
        }
    }

    fn start(&mut self) -> Result<()> {
        match self.action.clone() {
            Action::Ping => {
                if self.framing == Framing::Serial {
                    let mut device = self.device()?;
                    if !device.send_serial_ping(true) {
                        bail!("Failed to send ping: {}", device.error_string());
                    }
                }
                // TCP agents greet on connect; the Hello event completes the ping.
            }
            Action::Launch { binary, uid, arguments, debug } => {
                let start = ProcessStart { arguments, debug_control: debug, ..ProcessStart::new(binary, uid) };
                let add_listener = self.completion(Step::AddListener);
                let started = self.completion(Step::Start);
                let mut device = self.device()?;
                if debug {
                    device.send_settings_enable_log_command();
                    device.send_logging_add_listener_command(CONSOLE_LOGGER, add_listener, 0);
                }
                device.send_process_start_command(&start, started, 0);
            }
            Action::Install { file, silent, drive } => {
                let done = self.completion(Step::Install);
                let mut device = self.device()?;
                if silent {
                    device.send_install_with_options_command(&file, drive, done, 0);
                } else {
                    device.send_install_command(&file, done, 0);
                }
            }
            Action::Uninstall { uid } => {
                let done = self.completion(Step::Uninstall);
                self.device()?.send_uninstall_command(uid, done, 0);
            }
            Action::Put { local, remote, .. } => {
                self.put_data = std::fs::read(&local)
                    .with_context(|| format!("Failed to read {}", local.display()))?;
                self.put_offset = 0;
                let flags = FileSystemOpenFlags::WRITE | FileSystemOpenFlags::CREAT | FileSystemOpenFlags::TRUNC;
                let opened = self.completion(Step::Open);
                self.device()?.send_file_system_open_command(&remote, flags, opened, 0);
            }
            Action::Stat { remote } => {
                let opened = self.completion(Step::Open);
                self.device()?.send_file_system_open_command(&remote, FileSystemOpenFlags::READ, opened, 0);
            }
        }
        Ok(())
    }

    fn on_result(&mut self, step: Step, result: &CommandResult) -> Result<()> {
        log::debug!("{:?} completed: {}", step, result);
        if !result.is_success() {
            // A failed fstat still closes the handle it opened.
            if step == Step::Fstat {
                self.finish(Err(anyhow!("fstat failed: {}", result.error_message())));
                return self.close_file();
            }
            self.finish(Err(anyhow!("{:?} failed: {}", step, result.error_message())));
            return Ok(());
        }

        match step {
            Step::AddListener | Step::Resume => {}
            Step::Start => {
                let Some(context) = CodaDevice::parse_process_start(result) else {
                    self.finish(Err(anyhow!("Process start reply carried no context")));
                    return Ok(());
                };
                log::info!("Started process {}", context.id);
                let debug = matches!(self.action, Action::Launch { debug: true, .. });
                if debug {
                    self.process_id = Some(context.id);
                } else {
                    self.finish(Ok(Outcome::Launched { process_id: context.id }));
                }
            }
            Step::Install => self.finish(Ok(Outcome::Installed)),
            Step::Uninstall => self.finish(Ok(Outcome::Uninstalled)),
            Step::Open => {
                let Some(handle) = CodaDevice::parse_file_system_open(result) else {
                    self.finish(Err(anyhow!("Open reply carried no file handle")));
                    return Ok(());
                };
                self.file_handle = Some(handle);
                if matches!(self.action, Action::Stat { .. }) {
                    let stat = self.completion(Step::Fstat);
                    let handle = self.file_handle.clone().unwrap_or_default();
                    self.device()?.send_file_system_fstat_command(&handle, stat, 0);
                } else {
                    self.write_next_chunk()?;
                }
            }
            Step::Write => self.write_next_chunk()?,
            Step::Fstat => {
                self.stat = CodaDevice::parse_file_system_fstat(result);
                if self.stat.is_none() {
                    self.finish(Err(anyhow!("fstat reply carried no file attributes")));
                }
                self.close_file()?;
            }
            Step::Close => {
                let outcome = match &self.action {
                    Action::Stat { .. } => self.stat.take().map(Outcome::Stat),
                    _ => Some(Outcome::Written { bytes: self.put_data.len() }),
                };
                if let Some(outcome) = outcome {
                    self.finish(Ok(outcome));
                }
            }
        }
        Ok(())
    }

    /// Send the next block of a put, or close the file once all is written.
    fn write_next_chunk(&mut self) -> Result<()> {
        let Action::Put { chunk_size, .. } = self.action else {
            return Ok(());
        };
        if self.put_offset >= self.put_data.len() {
            return self.close_file();
        }
        let end = (self.put_offset + chunk_size.max(1)).min(self.put_data.len());
        let handle = self.file_handle.clone().unwrap_or_default();
        let written = self.completion(Step::Write);
        let offset = self.put_offset as u64;
        let chunk = self.put_data[self.put_offset..end].to_vec();
        self.put_offset = end;
        log::debug!("Writing {} bytes at offset {}", chunk.len(), offset);
        self.device()?.send_file_system_write_command(&handle, offset, &chunk, written, 0);
        Ok(())
    }

    fn close_file(&mut self) -> Result<()> {
        let Some(handle) = self.file_handle.take() else {
            return Ok(());
        };
        let closed = self.completion(Step::Close);
        self.device()?.send_file_system_close_command(&handle, closed, 0);
        Ok(())
    }

    fn drain_completions(&mut self) -> Result<()> {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.on_result(completion.step, &completion.result)?;
        }
        Ok(())
    }

    /// Completions sent before an event was published are handled first, so a
    /// process id is known before the events about it.
    fn poll_events(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.drain_completions()?;
                    if let Err(e) = self.on_event(event) {
                        self.finish(Err(e));
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(n)) => log::warn!("Missed {} device events", n),
                Err(TryRecvError::Closed) => {
                    self.finish(Err(anyhow!("Device event channel closed")));
                    break;
                }
            }
        }
        Ok(())
    }

    fn owns(&self, context_id: &str) -> bool {
        self.process_id.as_deref().is_some_and(|pid| {
            context_id == pid || context_id.strip_prefix(pid).is_some_and(|rest| rest.starts_with('.'))
        })
    }

    fn on_event(&mut self, event: CodaEvent) -> Result<()> {
        match event {
            CodaEvent::SerialPong(version) if self.action == Action::Ping => {
                self.finish(Ok(Outcome::Pong(version)));
            }
            CodaEvent::LocatorHello { services } => {
                log::info!("Agent services: {}", services.join(", "));
                if self.action == Action::Ping && self.framing == Framing::Tcp {
                    self.finish(Ok(Outcome::Hello(services)));
                }
            }
            CodaEvent::LoggingWrite { message, .. } => (self.output)(&message),
            CodaEvent::ContextSuspended { id, pc, reason, message } if self.owns(&id) => {
                if reason == SuspendReason::Crash {
                    bail!("{id} crashed at 0x{pc:08x}: {message}");
                }
                log::debug!("{} suspended at 0x{:08x} ({:?}); resuming", id, pc, reason);
                let resumed = self.completion(Step::Resume);
                self.device()?.send_run_control_resume(&id, resumed, 0);
            }
            CodaEvent::ProcessExited { id, exit_code } if self.owns(&id) => {
                self.finish(Ok(Outcome::Exited { process_id: id, exit_code }));
            }
            CodaEvent::Error(message) => bail!("Connection error: {message}"),
            CodaEvent::UnknownFrame { protocol_id, payload } => {
                log::debug!("Frame for protocol 0x{:02x}: {}", protocol_id, hex::encode(payload));
            }
            CodaEvent::Generic { service, name, values } => {
                let values: Vec<serde_json::Value> = values.iter().map(serde_json::Value::from).collect();
                log::debug!("{} {}: {}", service, name, serde_json::Value::Array(values));
            }
            other => log::trace!("Ignoring {:?}", other),
        }
        Ok(())
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        if let Ok(mut device) = self.device.lock() {
            device.close();
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}
