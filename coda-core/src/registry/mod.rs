//! Device registry module.
//!
//! Tracks the transport endpoints a backend enumerates and hands out
//! reference-counted engines for them. Engines are opened on the registry's
//! owning thread; callers on other threads have their requests marshalled
//! there and block until the engine is ready. When the last lease on a device
//! is dropped the device stays open for a grace period, so back-to-back
//! acquisitions reuse the same stream.

#[cfg(feature = "serial")]
pub mod serial_backend;

#[cfg(feature = "serial")]
pub use serial_backend::SerialPortBackend;

use crate::config::RegistryConfig;
use crate::device::{CodaDevice, SharedDevice};
use crate::frame::Framing;
use crate::stream::{spawn_read_pump, ByteStream};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::Instant;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Physical link of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommunicationKind {
    /// USB or native serial port.
    SerialPort,
    /// Bluetooth serial profile.
    Bluetooth,
}

/// An enumerated endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// OS name of the port, e.g. `COM3` or `/dev/ttyACM0`.
    pub port_name: String,
    /// Human-readable name.
    pub friendly_name: String,
    /// Transport the port uses.
    pub kind: CommunicationKind,
}

impl DeviceDescriptor {
    /// Descriptor for `port_name`.
    pub fn new(port_name: impl Into<String>, friendly_name: impl Into<String>, kind: CommunicationKind) -> Self {
        Self { port_name: port_name.into(), friendly_name: friendly_name.into(), kind }
    }

    /// Records are matched on port and friendly name only.
    fn same_device(&self, other: &Self) -> bool {
        self.port_name == other.port_name && self.friendly_name == other.friendly_name
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.friendly_name, self.port_name)
    }
}

/// Platform discovery and stream construction.
pub trait DeviceBackend: Send + 'static {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>>;

    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn ByteStream>>;
}

/// Change notifications, sent after the device list has been updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Newly listed.
    Added(DeviceDescriptor),
    /// No longer listed.
    Removed(DeviceDescriptor),
}

/// Result of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    /// Newly listed devices.
    pub added: Vec<DeviceDescriptor>,
    /// Devices no longer listed.
    pub removed: Vec<DeviceDescriptor>,
}

impl DeviceDiff {
    /// No device came or went.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct DeviceRecord {
    id: u64,
    descriptor: DeviceDescriptor,
    device: Option<SharedDevice>,
    acquisitions: usize,
    close_deadline: Option<Instant>,
}

#[derive(Default)]
struct RegistryState {
    records: Vec<DeviceRecord>,
    next_id: u64,
}

impl RegistryState {
    fn by_id(&mut self, id: u64) -> Option<&mut DeviceRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }
}

enum RegistryCommand {
    Acquire { port: String, reply: Sender<Result<(u64, SharedDevice)>> },
    Update { devices: Option<Vec<DeviceDescriptor>>, reply: Sender<Result<DeviceDiff>> },
    /// Re-evaluate close deadlines.
    Wake,
    Shutdown,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    backend: Mutex<Box<dyn DeviceBackend>>,
    config: RegistryConfig,
    command_tx: Sender<RegistryCommand>,
    event_tx: broadcast::Sender<DeviceEvent>,
}

/// Registry of available devices and their shared engines.
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
    owner: ThreadId,
    thread_handle: Option<thread::JoinHandle<()>>,
}

/// A held acquisition of a device; released on drop.
pub struct DeviceLease {
    device: SharedDevice,
    port_name: String,
    record_id: u64,
    registry: Weak<RegistryInner>,
}

impl DeviceLease {
    /// The shared engine of the leased device.
    pub const fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Port the lease was taken on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease").field("port_name", &self.port_name).finish_non_exhaustive()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.release(self.record_id);
        }
    }
}

impl DeviceRegistry {
    /// Create a registry and start its owning thread.
    pub fn new(backend: impl DeviceBackend, config: RegistryConfig) -> Result<Self> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(RegistryInner {
            state: Mutex::new(RegistryState::default()),
            backend: Mutex::new(Box::new(backend)),
            config,
            command_tx,
            event_tx,
        });

        let thread_inner = Arc::clone(&inner);
        let thread_handle = thread::Builder::new()
            .name("coda-registry".into())
            .spawn(move || thread_inner.run(&command_rx))
            .context("Failed to spawn registry thread")?;

        Ok(Self { inner, owner: thread_handle.thread().id(), thread_handle: Some(thread_handle) })
    }

    /// Subscribe to device additions and removals.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Snapshot of the current device list.
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.lock_state().records.iter().map(|r| r.descriptor.clone()).collect()
    }

    /// Descriptor of `port`, if listed.
    pub fn find(&self, port: &str) -> Option<DeviceDescriptor> {
        self.inner
            .lock_state()
            .records
            .iter()
            .find(|r| r.descriptor.port_name == port)
            .map(|r| r.descriptor.clone())
    }

    /// Outstanding leases on a port.
    pub fn acquisition_count(&self, port: &str) -> usize {
        self.inner
            .lock_state()
            .records
            .iter()
            .find(|r| r.descriptor.port_name == port)
            .map_or(0, |r| r.acquisitions)
    }

    /// Re-enumerate through the backend.
    pub fn update(&self) -> Result<DeviceDiff> {
        self.request_update(None)
    }

    /// Replace the device list with an externally discovered one.
    pub fn update_with(&self, devices: Vec<DeviceDescriptor>) -> Result<DeviceDiff> {
        self.request_update(Some(devices))
    }

    fn request_update(&self, devices: Option<Vec<DeviceDescriptor>>) -> Result<DeviceDiff> {
        if self.on_owner_thread() {
            return self.inner.update(devices);
        }
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.inner
            .command_tx
            .send(RegistryCommand::Update { devices, reply })
            .map_err(|_| anyhow!("Registry thread is not running"))?;
        rx.recv().context("Registry thread stopped before replying")?
    }

    /// Acquire the engine for `port`, opening it if needed.
    ///
    /// A failed open still counts as an acquisition; the lease's engine then
    /// reports the failure through `error_string`.
    pub fn acquire(&self, port: &str) -> Result<DeviceLease> {
        let (record_id, device) = if self.on_owner_thread() {
            self.inner.acquire(port)?
        } else {
            let (reply, rx) = crossbeam_channel::bounded(1);
            self.inner
                .command_tx
                .send(RegistryCommand::Acquire { port: port.to_string(), reply })
                .map_err(|_| anyhow!("Registry thread is not running"))?;
            rx.recv().context("Registry thread stopped before replying")??
        };
        Ok(DeviceLease {
            device,
            port_name: port.to_string(),
            record_id,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Explicit form of dropping a lease.
    pub fn release(&self, lease: DeviceLease) {
        drop(lease);
    }

    /// Close every device and stop the owning thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.inner.command_tx.send(RegistryCommand::Shutdown);
            if handle.join().is_err() {
                log::error!("Registry thread panicked");
            }
        }
    }

    fn on_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RegistryInner {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn run(&self, commands: &Receiver<RegistryCommand>) {
        let poll_interval = self.config.poll_interval();
        let mut next_poll = poll_interval.map(|_| Instant::now());
        log::debug!("Registry thread started");

        loop {
            let close_deadline = self.lock_state().records.iter().filter_map(|r| r.close_deadline).min();
            let wake_at = match (close_deadline, next_poll) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let received = match wake_at {
                Some(deadline) => commands.recv_deadline(deadline),
                None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(RegistryCommand::Acquire { port, reply }) => {
                    let _ = reply.send(self.acquire(&port));
                }
                Ok(RegistryCommand::Update { devices, reply }) => {
                    let _ = reply.send(self.update(devices));
                }
                Ok(RegistryCommand::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Ok(RegistryCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }

            self.close_expired();
            if let (Some(due), Some(interval)) = (next_poll, poll_interval) {
                if Instant::now() >= due {
                    if let Err(e) = self.update(None) {
                        log::warn!("Device poll failed: {:#}", e);
                    }
                    next_poll = Some(Instant::now() + interval);
                }
            }
        }

        self.close_all();
        log::debug!("Registry thread stopped");
    }

    fn acquire(&self, port: &str) -> Result<(u64, SharedDevice)> {
        let (record_id, descriptor, existing, acquisitions) = {
            let mut state = self.lock_state();
            let record = state
                .records
                .iter_mut()
                .find(|r| r.descriptor.port_name == port)
                .with_context(|| format!("Unknown device {port}"))?;
            record.close_deadline = None;
            (record.id, record.descriptor.clone(), record.device.clone(), record.acquisitions)
        };

        let reusable = existing.filter(|device| {
            acquisitions > 0 || device.lock().is_ok_and(|d| d.is_open())
        });
        let opened = reusable.is_none();
        let device = match reusable {
            Some(device) => {
                log::debug!("Reusing open device {}", descriptor);
                device
            }
            None => self.open_device(&descriptor),
        };

        let mut state = self.lock_state();
        if let Some(record) = state.by_id(record_id) {
            if opened {
                record.device = Some(Arc::clone(&device));
            }
            record.acquisitions += 1;
            record.close_deadline = None;
            log::debug!("Acquired {} ({} lease(s))", descriptor, record.acquisitions);
        }
        Ok((record_id, device))
    }

    fn open_device(&self, descriptor: &DeviceDescriptor) -> SharedDevice {
        let opened = self
            .backend
            .lock()
            .map_err(|_| anyhow!("Device backend lock poisoned"))
            .and_then(|mut backend| backend.open(descriptor));
        match opened {
            Ok(stream) => {
                log::info!("Opened {}", descriptor);
                let device = CodaDevice::with_stream(Framing::Serial, stream).into_shared();
                spawn_read_pump(&device);
                device
            }
            Err(e) => {
                log::warn!("Failed to open {}: {:#}", descriptor, e);
                let mut device = CodaDevice::new(Framing::Serial);
                device.record_error(format!("{e:#}"));
                device.into_shared()
            }
        }
    }

    fn release(&self, record_id: u64) {
        {
            let mut state = self.lock_state();
            let Some(record) = state.by_id(record_id) else {
                log::debug!("Released a device that is no longer listed");
                return;
            };
            if record.acquisitions == 0 {
                log::warn!("Release of {} without matching acquire", record.descriptor);
                return;
            }
            record.acquisitions -= 1;
            if record.acquisitions == 0 && record.device.is_some() {
                record.close_deadline = Some(Instant::now() + self.config.close_grace());
                log::debug!("Scheduling close of {}", record.descriptor);
            }
        }
        let _ = self.command_tx.send(RegistryCommand::Wake);
    }

    fn close_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(DeviceDescriptor, SharedDevice)> = {
            let mut state = self.lock_state();
            state
                .records
                .iter_mut()
                .filter(|r| r.acquisitions == 0 && r.close_deadline.is_some_and(|d| d <= now))
                .filter_map(|r| {
                    r.close_deadline = None;
                    r.device.take().map(|d| (r.descriptor.clone(), d))
                })
                .collect()
        };
        for (descriptor, device) in expired {
            close_device(&device);
            log::info!("Closed {} after grace period", descriptor);
        }
    }

    fn close_all(&self) {
        let devices: Vec<SharedDevice> =
            self.lock_state().records.iter_mut().filter_map(|r| r.device.take()).collect();
        for device in devices {
            close_device(&device);
        }
    }

    fn update(&self, devices: Option<Vec<DeviceDescriptor>>) -> Result<DeviceDiff> {
        let devices = match devices {
            Some(devices) => devices,
            None => self
                .backend
                .lock()
                .map_err(|_| anyhow!("Device backend lock poisoned"))?
                .enumerate()
                .context("Device enumeration failed")?,
        };

        let mut diff = DeviceDiff::default();
        let mut to_close = Vec::new();
        {
            let mut state = self.lock_state();
            let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut state.records)
                .into_iter()
                .partition(|r| devices.iter().any(|d| d.same_device(&r.descriptor)));
            state.records = kept;
            for mut record in removed {
                if record.acquisitions > 0 {
                    log::warn!("{} removed with {} lease(s) outstanding", record.descriptor, record.acquisitions);
                }
                to_close.extend(record.device.take());
                diff.removed.push(record.descriptor);
            }
            for descriptor in devices {
                if state.records.iter().any(|r| r.descriptor.same_device(&descriptor)) {
                    continue;
                }
                let id = state.next_id;
                state.next_id += 1;
                diff.added.push(descriptor.clone());
                state.records.push(DeviceRecord {
                    id,
                    descriptor,
                    device: None,
                    acquisitions: 0,
                    close_deadline: None,
                });
            }
        }

        for device in &to_close {
            close_device(device);
        }
        for descriptor in &diff.removed {
            log::info!("Device removed: {}", descriptor);
            let _ = self.event_tx.send(DeviceEvent::Removed(descriptor.clone()));
        }
        for descriptor in &diff.added {
            log::info!("Device added: {}", descriptor);
            let _ = self.event_tx.send(DeviceEvent::Added(descriptor.clone()));
        }
        Ok(diff)
    }
}

fn close_device(device: &SharedDevice) {
    match device.lock() {
        Ok(mut device) => device.close(),
        Err(poisoned) => poisoned.into_inner().close(),
    }
}
