//! Serial port discovery through the `serialport` crate.

use super::{CommunicationKind, DeviceBackend, DeviceDescriptor};
use crate::stream::{ByteStream, SerialByteStream};
use anyhow::{Context, Result};
use serialport::SerialPortType;

const NOKIA_VENDOR_ID: u16 = 0x0421;

/// Backend listing the system's serial ports.
#[derive(Debug, Clone)]
pub struct SerialPortBackend {
    baud_rate: u32,
    /// Only list USB ports of known phone vendors and Bluetooth ports.
    phones_only: bool,
}

impl SerialPortBackend {
    /// Lists every serial port, opened at `baud_rate`.
    pub const fn new(baud_rate: u32) -> Self {
        Self { baud_rate, phones_only: false }
    }

    #[must_use]
    pub const fn phones_only(mut self, phones_only: bool) -> Self {
        self.phones_only = phones_only;
        self
    }
}

impl DeviceBackend for SerialPortBackend {
    fn enumerate(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let ports = serialport::available_ports().context("Failed to list serial ports")?;
        let devices = ports
            .into_iter()
            .filter(|p| !self.phones_only || is_phone(&p.port_type))
            .map(|p| describe(&p.port_name, &p.port_type))
            .collect::<Vec<_>>();
        log::debug!("Enumerated {} serial device(s)", devices.len());
        Ok(devices)
    }

    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Box<dyn ByteStream>> {
        let stream = SerialByteStream::open(&descriptor.port_name, self.baud_rate)
            .with_context(|| format!("Failed to open {}", descriptor.port_name))?;
        Ok(Box::new(stream))
    }
}

fn is_phone(port_type: &SerialPortType) -> bool {
    match port_type {
        SerialPortType::UsbPort(info) => info.vid == NOKIA_VENDOR_ID,
        SerialPortType::BluetoothPort => true,
        _ => false,
    }
}

/// Friendly name and link kind of a port.
fn describe(port_name: &str, port_type: &SerialPortType) -> DeviceDescriptor {
    let (friendly_name, kind) = match port_type {
        SerialPortType::UsbPort(info) => {
            let name = info
                .product
                .clone()
                .or_else(|| info.manufacturer.clone())
                .unwrap_or_else(|| format!("USB device {:04x}:{:04x}", info.vid, info.pid));
            (name, CommunicationKind::SerialPort)
        }
        SerialPortType::BluetoothPort => {
            (format!("Bluetooth device ({port_name})"), CommunicationKind::Bluetooth)
        }
        // Linux exposes bound Bluetooth serial links as rfcomm ttys.
        _ if port_name.contains("rfcomm") => {
            (format!("Bluetooth device ({port_name})"), CommunicationKind::Bluetooth)
        }
        _ => (format!("Serial port ({port_name})"), CommunicationKind::SerialPort),
    };
    DeviceDescriptor::new(port_name, friendly_name, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_bluetooth() {
        let d = describe("COM7", &SerialPortType::BluetoothPort);
        assert_eq!(d.kind, CommunicationKind::Bluetooth);
        assert_eq!(d.friendly_name, "Bluetooth device (COM7)");

        let d = describe("/dev/rfcomm0", &SerialPortType::Unknown);
        assert_eq!(d.kind, CommunicationKind::Bluetooth);
    }

    #[test]
    fn test_describe_plain_port() {
        let d = describe("/dev/ttyS0", &SerialPortType::PciPort);
        assert_eq!(d.kind, CommunicationKind::SerialPort);
        assert_eq!(d.port_name, "/dev/ttyS0");
        assert!(!is_phone(&SerialPortType::PciPort));
        assert!(is_phone(&SerialPortType::BluetoothPort));
    }
}
