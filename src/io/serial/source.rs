// src/io/serial/source.rs
//
// Byte source backed by a real serial port (serialport crate), plus device
// enumeration.

use serde::Serialize;
use serialport::SerialPort;
use std::io::Read;
use std::time::Duration;

use super::utils::{
    classify_open_error, to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits,
};
use crate::io::error::{ConnectError, ReadError};
use crate::io::types::ChannelConfig;
use crate::io::{ByteSource, PortBackend, PortClaim};

// ============================================================================
// Types
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

// ============================================================================
// Serial Byte Source
// ============================================================================

/// An open serial port. Holds the process-wide claim on the device until closed.
pub struct SerialByteSource {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
    claim: Option<PortClaim>,
}

impl SerialByteSource {
    pub fn open(config: &ChannelConfig) -> Result<Self, ConnectError> {
        if config.baud_rate == 0 {
            return Err(ConnectError::invalid_config(&config.port, "baud rate must be positive"));
        }
        let data_bits = to_serialport_data_bits(&config.port, config.byte_size)?;
        let stop_bits = to_serialport_stop_bits(&config.port, config.stop_bits)?;
        let parity = to_serialport_parity(config.parity);

        // Claim before touching the OS so two channels never race for one device
        let claim = PortClaim::acquire(&config.port)?;

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| classify_open_error(&config.port, &e))?;

        tlog!(
            "[Serial] Opened {} at {}",
            config.port,
            config.summary()
        );

        Ok(Self {
            port_name: config.port.clone(),
            port: Some(port),
            claim: Some(claim),
        })
    }
}

impl ByteSource for SerialByteSource {
    fn port(&self) -> &str {
        &self.port_name
    }

    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, ReadError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ReadError::Terminal("port is closed".to_string()))?;

        let available = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => return Err(classify_read_error(&e)),
        };
        if available == 0 || max_bytes == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; available.min(max_bytes)];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(ReadError::from_io(&e)),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tlog!("[Serial] Closed {}", self.port_name);
        }
        self.claim.take();
    }
}

impl Drop for SerialByteSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify_read_error(e: &serialport::Error) -> ReadError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => ReadError::Terminal(e.description.clone()),
        serialport::ErrorKind::Io(kind) => ReadError::from_io(&std::io::Error::new(kind, e.description.clone())),
        _ => ReadError::Transient(e.description.clone()),
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Port backend for the host's serial devices
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialBackend;

impl PortBackend for SerialBackend {
    fn open(&self, config: &ChannelConfig) -> Result<Box<dyn ByteSource>, ConnectError> {
        Ok(Box::new(SerialByteSource::open(config)?))
    }

    fn list_devices(&self) -> Result<Vec<String>, String> {
        Ok(list_serial_ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect())
    }
}

impl From<serialport::SerialPortInfo> for SerialPortInfo {
    fn from(p: serialport::SerialPortInfo) -> Self {
        let mut info = SerialPortInfo {
            port_name: p.port_name,
            port_type: String::new(),
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        };
        info.port_type = match p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.manufacturer = usb.manufacturer;
                info.product = usb.product;
                info.serial_number = usb.serial_number;
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                "USB"
            }
            serialport::SerialPortType::BluetoothPort => "Bluetooth",
            serialport::SerialPortType::PciPort => "PCI",
            serialport::SerialPortType::Unknown => "Unknown",
        }
        .to_string();
        info
    }
}

/// macOS call-in devices (`/dev/tty.*`) block on open until carrier detect,
/// so only their `/dev/cu.*` twins are offered.
fn is_listable(port_name: &str) -> bool {
    !(cfg!(target_os = "macos") && port_name.starts_with("/dev/tty."))
}

/// Serial devices present on this machine
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports = serialport::available_ports()
        .map_err(|e| format!("Failed to enumerate ports: {}", e))?;
    Ok(ports
        .into_iter()
        .filter(|p| is_listable(&p.port_name))
        .map(SerialPortInfo::from)
        .collect())
}
