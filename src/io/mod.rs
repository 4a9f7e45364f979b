// src/io/mod.rs
//
// Byte source abstraction for serial channels.
// Provides a common interface over real serial ports and the in-memory
// backend, plus the process-wide device claim table.

mod error;
pub mod memory;
pub mod serial;
mod types;

pub use error::{ConnectError, ParseError, ReadError, SinkError};
pub use memory::MemoryBackend;
pub use serial::{list_serial_ports, Parity, SerialBackend, SerialPortInfo, StopBits};
pub use types::{ChannelConfig, ChannelEvent, ChannelState, ReaderEvent, STANDARD_BAUD_RATES};

use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

// ============================================================================
// Source Traits
// ============================================================================

/// One open connection producing raw bytes.
///
/// Owned by exactly one reader thread between open and close.
pub trait ByteSource: Send {
    /// Device identifier this source was opened on
    fn port(&self) -> &str;

    /// Return up to `max_bytes` of what is already buffered by the driver.
    /// Empty when nothing is waiting; never blocks for long.
    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, ReadError>;

    /// Release the device. Further reads fail with a terminal error.
    fn close(&mut self);
}

/// Opens byte sources and enumerates the devices they can be opened on.
pub trait PortBackend: Send + Sync {
    fn open(&self, config: &ChannelConfig) -> Result<Box<dyn ByteSource>, ConnectError>;

    /// Raw enumeration; may contain duplicates and is unordered.
    fn list_devices(&self) -> Result<Vec<String>, String>;
}

/// Deduplicate and sort a device listing so repeated calls compare equal.
pub fn normalize_device_list(devices: Vec<String>) -> Vec<String> {
    devices
        .into_iter()
        .filter(|d| !d.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ============================================================================
// Device Claims
// ============================================================================

/// Device identifiers currently held open by this process
static CLAIMED_PORTS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive hold on a device identifier. Released on drop.
#[derive(Debug)]
pub struct PortClaim {
    port: String,
}

impl PortClaim {
    pub fn acquire(port: &str) -> Result<Self, ConnectError> {
        let mut claimed = CLAIMED_PORTS
            .lock()
            .map_err(|e| ConnectError::os(port, format!("claim table poisoned: {}", e)))?;
        if !claimed.insert(port.to_string()) {
            return Err(ConnectError::busy(port));
        }
        Ok(Self {
            port: port.to_string(),
        })
    }

    pub fn is_claimed(port: &str) -> bool {
        CLAIMED_PORTS
            .lock()
            .map(|claimed| claimed.contains(port))
            .unwrap_or(false)
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        if let Ok(mut claimed) = CLAIMED_PORTS.lock() {
            claimed.remove(&self.port);
        }
    }
}
