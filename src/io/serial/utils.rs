// src/io/serial/utils.rs
//
// Line-setting types and their conversion to the serialport crate.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, StopBits as SpStopBits};

use crate::io::error::ConnectError;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    /// Single-letter form used in `8N1`-style summaries
    pub fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

impl std::str::FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "o" | "odd" => Ok(Parity::Odd),
            "e" | "even" => Ok(Parity::Even),
            other => Err(format!("unknown parity '{}'", other)),
        }
    }
}

/// Stop bit setting. 1.5 is accepted in configuration but most drivers refuse it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    pub fn label(self) -> &'static str {
        match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        }
    }
}

impl std::str::FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            other => Err(format!("unknown stop bits '{}'", other)),
        }
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(port: &str, bits: u8) -> Result<DataBits, ConnectError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(ConnectError::invalid_config(
            port,
            format!("unsupported byte size {}", other),
        )),
    }
}

/// Convert stop bits to serialport crate's StopBits type.
/// serialport has no 1.5 stop bit mode.
pub fn to_serialport_stop_bits(port: &str, bits: StopBits) -> Result<SpStopBits, ConnectError> {
    match bits {
        StopBits::One => Ok(SpStopBits::One),
        StopBits::Two => Ok(SpStopBits::Two),
        StopBits::OnePointFive => Err(ConnectError::invalid_config(
            port,
            "1.5 stop bits are not supported by this driver",
        )),
    }
}

/// Map a serialport open failure onto the connect taxonomy.
pub fn classify_open_error(port: &str, e: &serialport::Error) -> ConnectError {
    use serialport::ErrorKind;
    match e.kind() {
        ErrorKind::NoDevice => ConnectError::not_found(port),
        ErrorKind::InvalidInput => ConnectError::invalid_config(port, e.description.clone()),
        ErrorKind::Io(std::io::ErrorKind::NotFound) => ConnectError::not_found(port),
        ErrorKind::Io(std::io::ErrorKind::PermissionDenied)
        | ErrorKind::Io(std::io::ErrorKind::AddrInUse) => ConnectError::busy(port),
        ErrorKind::Io(std::io::ErrorKind::InvalidInput) => {
            ConnectError::invalid_config(port, e.description.clone())
        }
        _ => {
            // Drivers report a claimed tty as EBUSY with varying descriptions
            let lower = e.description.to_lowercase();
            if lower.contains("busy") || lower.contains("access is denied") {
                ConnectError::busy(port)
            } else {
                ConnectError::os(port, e.description.clone())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
