// src/io/error.rs
//
// Error taxonomy for the ingestion pipeline.
// Connect failures, read failures, capture sink failures and NMEA field
// failures are separate types so each layer decides what to do with them.

use thiserror::Error;

/// Failure to open a byte source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Device already claimed (by this process or another)
    #[error("{port}: port is busy")]
    PortBusy { port: String },
    /// Device does not exist (never existed or vanished)
    #[error("{port}: port not found")]
    PortNotFound { port: String },
    /// Parameter combination the device or driver does not support
    #[error("{port}: invalid configuration: {reason}")]
    InvalidConfig { port: String, reason: String },
    /// Any other OS-reported failure
    #[error("{port}: {reason}")]
    Os { port: String, reason: String },
}

impl ConnectError {
    pub fn busy(port: impl Into<String>) -> Self {
        ConnectError::PortBusy { port: port.into() }
    }

    pub fn not_found(port: impl Into<String>) -> Self {
        ConnectError::PortNotFound { port: port.into() }
    }

    pub fn invalid_config(port: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectError::InvalidConfig {
            port: port.into(),
            reason: reason.into(),
        }
    }

    pub fn os(port: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectError::Os {
            port: port.into(),
            reason: reason.into(),
        }
    }
}

/// Failure while reading from an open byte source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// May succeed on retry (interrupted syscall, momentary driver hiccup)
    #[error("transient read error: {0}")]
    Transient(String),
    /// Connection is unusable (device unplugged, handle closed)
    #[error("read error: {0}")]
    Terminal(String),
}

impl ReadError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadError::Terminal(_))
    }

    /// Classify an OS error from a read.
    /// Timeouts are not errors at all and must be filtered by the caller.
    pub fn from_io(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::Other => {
                ReadError::Transient(e.to_string())
            }
            _ => ReadError::Terminal(e.to_string()),
        }
    }

    /// Promote to terminal after retries are exhausted.
    pub fn into_terminal(self) -> Self {
        match self {
            ReadError::Transient(msg) => ReadError::Terminal(msg),
            terminal => terminal,
        }
    }
}

/// Capture file I/O failure, carrying the OS-reported reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {reason}")]
pub struct SinkError {
    pub path: String,
    pub reason: String,
}

impl SinkError {
    pub fn new(path: impl Into<String>, e: &std::io::Error) -> Self {
        SinkError {
            path: path.into(),
            reason: e.to_string(),
        }
    }
}

/// NMEA field decode failure. Never leaves the parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated sentence ({0} fields)")]
    Truncated(usize),
    #[error("bad {field}: '{value}'")]
    Field { field: &'static str, value: String },
    #[error("checksum mismatch (expected {expected:02X}, got {actual:02X})")]
    Checksum { expected: u8, actual: u8 },
}

impl ParseError {
    pub fn field(field: &'static str, value: impl Into<String>) -> Self {
        ParseError::Field {
            field,
            value: value.into(),
        }
    }
}
