// src/io/types.rs
//
// Shared types for per-channel streaming.
// Used by the reader threads to communicate with the consumer context.

use serde::{Deserialize, Serialize};

use super::error::ReadError;
use super::serial::{Parity, StopBits};

/// Baud rates offered by the port picker. Any positive rate is accepted.
pub const STANDARD_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

// ============================================================================
// Channel Configuration
// ============================================================================

/// Line settings for one channel. Fixed for the lifetime of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_byte_size")]
    pub byte_size: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_byte_size() -> u8 {
    8
}
fn default_read_timeout_ms() -> u64 {
    1000
}

impl ChannelConfig {
    /// 8N1 with a one second read timeout
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            byte_size: default_byte_size(),
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout_ms: default_read_timeout_ms(),
        }
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_byte_size(mut self, byte_size: u8) -> Self {
        self.byte_size = byte_size;
        self
    }

    /// Short line-settings summary, e.g. `115200 8N1`
    pub fn summary(&self) -> String {
        format!(
            "{} {}{}{}",
            self.baud_rate,
            self.byte_size,
            self.parity.letter(),
            self.stop_bits.label()
        )
    }
}

// ============================================================================
// Channel State
// ============================================================================

/// Connection state of a channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Faulted,
}

impl ChannelState {
    /// Only an idle or faulted channel may start connecting
    pub fn can_connect(self) -> bool {
        matches!(self, ChannelState::Idle | ChannelState::Faulted)
    }
}

// ============================================================================
// Reader Messages
// ============================================================================

/// Internal message from a reader thread to its channel's consumer
#[derive(Debug)]
pub enum ReaderEvent {
    /// Decoded text, in arrival order
    Data(String),
    /// Terminal read failure; the reader has exited
    Error(ReadError),
}

// ============================================================================
// Consumer Notifications
// ============================================================================

/// Notification produced on the consumer context for the presentation layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// New text reached the channel's buffers
    Received { index: usize, bytes: usize },
    /// Connection ended by a read error
    Faulted {
        index: usize,
        port: String,
        message: String,
    },
    /// Device vanished from enumeration and the channel was disconnected
    DeviceDisappeared { index: usize, port: String },
    /// Capture file failure; ingestion continues
    SinkError { index: usize, message: String },
}

impl ChannelEvent {
    pub fn index(&self) -> usize {
        match self {
            ChannelEvent::Received { index, .. }
            | ChannelEvent::Faulted { index, .. }
            | ChannelEvent::DeviceDisappeared { index, .. }
            | ChannelEvent::SinkError { index, .. } => *index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_defaults() {
        let cfg = ChannelConfig::new("/dev/ttyUSB0", 9600);
        assert_eq!(cfg.byte_size, 8);
        assert_eq!(cfg.parity, Parity::None);
        assert_eq!(cfg.stop_bits, StopBits::One);
        assert_eq!(cfg.summary(), "9600 8N1");
    }

    #[test]
    fn test_channel_config_deserialize_fills_defaults() {
        let cfg: ChannelConfig =
            serde_json::from_str(r#"{"port":"COM4","baud_rate":115200,"parity":"even"}"#).unwrap();
        assert_eq!(cfg.read_timeout_ms, 1000);
        assert_eq!(cfg.parity, Parity::Even);
        assert_eq!(cfg.summary(), "115200 8E1");
    }

    #[test]
    fn test_can_connect() {
        assert!(ChannelState::Idle.can_connect());
        assert!(ChannelState::Faulted.can_connect());
        assert!(!ChannelState::Connected.can_connect());
        assert!(!ChannelState::Connecting.can_connect());
        assert!(!ChannelState::Disconnecting.can_connect());
    }
}
