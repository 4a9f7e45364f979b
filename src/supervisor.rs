// src/supervisor.rs
//
// Per-channel lifecycle.
// A ChannelSupervisor owns everything one serial channel needs: the reader
// thread and its queue, the display and parsed buffers, the optional capture
// file and the optional sentence parser. All mutation happens on the consumer
// context through `poll()` and the control methods; the reader thread only
// ever sends ReaderEvents.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::buffers::{ChannelBuffer, DEFAULT_TRUNCATE_FACTOR};
use crate::capture::{LogWriter, DEFAULT_FLUSH_THRESHOLD, DEFAULT_LOG_DIR, DEFAULT_MAX_FILE_SIZE};
use crate::io::serial::{spawn_reader, ReaderHandle, ReaderOptions};
use crate::io::{
    ChannelConfig, ChannelEvent, ChannelState, ConnectError, Parity, PortBackend, ReaderEvent,
    SinkError, StopBits,
};
use crate::nmea::{NmeaParser, SentenceParser};

// ============================================================================
// Options
// ============================================================================

/// Tuning shared by every channel of a registry
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub display_soft_max: usize,
    pub parsed_soft_max: usize,
    pub truncate_factor: f64,
    pub log_dir: PathBuf,
    pub max_log_file_size: u64,
    pub log_flush_threshold: usize,
    /// Reader-to-consumer queue depth, in chunks
    pub queue_capacity: usize,
    /// Chunks applied per `poll()` so one busy channel cannot starve the rest
    pub max_events_per_poll: usize,
    pub disconnect_timeout: Duration,
    pub parse_nmea: bool,
    pub verify_nmea_checksum: bool,
    pub reader: ReaderOptions,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            display_soft_max: 100_000,
            parsed_soft_max: 50_000,
            truncate_factor: DEFAULT_TRUNCATE_FACTOR,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            max_log_file_size: DEFAULT_MAX_FILE_SIZE,
            log_flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            queue_capacity: 256,
            max_events_per_poll: 64,
            disconnect_timeout: Duration::from_millis(1500),
            parse_nmea: false,
            verify_nmea_checksum: false,
            reader: ReaderOptions::default(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("channel {index}: cannot {action} while {state:?}")]
    InvalidState {
        index: usize,
        action: &'static str,
        state: ChannelState,
    },

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("channel {index}: failed to start reader: {reason}")]
    Spawn { index: usize, reason: String },

    #[error("failed to export to {path}: {reason}")]
    Export { path: String, reason: String },
}

// ============================================================================
// Snapshot
// ============================================================================

/// Read-only view of a channel for the presentation layer
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub index: usize,
    pub state: ChannelState,
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub byte_size: Option<u8>,
    pub parity: Option<Parity>,
    pub stop_bits: Option<StopBits>,
    pub receiving: bool,
    pub display_paused: bool,
    pub auto_save: bool,
    pub parse_nmea: bool,
    pub bytes_received: u64,
    pub display_len: usize,
    pub parsed_len: usize,
    pub log_path: Option<String>,
    pub status: Option<String>,
}

// ============================================================================
// Channel Supervisor
// ============================================================================

pub struct ChannelSupervisor {
    index: usize,
    backend: Arc<dyn PortBackend>,
    options: ChannelOptions,
    state: ChannelState,
    config: Option<ChannelConfig>,
    display: ChannelBuffer,
    parsed: ChannelBuffer,
    parser: Option<Box<dyn SentenceParser>>,
    sink: Option<LogWriter>,
    rx: Option<Receiver<ReaderEvent>>,
    reader: Option<ReaderHandle>,
    auto_save: bool,
    receiving: bool,
    display_paused: bool,
    /// Bytes applied since the last connect
    bytes_received: u64,
    status: Option<String>,
    /// Events raised outside `poll()`, delivered by the next call
    pending_events: Vec<ChannelEvent>,
}

impl ChannelSupervisor {
    pub fn new(index: usize, backend: Arc<dyn PortBackend>, options: ChannelOptions) -> Self {
        let parser = options.parse_nmea.then(|| new_parser(&options));
        Self {
            index,
            backend,
            display: ChannelBuffer::new(options.display_soft_max, options.truncate_factor),
            parsed: ChannelBuffer::new(options.parsed_soft_max, options.truncate_factor),
            options,
            state: ChannelState::Idle,
            config: None,
            parser,
            sink: None,
            rx: None,
            reader: None,
            auto_save: false,
            receiving: true,
            display_paused: false,
            bytes_received: 0,
            status: None,
            pending_events: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open `config.port` and start streaming.
    ///
    /// Only valid from Idle or Faulted. An open failure leaves the channel
    /// Faulted with the reason as its status; it can be retried right away.
    pub fn connect(&mut self, config: ChannelConfig) -> Result<(), SupervisorError> {
        if !self.state.can_connect() {
            return Err(SupervisorError::InvalidState {
                index: self.index,
                action: "connect",
                state: self.state,
            });
        }

        self.state = ChannelState::Connecting;
        self.status = None;
        tlog!(
            "[Channel:{}] Connecting to {} at {}",
            self.index,
            config.port,
            config.summary()
        );

        let source = match self.backend.open(&config) {
            Ok(source) => source,
            Err(e) => {
                tlog!("[Channel:{}] Connect failed: {}", self.index, e);
                self.state = ChannelState::Faulted;
                self.status = Some(e.to_string());
                return Err(e.into());
            }
        };

        let (tx, rx) = sync_channel(self.options.queue_capacity.max(1));
        let reader = match spawn_reader(self.index, source, self.options.reader.clone(), tx) {
            Ok(reader) => reader,
            Err(e) => {
                tlog!("[Channel:{}] Failed to spawn reader: {}", self.index, e);
                self.state = ChannelState::Faulted;
                self.status = Some(format!("Failed to start reader: {}", e));
                return Err(SupervisorError::Spawn {
                    index: self.index,
                    reason: e.to_string(),
                });
            }
        };

        self.rx = Some(rx);
        self.reader = Some(reader);
        self.config = Some(config);
        self.bytes_received = 0;
        if let Some(parser) = self.parser.as_mut() {
            parser.reset();
        }
        if self.auto_save {
            self.open_sink();
        }
        self.state = ChannelState::Connected;
        Ok(())
    }

    /// Stop streaming and release the device. No-op when Idle.
    ///
    /// Data the reader already queued is applied before the capture file
    /// closes. From Faulted this just acknowledges the fault.
    pub fn disconnect(&mut self) {
        if self.state == ChannelState::Idle {
            return;
        }
        self.teardown();
        self.state = ChannelState::Idle;
        self.status = None;
        if let Some(config) = &self.config {
            tlog!("[Channel:{}] Disconnected from {}", self.index, config.port);
        }
    }

    /// Terminal read failure: tear down and land in Faulted.
    pub fn on_error(&mut self, message: &str) {
        self.teardown();
        self.state = ChannelState::Faulted;
        self.status = Some(message.to_string());

        let port = self.port().unwrap_or_default().to_string();
        tlog!("[Channel:{}] Faulted on {}: {}", self.index, port, message);
        self.pending_events.push(ChannelEvent::Faulted {
            index: self.index,
            port,
            message: message.to_string(),
        });
    }

    /// Force a disconnect because the device left enumeration.
    /// Returns the notification when the channel was actually connected.
    pub fn handle_device_lost(&mut self) -> Option<ChannelEvent> {
        if self.state != ChannelState::Connected {
            return None;
        }
        let port = self.port().unwrap_or_default().to_string();
        self.teardown();
        self.state = ChannelState::Idle;
        self.status = Some(format!("{} is no longer present", port));
        tlog!("[Channel:{}] Device {} disappeared, disconnected", self.index, port);
        Some(ChannelEvent::DeviceDisappeared {
            index: self.index,
            port,
        })
    }

    /// Stop the reader, drain its queue, close the sink.
    fn teardown(&mut self) {
        if self.reader.is_some() || self.sink.is_some() {
            self.state = ChannelState::Disconnecting;
        }

        if let Some(reader) = self.reader.take() {
            reader.request_stop();
            let deadline = Instant::now() + self.options.disconnect_timeout;
            while !reader.is_finished() && Instant::now() < deadline {
                self.drain_queued_data();
                std::thread::sleep(Duration::from_millis(2));
            }
            reader.finish();
        }

        self.drain_queued_data();
        self.rx = None;
        self.close_sink();
    }

    /// Apply every Data event already queued. Errors are moot once stopping.
    fn drain_queued_data(&mut self) {
        let Some(rx) = self.rx.as_ref() else {
            return;
        };
        let queued: Vec<ReaderEvent> = rx.try_iter().collect();
        let mut bytes = 0;
        for event in queued {
            if let ReaderEvent::Data(text) = event {
                bytes += self.on_data(&text);
            }
        }
        if bytes > 0 {
            self.pending_events.push(ChannelEvent::Received {
                index: self.index,
                bytes,
            });
        }
    }

    // ------------------------------------------------------------------------
    // Data Path
    // ------------------------------------------------------------------------

    /// Apply pending reader output. Call regularly from the consumer context.
    pub fn poll(&mut self) -> Vec<ChannelEvent> {
        let mut events = std::mem::take(&mut self.pending_events);
        let Some(rx) = self.rx.as_ref() else {
            return events;
        };

        let max_events = self.options.max_events_per_poll.max(1);
        let mut batch = Vec::new();
        let mut reader_gone = false;
        while batch.len() < max_events {
            match rx.try_recv() {
                Ok(event) => {
                    let is_error = matches!(event, ReaderEvent::Error(_));
                    batch.push(event);
                    if is_error {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    reader_gone = true;
                    break;
                }
            }
        }

        let mut bytes = 0;
        let mut failure = None;
        for event in batch {
            match event {
                ReaderEvent::Data(text) => bytes += self.on_data(&text),
                ReaderEvent::Error(e) => failure = Some(e.to_string()),
            }
        }
        if bytes > 0 {
            events.push(ChannelEvent::Received {
                index: self.index,
                bytes,
            });
        }
        events.append(&mut self.pending_events);

        if failure.is_none() && reader_gone && self.state == ChannelState::Connected {
            failure = Some("reader stopped unexpectedly".to_string());
        }
        if let Some(message) = failure {
            self.on_error(&message);
            events.append(&mut self.pending_events);
        }
        events
    }

    /// Route one decoded chunk. Returns the bytes applied (0 when dropped).
    pub fn on_data(&mut self, text: &str) -> usize {
        if !self.receiving || text.is_empty() {
            return 0;
        }
        self.bytes_received += text.len() as u64;

        if !self.display_paused {
            self.display.append(text);
        }

        let max_file_size = self.options.max_log_file_size;
        let written = match self.sink.as_mut() {
            Some(sink) => sink
                .write(text)
                .and_then(|_| sink.rollover_if_exceeded(max_file_size))
                .map(|_| ()),
            None => Ok(()),
        };
        if let Err(e) = written {
            // Stop capturing; a failed disk tends to keep failing
            self.sink.take();
            self.report_sink_error(e);
        }

        if let Some(parser) = self.parser.as_mut() {
            if let Some(rendered) = parser.parse(text) {
                self.parsed.append(&rendered);
            }
        }
        text.len()
    }

    // ------------------------------------------------------------------------
    // Capture File
    // ------------------------------------------------------------------------

    fn open_sink(&mut self) {
        let Some(port) = self.config.as_ref().map(|c| c.port.clone()) else {
            return;
        };
        match LogWriter::open_with_threshold(
            &self.options.log_dir,
            &port,
            self.options.log_flush_threshold,
        ) {
            Ok(writer) => self.sink = Some(writer),
            Err(e) => self.report_sink_error(e),
        }
    }

    fn close_sink(&mut self) {
        if let Some(mut writer) = self.sink.take() {
            if let Err(e) = writer.close() {
                self.report_sink_error(e);
            }
        }
    }

    fn report_sink_error(&mut self, e: SinkError) {
        tlog!("[Channel:{}] Capture failed: {}", self.index, e);
        let message = e.to_string();
        self.status = Some(message.clone());
        self.pending_events.push(ChannelEvent::SinkError {
            index: self.index,
            message,
        });
    }

    /// Toggle capture. While Connected the file opens or closes immediately.
    pub fn set_auto_save(&mut self, enabled: bool) {
        self.auto_save = enabled;
        if self.state != ChannelState::Connected {
            return;
        }
        if enabled && self.sink.is_none() {
            self.open_sink();
        } else if !enabled {
            self.close_sink();
        }
    }

    /// Set the capture flag without touching files; applies at the next connect.
    pub fn set_auto_save_flag(&mut self, enabled: bool) {
        self.auto_save = enabled;
    }

    // ------------------------------------------------------------------------
    // Display Controls
    // ------------------------------------------------------------------------

    pub fn pause(&mut self) {
        self.display_paused = true;
    }

    pub fn resume(&mut self) {
        self.display_paused = false;
    }

    /// When off, incoming chunks are discarded before any buffer or file sees them.
    pub fn set_receiving(&mut self, enabled: bool) {
        self.receiving = enabled;
    }

    pub fn set_parse_nmea(&mut self, enabled: bool) {
        match (enabled, self.parser.is_some()) {
            (true, false) => self.parser = Some(new_parser(&self.options)),
            (false, true) => self.parser = None,
            _ => {}
        }
    }

    pub fn clear(&mut self) {
        self.display.clear();
        self.parsed.clear();
    }

    pub fn clear_status(&mut self) {
        self.status = None;
    }

    pub fn export_display(&self, path: &Path) -> Result<(), SupervisorError> {
        export_text(path, self.display.as_str())
    }

    pub fn export_parsed(&self, path: &Path) -> Result<(), SupervisorError> {
        export_text(path, self.parsed.as_str())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn config(&self) -> Option<&ChannelConfig> {
        self.config.as_ref()
    }

    /// Device of the current or most recent connection
    pub fn port(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.port.as_str())
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn display(&self) -> &ChannelBuffer {
        &self.display
    }

    pub fn parsed(&self) -> &ChannelBuffer {
        &self.parsed
    }

    pub fn auto_save(&self) -> bool {
        self.auto_save
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn is_display_paused(&self) -> bool {
        self.display_paused
    }

    pub fn parses_nmea(&self) -> bool {
        self.parser.is_some()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|s| s.path())
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let config = self.config.as_ref();
        ChannelSnapshot {
            index: self.index,
            state: self.state,
            port: config.map(|c| c.port.clone()),
            baud_rate: config.map(|c| c.baud_rate),
            byte_size: config.map(|c| c.byte_size),
            parity: config.map(|c| c.parity),
            stop_bits: config.map(|c| c.stop_bits),
            receiving: self.receiving,
            display_paused: self.display_paused,
            auto_save: self.auto_save,
            parse_nmea: self.parses_nmea(),
            bytes_received: self.bytes_received,
            display_len: self.display.current_length(),
            parsed_len: self.parsed.current_length(),
            log_path: self.log_path().map(|p| p.display().to_string()),
            status: self.status.clone(),
        }
    }
}

impl Drop for ChannelSupervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn new_parser(options: &ChannelOptions) -> Box<dyn SentenceParser> {
    Box::new(NmeaParser::new().with_checksum_verification(options.verify_nmea_checksum))
}

fn export_text(path: &Path, text: &str) -> Result<(), SupervisorError> {
    std::fs::write(path, text).map_err(|e| SupervisorError::Export {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ByteSource, MemoryBackend, PortClaim, ReadError};

    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

    fn test_options(log_dir: &Path) -> ChannelOptions {
        ChannelOptions {
            log_dir: log_dir.to_path_buf(),
            log_flush_threshold: 16,
            disconnect_timeout: Duration::from_secs(1),
            reader: ReaderOptions {
                poll_interval: Duration::from_millis(2),
                chunk_size: 64,
                max_read_retries: 1,
                retry_backoff: Duration::from_millis(1),
            },
            ..ChannelOptions::default()
        }
    }

    fn supervisor(backend: &MemoryBackend, log_dir: &Path) -> ChannelSupervisor {
        ChannelSupervisor::new(0, Arc::new(backend.clone()), test_options(log_dir))
    }

    fn poll_until(
        sup: &mut ChannelSupervisor,
        mut done: impl FnMut(&ChannelSupervisor) -> bool,
    ) -> Vec<ChannelEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            events.extend(sup.poll());
            if done(sup) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        events
    }

    #[test]
    fn test_disconnect_when_idle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(&MemoryBackend::new(), dir.path());
        sup.disconnect();
        sup.disconnect();
        assert_eq!(sup.state(), ChannelState::Idle);
        assert!(sup.poll().is_empty());
    }

    #[test]
    fn test_data_reaches_display_and_capture_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-flow");
        let mut sup = supervisor(&backend, dir.path());
        sup.set_auto_save(true);
        sup.connect(ChannelConfig::new("sup-flow", 9600)).unwrap();
        assert_eq!(sup.state(), ChannelState::Connected);
        let log_path = sup.log_path().unwrap().to_path_buf();

        backend.push_bytes("sup-flow", b"hello ");
        backend.push_bytes("sup-flow", b"world\n");
        let events = poll_until(&mut sup, |s| s.display().as_str() == "hello world\n");
        assert_eq!(sup.display().as_str(), "hello world\n");
        let received: usize = events
            .iter()
            .map(|e| match e {
                ChannelEvent::Received { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum();
        assert_eq!(received, 12);

        sup.disconnect();
        assert_eq!(sup.state(), ChannelState::Idle);
        assert!(!backend.is_claimed("sup-flow"));
        assert_eq!(std::fs::read_to_string(log_path).unwrap(), "hello world\n");
    }

    #[test]
    fn test_connect_while_connected_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-twice");
        let mut sup = supervisor(&backend, dir.path());
        sup.connect(ChannelConfig::new("sup-twice", 9600)).unwrap();
        let err = sup.connect(ChannelConfig::new("sup-twice", 9600)).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::InvalidState {
                state: ChannelState::Connected,
                ..
            }
        ));
        assert_eq!(sup.state(), ChannelState::Connected);
    }

    #[test]
    fn test_failed_open_faults_and_can_retry() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut sup = supervisor(&backend, dir.path());

        let err = sup.connect(ChannelConfig::new("sup-retry", 9600)).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Connect(ConnectError::PortNotFound { .. })
        ));
        assert_eq!(sup.state(), ChannelState::Faulted);
        assert!(sup.status().unwrap().contains("not found"));

        backend.add_device("sup-retry");
        sup.connect(ChannelConfig::new("sup-retry", 9600)).unwrap();
        assert_eq!(sup.state(), ChannelState::Connected);
        assert!(sup.status().is_none());
    }

    #[test]
    fn test_second_channel_on_same_port_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-busy");
        let mut first = supervisor(&backend, dir.path());
        let mut second = ChannelSupervisor::new(1, Arc::new(backend.clone()), test_options(dir.path()));

        first.connect(ChannelConfig::new("sup-busy", 9600)).unwrap();
        let err = second.connect(ChannelConfig::new("sup-busy", 9600)).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Connect(ConnectError::PortBusy { .. })
        ));
        assert_eq!(second.state(), ChannelState::Faulted);
        assert_eq!(first.state(), ChannelState::Connected);

        first.disconnect();
        second.connect(ChannelConfig::new("sup-busy", 9600)).unwrap();
    }

    #[test]
    fn test_terminal_read_error_faults_channel() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-fault");
        let mut sup = supervisor(&backend, dir.path());
        sup.connect(ChannelConfig::new("sup-fault", 9600)).unwrap();

        backend.push_bytes("sup-fault", b"last words\n");
        backend.push_error("sup-fault", ReadError::Terminal("device reports an error".to_string()));
        let events = poll_until(&mut sup, |s| s.state() == ChannelState::Faulted);

        assert_eq!(sup.state(), ChannelState::Faulted);
        assert_eq!(sup.display().as_str(), "last words\n");
        assert!(sup.status().unwrap().contains("device reports an error"));
        assert!(events.iter().any(|e| matches!(
            e,
            ChannelEvent::Faulted { port, .. } if port == "sup-fault"
        )));
        assert!(!backend.is_claimed("sup-fault"));

        sup.disconnect();
        assert_eq!(sup.state(), ChannelState::Idle);
    }

    #[test]
    fn test_disconnect_applies_queued_data() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-drain");
        let mut sup = supervisor(&backend, dir.path());
        sup.set_auto_save(true);
        sup.connect(ChannelConfig::new("sup-drain", 9600)).unwrap();
        let log_path = sup.log_path().unwrap().to_path_buf();

        backend.push_bytes("sup-drain", b"queued but never polled\n");
        std::thread::sleep(Duration::from_millis(100));
        sup.disconnect();

        assert_eq!(sup.display().as_str(), "queued but never polled\n");
        assert_eq!(
            std::fs::read_to_string(log_path).unwrap(),
            "queued but never polled\n"
        );
        assert!(matches!(sup.poll().as_slice(), [ChannelEvent::Received { bytes: 24, .. }]));
    }

    #[test]
    fn test_pause_freezes_display_only() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-pause");
        let mut sup = supervisor(&backend, dir.path());
        sup.set_parse_nmea(true);
        sup.set_auto_save(true);
        sup.connect(ChannelConfig::new("sup-pause", 9600)).unwrap();
        let log_path = sup.log_path().unwrap().to_path_buf();

        sup.pause();
        backend.push_bytes("sup-pause", RMC.as_bytes());
        poll_until(&mut sup, |s| s.bytes_received() == RMC.len() as u64);
        assert!(sup.display().is_empty());
        assert!(sup.parsed().as_str().contains("[RMC] Position fix"));

        sup.resume();
        backend.push_bytes("sup-pause", b"after\n");
        poll_until(&mut sup, |s| !s.display().is_empty());
        assert_eq!(sup.display().as_str(), "after\n");

        sup.disconnect();
        let captured = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(captured, format!("{}after\n", RMC));
    }

    #[test]
    fn test_receiving_disabled_drops_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(&MemoryBackend::new(), dir.path());
        sup.set_parse_nmea(true);
        sup.set_receiving(false);
        assert_eq!(sup.on_data(RMC), 0);
        assert!(sup.display().is_empty());
        assert!(sup.parsed().is_empty());
        assert_eq!(sup.bytes_received(), 0);

        sup.set_receiving(true);
        assert_eq!(sup.on_data("x"), 1);
        assert_eq!(sup.display().as_str(), "x");
    }

    #[test]
    fn test_auto_save_toggle_while_connected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-toggle");
        let mut sup = supervisor(&backend, dir.path());
        sup.connect(ChannelConfig::new("sup-toggle", 9600)).unwrap();
        assert!(sup.log_path().is_none());

        sup.set_auto_save(true);
        let path = sup.log_path().unwrap().to_path_buf();
        sup.on_data("captured\n");
        sup.set_auto_save(false);
        assert!(sup.log_path().is_none());
        sup.on_data("not captured\n");

        assert_eq!(std::fs::read_to_string(path).unwrap(), "captured\n");
    }

    #[test]
    fn test_global_flag_does_not_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-flag");
        let mut sup = supervisor(&backend, dir.path());
        sup.connect(ChannelConfig::new("sup-flag", 9600)).unwrap();
        sup.set_auto_save_flag(true);
        assert!(sup.auto_save());
        assert!(sup.log_path().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sink_failure_does_not_stop_ingestion() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, "file").unwrap();

        let backend = MemoryBackend::new();
        backend.add_device("sup-sinkfail");
        let mut sup = ChannelSupervisor::new(2, Arc::new(backend.clone()), test_options(&blocker));
        sup.set_auto_save(true);
        sup.connect(ChannelConfig::new("sup-sinkfail", 9600)).unwrap();
        assert_eq!(sup.state(), ChannelState::Connected);

        backend.push_bytes("sup-sinkfail", b"still flowing\n");
        let events = poll_until(&mut sup, |s| !s.display().is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, ChannelEvent::SinkError { index: 2, .. })));
        assert_eq!(sup.display().as_str(), "still flowing\n");
        assert_eq!(sup.state(), ChannelState::Connected);
    }

    #[test]
    fn test_export_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-export");
        let mut sup = supervisor(&backend, dir.path());
        sup.connect(ChannelConfig::new("sup-export", 115200).with_parity(Parity::Even))
            .unwrap();
        sup.on_data("line one\nline two\n");

        let out = dir.path().join("session.txt");
        sup.export_display(&out).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "line one\nline two\n");

        let snap = sup.snapshot();
        assert_eq!(snap.port.as_deref(), Some("sup-export"));
        assert_eq!(snap.baud_rate, Some(115200));
        assert_eq!(snap.parity, Some(Parity::Even));
        assert_eq!(snap.bytes_received, 18);
        assert_eq!(snap.display_len, 18);
        assert!(!snap.parse_nmea);

        let err = sup
            .export_parsed(&dir.path().join("missing").join("x.txt"))
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Export { .. }));
    }

    /// Device whose reads block far longer than a disconnect may wait
    struct StuckBackend {
        read_delay: Duration,
    }

    struct StuckSource {
        port: String,
        read_delay: Duration,
        claim: Option<PortClaim>,
    }

    impl PortBackend for StuckBackend {
        fn open(&self, config: &ChannelConfig) -> Result<Box<dyn ByteSource>, ConnectError> {
            let claim = PortClaim::acquire(&config.port)?;
            Ok(Box::new(StuckSource {
                port: config.port.clone(),
                read_delay: self.read_delay,
                claim: Some(claim),
            }))
        }

        fn list_devices(&self) -> Result<Vec<String>, String> {
            Ok(Vec::new())
        }
    }

    impl ByteSource for StuckSource {
        fn port(&self) -> &str {
            &self.port
        }

        fn read_available(&mut self, _max_bytes: usize) -> Result<Vec<u8>, ReadError> {
            std::thread::sleep(self.read_delay);
            Ok(Vec::new())
        }

        fn close(&mut self) {
            self.claim.take();
        }
    }

    #[test]
    fn test_stuck_reader_is_detached_and_releases_device_later() {
        let dir = tempfile::tempdir().unwrap();
        let port = "sup-stuck";
        let mut options = test_options(dir.path());
        options.disconnect_timeout = Duration::from_millis(100);
        let backend = Arc::new(StuckBackend {
            read_delay: Duration::from_millis(800),
        });
        let mut sup = ChannelSupervisor::new(3, backend, options);

        sup.connect(ChannelConfig::new(port, 9600)).unwrap();
        // Let the reader enter its blocking read
        std::thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        sup.disconnect();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(sup.state(), ChannelState::Idle);

        // The detached thread still owns the device
        assert!(PortClaim::is_claimed(port));
        let err = sup.connect(ChannelConfig::new(port, 9600)).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Connect(ConnectError::PortBusy { .. })
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while PortClaim::is_claimed(port) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!PortClaim::is_claimed(port));
    }

    #[test]
    fn test_zero_events_per_poll_still_makes_progress() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-zero-batch");
        let mut options = test_options(dir.path());
        options.max_events_per_poll = 0;
        let mut sup = ChannelSupervisor::new(4, Arc::new(backend.clone()), options);
        sup.connect(ChannelConfig::new("sup-zero-batch", 9600)).unwrap();

        backend.push_bytes("sup-zero-batch", b"one\n");
        poll_until(&mut sup, |s| !s.display().is_empty());
        assert_eq!(sup.display().as_str(), "one\n");
    }

    #[test]
    fn test_parses_nmea_follows_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut sup = supervisor(&backend, dir.path());
        assert!(!sup.parses_nmea());

        sup.set_parse_nmea(true);
        assert!(sup.parses_nmea());
        assert!(sup.snapshot().parse_nmea);

        sup.set_parse_nmea(false);
        assert!(!sup.parses_nmea());
        assert!(!sup.snapshot().parse_nmea);
    }

    #[test]
    fn test_drop_releases_device() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("sup-drop");
        let mut sup = supervisor(&backend, dir.path());
        sup.connect(ChannelConfig::new("sup-drop", 9600)).unwrap();
        assert!(backend.is_claimed("sup-drop"));
        drop(sup);
        assert!(!backend.is_claimed("sup-drop"));
    }
}
