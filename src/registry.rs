// src/registry.rs
//
// Fixed-capacity set of channels.
// Owns one ChannelSupervisor per slot, applies global toggles, re-enumerates
// devices and drives every channel's queue from the consumer context.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::io::{normalize_device_list, ChannelConfig, ChannelEvent, ChannelState, PortBackend, SerialBackend};
use crate::supervisor::{ChannelOptions, ChannelSnapshot, ChannelSupervisor, SupervisorError};

// ============================================================================
// Options & Errors
// ============================================================================

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    pub min_ports: usize,
    pub max_ports: usize,
    pub initial_count: usize,
    /// Auto-save flag given to every channel at creation
    pub auto_save: bool,
    pub channel: ChannelOptions,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            min_ports: 8,
            max_ports: 16,
            initial_count: 8,
            auto_save: false,
            channel: ChannelOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("channel count {count} outside {min}..={max}")]
    CountOutOfRange { count: usize, min: usize, max: usize },

    #[error("no channel {index} (have {count})")]
    NoSuchChannel { index: usize, count: usize },

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error(transparent)]
    Channel(#[from] SupervisorError),
}

/// Result of a device refresh
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefreshOutcome {
    /// Sorted, deduplicated device identifiers
    pub devices: Vec<String>,
    /// One DeviceDisappeared per channel that lost its device
    pub events: Vec<ChannelEvent>,
}

// ============================================================================
// Port Registry
// ============================================================================

pub struct PortRegistry {
    backend: Arc<dyn PortBackend>,
    options: RegistryOptions,
    channels: Vec<ChannelSupervisor>,
    auto_save: bool,
    receiving: bool,
}

impl PortRegistry {
    pub fn new(backend: Arc<dyn PortBackend>, options: RegistryOptions) -> Result<Self, RegistryError> {
        if options.min_ports == 0 || options.min_ports > options.max_ports {
            return Err(RegistryError::CountOutOfRange {
                count: options.initial_count,
                min: options.min_ports,
                max: options.max_ports,
            });
        }
        check_count(options.initial_count, &options)?;

        let mut registry = Self {
            backend,
            auto_save: options.auto_save,
            receiving: true,
            channels: Vec::with_capacity(options.max_ports),
            options,
        };
        for index in 0..registry.options.initial_count {
            let channel = registry.new_channel(index);
            registry.channels.push(channel);
        }
        tlog!("[Registry] Created with {} channels", registry.channels.len());
        Ok(registry)
    }

    /// Registry over the host's serial ports
    pub fn with_serial(options: RegistryOptions) -> Result<Self, RegistryError> {
        Self::new(Arc::new(SerialBackend), options)
    }

    fn new_channel(&self, index: usize) -> ChannelSupervisor {
        let mut channel =
            ChannelSupervisor::new(index, self.backend.clone(), self.options.channel.clone());
        channel.set_auto_save_flag(self.auto_save);
        channel.set_receiving(self.receiving);
        channel
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[ChannelSupervisor] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Result<&ChannelSupervisor, RegistryError> {
        let count = self.channels.len();
        self.channels
            .get(index)
            .ok_or(RegistryError::NoSuchChannel { index, count })
    }

    pub fn channel_mut(&mut self, index: usize) -> Result<&mut ChannelSupervisor, RegistryError> {
        let count = self.channels.len();
        self.channels
            .get_mut(index)
            .ok_or(RegistryError::NoSuchChannel { index, count })
    }

    pub fn connect(&mut self, index: usize, config: ChannelConfig) -> Result<(), RegistryError> {
        self.channel_mut(index)?.connect(config)?;
        Ok(())
    }

    pub fn disconnect(&mut self, index: usize) -> Result<(), RegistryError> {
        self.channel_mut(index)?.disconnect();
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        self.channels.iter().map(|c| c.snapshot()).collect()
    }

    /// Change the number of channels.
    ///
    /// Connected channels that stay in range are kept as they are. Other
    /// in-range channels start over with empty buffers. Channels past the new
    /// count are disconnected and dropped.
    pub fn resize(&mut self, count: usize) -> Result<(), RegistryError> {
        check_count(count, &self.options)?;

        let previous = self.channels.len();
        if count < previous {
            for mut channel in self.channels.drain(count..) {
                channel.disconnect();
            }
        }

        for index in 0..self.channels.len() {
            if self.channels[index].state() != ChannelState::Connected {
                let fresh = self.new_channel(index);
                let mut old = std::mem::replace(&mut self.channels[index], fresh);
                old.disconnect();
            }
        }

        while self.channels.len() < count {
            let channel = self.new_channel(self.channels.len());
            self.channels.push(channel);
        }

        tlog!("[Registry] Resized from {} to {} channels", previous, count);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------------

    pub fn list_available_devices(&self) -> Result<Vec<String>, RegistryError> {
        self.backend
            .list_devices()
            .map(normalize_device_list)
            .map_err(RegistryError::Enumeration)
    }

    /// Re-enumerate devices. Connected channels whose device vanished are
    /// disconnected; every other non-faulted channel gets its status cleared.
    pub fn refresh_all(&mut self) -> Result<RefreshOutcome, RegistryError> {
        let devices = self.list_available_devices()?;
        let present: HashSet<&str> = devices.iter().map(String::as_str).collect();

        let mut events = Vec::new();
        for channel in self.channels.iter_mut() {
            let vanished = channel.state() == ChannelState::Connected
                && channel.port().is_some_and(|p| !present.contains(p));
            if vanished {
                events.extend(channel.handle_device_lost());
            } else if channel.state() != ChannelState::Faulted {
                channel.clear_status();
            }
        }

        tlog!(
            "[Registry] Refresh found {} devices, {} disappeared",
            devices.len(),
            events.len()
        );
        Ok(RefreshOutcome { devices, events })
    }

    // ------------------------------------------------------------------------
    // Global Toggles
    // ------------------------------------------------------------------------

    /// Set every channel's auto-save flag. Takes effect at each channel's next connect.
    pub fn set_global_auto_save(&mut self, enabled: bool) {
        self.auto_save = enabled;
        for channel in self.channels.iter_mut() {
            channel.set_auto_save_flag(enabled);
        }
    }

    pub fn set_global_receiving(&mut self, enabled: bool) {
        self.receiving = enabled;
        for channel in self.channels.iter_mut() {
            channel.set_receiving(enabled);
        }
    }

    pub fn pause_all(&mut self) {
        self.channels.iter_mut().for_each(ChannelSupervisor::pause);
    }

    pub fn resume_all(&mut self) {
        self.channels.iter_mut().for_each(ChannelSupervisor::resume);
    }

    pub fn clear_all(&mut self) {
        self.channels.iter_mut().for_each(ChannelSupervisor::clear);
    }

    pub fn auto_save(&self) -> bool {
        self.auto_save
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    // ------------------------------------------------------------------------
    // Consumer Loop
    // ------------------------------------------------------------------------

    /// Apply queued reader output on every channel.
    pub fn pump(&mut self) -> Vec<ChannelEvent> {
        self.channels.iter_mut().flat_map(|c| c.poll()).collect()
    }

    /// Disconnect every channel.
    pub fn shutdown(&mut self) {
        let connected = self
            .channels
            .iter()
            .filter(|c| c.state() != ChannelState::Idle)
            .count();
        for channel in self.channels.iter_mut() {
            channel.disconnect();
        }
        if connected > 0 {
            tlog!("[Registry] Shut down {} channels", connected);
        }
    }
}

impl Drop for PortRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_count(count: usize, options: &RegistryOptions) -> Result<(), RegistryError> {
    if count < options.min_ports || count > options.max_ports {
        return Err(RegistryError::CountOutOfRange {
            count,
            min: options.min_ports,
            max: options.max_ports,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::ReaderOptions;
    use crate::io::MemoryBackend;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn options(log_dir: &Path) -> RegistryOptions {
        RegistryOptions {
            min_ports: 2,
            max_ports: 6,
            initial_count: 4,
            auto_save: false,
            channel: ChannelOptions {
                log_dir: log_dir.to_path_buf(),
                disconnect_timeout: Duration::from_secs(1),
                reader: ReaderOptions {
                    poll_interval: Duration::from_millis(2),
                    ..ReaderOptions::default()
                },
                ..ChannelOptions::default()
            },
        }
    }

    fn registry(backend: &MemoryBackend, log_dir: &Path) -> PortRegistry {
        PortRegistry::new(Arc::new(backend.clone()), options(log_dir)).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_counts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let mut opts = options(dir.path());
        opts.initial_count = 9;
        assert!(matches!(
            PortRegistry::new(backend.clone(), opts),
            Err(RegistryError::CountOutOfRange { count: 9, .. })
        ));

        let mut opts = options(dir.path());
        opts.min_ports = 0;
        assert!(PortRegistry::new(backend, opts).is_err());
    }

    #[test]
    fn test_resize_keeps_connected_channels() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("reg-keep");
        let mut reg = registry(&backend, dir.path());

        reg.connect(1, ChannelConfig::new("reg-keep", 9600)).unwrap();
        reg.channel_mut(1).unwrap().on_data("kept\n");
        reg.channel_mut(0).unwrap().on_data("rebuilt\n");

        reg.resize(6).unwrap();
        assert_eq!(reg.len(), 6);
        assert_eq!(reg.channel(1).unwrap().state(), ChannelState::Connected);
        assert_eq!(reg.channel(1).unwrap().display().as_str(), "kept\n");
        assert!(reg.channel(0).unwrap().display().is_empty());

        reg.resize(2).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.channel(1).unwrap().state(), ChannelState::Connected);
        assert!(backend.is_claimed("reg-keep"));

        assert!(matches!(
            reg.resize(7),
            Err(RegistryError::CountOutOfRange { count: 7, min: 2, max: 6 })
        ));
        assert!(matches!(reg.resize(1), Err(RegistryError::CountOutOfRange { .. })));
    }

    #[test]
    fn test_resize_down_disconnects_dropped_channels() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("reg-dropped");
        let mut reg = registry(&backend, dir.path());
        reg.connect(3, ChannelConfig::new("reg-dropped", 9600)).unwrap();
        assert!(backend.is_claimed("reg-dropped"));

        reg.resize(3).unwrap();
        assert!(!backend.is_claimed("reg-dropped"));
        assert!(matches!(
            reg.channel(3),
            Err(RegistryError::NoSuchChannel { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_list_available_devices_is_sorted_and_unique() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("reg-list-b");
        backend.add_device("reg-list-a");
        backend.add_device("reg-list-b");
        let reg = registry(&backend, dir.path());
        let first = reg.list_available_devices().unwrap();
        assert_eq!(first, vec!["reg-list-a", "reg-list-b"]);
        assert_eq!(reg.list_available_devices().unwrap(), first);
    }

    #[test]
    fn test_refresh_disconnects_vanished_devices() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("reg-vanish");
        backend.add_device("reg-stays");
        let mut reg = registry(&backend, dir.path());
        reg.connect(0, ChannelConfig::new("reg-vanish", 9600)).unwrap();
        reg.connect(1, ChannelConfig::new("reg-stays", 9600)).unwrap();
        // Channel 2 faults on open and must keep its message
        let _ = reg.connect(2, ChannelConfig::new("reg-never-there", 9600));

        backend.remove_device("reg-vanish");
        let outcome = reg.refresh_all().unwrap();

        assert_eq!(outcome.devices, vec!["reg-stays"]);
        assert_eq!(
            outcome.events,
            vec![ChannelEvent::DeviceDisappeared {
                index: 0,
                port: "reg-vanish".to_string()
            }]
        );
        assert!(!outcome
            .events
            .iter()
            .any(|e| matches!(e, ChannelEvent::Faulted { .. })));

        let lost = reg.channel(0).unwrap();
        assert_eq!(lost.state(), ChannelState::Idle);
        assert!(lost.status().unwrap().contains("reg-vanish"));
        assert!(!backend.is_claimed("reg-vanish"));

        assert_eq!(reg.channel(1).unwrap().state(), ChannelState::Connected);
        assert_eq!(reg.channel(2).unwrap().state(), ChannelState::Faulted);
        assert!(reg.channel(2).unwrap().status().is_some());

        // A second refresh clears the message of the now idle channel
        let outcome = reg.refresh_all().unwrap();
        assert!(outcome.events.is_empty());
        assert!(reg.channel(0).unwrap().status().is_none());
    }

    #[test]
    fn test_global_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let mut reg = registry(&backend, dir.path());

        reg.set_global_auto_save(true);
        assert!(reg.channels().iter().all(|c| c.auto_save()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        reg.set_global_receiving(false);
        reg.channel_mut(0).unwrap().on_data("ignored");
        assert!(reg.channel(0).unwrap().display().is_empty());

        reg.set_global_receiving(true);
        reg.pause_all();
        reg.channel_mut(0).unwrap().on_data("hidden");
        assert!(reg.channel(0).unwrap().display().is_empty());
        reg.resume_all();
        reg.channel_mut(0).unwrap().on_data("shown");
        assert_eq!(reg.channel(0).unwrap().display().as_str(), "shown");

        reg.clear_all();
        assert!(reg.channels().iter().all(|c| c.display().is_empty()));

        // New channels inherit the global flags
        reg.resize(6).unwrap();
        assert!(reg.channel(5).unwrap().auto_save());
    }

    #[test]
    fn test_pump_collects_events_from_all_channels() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("reg-pump-a");
        backend.add_device("reg-pump-b");
        let mut reg = registry(&backend, dir.path());
        reg.connect(0, ChannelConfig::new("reg-pump-a", 9600)).unwrap();
        reg.connect(2, ChannelConfig::new("reg-pump-b", 9600)).unwrap();

        backend.push_bytes("reg-pump-a", b"alpha\n");
        backend.push_bytes("reg-pump-b", b"bravo\n");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = HashSet::new();
        while seen.len() < 2 && Instant::now() < deadline {
            for event in reg.pump() {
                seen.insert(event.index());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(seen, HashSet::from([0, 2]));
        assert_eq!(reg.channel(0).unwrap().display().as_str(), "alpha\n");
        assert_eq!(reg.channel(2).unwrap().display().as_str(), "bravo\n");
    }

    #[test]
    fn test_shutdown_and_drop_release_devices() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        backend.add_device("reg-shutdown-a");
        backend.add_device("reg-shutdown-b");
        let mut reg = registry(&backend, dir.path());
        reg.connect(0, ChannelConfig::new("reg-shutdown-a", 9600)).unwrap();
        reg.shutdown();
        assert!(!backend.is_claimed("reg-shutdown-a"));
        assert!(reg.channels().iter().all(|c| c.state() == ChannelState::Idle));

        reg.connect(1, ChannelConfig::new("reg-shutdown-b", 9600)).unwrap();
        drop(reg);
        assert!(!backend.is_claimed("reg-shutdown-b"));
    }

    #[test]
    fn test_bad_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&MemoryBackend::new(), dir.path());
        assert!(matches!(
            reg.connect(10, ChannelConfig::new("reg-nowhere", 9600)),
            Err(RegistryError::NoSuchChannel { index: 10, count: 4 })
        ));
        assert!(reg.disconnect(10).is_err());
        assert!(reg.disconnect(0).is_ok());
    }
}
