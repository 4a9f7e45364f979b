// src/settings.rs
//
// Application settings, persisted as TOML.
// Every field has a default so older or hand-written files keep loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{DEFAULT_FLUSH_THRESHOLD, DEFAULT_LOG_DIR, DEFAULT_MAX_FILE_SIZE};
use crate::io::serial::ReaderOptions;
use crate::registry::RegistryOptions;
use crate::supervisor::ChannelOptions;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    // Capture files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_max_log_file_size")]
    pub max_log_file_size: u64, // bytes
    #[serde(default = "default_log_flush_threshold")]
    pub log_flush_threshold: usize, // bytes
    #[serde(default)]
    pub auto_save: bool,

    // Buffers
    #[serde(default = "default_display_soft_max")]
    pub display_soft_max: usize, // bytes
    #[serde(default = "default_parsed_soft_max")]
    pub parsed_soft_max: usize, // bytes
    #[serde(default = "default_truncate_factor")]
    pub truncate_factor: f64,

    // Reader loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_events_per_poll")]
    pub max_events_per_poll: usize,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    // Registry
    #[serde(default = "default_port_count")]
    pub port_count: usize,
    #[serde(default = "default_min_ports")]
    pub min_ports: usize,
    #[serde(default = "default_max_ports")]
    pub max_ports: usize,
    #[serde(default = "default_baud_rate")]
    pub default_baud_rate: u32,

    // NMEA
    #[serde(default)]
    pub parse_nmea: bool,
    #[serde(default)]
    pub verify_nmea_checksum: bool,
}

fn default_log_dir() -> String {
    DEFAULT_LOG_DIR.to_string()
}
fn default_max_log_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}
fn default_log_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}
fn default_display_soft_max() -> usize {
    100_000
}
fn default_parsed_soft_max() -> usize {
    50_000
}
fn default_truncate_factor() -> f64 {
    crate::buffers::DEFAULT_TRUNCATE_FACTOR
}
fn default_poll_interval_ms() -> u64 {
    20
}
fn default_read_chunk_size() -> usize {
    1024
}
fn default_max_read_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_events_per_poll() -> usize {
    64
}
fn default_disconnect_timeout_ms() -> u64 {
    1500
}
fn default_port_count() -> usize {
    8
}
fn default_min_ports() -> usize {
    8
}
fn default_max_ports() -> usize {
    16
}
fn default_baud_rate() -> u32 {
    9600
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            max_log_file_size: default_max_log_file_size(),
            log_flush_threshold: default_log_flush_threshold(),
            auto_save: false,
            display_soft_max: default_display_soft_max(),
            parsed_soft_max: default_parsed_soft_max(),
            truncate_factor: default_truncate_factor(),
            poll_interval_ms: default_poll_interval_ms(),
            read_chunk_size: default_read_chunk_size(),
            max_read_retries: default_max_read_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            queue_capacity: default_queue_capacity(),
            max_events_per_poll: default_max_events_per_poll(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            port_count: default_port_count(),
            min_ports: default_min_ports(),
            max_ports: default_max_ports(),
            default_baud_rate: default_baud_rate(),
            parse_nmea: false,
            verify_nmea_checksum: false,
        }
    }
}

impl AppSettings {
    /// Per-channel tuning derived from these settings
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            display_soft_max: self.display_soft_max,
            parsed_soft_max: self.parsed_soft_max,
            truncate_factor: self.truncate_factor,
            log_dir: PathBuf::from(&self.log_dir),
            max_log_file_size: self.max_log_file_size,
            log_flush_threshold: self.log_flush_threshold.max(1),
            queue_capacity: self.queue_capacity.max(1),
            max_events_per_poll: self.max_events_per_poll.max(1),
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
            parse_nmea: self.parse_nmea,
            verify_nmea_checksum: self.verify_nmea_checksum,
            reader: ReaderOptions {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                chunk_size: self.read_chunk_size.max(1),
                max_read_retries: self.max_read_retries,
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }

    /// Registry limits derived from these settings
    pub fn registry_options(&self) -> RegistryOptions {
        let min_ports = self.min_ports.max(1);
        let max_ports = self.max_ports.max(min_ports);
        RegistryOptions {
            min_ports,
            max_ports,
            initial_count: self.port_count.clamp(min_ports, max_ports),
            auto_save: self.auto_save,
            channel: self.channel_options(),
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// `<config dir>/serialmux/settings.toml`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("serialmux").join("settings.toml"))
}

/// Load settings, falling back to defaults when the file does not exist.
pub fn load_settings(path: &Path) -> Result<AppSettings, String> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read settings {}: {}", path.display(), e))?;
    toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse settings {}: {}", path.display(), e))
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let contents = toml::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    std::fs::write(path, contents)
        .map_err(|e| format!("Failed to write settings {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.log_dir, "serial_logs");
        assert_eq!(settings.max_log_file_size, 500 * 1024 * 1024);
        assert_eq!(settings.truncate_factor, 1.2);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "port_count = 12\nparse_nmea = true\n").unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.port_count, 12);
        assert!(settings.parse_nmea);
        assert_eq!(settings.display_soft_max, 100_000);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = AppSettings {
            auto_save: true,
            max_ports: 12,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "port_count = \"many\"").unwrap();
        assert!(load_settings(&path).unwrap_err().contains("Failed to parse settings"));
    }

    #[test]
    fn test_registry_options_clamps_counts() {
        let settings = AppSettings {
            port_count: 40,
            min_ports: 8,
            max_ports: 16,
            ..AppSettings::default()
        };
        let opts = settings.registry_options();
        assert_eq!(opts.initial_count, 16);

        let settings = AppSettings {
            min_ports: 0,
            max_ports: 0,
            port_count: 0,
            ..AppSettings::default()
        };
        let opts = settings.registry_options();
        assert_eq!((opts.min_ports, opts.max_ports, opts.initial_count), (1, 1, 1));
    }

    #[test]
    fn test_channel_options_mapping() {
        let opts = AppSettings::default().channel_options();
        assert_eq!(opts.reader.poll_interval, Duration::from_millis(20));
        assert_eq!(opts.reader.chunk_size, 1024);
        assert_eq!(opts.disconnect_timeout, Duration::from_millis(1500));
        assert_eq!(opts.log_dir, PathBuf::from("serial_logs"));
    }
}
