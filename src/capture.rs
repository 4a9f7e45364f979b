// src/capture.rs
//
// Per-channel capture files.
// Append-only UTF-8 text, batched writes, size-triggered rollover to a new
// timestamped file. Only the channel's consumer context touches the file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::io::SinkError;

/// Default rollover size (500 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;
/// Pending bytes that trigger a write to disk
pub const DEFAULT_FLUSH_THRESHOLD: usize = 8 * 1024;
/// Default capture directory, relative to the working directory
pub const DEFAULT_LOG_DIR: &str = "serial_logs";

/// Characters that are unsafe in a filename on at least one common host
const UNSAFE_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Turn a device identifier into a filename stem.
/// `/dev/ttyUSB0` becomes `dev_ttyUSB0`, `COM3` stays `COM3`.
pub fn sanitize_label(label: &str) -> String {
    let replaced: String = label
        .chars()
        .map(|c| {
            if UNSAFE_FILENAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim_start_matches(['_', '.']).trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "port".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `{dir}/{stem}_{YYYYMMDD_HHMMSS}.log`, suffixed `_1`, `_2`, ... if taken
fn unique_log_path(dir: &Path, stem: &str) -> PathBuf {
    let base = format!("{}_{}", stem, chrono::Local::now().format("%Y%m%d_%H%M%S"));
    let mut candidate = dir.join(format!("{}.log", base));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}.log", base, n));
        n += 1;
    }
    candidate
}

fn open_append(path: &Path) -> Result<File, SinkError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SinkError::new(path.display().to_string(), &e))
}

// ============================================================================
// Log Writer
// ============================================================================

/// Rotating capture file for one channel
pub struct LogWriter {
    dir: PathBuf,
    stem: String,
    path: PathBuf,
    file: Option<File>,
    pending: Vec<u8>,
    flush_threshold: usize,
    /// Bytes accepted for the current file, flushed or not
    bytes_written: u64,
}

impl LogWriter {
    /// Create `dir` if needed and open a fresh file for `label`.
    pub fn open(dir: &Path, label: &str) -> Result<Self, SinkError> {
        Self::open_with_threshold(dir, label, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn open_with_threshold(
        dir: &Path,
        label: &str,
        flush_threshold: usize,
    ) -> Result<Self, SinkError> {
        std::fs::create_dir_all(dir).map_err(|e| SinkError::new(dir.display().to_string(), &e))?;
        let stem = sanitize_label(label);
        let path = unique_log_path(dir, &stem);
        let file = open_append(&path)?;

        tlog!("[Capture] Opened {}", path.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            stem,
            path,
            file: Some(file),
            pending: Vec::with_capacity(flush_threshold),
            flush_threshold,
            bytes_written: 0,
        })
    }

    /// Queue text for the current file. Returns the number of bytes accepted.
    pub fn write(&mut self, text: &str) -> Result<usize, SinkError> {
        if self.file.is_none() {
            return Err(SinkError {
                path: self.path.display().to_string(),
                reason: "capture file is closed".to_string(),
            });
        }
        self.pending.extend_from_slice(text.as_bytes());
        self.bytes_written += text.len() as u64;
        if self.pending.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(text.len())
    }

    /// Write pending bytes to the current file.
    /// On failure the pending bytes are discarded; capture is best-effort.
    pub fn flush(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.write_all(&pending)
            .and_then(|_| file.flush())
            .map_err(|e| SinkError::new(self.path.display().to_string(), &e))
    }

    /// Start a new file once the current one has reached `max_bytes`.
    /// Everything accepted so far lands in the old file first.
    /// Returns true when a new file was opened.
    pub fn rollover_if_exceeded(&mut self, max_bytes: u64) -> Result<bool, SinkError> {
        if self.bytes_written < max_bytes {
            return Ok(false);
        }
        self.flush()?;
        self.file.take();

        let previous = std::mem::replace(&mut self.path, unique_log_path(&self.dir, &self.stem));
        self.file = Some(open_append(&self.path)?);
        self.bytes_written = 0;

        tlog!(
            "[Capture] Rolled over {} -> {}",
            previous.display(),
            self.path.display()
        );
        Ok(true)
    }

    /// Flush and close. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), SinkError> {
        let result = self.flush();
        if self.file.take().is_some() {
            tlog!("[Capture] Closed {}", self.path.display());
        }
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
