// src/io/serial/reader.rs
//
// Per-channel reader thread.
// Polls a byte source, decodes what arrives and hands the text to the
// channel's consumer through a bounded queue. The thread owns the source
// exclusively and closes it on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::decoder::LineDecoder;
use crate::io::types::ReaderEvent;
use crate::io::ByteSource;

// ============================================================================
// Options
// ============================================================================

/// Tuning for the poll loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Sleep when no data is available
    pub poll_interval: Duration,
    /// Upper bound on bytes taken per read
    pub chunk_size: usize,
    /// Consecutive transient failures tolerated before the error is terminal
    pub max_read_retries: u32,
    /// Base backoff; attempt `n` sleeps `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            chunk_size: 1024,
            max_read_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

// ============================================================================
// Reader Handle
// ============================================================================

/// Control side of a running reader thread
pub struct ReaderHandle {
    index: usize,
    port: String,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Ask the loop to exit at its next iteration boundary
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Join a finished thread, or detach one that is still running.
    /// Returns true when the thread had exited.
    pub fn finish(mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        if handle.is_finished() {
            if handle.join().is_err() {
                tlog!("[Serial:{}] Reader thread for {} panicked", self.index, self.port);
            }
            true
        } else {
            // Stop flag stays set; the thread releases the device when it returns
            tlog!(
                "[Serial:{}] Reader for {} did not exit in time, detaching",
                self.index,
                self.port
            );
            false
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Reader Loop
// ============================================================================

/// Spawn the reader thread for one channel.
pub fn spawn_reader(
    index: usize,
    source: Box<dyn ByteSource>,
    options: ReaderOptions,
    tx: SyncSender<ReaderEvent>,
) -> std::io::Result<ReaderHandle> {
    let port = source.port().to_string();
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();

    let handle = std::thread::Builder::new()
        .name(format!("serialmux-reader-{}", index))
        .spawn(move || run_reader(index, source, options, stop_flag_clone, tx))?;

    Ok(ReaderHandle {
        index,
        port,
        stop_flag,
        handle: Some(handle),
    })
}

fn run_reader(
    index: usize,
    mut source: Box<dyn ByteSource>,
    options: ReaderOptions,
    stop_flag: Arc<AtomicBool>,
    tx: SyncSender<ReaderEvent>,
) {
    let mut decoder = LineDecoder::new();
    let mut consecutive_errors: u32 = 0;
    let mut total_bytes: u64 = 0;

    tlog!("[Serial:{}] Reader started on {}", index, source.port());

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }

        match source.read_available(options.chunk_size) {
            Ok(bytes) if bytes.is_empty() => {
                consecutive_errors = 0;
                std::thread::sleep(options.poll_interval);
            }
            Ok(bytes) => {
                consecutive_errors = 0;
                total_bytes += bytes.len() as u64;
                let text = decoder.feed(&bytes);
                if text.is_empty() {
                    continue;
                }
                if let Err(dropped) =
                    send_with_backpressure(&tx, &stop_flag, ReaderEvent::Data(text), options.poll_interval)
                {
                    log_dropped(index, source.port(), &dropped);
                    break;
                }
            }
            Err(e) if !e.is_terminal() && consecutive_errors < options.max_read_retries => {
                consecutive_errors += 1;
                tlog!(
                    "[Serial:{}] {} (attempt {}/{})",
                    index,
                    e,
                    consecutive_errors,
                    options.max_read_retries
                );
                std::thread::sleep(options.retry_backoff * consecutive_errors);
            }
            Err(e) => {
                let e = e.into_terminal();
                tlog!("[Serial:{}] {} on {}, closing", index, e, source.port());
                source.close();
                if let Err(dropped) =
                    send_with_backpressure(&tx, &stop_flag, ReaderEvent::Error(e), options.poll_interval)
                {
                    log_dropped(index, source.port(), &dropped);
                }
                return;
            }
        }
    }

    let tail = decoder.flush();
    if !tail.is_empty() {
        if let Err(e) = tx.try_send(ReaderEvent::Data(tail)) {
            let dropped = match e {
                TrySendError::Full(event) | TrySendError::Disconnected(event) => event,
            };
            log_dropped(index, source.port(), &dropped);
        }
    }
    source.close();

    tlog!(
        "[Serial:{}] Reader stopped on {} ({} bytes)",
        index,
        source.port(),
        total_bytes
    );
}

/// Queue an event, waiting while the consumer is behind.
/// Gives up once a stop is requested or the consumer is gone, handing the
/// undelivered event back.
fn send_with_backpressure(
    tx: &SyncSender<ReaderEvent>,
    stop_flag: &AtomicBool,
    event: ReaderEvent,
    wait: Duration,
) -> Result<(), ReaderEvent> {
    let mut event = event;
    loop {
        match tx.try_send(event) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(returned)) => {
                if stop_flag.load(Ordering::SeqCst) {
                    return Err(returned);
                }
                event = returned;
                std::thread::sleep(wait);
            }
            Err(TrySendError::Disconnected(returned)) => return Err(returned),
        }
    }
}

fn log_dropped(index: usize, port: &str, event: &ReaderEvent) {
    match event {
        ReaderEvent::Data(text) => tlog!(
            "[Serial:{}] Dropped {} bytes from {} at shutdown",
            index,
            text.len(),
            port
        ),
        ReaderEvent::Error(e) => {
            tlog!("[Serial:{}] Undelivered error from {}: {}", index, port, e)
        }
    }
}
