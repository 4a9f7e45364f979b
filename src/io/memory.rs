// src/io/memory.rs
//
// In-memory port backend.
// Scripted devices that replay queued bytes and errors. Used to exercise the
// pipeline without hardware and to replay captured streams.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::{ConnectError, ReadError};
use super::types::ChannelConfig;
use super::{ByteSource, PortBackend, PortClaim};

enum Step {
    Bytes(Vec<u8>),
    Error(ReadError),
}

#[derive(Default)]
struct MemoryState {
    /// Enumeration order as added, duplicates allowed
    listing: Vec<String>,
    scripts: HashMap<String, VecDeque<Step>>,
    open_failures: HashMap<String, ConnectError>,
}

/// Backend whose devices are driven by the caller
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock only happens in a failing test
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make a device visible. Adding the same name twice lists it twice.
    pub fn add_device(&self, name: &str) {
        let mut state = self.lock();
        state.listing.push(name.to_string());
        state.scripts.entry(name.to_string()).or_default();
    }

    /// Remove a device from enumeration. Open handles go silent.
    pub fn remove_device(&self, name: &str) {
        let mut state = self.lock();
        state.listing.retain(|d| d != name);
        state.scripts.remove(name);
    }

    /// Queue bytes for the next reads on `name`
    pub fn push_bytes(&self, name: &str, bytes: &[u8]) {
        let mut state = self.lock();
        if let Some(script) = state.scripts.get_mut(name) {
            script.push_back(Step::Bytes(bytes.to_vec()));
        }
    }

    /// Queue a read failure on `name`
    pub fn push_error(&self, name: &str, error: ReadError) {
        let mut state = self.lock();
        if let Some(script) = state.scripts.get_mut(name) {
            script.push_back(Step::Error(error));
        }
    }

    /// Make the next open of `name` fail with `error`
    pub fn fail_next_open(&self, name: &str, error: ConnectError) {
        self.lock().open_failures.insert(name.to_string(), error);
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        PortClaim::is_claimed(name)
    }

    fn next_chunk(&self, name: &str, max_bytes: usize) -> Result<Vec<u8>, ReadError> {
        let mut state = self.lock();
        let Some(script) = state.scripts.get_mut(name) else {
            return Ok(Vec::new());
        };
        match script.pop_front() {
            None => Ok(Vec::new()),
            Some(Step::Error(e)) => Err(e),
            Some(Step::Bytes(mut bytes)) => {
                if bytes.len() > max_bytes {
                    let rest = bytes.split_off(max_bytes);
                    script.push_front(Step::Bytes(rest));
                }
                Ok(bytes)
            }
        }
    }
}

impl PortBackend for MemoryBackend {
    fn open(&self, config: &ChannelConfig) -> Result<Box<dyn ByteSource>, ConnectError> {
        if config.baud_rate == 0 {
            return Err(ConnectError::invalid_config(&config.port, "baud rate must be positive"));
        }
        {
            let mut state = self.lock();
            if let Some(e) = state.open_failures.remove(&config.port) {
                return Err(e);
            }
            if !state.scripts.contains_key(&config.port) {
                return Err(ConnectError::not_found(&config.port));
            }
        }
        let claim = PortClaim::acquire(&config.port)?;
        Ok(Box::new(MemoryByteSource {
            backend: self.clone(),
            port: config.port.clone(),
            claim: Some(claim),
        }))
    }

    fn list_devices(&self) -> Result<Vec<String>, String> {
        Ok(self.lock().listing.clone())
    }
}

struct MemoryByteSource {
    backend: MemoryBackend,
    port: String,
    claim: Option<PortClaim>,
}

impl ByteSource for MemoryByteSource {
    fn port(&self) -> &str {
        &self.port
    }

    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, ReadError> {
        if self.claim.is_none() {
            return Err(ReadError::Terminal("port is closed".to_string()));
        }
        self.backend.next_chunk(&self.port, max_bytes)
    }

    fn close(&mut self) {
        self.claim.take();
    }
}
