// src/io/serial/mod.rs
//
// Serial port driver.
// Provides cross-platform serial access and the per-channel reader loop.
//
// Features:
// - Exclusive open with typed connect errors
// - Poll-based reads bounded by chunk size
// - Reader thread with transient-error retry and backpressure

pub mod reader;
pub mod source;
pub(crate) mod utils;

pub use reader::{spawn_reader, ReaderHandle, ReaderOptions};
pub use source::{list_serial_ports, SerialBackend, SerialByteSource, SerialPortInfo};
pub use utils::{Parity, StopBits};
