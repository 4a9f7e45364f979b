// src/lib.rs
//
// serialmux: receive from up to sixteen serial ports at once.
// Each connected channel runs a reader thread feeding a bounded queue; the
// caller drains every queue from one consumer context via `PortRegistry::pump`.

#[macro_use]
mod logging;

pub mod buffers;
pub mod capture;
pub mod decoder;
pub mod io;
pub mod nmea;
pub mod registry;
pub mod settings;
pub mod supervisor;

#[cfg(feature = "cli")]
pub mod cli;

pub use logging::{init_file_logging, stop_file_logging};

pub use buffers::ChannelBuffer;
pub use capture::LogWriter;
pub use io::{
    ChannelConfig, ChannelEvent, ChannelState, ConnectError, MemoryBackend, Parity, PortBackend,
    ReadError, SerialBackend, SinkError, StopBits,
};
pub use nmea::{NmeaParser, SentenceParser};
pub use registry::{PortRegistry, RefreshOutcome, RegistryError, RegistryOptions};
pub use settings::{load_settings, save_settings, AppSettings};
pub use supervisor::{ChannelOptions, ChannelSnapshot, ChannelSupervisor, SupervisorError};
