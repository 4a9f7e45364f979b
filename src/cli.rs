// src/cli.rs
//
// Command-line front end.
// Opens one channel per PORT[@BAUD] argument and streams every channel to
// stdout, one line per record, prefixed with the channel number.

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffers::ChannelBuffer;
use crate::io::{
    list_serial_ports, ChannelConfig, ChannelEvent, ChannelState, Parity, SerialPortInfo, StopBits,
};
use crate::registry::PortRegistry;
use crate::settings::{default_settings_path, load_settings, AppSettings};

/// How often connected devices are checked for removal
const REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// serialmux - receive from several serial ports at once
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Ports to open, as PORT or PORT@BAUD (e.g. /dev/ttyUSB0@115200)
    ports: Vec<String>,

    /// List serial devices and exit
    #[arg(short, long)]
    list: bool,

    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write every channel to a rotating capture file
    #[arg(long)]
    autosave: bool,

    /// Directory for capture files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Decode NMEA RMC/GGA sentences and print the decoded blocks
    #[arg(long)]
    nmea: bool,

    /// Parity for every port (none|odd|even)
    #[arg(long, default_value = "none")]
    parity: Parity,

    /// Stop bits for every port (1|1.5|2)
    #[arg(long, default_value = "1")]
    stop_bits: StopBits,

    /// Also write diagnostics to a timestamped file in this directory
    #[arg(long)]
    app_log: Option<PathBuf>,

    /// Report channel events on stderr as JSON lines
    #[arg(long)]
    json_events: bool,
}

/// Parse `PORT` or `PORT@BAUD`.
fn parse_port_spec(spec: &str, default_baud: u32) -> Result<ChannelConfig, String> {
    let (port, baud) = match spec.rsplit_once('@') {
        Some((port, baud)) => {
            let baud: u32 = baud
                .parse()
                .map_err(|_| format!("Invalid baud rate in '{}'", spec))?;
            (port, baud)
        }
        None => (spec, default_baud),
    };
    if port.is_empty() {
        return Err(format!("Missing port name in '{}'", spec));
    }
    if baud == 0 {
        return Err(format!("Baud rate must be positive in '{}'", spec));
    }
    Ok(ChannelConfig::new(port, baud))
}

/// Prints what a buffer gained since the last call, whole lines only.
#[derive(Default)]
struct LinePrinter {
    seen: u64,
    partial: String,
}

impl LinePrinter {
    fn take_lines(&mut self, buffer: &ChannelBuffer) -> Vec<String> {
        let total = buffer.total_appended();
        let fresh = (total - self.seen.min(total)) as usize;
        self.seen = total;
        if fresh == 0 {
            return Vec::new();
        }
        let text = buffer.as_str();
        let start = text.len().saturating_sub(fresh);
        self.partial.push_str(text.get(start..).unwrap_or(text));

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        (!rest.is_empty()).then_some(rest)
    }
}

fn print_devices() -> Result<(), String> {
    let ports = list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for p in ports {
        println!("{}", describe_port(&p));
    }
    Ok(())
}

/// `/dev/ttyUSB0  (USB 0403:6001: FTDI, FT232R, A10K1234)`
fn describe_port(p: &SerialPortInfo) -> String {
    let usb_id = match (p.vid, p.pid) {
        (Some(vid), Some(pid)) => format!(" {:04x}:{:04x}", vid, pid),
        _ => String::new(),
    };
    let detail = [&p.manufacturer, &p.product, &p.serial_number]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if detail.is_empty() {
        format!("{}  ({}{})", p.port_name, p.port_type, usb_id)
    } else {
        format!("{}  ({}{}: {})", p.port_name, p.port_type, usb_id, detail)
    }
}

fn load_cli_settings(args: &Args) -> Result<AppSettings, String> {
    let mut settings = match args.config.clone().or_else(default_settings_path) {
        Some(path) => load_settings(&path)?,
        None => AppSettings::default(),
    };
    if args.autosave {
        settings.auto_save = true;
    }
    if args.nmea {
        settings.parse_nmea = true;
    }
    if let Some(dir) = &args.log_dir {
        settings.log_dir = dir.display().to_string();
    }
    // Enough channels for every requested port
    settings.port_count = settings.port_count.max(args.ports.len());
    if args.ports.len() > settings.max_ports {
        return Err(format!(
            "{} ports requested, at most {} supported",
            args.ports.len(),
            settings.max_ports
        ));
    }
    Ok(settings)
}

fn print_event(event: &ChannelEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            eprintln!("{}", line);
        }
        return;
    }
    match event {
        ChannelEvent::Received { .. } => {}
        ChannelEvent::Faulted { index, port, message } => {
            eprintln!("[{}] {} faulted: {}", index, port, message)
        }
        ChannelEvent::DeviceDisappeared { index, port } => {
            eprintln!("[{}] {} disappeared", index, port)
        }
        ChannelEvent::SinkError { index, message } => {
            eprintln!("[{}] capture error: {}", index, message)
        }
    }
}

pub fn run() -> Result<(), String> {
    let args = Args::parse();

    if args.list {
        return print_devices();
    }
    if args.ports.is_empty() {
        return Err("No ports given (use --list to see available devices)".to_string());
    }
    if let Some(dir) = &args.app_log {
        crate::logging::init_file_logging(dir)?;
    }

    let settings = load_cli_settings(&args)?;
    let configs = args
        .ports
        .iter()
        .map(|spec| {
            parse_port_spec(spec, settings.default_baud_rate)
                .map(|c| c.with_parity(args.parity).with_stop_bits(args.stop_bits))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut registry =
        PortRegistry::with_serial(settings.registry_options()).map_err(|e| e.to_string())?;
    for (index, config) in configs.into_iter().enumerate() {
        let summary = format!("{} {}", config.port, config.summary());
        match registry.connect(index, config) {
            Ok(()) => eprintln!("[{}] {} connected", index, summary),
            Err(e) => eprintln!("[{}] {}", index, e),
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || handler_flag.store(false, Ordering::SeqCst))
        .map_err(|e| format!("Failed to install Ctrl-C handler: {}", e))?;

    let mut raw: HashMap<usize, LinePrinter> = HashMap::new();
    let mut parsed: HashMap<usize, LinePrinter> = HashMap::new();
    let mut last_refresh = Instant::now();
    let poll_interval = Duration::from_millis(settings.poll_interval_ms.max(1));

    while running.load(Ordering::SeqCst) {
        for event in registry.pump() {
            print_event(&event, args.json_events);
        }
        print_new_output(&registry, &mut raw, &mut parsed);

        if last_refresh.elapsed() >= REFRESH_INTERVAL {
            last_refresh = Instant::now();
            match registry.refresh_all() {
                Ok(outcome) => outcome
                    .events
                    .iter()
                    .for_each(|e| print_event(e, args.json_events)),
                Err(e) => tlog!("[cli] {}", e),
            }
        }

        let any_connected = registry
            .channels()
            .iter()
            .any(|c| c.state() == ChannelState::Connected);
        if !any_connected {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    registry.shutdown();
    for event in registry.pump() {
        print_event(&event, args.json_events);
    }
    print_new_output(&registry, &mut raw, &mut parsed);
    for (index, printer) in raw.iter_mut().chain(parsed.iter_mut()) {
        if let Some(rest) = printer.finish() {
            println!("[{}] {}", index, rest);
        }
    }
    crate::logging::stop_file_logging();
    Ok(())
}

fn print_new_output(
    registry: &PortRegistry,
    raw: &mut HashMap<usize, LinePrinter>,
    parsed: &mut HashMap<usize, LinePrinter>,
) {
    for channel in registry.channels() {
        let index = channel.index();
        if channel.parses_nmea() {
            for line in parsed.entry(index).or_default().take_lines(channel.parsed()) {
                println!("[{} nmea] {}", index, line);
            }
        } else {
            for line in raw.entry(index).or_default().take_lines(channel.display()) {
                println!("[{}] {}", index, line);
            }
        }
    }
}
