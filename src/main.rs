fn main() {
    if let Err(e) = serialmux_lib::cli::run() {
        eprintln!("serialmux: {}", e);
        std::process::exit(1);
    }
}
