//! swarm-downloader - Main entry point
//!
//! Downloads one torrent from many peers at once.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::ExitCode;
use swarm_downloader::{CliArgs, Config, DownloadOutcome, Session, TorrentInfo, TorrentParser};
use tracing::{debug, error, info};

/// Log panics through tracing before the default hook output
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    setup_panic_handler();
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let torrent_info = load_torrent_file(&config.torrent_file)
        .context("Failed to load torrent file")?;
    if !config.is_quiet() {
        display_torrent_info(&torrent_info, &config);
    }

    let session = Session::new(config, torrent_info);
    match session.run_until_interrupted().await? {
        DownloadOutcome::Complete { pieces, bytes } => {
            info!("Download complete: {} pieces, {}", pieces, format_bytes(bytes));
            Ok(ExitCode::SUCCESS)
        }
        DownloadOutcome::Incomplete { missing } => {
            error!("Download incomplete: {} piece(s) missing", missing.len());
            debug!("Missing pieces: {:?}", missing);
            Ok(ExitCode::from(2))
        }
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {}", args.log_level());
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    info!("Loading torrent file: {}", path.display());

    let info = TorrentParser::parse_file(path)
        .with_context(|| format!("Failed to parse torrent file '{}'", path.display()))?;

    info!("Successfully loaded torrent file: {}", info.name);
    Ok(info)
}

/// Display torrent information
fn display_torrent_info(torrent_info: &TorrentInfo, config: &Config) {
    println!("Torrent Information:");
    println!("  Name: {}", torrent_info.name);
    println!("  Size: {} ({})", torrent_info.total_size(), format_bytes(torrent_info.total_size()));
    println!("  Pieces: {}", torrent_info.piece_count());
    println!("  Piece length: {}", format_bytes(torrent_info.piece_length));
    println!("  Info hash: {}", torrent_info.info_hash_hex());
    if let Some(files) = &torrent_info.files {
        println!("  Files: {}", files.len());
    }
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Announce port: {}", config.port);
    println!("  Max connections: {}", config.max_connections);
    println!("  Manual peers: {}", config.peers.len());
    println!("  DHT: {}", if config.is_dht_enabled() { "enabled" } else { "disabled" });
    println!("  Tracker: {}", if config.is_tracker_enabled() { "enabled" } else { "disabled" });
    println!();
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
