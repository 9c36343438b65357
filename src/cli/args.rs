//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::peer::PeerAddress;

/// CLI arguments for the swarm downloader
#[derive(Debug, Parser)]
#[command(name = "swarm-downloader", version)]
#[command(about = "Download a torrent from many peers at once", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Port announced to trackers and the DHT
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of concurrent peer connections
    #[arg(short, long, default_value_t = 50)]
    pub max_connections: usize,

    /// Extra peer to connect to (ip:port), may be repeated
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<PeerAddress>,

    /// Disable DHT peer discovery
    #[arg(long)]
    pub no_dht: bool,

    /// Disable tracker announces
    #[arg(long)]
    pub no_tracker: bool,

    /// TCP connect timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Per-message read timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub read_timeout: u64,

    /// Overall DHT lookup budget in seconds
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub dht_timeout: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
