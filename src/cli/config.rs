//! CLI configuration module
//!
//! Turns parsed arguments into the validated settings the session runs with.

use crate::cli::args::CliArgs;
use crate::dht::DhtConfig;
use crate::peer::{PeerAddress, PeerConfig};
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context, Result};

/// Configuration for the swarm downloader
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the .torrent file
    pub torrent_file: PathBuf,
    /// Download directory
    pub output_dir: PathBuf,
    /// Port announced to trackers and the DHT
    pub port: u16,
    /// Maximum number of concurrent peer connections
    pub max_connections: usize,
    /// Peers given on the command line
    pub peers: Vec<PeerAddress>,
    /// Enable DHT
    pub use_dht: bool,
    /// Enable tracker
    pub use_tracker: bool,
    /// Per-peer timeouts and limits
    pub peer: PeerConfig,
    /// DHT lookup settings
    pub dht: DhtConfig,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let output_dir = args.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        let peer = PeerConfig {
            connect_timeout: Duration::from_secs(args.connect_timeout),
            read_timeout: Duration::from_secs(args.read_timeout),
            ..PeerConfig::default()
        };
        let dht = DhtConfig {
            lookup_timeout: Duration::from_secs(args.dht_timeout),
            ..DhtConfig::default()
        };

        Self {
            torrent_file: args.torrent_file.clone(),
            output_dir,
            port: args.port,
            max_connections: args.max_connections,
            peers: args.peers.clone(),
            use_dht: !args.no_dht,
            use_tracker: !args.no_tracker,
            peer,
            dht,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("Port cannot be 0"));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be at least 1"));
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("output_dir cannot be empty"));
        }

        self.peer.validate().context("Invalid peer settings")?;
        if self.use_dht {
            self.dht.validate().context("Invalid DHT settings")?;
        }

        if !self.use_dht && !self.use_tracker && self.peers.is_empty() {
            return Err(anyhow::anyhow!("No peer source: DHT and tracker are disabled and no --peer was given"));
        }

        Ok(())
    }

    /// Check if DHT should be enabled
    pub fn is_dht_enabled(&self) -> bool {
        self.use_dht
    }

    /// Check if tracker should be enabled
    pub fn is_tracker_enabled(&self) -> bool {
        self.use_tracker
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(extra: &[&str]) -> Config {
        let mut argv = vec!["swarm-downloader", "test.torrent"];
        argv.extend_from_slice(extra);
        Config::from_args(&CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_config_from_args() {
        let config = config(&[
            "-o", "/tmp/downloads",
            "-p", "6882",
            "-m", "100",
            "--no-dht",
            "--connect-timeout", "5",
            "--read-timeout", "20",
            "--dht-timeout", "15",
            "--peer", "127.0.0.1:7000",
        ]);

        assert_eq!(config.torrent_file, PathBuf::from("test.torrent"));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.port, 6882);
        assert_eq!(config.max_connections, 100);
        assert!(!config.is_dht_enabled());
        assert!(config.is_tracker_enabled());
        assert_eq!(config.peer.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.peer.read_timeout, Duration::from_secs(20));
        assert_eq!(config.dht.lookup_timeout, Duration::from_secs(15));
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_default_output_dir() {
        assert_eq!(config(&[]).output_dir, PathBuf::from("./downloads"));
    }

    #[test]
    fn test_config_validate() {
        assert!(config(&[]).validate().is_ok());
    }

    #[test]
    fn test_config_validate_invalid_port() {
        assert!(config(&["-p", "0"]).validate().is_err());
    }

    #[test]
    fn test_config_validate_zero_connections() {
        assert!(config(&["-m", "0"]).validate().is_err());
    }

    #[test]
    fn test_config_validate_zero_timeout() {
        assert!(config(&["--read-timeout", "0"]).validate().is_err());
        assert!(config(&["--dht-timeout", "0"]).validate().is_err());
        // DHT settings are not checked when the DHT is off
        assert!(config(&["--dht-timeout", "0", "--no-dht"]).validate().is_ok());
    }

    #[test]
    fn test_config_validate_requires_peer_source() {
        assert!(config(&["--no-dht", "--no-tracker"]).validate().is_err());
        assert!(config(&["--no-dht", "--no-tracker", "--peer", "10.0.0.1:6881"]).validate().is_ok());
    }
}
