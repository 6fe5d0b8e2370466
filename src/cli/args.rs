//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log output style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// CLI arguments for the P2P node
#[derive(Debug, Default, Parser)]
#[command(name = "kad-p2p")]
#[command(about = "Kademlia peer discovery node with an encrypted TCP transport", long_about = None)]
pub struct CliArgs {
    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on and advertise
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port for the encrypted transport
    #[arg(long)]
    pub tcp_port: Option<u16>,

    /// UDP port for KadRPC
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// Zone carried in packed node ids
    #[arg(long)]
    pub zone: Option<u16>,

    /// PEM encoded P-256 private key; a fresh key is generated when absent
    #[arg(short, long, value_name = "PEM")]
    pub key: Option<PathBuf>,

    /// Bootstrap enode URL (repeatable)
    #[arg(short, long, value_name = "ENODE")]
    pub bootstrap: Vec<String>,

    /// JSON file persisting known peers; in-memory when absent
    #[arg(long, value_name = "FILE")]
    pub store: Option<PathBuf>,

    /// Serve the authenticated TCP echo service
    #[arg(long)]
    pub serve_tcp: bool,

    /// Log output style
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["kad-p2p"]).unwrap();
        assert!(args.config.is_none());
        assert!(args.bootstrap.is_empty());
        assert!(!args.serve_tcp);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::try_parse_from([
            "kad-p2p",
            "--host",
            "10.0.0.1",
            "--udp-port",
            "30303",
            "-b",
            "enode://a@1.2.3.4:1",
            "-b",
            "enode://b@1.2.3.4:2",
            "--log-format",
            "json",
            "--serve-tcp",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(args.udp_port, Some(30303));
        assert_eq!(args.bootstrap.len(), 2);
        assert_eq!(args.log_format, Some(LogFormat::Json));
        assert!(args.serve_tcp);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_quiet_level() {
        let args = CliArgs {
            quiet: true,
            ..Default::default()
        };
        assert!(args.is_quiet());
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
