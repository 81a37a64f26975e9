//! CLI argument definitions using clap
//!
//! Commands:
//! - metafleet serve --config <path>
//! - metafleet check-config --config <path>
//! - metafleet issue-ca --out <dir>
//! - metafleet issue-identity --ca-dir <dir> --organization <org> --out <dir>
//! - metafleet demo --masters <n> --capacity <n>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// metafleet - provisions tenant masters and connects them back over mutual TLS
#[derive(Parser, Debug)]
#[command(name = "metafleet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log filter, e.g. "info" or "metafleet=debug" (RUST_LOG wins)
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./metafleet.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./metafleet.json")]
        config: PathBuf,
    },

    /// Create a certificate authority for the fleet
    IssueCa {
        /// Directory to write ca.pem and ca.key into
        #[arg(long)]
        out: PathBuf,

        /// CA common name
        #[arg(long, default_value = "metafleet CA")]
        common_name: String,
    },

    /// Issue a master or coordinator identity from an existing CA
    IssueIdentity {
        /// Directory holding ca.pem and ca.key
        #[arg(long)]
        ca_dir: PathBuf,

        /// Organization bound into the certificate
        #[arg(long)]
        organization: String,

        /// Directory to write <stem>.pem and <stem>.key into
        #[arg(long)]
        out: PathBuf,

        /// Issue a coordinator identity for this DNS name instead of a
        /// master identity
        #[arg(long)]
        server_name: Option<String>,

        /// File name stem (default: the organization, or "coordinator")
        #[arg(long)]
        stem: Option<String>,
    },

    /// Run an in-process fleet: provision masters, wait for them to
    /// connect, then tear them down
    Demo {
        /// Number of masters
        #[arg(long, default_value_t = 4)]
        masters: usize,

        /// Backend capacity
        #[arg(long, default_value_t = 2)]
        capacity: usize,

        /// Simulated start delay in milliseconds
        #[arg(long, default_value_t = 200)]
        delay_ms: u64,

        /// Give up waiting for connections after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
