//! CLI module for metafleet
//!
//! Provides command-line interface for:
//! - serve: run the coordinator from a configuration file
//! - check-config: validate a configuration file
//! - issue-ca / issue-identity: manage the fleet's TLS material
//! - demo: run an in-process fleet end to end

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, demo, issue_ca, issue_identity, run, run_command, serve};
pub use errors::{CliError, CliResult};
pub use io::{write_error, write_response};
