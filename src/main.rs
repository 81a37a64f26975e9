//! metafleet CLI entry point
//!
//! Parses arguments, dispatches the command and exits non-zero on failure.
//! All logic lives in the `cli` module.

use metafleet::cli;

fn main() {
    if let Err(e) = cli::run() {
        let _ = cli::write_error(e.code(), &e.to_string());
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
