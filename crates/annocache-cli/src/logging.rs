//! Logging setup
//!
//! Logs go to stderr by default so they never mix with command output, or
//! to `log_file` when one is configured. `RUST_LOG` overrides the level.

use std::fs::File;
use std::path::Path;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
pub fn init(verbose: bool, log_file: Option<&Path>) {
    let log_level = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "annocache_core={},annocache_cli={}",
            log_level, log_level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    match log_file {
        Some(path) => match File::create(path) {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(file).try_init();
                info!("Logging to {:?}", path);
            }
            Err(e) => {
                eprintln!("Warning: Could not create log file {:?}: {}", path, e);
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
        },
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
