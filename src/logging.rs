// Logging setup
//
// Everything in the crate logs through the `log` facade; this installs
// env_logger as the sink. The configured level is the default filter and
// RUST_LOG directives override it per module.

use std::fs::{File, OpenOptions};
use std::io::Write;

use anyhow::{Context, Result};
use env_logger::{Builder, Target};

use crate::config::LoggingConfig;

pub fn init(config: &LoggingConfig) -> Result<()> {
    let mut builder = Builder::new();
    builder.parse_filters(&config.level);
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }

    if config.log_to_file {
        let file = open_log_file(&config.log_file)?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .context("a global logger is already installed")?;
    if config.log_to_file {
        log::info!("Logging to {}", config.log_file);
    }
    Ok(())
}

/// Truncate the log file and stamp it with the start time
fn open_log_file(path: &str) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {path}"))?;
    writeln!(file, "=== tri-rhi log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}
