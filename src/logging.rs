//! Process-wide log sink.
//!
//! Code logs through the `log` macros. Records are bridged into a
//! `tracing-subscriber` registry with two identical formatters: one on
//! stdout with colour, one appending to the persistent log file without.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default persistent log location
pub const DEFAULT_LOG_FILE: &str = "/var/log/archcrypt-install.log";

/// Install the global subscriber.
///
/// `RUST_LOG` selects the level unless `verbose` forces debug. When the log
/// file cannot be opened the run continues on the console only.
pub fn init(log_file: &Path, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (file, open_error) = match open_append(log_file) {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };

    let console = fmt::layer().with_target(false);
    let persistent = file.map(|f| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_writer(Mutex::new(f))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(persistent)
        .try_init()
        .context("Failed to install log subscriber")?;

    match open_error {
        None => log::debug!("Logging to {}", log_file.display()),
        Some(e) => log::warn!(
            "Cannot open log file {} ({:#}); logging to console only",
            log_file.display(),
            e
        ),
    }
    Ok(())
}

/// Open `path` for appending, creating it if absent
fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_append_keeps_existing_lines() {
        let dir = tempfile::tempdir().expect("tempdir"); // test: tempdir creation
        let path = dir.path().join("install.log");

        let mut first = open_append(&path).expect("create"); // test: temp path
        writeln!(first, "first run").expect("write"); // test: temp file
        drop(first);

        let mut second = open_append(&path).expect("reopen"); // test: temp path
        writeln!(second, "second run").expect("write"); // test: temp file
        drop(second);

        let contents = std::fs::read_to_string(&path).expect("read back"); // test: just written
        assert_eq!(contents, "first run\nsecond run\n");
    }

    #[test]
    fn test_open_append_reports_missing_directory() {
        let err = open_append(Path::new("/nonexistent-dir-xyz/install.log")).expect_err("no dir"); // test: expected error
        assert!(err.to_string().contains("/nonexistent-dir-xyz/install.log"));
    }
}
