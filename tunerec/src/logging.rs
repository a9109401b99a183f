//! Logging setup: console output plus a daily-rotated log file.
//!
//! Components log through the `log` macros; `tracing-log` bridges them
//! into the tracing subscriber configured here. Old log files past the
//! retention window are removed at startup.

use std::io;
use std::path::Path;

use chrono::{DateTime, Local};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "tunerec.log";

/// Install the global subscriber: an ANSI console layer and a non-blocking
/// daily-rotated file layer under `log_dir`.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;
    prune_old_logs(log_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    // The writer guard must outlive the process or buffered lines are lost.
    std::mem::forget(guard);

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = fmt::layer()
        .with_writer(io::stdout)
        .with_target(true)
        .with_timer(LocalTimer);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_timer(LocalTimer);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    // Route log:: macro calls into tracing.
    tracing_log::LogTracer::init()?;

    Ok(())
}

/// Delete rotated log files whose modification time is past the
/// retention window.
fn prune_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }
    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !path.is_file() || !is_log {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => DateTime::<Local>::from(t),
            Err(_) => continue,
        };
        if modified < cutoff {
            if let Err(e) = std::fs::remove_file(&path) {
                eprintln!("Could not remove old log file {:?}: {}", path, e);
            }
        }
    }

    Ok(())
}

/// Local-time timestamps in log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}
