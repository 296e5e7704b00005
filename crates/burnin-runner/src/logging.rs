//! Subscriber setup: `RUST_LOG` filter (default `burnin=info`), human-readable
//! lines on stderr, and a copy in `log/<prefix>_<YYYYmmdd_HHMMSS>.log`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub fn log_file_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!(
        "{}_{}.log",
        prefix,
        Local::now().format("%Y%m%d_%H%M%S")
    ))
}

/// Safe to call more than once; later calls leave the first subscriber in
/// place. Returns the log file when one could be opened.
pub fn init(log_dir: Option<&Path>, prefix: &str) -> Option<PathBuf> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burnin=info"));

    let opened = log_dir.and_then(|dir| {
        fs::create_dir_all(dir).ok()?;
        let path = log_file_path(dir, prefix);
        let file = File::create(&path).ok()?;
        Some((path, file))
    });
    let (path, file_layer) = match opened {
        Some((path, file)) => (
            Some(path),
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            ),
        ),
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(file_layer)
        .try_init();
    path
}
