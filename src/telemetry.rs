//! Tracing setup: stderr output plus an optional daily-rolling log file.

use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

const LOG_FILE_PREFIX: &str = "sequencer.log";

/// Keeps the file writer flushing. Drop it last.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init(log_dir: Option<&Path>) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![Box::new(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false),
    )];

    let mut file_guard = None;
    let mut setup_error = None;
    if let Some(dir) = log_dir {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                ));
                file_guard = Some(guard);
            }
            Err(e) => setup_error = Some(format!("log dir init failed for {}: {e}", dir.display())),
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    if let Some(error) = setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _file: file_guard }
}
