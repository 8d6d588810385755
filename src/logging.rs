//! Tracing setup for the transfer engine.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::{TransferError, TransferResult};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Maps a verbosity level (0=error .. 4+=trace) to a filter directive.
fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `verbosity` when it is set. When
/// `log_file` is given, output is appended to that file without ANSI colors.
pub fn init_logging(
    verbosity: u8,
    log_file: Option<&Path>,
    format: LogFormat,
) -> TransferResult<()> {
    let level = level_for(verbosity);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ftpdeck={}", level)));

    let init_err =
        |e: tracing_subscriber::util::TryInitError| TransferError::Internal(e.to_string());

    match (log_file, format) {
        (None, LogFormat::Text) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(verbosity >= 3)
                    .with_line_number(verbosity >= 3),
            )
            .try_init()
            .map_err(init_err)?,
        (None, LogFormat::Json) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .map_err(init_err)?,
        (Some(path), LogFormat::Text) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(file).with_ansi(false).with_target(true))
                .try_init()
                .map_err(init_err)?
        }
        (Some(path), LogFormat::Json) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(file))
                .try_init()
                .map_err(init_err)?
        }
    }

    Ok(())
}

/// Logging for tests. Ignores the error when a subscriber is already set.
pub fn init_test_logging() {
    let _ = init_logging(3, None, LogFormat::Text);
}
