//! Logging subscriber construction
//!
//! The binary installs a process-wide stderr subscriber at startup. Bootstrap
//! requests additionally get their own JSON subscriber writing to the log file
//! named in the request, scoped around the handling of that one request.

use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used by the process-wide subscriber when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "warn,kairos_provider=info";

/// Errors that can occur while building a subscriber
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The requested log level is not a known level
    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    /// The log file could not be opened
    #[error("cannot open log file {path}: {source}")]
    LogFile {
        /// Path of the log file
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to install the global subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Install the process-wide subscriber
///
/// Logs go to stderr since stdout carries the event response.
pub fn init() -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

/// Parse a level name such as `debug` or `info`
pub fn parse_level(level: &str) -> Result<LevelFilter, TelemetryError> {
    LevelFilter::from_str(level.trim()).map_err(|_| TelemetryError::InvalidLevel(level.to_string()))
}

/// Build a JSON subscriber for one bootstrap request
///
/// Writes to `logfile` (appending, created if missing) or to stderr when no
/// file is given. Only events at `level` or above are recorded.
pub fn request_dispatch(logfile: Option<&Path>, level: &str) -> Result<Dispatch, TelemetryError> {
    let level = parse_level(level)?;
    let filter = EnvFilter::default().add_directive(level.into());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_ansi(false);

    let dispatch = match logfile {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| TelemetryError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| TelemetryError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            Dispatch::new(
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.with_writer(Mutex::new(file))),
            )
        }
        None => Dispatch::new(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer.with_writer(std::io::stderr)),
        ),
    };
    Ok(dispatch)
}
