//! Diagnostic output setup.
//!
//! Logs go to stderr by default because the wrapped command's stdout may need
//! to stay parsable. A file destination is opened in append mode without ANSI colors.
use crate::config::{LogDestination, LogLevel};
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Errors that can occur while setting up logging.
#[derive(Debug)]
pub enum LoggingError {
    /// Failed to open the log file.
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A global subscriber was already installed.
    Init { reason: String },
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::Open { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            LoggingError::Init { reason } => write!(f, "failed to initialise logging: {reason}"),
        }
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoggingError::Open { source, .. } => Some(source),
            LoggingError::Init { .. } => None,
        }
    }
}

/// Build the writer for a destination, and whether it should get ANSI colors.
fn make_writer(destination: &LogDestination) -> Result<(BoxMakeWriter, bool), LoggingError> {
    match destination {
        LogDestination::Stderr => Ok((
            BoxMakeWriter::new(std::io::stderr),
            std::io::stderr().is_terminal(),
        )),
        LogDestination::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| LoggingError::Open {
                    path: path.clone(),
                    source: e,
                })?;
            Ok((BoxMakeWriter::new(Mutex::new(file)), false))
        }
    }
}

/// Install the global subscriber.
pub fn init(destination: &LogDestination, level: LogLevel) -> Result<(), LoggingError> {
    let (writer, ansi) = make_writer(destination)?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .with_env_filter(EnvFilter::default().add_directive(level.filter().into()))
        .try_init()
        .map_err(|e| LoggingError::Init {
            reason: e.to_string(),
        })
}
