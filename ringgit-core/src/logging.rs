//! Tracing subscriber setup for the batch jobs.
//!
//! Every job logs to stderr and, when a log file is configured, appends the
//! same lines to that file.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Log file names, one per job.
pub const SETUP_TABLES_LOG: &str = "bq_table_setup.log";
pub const SCRAPE_BONDS_LOG: &str = "government_bonds_scraper.log";
pub const LOAD_PRICECATCHER_LOG: &str = "pricecatcher_transactions_scraper.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file {path}: {source}")]
    OpenLogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Install the global subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset.
pub fn init_logging(default_level: &str, log_file: Option<&Path>) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false);

    let result = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| LoggingError::OpenLogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenLogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            builder
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    result.map_err(|e| LoggingError::Init(e.to_string()))
}

/// Pluralising suffix used in summary log lines.
pub fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
