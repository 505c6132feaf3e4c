//! Government bond-yield scraper.
//!
//! Keeps a set of local JSON "vehicle" files (one per family of securities)
//! up to date from the central bank's public yield API.

pub mod merge;
pub mod record;
pub mod scrape;
pub mod source;
pub mod store;

pub use merge::{dedupe_records, merge_into_store, MergeReport};
pub use record::{SnapshotEntry, VehicleFile, YieldRecord, YieldResponse, NO_RESPONSE_STATUS};
pub use scrape::{run_scrape, scrape_window, snapshot_path, write_snapshot, ScrapeOptions, ScrapeSummary, YearScrape};
pub use source::{BnmClient, YieldSource};
pub use store::VehicleStore;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {reason}")]
    Json { path: PathBuf, reason: String },

    #[error("failed to build request pool: {0}")]
    Pool(String),
}
