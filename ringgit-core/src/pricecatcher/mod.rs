//! Price-catcher transactional load.
//!
//! Monthly parquet snapshots are fetched for every month since the stored
//! watermark, deduplicated, filtered to rows after the watermark and
//! appended to the warehouse in bounded batches.

pub mod frame;
pub mod loader;
pub mod source;

pub use frame::{batch_slices, date_span, dedupe_and_filter, normalize_dates, prepare_month};
pub use loader::{run_load, LoadOptions, LoadSummary};
pub use source::{DataGovClient, SnapshotSource};

use crate::warehouse::WarehouseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot published for {0}")]
    NotPublished(String),

    #[error("snapshot for {month} returned HTTP {status}")]
    Http { month: String, status: u16 },

    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("failed to transform {month}: {reason}")]
    Transform { month: String, reason: String },
}
