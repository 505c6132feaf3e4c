//! Warehouse abstraction.
//!
//! The jobs only need a handful of operations from the warehouse: check and
//! create tables, count rows, append a parquet payload, and read/write the
//! per-table watermark. `Warehouse` captures exactly that so the jobs can run
//! against BigQuery in production and against a local parquet directory in
//! tests or offline runs.

pub mod bigquery;
pub mod local;
pub mod table;

pub use bigquery::{BigQueryConfig, BigQueryWarehouse};
pub use local::LocalWarehouse;
pub use table::{FieldMode, FieldSchema, FieldType, Partitioning, TableDefinition, TimeGranularity};

use crate::config::{WarehouseBackend, WarehouseSettings};
use chrono::NaiveDate;
use polars::prelude::*;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table not found: {0}")]
    NotFound(String),

    #[error("table already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rejected load into {table}: {reason}")]
    InvalidData { table: String, reason: String },

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("warehouse API returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("load job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a load treats rows already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Append,
    Truncate,
}

impl WriteDisposition {
    pub fn as_bigquery(&self) -> &'static str {
        match self {
            Self::Append => "WRITE_APPEND",
            Self::Truncate => "WRITE_TRUNCATE",
        }
    }
}

/// What a finished load reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadOutcome {
    /// Rows the warehouse wrote from the payload.
    pub output_rows: u64,
}

/// Operations the batch jobs need from a warehouse.
///
/// Table names are bare table ids; the implementation supplies the
/// project/dataset qualification.
pub trait Warehouse: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    fn table_exists(&self, table: &str) -> Result<bool, WarehouseError>;

    /// Create a table. Fails with [`WarehouseError::AlreadyExists`] if present.
    fn create_table(&self, definition: &TableDefinition) -> Result<(), WarehouseError>;

    fn num_rows(&self, table: &str) -> Result<u64, WarehouseError>;

    /// Load a parquet payload into an existing table.
    fn load_parquet(
        &self,
        table: &str,
        parquet: Vec<u8>,
        disposition: WriteDisposition,
    ) -> Result<LoadOutcome, WarehouseError>;

    /// Latest ingested date recorded for `tablename` in `meta_table`.
    fn read_watermark(&self, meta_table: &str, tablename: &str) -> Result<Option<NaiveDate>, WarehouseError>;

    /// Record `date` as the latest ingested date for `tablename` (upsert).
    fn write_watermark(&self, meta_table: &str, tablename: &str, date: NaiveDate) -> Result<(), WarehouseError>;
}

/// Open the configured warehouse backend.
pub fn open(settings: &WarehouseSettings) -> Result<Box<dyn Warehouse>, WarehouseError> {
    match settings.backend {
        WarehouseBackend::Local => Ok(Box::new(LocalWarehouse::new(&settings.root, &settings.dataset))),
        WarehouseBackend::Bigquery => {
            let project = settings
                .project
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| WarehouseError::InvalidArgument("BigQuery needs a project".into()))?;
            let token = settings
                .access_token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| WarehouseError::InvalidArgument("BigQuery needs an access token".into()))?;

            let mut config = BigQueryConfig::new(project, settings.dataset.clone(), token);
            config.location = settings.location.clone();
            config.poll_interval = Duration::from_millis(settings.job_poll_interval_ms);
            config.job_timeout = Duration::from_secs(settings.job_timeout_secs);
            Ok(Box::new(BigQueryWarehouse::new(config)?))
        }
    }
}

/// Table ids are restricted to letters, digits and underscores.
pub fn validate_table_id(table: &str) -> Result<(), WarehouseError> {
    if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(WarehouseError::InvalidArgument(format!(
            "invalid table id '{table}': use letters, digits and underscores"
        )));
    }
    Ok(())
}

/// Serialise a DataFrame to an in-memory parquet file.
pub fn encode_parquet(df: &mut DataFrame) -> Result<Vec<u8>, WarehouseError> {
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf)
        .finish(df)
        .map_err(|e| WarehouseError::Parquet(format!("write parquet: {e}")))?;
    Ok(buf)
}

/// Read an in-memory parquet file.
pub fn decode_parquet(bytes: &[u8]) -> Result<DataFrame, WarehouseError> {
    ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| WarehouseError::Parquet(format!("read parquet: {e}")))
}
