//! Table provisioning from JSON schema descriptors.
//!
//! A descriptor directory holds one `{table}_schema.json` file per table.
//! Each descriptor lists the table's columns and an optional partition spec;
//! provisioning creates every table that does not exist yet and reports
//! which tables were created, skipped or failed.

pub mod descriptor;
pub mod provision;

pub use descriptor::{
    discover_descriptors, parse_schema, table_name_for, ColumnDescriptor, PartitionDescriptor,
    SchemaDescriptor, SCHEMA_SUFFIX,
};
pub use provision::{provision_tables, ProvisionReport};

use crate::warehouse::WarehouseError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed descriptor {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("invalid column: {0}")]
    InvalidColumn(String),

    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}
