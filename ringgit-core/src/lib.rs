//! Ringgit Core: batch jobs for Malaysian economic data.
//!
//! This crate contains the three jobs and what they share:
//! - Table provisioning from JSON schema descriptors
//! - Government bond-yield scrape into local JSON vehicle files
//! - Incremental price-catcher load into the warehouse, tracked by a watermark
//! - Warehouse abstraction with local-parquet and BigQuery backends
//! - Settings, logging setup and calendar helpers

pub mod bonds;
pub mod calendar;
pub mod config;
pub mod logging;
pub mod pricecatcher;
pub mod schema;
pub mod warehouse;
