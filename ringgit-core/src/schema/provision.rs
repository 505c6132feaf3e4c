//! Create missing tables from a descriptor directory.

use super::descriptor::{discover_descriptors, parse_schema, SchemaDescriptor};
use super::SchemaError;
use crate::logging::plural;
use crate::warehouse::Warehouse;
use std::path::Path;
use tracing::{error, info, warn};

/// Per-table outcome of a provisioning run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
    pub exists: Vec<String>,
}

impl ProvisionReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len() + self.exists.len()
    }

    fn log_summary(&self) {
        let n = self.successful.len();
        info!("Successfully created {n} table{}: {}", plural(n), self.successful.join(", "));
        let n = self.failed.len();
        info!("Failed to create {n} table{}: {}", plural(n), self.failed.join(", "));
        let n = self.exists.len();
        info!(
            "{n} table{} already exist{}: {}",
            plural(n),
            if n == 1 { "s" } else { "" },
            self.exists.join(", ")
        );
    }
}

/// Create every table described in `dir` that the warehouse does not have yet.
///
/// Existing tables are never touched. A failure on one table is logged and
/// recorded, and the run moves on to the next descriptor. Only an unreadable
/// directory fails the whole run.
pub fn provision_tables(warehouse: &dyn Warehouse, dir: &Path) -> Result<ProvisionReport, SchemaError> {
    let descriptors = discover_descriptors(dir)?;
    let mut report = ProvisionReport::default();

    if descriptors.is_empty() {
        warn!("{} has no schema json files", dir.display());
        return Ok(report);
    }

    for (table, path) in &descriptors {
        match provision_one(warehouse, table, path) {
            Ok(true) => report.successful.push(table.clone()),
            Ok(false) => report.exists.push(table.clone()),
            Err(e) => {
                error!("failed to create table {table}, skipping: {e}");
                report.failed.push(table.clone());
            }
        }
    }

    report.log_summary();
    Ok(report)
}

/// Returns `Ok(false)` when the table already exists.
fn provision_one(warehouse: &dyn Warehouse, table: &str, path: &Path) -> Result<bool, SchemaError> {
    if warehouse.table_exists(table)? {
        info!("Table {table} already exists, skipping");
        return Ok(false);
    }

    let descriptor = SchemaDescriptor::from_file(path)?;
    let definition = parse_schema(table, &descriptor)?;
    info!("Parsed schema for table {table}");

    match &definition.partitioning {
        Some(p) => info!("Adding {} to table on column: {}", p.label(), p.field()),
        None => info!("Creating table without partition"),
    }

    warehouse.create_table(&definition)?;
    info!("Created {} table {table}", warehouse.name());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{LocalWarehouse, Partitioning};
    use std::fs;

    const PRICES: &str = r#"{
        "columns": [
            {"name": "date", "field_type": "DATE", "mode": "REQUIRED"},
            {"name": "premise_code", "field_type": "INTEGER"},
            {"name": "price", "field_type": "FLOAT"}
        ],
        "partitions": {"type": "TIME", "range": "MONTH", "field": "date"}
    }"#;

    fn setup() -> (tempfile::TempDir, LocalWarehouse) {
        let dir = tempfile::tempdir().unwrap();
        let wh = LocalWarehouse::new(dir.path().join("wh"), "ds");
        fs::create_dir(dir.path().join("schemas")).unwrap();
        (dir, wh)
    }

    #[test]
    fn creates_then_skips_on_rerun() {
        let (dir, wh) = setup();
        let schemas = dir.path().join("schemas");
        fs::write(schemas.join("prices_schema.json"), PRICES).unwrap();
        fs::write(schemas.join("template_schema.json"), PRICES).unwrap();

        let first = provision_tables(&wh, &schemas).unwrap();
        assert_eq!(first.successful, vec!["prices"]);
        assert!(first.exists.is_empty());
        assert!(matches!(
            wh.definition("prices").unwrap().partitioning,
            Some(Partitioning::Time { .. })
        ));
        assert!(!wh.table_exists("template").unwrap());

        let second = provision_tables(&wh, &schemas).unwrap();
        assert!(second.successful.is_empty());
        assert_eq!(second.exists, vec!["prices"]);
    }

    #[test]
    fn bad_descriptor_fails_only_its_table() {
        let (dir, wh) = setup();
        let schemas = dir.path().join("schemas");
        fs::write(schemas.join("prices_schema.json"), PRICES).unwrap();
        fs::write(schemas.join("broken_schema.json"), "{not json").unwrap();

        let report = provision_tables(&wh, &schemas).unwrap();
        assert_eq!(report.failed, vec!["broken"]);
        assert_eq!(report.successful, vec!["prices"]);
        assert!(report.has_failures());
        assert_eq!(report.total(), 2);
    }

    #[test]
    fn empty_directory_yields_empty_report() {
        let (dir, wh) = setup();
        let report = provision_tables(&wh, &dir.path().join("schemas")).unwrap();
        assert_eq!(report, ProvisionReport::default());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let (dir, wh) = setup();
        assert!(matches!(
            provision_tables(&wh, &dir.path().join("nope")),
            Err(SchemaError::Read { .. })
        ));
    }
}
