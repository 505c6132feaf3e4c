//! Filesystem-backed warehouse.
//!
//! Layout: `{root}/{dataset}/{table}/table.json` plus one
//! `part-NNNNNN.parquet` file per load.
//!
//! - The manifest holds the table definition and the list of parts (row
//!   count and BLAKE3 hash of each payload)
//! - Writes are atomic (write to .tmp, rename into place); a truncating load
//!   removes the replaced parts only after the new manifest is in place
//! - Loads are validated against the definition before anything is written
//! - The watermark table is an ordinary table, rewritten on every upsert

use super::table::{FieldMode, TableDefinition};
use super::{
    decode_parquet, encode_parquet, validate_table_id, LoadOutcome, Warehouse, WarehouseError,
    WriteDisposition,
};
use crate::calendar::{from_epoch_days, parse_date, to_epoch_days};
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "table.json";

/// Manifest sidecar for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableManifest {
    pub definition: TableDefinition,
    pub created_at: NaiveDateTime,
    pub next_part: u64,
    pub parts: Vec<PartMeta>,
}

impl TableManifest {
    pub fn num_rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows).sum()
    }
}

/// One loaded parquet payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartMeta {
    pub file: String,
    pub rows: u64,
    pub data_hash: String,
    pub loaded_at: NaiveDateTime,
}

/// A warehouse dataset stored as parquet files on local disk.
pub struct LocalWarehouse {
    dataset_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>, dataset: &str) -> Self {
        Self {
            dataset_dir: root.into().join(dataset),
            write_lock: Mutex::new(()),
        }
    }

    /// Directory holding every table of the dataset.
    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn table_dir(&self, table: &str) -> Result<PathBuf, WarehouseError> {
        validate_table_id(table)?;
        Ok(self.dataset_dir.join(table))
    }

    fn manifest_path(&self, table: &str) -> Result<PathBuf, WarehouseError> {
        Ok(self.table_dir(table)?.join(MANIFEST_FILE))
    }

    /// Read a table's manifest.
    pub fn manifest(&self, table: &str) -> Result<TableManifest, WarehouseError> {
        let path = self.manifest_path(table)?;
        if !path.exists() {
            return Err(WarehouseError::NotFound(table.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_manifest(&self, table: &str, manifest: &TableManifest) -> Result<(), WarehouseError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&self.manifest_path(table)?, &bytes)
    }

    /// The definition a table was created with.
    pub fn definition(&self, table: &str) -> Result<TableDefinition, WarehouseError> {
        Ok(self.manifest(table)?.definition)
    }

    /// Names of all tables in the dataset, sorted.
    pub fn tables(&self) -> Result<Vec<String>, WarehouseError> {
        if !self.dataset_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dataset_dir)? {
            let entry = entry?;
            if entry.path().join(MANIFEST_FILE).exists() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every row of a table, parts concatenated in load order.
    pub fn read_table(&self, table: &str) -> Result<DataFrame, WarehouseError> {
        let manifest = self.manifest(table)?;
        let dir = self.table_dir(table)?;

        let mut combined: Option<DataFrame> = None;
        for part in &manifest.parts {
            let bytes = fs::read(dir.join(&part.file))?;
            let df = decode_parquet(&bytes)?;
            combined = Some(match combined {
                None => df,
                Some(mut acc) => {
                    acc.vstack_mut(&df)
                        .map_err(|e| WarehouseError::Parquet(format!("concat {}: {e}", part.file)))?;
                    acc
                }
            });
        }
        Ok(combined.unwrap_or_default())
    }

    fn load_locked(
        &self,
        table: &str,
        parquet: Vec<u8>,
        disposition: WriteDisposition,
    ) -> Result<LoadOutcome, WarehouseError> {
        let mut manifest = self.manifest(table)?;
        let dir = self.table_dir(table)?;

        let df = decode_parquet(&parquet)?;
        validate_payload(table, &manifest.definition, &df)?;

        let file = format!("part-{:06}.parquet", manifest.next_part);
        write_atomic(&dir.join(&file), &parquet)?;

        let stale = match disposition {
            WriteDisposition::Truncate => std::mem::take(&mut manifest.parts),
            WriteDisposition::Append => Vec::new(),
        };
        let rows = df.height() as u64;
        manifest.parts.push(PartMeta {
            file: file.clone(),
            rows,
            data_hash: blake3::hash(&parquet).to_hex().to_string(),
            loaded_at: chrono::Local::now().naive_local(),
        });
        manifest.next_part += 1;
        if let Err(e) = self.write_manifest(table, &manifest) {
            let _ = fs::remove_file(dir.join(&file));
            return Err(e);
        }

        // The manifest no longer lists these, so a failed delete only leaves an orphan.
        for part in stale {
            match fs::remove_file(dir.join(&part.file)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove replaced part {table}/{}: {e}", part.file),
            }
        }

        debug!("wrote {rows} rows to {table}/{file}");
        Ok(LoadOutcome { output_rows: rows })
    }

    fn watermark_rows(&self, meta_table: &str) -> Result<Vec<(String, Option<NaiveDate>)>, WarehouseError> {
        let df = self.read_table(meta_table)?;
        if df.height() == 0 {
            return Ok(Vec::new());
        }
        let map_err = |e: PolarsError| WarehouseError::Parquet(format!("{meta_table}: {e}"));

        let names = df.column("tablename").map_err(map_err)?;
        let names = names.str().map_err(map_err)?;
        let dates = date_values(df.column("latest_date").map_err(map_err)?)
            .map_err(|e| WarehouseError::Parquet(format!("{meta_table}: {e}")))?;

        Ok(names
            .into_iter()
            .zip(dates)
            .filter_map(|(name, date)| name.map(|n| (n.to_string(), date)))
            .collect())
    }
}

impl Warehouse for LocalWarehouse {
    fn name(&self) -> &str {
        "local"
    }

    fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        Ok(self.manifest_path(table)?.exists())
    }

    fn create_table(&self, definition: &TableDefinition) -> Result<(), WarehouseError> {
        let _guard = self.lock();
        let table = definition.table_id.as_str();
        if self.table_exists(table)? {
            return Err(WarehouseError::AlreadyExists(table.to_string()));
        }
        fs::create_dir_all(self.table_dir(table)?)?;
        let manifest = TableManifest {
            definition: definition.clone(),
            created_at: chrono::Local::now().naive_local(),
            next_part: 0,
            parts: Vec::new(),
        };
        self.write_manifest(table, &manifest)
    }

    fn num_rows(&self, table: &str) -> Result<u64, WarehouseError> {
        Ok(self.manifest(table)?.num_rows())
    }

    fn load_parquet(
        &self,
        table: &str,
        parquet: Vec<u8>,
        disposition: WriteDisposition,
    ) -> Result<LoadOutcome, WarehouseError> {
        let _guard = self.lock();
        self.load_locked(table, parquet, disposition)
    }

    fn read_watermark(&self, meta_table: &str, tablename: &str) -> Result<Option<NaiveDate>, WarehouseError> {
        Ok(self
            .watermark_rows(meta_table)?
            .into_iter()
            .filter(|(name, _)| name == tablename)
            .filter_map(|(_, date)| date)
            .max())
    }

    fn write_watermark(&self, meta_table: &str, tablename: &str, date: NaiveDate) -> Result<(), WarehouseError> {
        let _guard = self.lock();
        let mut rows = self.watermark_rows(meta_table)?;
        rows.retain(|(name, _)| name != tablename);
        rows.push((tablename.to_string(), Some(date)));
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let names: Vec<String> = rows.iter().map(|(n, _)| n.clone()).collect();
        let days: Vec<Option<i32>> = rows.iter().map(|(_, d)| d.map(to_epoch_days)).collect();

        let mut df = DataFrame::new(vec![
            Column::new("tablename".into(), names),
            Column::new("latest_date".into(), days)
                .cast(&DataType::Date)
                .map_err(|e| WarehouseError::Parquet(format!("date cast: {e}")))?,
        ])
        .map_err(|e| WarehouseError::Parquet(format!("dataframe creation: {e}")))?;

        let bytes = encode_parquet(&mut df)?;
        self.load_locked(meta_table, bytes, WriteDisposition::Truncate)?;
        Ok(())
    }
}

/// Reject payloads the table schema cannot accept.
fn validate_payload(table: &str, definition: &TableDefinition, df: &DataFrame) -> Result<(), WarehouseError> {
    if definition.fields.is_empty() {
        return Ok(());
    }
    let reject = |reason: String| WarehouseError::InvalidData {
        table: table.to_string(),
        reason,
    };

    for name in df.get_column_names() {
        if definition.field(name.as_str()).is_none() {
            return Err(reject(format!("column '{name}' is not in the table schema")));
        }
    }

    for field in definition.fields.iter().filter(|f| f.mode == FieldMode::Required) {
        let column = df
            .column(&field.name)
            .map_err(|_| reject(format!("missing required column '{}'", field.name)))?;
        if column.null_count() > 0 {
            return Err(reject(format!(
                "required column '{}' has {} null value(s)",
                field.name,
                column.null_count()
            )));
        }
    }
    Ok(())
}

/// Read a Date, Datetime or `YYYY-MM-DD` string column as dates.
fn date_values(column: &Column) -> Result<Vec<Option<NaiveDate>>, PolarsError> {
    match column.dtype() {
        DataType::String => Ok(column
            .str()?
            .into_iter()
            .map(|v| v.and_then(|s| parse_date(s).ok()))
            .collect()),
        DataType::Date => Ok(column
            .date()?
            .physical()
            .into_iter()
            .map(|v| v.and_then(from_epoch_days))
            .collect()),
        _ => {
            let cast = column.cast(&DataType::Date)?;
            Ok(cast
                .date()?
                .physical()
                .into_iter()
                .map(|v| v.and_then(from_epoch_days))
                .collect())
        }
    }
}

/// Write to `{path}.tmp` then rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WarehouseError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        WarehouseError::Io(e)
    })
}
