//! Incremental load of monthly snapshots into the warehouse.

use super::frame::{batch_slices, date_span, prepare_month};
use super::source::SnapshotSource;
use super::{LoadError, SnapshotError};
use crate::calendar::months_between;
use crate::config::Settings;
use crate::warehouse::{decode_parquet, encode_parquet, Warehouse, WriteDisposition};
use chrono::NaiveDate;
use polars::prelude::DataFrame;
use std::time::Instant;
use tracing::{info, warn};

/// What to load and where.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub table: String,
    pub meta_table: String,
    pub batch_rows: usize,
    pub date_column: String,
    pub dedupe_keys: Vec<String>,
    /// Watermark used when the meta table has no row for `table`.
    pub initial_watermark: NaiveDate,
}

impl LoadOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let pc = &settings.pricecatcher;
        Self {
            table: pc.table.clone(),
            meta_table: settings.warehouse.meta_table.clone(),
            batch_rows: pc.batch_rows,
            date_column: pc.date_column.clone(),
            dedupe_keys: pc.dedupe_keys.clone(),
            initial_watermark: pc.initial_watermark,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub previous_watermark: NaiveDate,
    pub new_watermark: NaiveDate,
    /// True when the watermark was already at today and nothing ran.
    pub up_to_date: bool,
    pub months_attempted: usize,
    pub months_missing: usize,
    pub batches: usize,
    pub rows_loaded: u64,
}

/// Load every month since the watermark and advance it.
///
/// A month that cannot be fetched or decoded is logged and skipped. A
/// failure while transforming or loading stops the run and returns the error
/// after saving progress: each month is loaded in date order, so the
/// watermark moves to the day before the first row that did not load. Rows of
/// that one day which went out in the previous batch are loaded again on the
/// next run.
pub fn run_load(
    source: &dyn SnapshotSource,
    warehouse: &dyn Warehouse,
    options: &LoadOptions,
    today: NaiveDate,
) -> Result<LoadSummary, LoadError> {
    let watermark = match warehouse.read_watermark(&options.meta_table, &options.table)? {
        Some(date) => date,
        None => {
            info!(
                "No watermark for {} in {}, starting from {}",
                options.table, options.meta_table, options.initial_watermark
            );
            options.initial_watermark
        }
    };
    info!("Latest loaded date for {}: {watermark}", options.table);

    let mut summary = LoadSummary {
        previous_watermark: watermark,
        new_watermark: watermark,
        up_to_date: false,
        months_attempted: 0,
        months_missing: 0,
        batches: 0,
        rows_loaded: 0,
    };

    if watermark >= today {
        info!("Data is up to date");
        summary.up_to_date = true;
        return Ok(summary);
    }

    let mut latest = watermark;
    for month in months_between(watermark, today) {
        summary.months_attempted += 1;
        match load_month(source, warehouse, options, &month, watermark, &mut latest, &mut summary) {
            Ok(()) => {}
            Err(e) => {
                if latest > watermark {
                    warehouse.write_watermark(&options.meta_table, &options.table, latest)?;
                    warn!("Stopped at {month}; watermark advanced to {latest}");
                }
                return Err(e);
            }
        }
    }
    info!("Finished loading data into table");

    warehouse.write_watermark(&options.meta_table, &options.table, latest)?;
    info!(
        "Updated meta table latest_date for tablename: `{}` with value {latest}",
        options.table
    );
    summary.new_watermark = latest;
    Ok(summary)
}

/// Load one month, moving `progress` to the latest date known to be complete.
fn load_month(
    source: &dyn SnapshotSource,
    warehouse: &dyn Warehouse,
    options: &LoadOptions,
    month: &str,
    watermark: NaiveDate,
    progress: &mut NaiveDate,
    summary: &mut LoadSummary,
) -> Result<(), LoadError> {
    let fetch_started = Instant::now();
    let bytes = match source.fetch_month(month) {
        Ok(bytes) => bytes,
        Err(SnapshotError::NotPublished(_)) => {
            info!("No pricecatcher transaction data published for {month}");
            summary.months_missing += 1;
            return Ok(());
        }
        Err(e) => {
            warn!("Unable to extract pricecatcher transaction data for {month}: {e}");
            summary.months_missing += 1;
            return Ok(());
        }
    };
    let raw = match decode_parquet(&bytes) {
        Ok(df) => df,
        Err(e) => {
            warn!("Snapshot for {month} is not readable parquet: {e}");
            summary.months_missing += 1;
            return Ok(());
        }
    };
    info!(
        "Fetched {} rows for {month} in {:.3} seconds",
        raw.height(),
        fetch_started.elapsed().as_secs_f64()
    );

    let transform = |e: polars::prelude::PolarsError| LoadError::Transform {
        month: month.to_string(),
        reason: e.to_string(),
    };
    let df = prepare_month(raw, &options.date_column, &options.dedupe_keys, watermark).map_err(transform)?;
    let Some((first, last)) = date_span(&df, &options.date_column).map_err(transform)? else {
        info!("No new rows after {watermark} in {month}");
        return Ok(());
    };

    for (idx, slice) in batch_slices(&df, options.batch_rows).into_iter().enumerate() {
        let span = date_span(&slice, &options.date_column).map_err(transform)?;
        let rows = match load_batch(warehouse, options, slice) {
            Ok(rows) => rows,
            Err(e) => {
                // Every row dated before this batch's first day is already in.
                if idx > 0 {
                    if let Some(done) = span.and_then(|(lo, _)| lo.pred_opt()) {
                        *progress = (*progress).max(done);
                    }
                }
                return Err(e);
            }
        };

        summary.batches += 1;
        summary.rows_loaded += rows;
        info!("Batch {} finished", idx + 1);
        if let Some((lo, hi)) = span {
            info!("Data loaded for {lo} to {hi}");
        }
    }

    info!("{month}: {} new rows dated {first} to {last}", df.height());
    *progress = (*progress).max(last);
    Ok(())
}

/// Append one slice; returns the rows the warehouse reported writing.
fn load_batch(warehouse: &dyn Warehouse, options: &LoadOptions, mut slice: DataFrame) -> Result<u64, LoadError> {
    let buf_started = Instant::now();
    let parquet = encode_parquet(&mut slice)?;
    info!("Loaded data to buffer in {:.3} seconds", buf_started.elapsed().as_secs_f64());

    let initial_rows = warehouse.num_rows(&options.table)?;
    info!("Loading data into table {}...", options.table);
    let load_started = Instant::now();
    let outcome = warehouse.load_parquet(&options.table, parquet, WriteDisposition::Append)?;
    let elapsed = load_started.elapsed().as_secs_f64();
    let loaded_rows = warehouse.num_rows(&options.table)?.saturating_sub(initial_rows);
    info!("Successfully loaded {loaded_rows} rows into the table after {elapsed:.3} seconds");
    Ok(outcome.output_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{FieldSchema, FieldType, LocalWarehouse, TableDefinition};
    use polars::prelude::*;
    use std::collections::HashMap;

    struct Months(HashMap<String, Vec<u8>>);

    impl SnapshotSource for Months {
        fn name(&self) -> &str {
            "memory"
        }

        fn fetch_month(&self, month: &str) -> Result<Vec<u8>, SnapshotError> {
            self.0
                .get(month)
                .cloned()
                .ok_or_else(|| SnapshotError::NotPublished(month.to_string()))
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn month_file(dates: &[&str], premise: &[i64], item: &[i64]) -> Vec<u8> {
        let price: Vec<f64> = (0..dates.len()).map(|i| i as f64).collect();
        let mut df = df!(
            "date" => dates,
            "premise_code" => premise,
            "item_code" => item,
            "price" => price,
        )
        .unwrap();
        encode_parquet(&mut df).unwrap()
    }

    fn warehouse(dir: &std::path::Path) -> LocalWarehouse {
        let wh = LocalWarehouse::new(dir, "ds");
        wh.create_table(&TableDefinition::new(
            "prices",
            vec![
                FieldSchema::new("date", FieldType::Date).required(),
                FieldSchema::new("premise_code", FieldType::Integer),
                FieldSchema::new("item_code", FieldType::Integer),
                FieldSchema::new("price", FieldType::Float),
            ],
        ))
        .unwrap();
        wh.create_table(&TableDefinition::watermark_table("meta")).unwrap();
        wh
    }

    fn options(batch_rows: usize) -> LoadOptions {
        LoadOptions {
            table: "prices".into(),
            meta_table: "meta".into(),
            batch_rows,
            date_column: "date".into(),
            dedupe_keys: vec!["date".into(), "premise_code".into(), "item_code".into()],
            initial_watermark: d(2024, 1, 15),
        }
    }

    #[test]
    fn loads_new_rows_in_batches_and_advances_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let wh = warehouse(dir.path());
        let source = Months(HashMap::from([
            (
                "2024-01".to_string(),
                month_file(&["2024-01-10", "2024-01-20", "2024-01-20"], &[1, 1, 1], &[5, 5, 5]),
            ),
            (
                "2024-02".to_string(),
                month_file(&["2024-02-01", "2024-02-02", "2024-02-03"], &[1, 2, 3], &[5, 6, 7]),
            ),
        ]));

        let summary = run_load(&source, &wh, &options(2), d(2024, 3, 10)).unwrap();
        assert_eq!(summary.months_attempted, 3);
        assert_eq!(summary.months_missing, 1);
        assert_eq!(summary.rows_loaded, 4);
        // January: 1 row in 1 batch; February: 3 rows in 2 batches.
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.new_watermark, d(2024, 2, 3));
        assert_eq!(wh.num_rows("prices").unwrap(), 4);
        assert_eq!(wh.read_watermark("meta", "prices").unwrap(), Some(d(2024, 2, 3)));

        // A rerun over the same snapshots loads nothing new.
        let again = run_load(&source, &wh, &options(2), d(2024, 3, 10)).unwrap();
        assert_eq!(again.rows_loaded, 0);
        assert_eq!(again.new_watermark, d(2024, 2, 3));
        assert_eq!(wh.num_rows("prices").unwrap(), 4);
    }

    #[test]
    fn up_to_date_watermark_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let wh = warehouse(dir.path());
        wh.write_watermark("meta", "prices", d(2024, 3, 10)).unwrap();
        let meta_parts = wh.manifest("meta").unwrap().parts.len();

        let source = Months(HashMap::new());
        let summary = run_load(&source, &wh, &options(10), d(2024, 3, 10)).unwrap();
        assert!(summary.up_to_date);
        assert_eq!(summary.months_attempted, 0);
        assert_eq!(wh.manifest("meta").unwrap().parts.len(), meta_parts);
    }

    #[test]
    fn nothing_new_keeps_old_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let wh = warehouse(dir.path());
        let source = Months(HashMap::new());

        let summary = run_load(&source, &wh, &options(10), d(2024, 2, 1)).unwrap();
        assert_eq!(summary.months_missing, 2);
        assert_eq!(summary.new_watermark, d(2024, 1, 15));
        assert_eq!(wh.read_watermark("meta", "prices").unwrap(), Some(d(2024, 1, 15)));
    }

    #[test]
    fn rejected_load_stops_but_keeps_finished_months() {
        let dir = tempfile::tempdir().unwrap();
        let wh = warehouse(dir.path());
        let mut bad = df!(
            "date" => &["2024-02-05"],
            "unexpected" => &[1i64],
        )
        .unwrap();
        let source = Months(HashMap::from([
            ("2024-01".to_string(), month_file(&["2024-01-20"], &[1], &[1])),
            ("2024-02".to_string(), encode_parquet(&mut bad).unwrap()),
        ]));
        let mut opts = options(10);
        opts.dedupe_keys = vec!["date".into()];

        let err = run_load(&source, &wh, &opts, d(2024, 3, 1)).unwrap_err();
        assert!(matches!(err, LoadError::Warehouse(_)));
        assert_eq!(wh.read_watermark("meta", "prices").unwrap(), Some(d(2024, 1, 20)));
    }

    /// Local warehouse that refuses appends once its budget is spent.
    struct FlakyWarehouse {
        inner: LocalWarehouse,
        loads_left: std::sync::Mutex<usize>,
    }

    impl Warehouse for FlakyWarehouse {
        fn name(&self) -> &str {
            "flaky"
        }

        fn table_exists(&self, table: &str) -> Result<bool, crate::warehouse::WarehouseError> {
            self.inner.table_exists(table)
        }

        fn create_table(&self, definition: &TableDefinition) -> Result<(), crate::warehouse::WarehouseError> {
            self.inner.create_table(definition)
        }

        fn num_rows(&self, table: &str) -> Result<u64, crate::warehouse::WarehouseError> {
            self.inner.num_rows(table)
        }

        fn load_parquet(
            &self,
            table: &str,
            parquet: Vec<u8>,
            disposition: WriteDisposition,
        ) -> Result<crate::warehouse::LoadOutcome, crate::warehouse::WarehouseError> {
            let mut left = self.loads_left.lock().unwrap();
            if *left == 0 {
                return Err(crate::warehouse::WarehouseError::Network("connection reset".into()));
            }
            *left -= 1;
            self.inner.load_parquet(table, parquet, disposition)
        }

        fn read_watermark(
            &self,
            meta_table: &str,
            tablename: &str,
        ) -> Result<Option<NaiveDate>, crate::warehouse::WarehouseError> {
            self.inner.read_watermark(meta_table, tablename)
        }

        fn write_watermark(
            &self,
            meta_table: &str,
            tablename: &str,
            date: NaiveDate,
        ) -> Result<(), crate::warehouse::WarehouseError> {
            self.inner.write_watermark(meta_table, tablename, date)
        }
    }

    #[test]
    fn failed_batch_keeps_completed_days_and_rerun_loads_the_rest_once() {
        let dir = tempfile::tempdir().unwrap();
        let wh = FlakyWarehouse {
            inner: warehouse(dir.path()),
            loads_left: std::sync::Mutex::new(1),
        };
        // Out of date order on purpose; batches go out sorted.
        let source = Months(HashMap::from([(
            "2024-02".to_string(),
            month_file(
                &["2024-02-03", "2024-02-01", "2024-02-04", "2024-02-02"],
                &[1, 1, 1, 1],
                &[5, 5, 5, 5],
            ),
        )]));
        let mut opts = options(2);
        opts.initial_watermark = d(2024, 1, 31);

        let err = run_load(&source, &wh, &opts, d(2024, 2, 10)).unwrap_err();
        assert!(matches!(err, LoadError::Warehouse(_)));
        // 02-01 and 02-02 went out in the first batch.
        assert_eq!(wh.num_rows("prices").unwrap(), 2);
        assert_eq!(wh.read_watermark("meta", "prices").unwrap(), Some(d(2024, 2, 2)));

        *wh.loads_left.lock().unwrap() = usize::MAX;
        let rerun = run_load(&source, &wh, &opts, d(2024, 2, 10)).unwrap();
        assert_eq!(rerun.previous_watermark, d(2024, 2, 2));
        assert_eq!(rerun.rows_loaded, 2);
        assert_eq!(wh.num_rows("prices").unwrap(), 4);
        assert_eq!(rerun.new_watermark, d(2024, 2, 4));
    }

    #[test]
    fn garbage_snapshot_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let wh = warehouse(dir.path());
        let source = Months(HashMap::from([("2024-01".to_string(), b"not parquet".to_vec())]));
        let summary = run_load(&source, &wh, &options(10), d(2024, 1, 31)).unwrap();
        assert_eq!(summary.months_missing, 1);
        assert_eq!(summary.rows_loaded, 0);
    }
}
