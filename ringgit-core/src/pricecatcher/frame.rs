//! DataFrame transforms for one month of transactions.

use crate::calendar::from_epoch_days;
use chrono::NaiveDate;
use polars::prelude::*;
use tracing::warn;

/// Length of the `YYYY-MM-DD` prefix of a date or timestamp string.
const ISO_DATE_LEN: i64 = 10;

/// Cast the date column to `Date`, whatever it was stored as.
///
/// Strings are read from their `YYYY-MM-DD` prefix, so timestamps such as
/// `2024-03-01 00:00:00` keep their day. Unparseable values become null and
/// are reported, since the watermark filter drops them.
pub fn normalize_dates(df: DataFrame, date_column: &str) -> PolarsResult<DataFrame> {
    let column = df.column(date_column)?;
    let dtype = column.dtype().clone();
    let nulls_before = column.null_count();

    let expr = match dtype {
        DataType::Date => return Ok(df),
        DataType::String => col(date_column)
            .str()
            .head(lit(ISO_DATE_LEN))
            .str()
            .to_date(StrptimeOptions {
                format: Some("%Y-%m-%d".into()),
                strict: false,
                ..Default::default()
            }),
        DataType::Datetime(_, _) => col(date_column).cast(DataType::Date),
        other => polars_bail!(
            SchemaMismatch: "column '{}' has type {}, expected a date, datetime or string",
            date_column, other
        ),
    };

    let out = df.lazy().with_column(expr).collect()?;
    let unreadable = out.column(date_column)?.null_count().saturating_sub(nulls_before);
    if unreadable > 0 {
        warn!("{unreadable} value(s) in '{date_column}' are not dates and will be skipped");
    }
    Ok(out)
}

/// Drop repeated keys (keeping the first row) and rows at or before `watermark`.
///
/// The result is ordered by date; rows sharing a date keep their input order.
pub fn dedupe_and_filter(
    df: DataFrame,
    date_column: &str,
    keys: &[String],
    watermark: NaiveDate,
) -> PolarsResult<DataFrame> {
    df.lazy()
        .unique_stable(
            Some(keys.iter().map(|k| k.as_str().into()).collect()),
            UniqueKeepStrategy::First,
        )
        .filter(col(date_column).gt(lit(watermark)))
        .sort([date_column], SortMultipleOptions::default().with_maintain_order(true))
        .collect()
}

/// Full per-month transform: normalise dates, dedupe, keep rows after the watermark.
pub fn prepare_month(
    df: DataFrame,
    date_column: &str,
    keys: &[String],
    watermark: NaiveDate,
) -> PolarsResult<DataFrame> {
    let df = normalize_dates(df, date_column)?;
    dedupe_and_filter(df, date_column, keys, watermark)
}

/// Earliest and latest date in a `Date` column.
pub fn date_span(df: &DataFrame, date_column: &str) -> PolarsResult<Option<(NaiveDate, NaiveDate)>> {
    let dates = df.column(date_column)?.date()?.physical();
    let Some((lo, hi)) = dates.min().zip(dates.max()) else {
        return Ok(None);
    };
    match (from_epoch_days(lo), from_epoch_days(hi)) {
        (Some(first), Some(last)) => Ok(Some((first, last))),
        _ => polars_bail!(
            ComputeError: "column '{}' holds dates outside the supported range", date_column
        ),
    }
}

/// Split into consecutive slices of at most `batch_rows` rows.
///
/// An empty frame yields no slices.
pub fn batch_slices(df: &DataFrame, batch_rows: usize) -> Vec<DataFrame> {
    let batch_rows = batch_rows.max(1);
    (0..df.height())
        .step_by(batch_rows)
        .map(|offset| df.slice(offset as i64, batch_rows))
        .collect()
}
