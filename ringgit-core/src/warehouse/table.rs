//! Warehouse table definitions: columns, modes, partitioning.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column type, named the way BigQuery names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Numeric,
    Bignumeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    Datetime,
    Geography,
    Json,
    Record,
    Interval,
    Range,
}

impl FieldType {
    /// Parse a type name, accepting the standard-SQL aliases (`INT64`, `STRUCT`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        let t = match name.trim().to_ascii_uppercase().as_str() {
            "STRING" => Self::String,
            "BYTES" => Self::Bytes,
            "INTEGER" | "INT64" => Self::Integer,
            "FLOAT" | "FLOAT64" => Self::Float,
            "NUMERIC" => Self::Numeric,
            "BIGNUMERIC" => Self::Bignumeric,
            "BOOLEAN" | "BOOL" => Self::Boolean,
            "TIMESTAMP" => Self::Timestamp,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "DATETIME" => Self::Datetime,
            "GEOGRAPHY" => Self::Geography,
            "JSON" => Self::Json,
            "RECORD" | "STRUCT" => Self::Record,
            "INTERVAL" => Self::Interval,
            "RANGE" => Self::Range,
            _ => return None,
        };
        Some(t)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Bytes => "BYTES",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Numeric => "NUMERIC",
            Self::Bignumeric => "BIGNUMERIC",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::Datetime => "DATETIME",
            Self::Geography => "GEOGRAPHY",
            Self::Json => "JSON",
            Self::Record => "RECORD",
            Self::Interval => "INTERVAL",
            Self::Range => "RANGE",
        }
    }

    /// Types a time-partitioned table may be partitioned on.
    pub fn is_time_partitionable(&self) -> bool {
        matches!(self, Self::Date | Self::Timestamp | Self::Datetime)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "NULLABLE" => Some(Self::Nullable),
            "REQUIRED" => Some(Self::Required),
            "REPEATED" => Some(Self::Repeated),
            _ => None,
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Sub-fields of a RECORD column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            description: None,
            fields: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.mode = FieldMode::Required;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeGranularity {
    Hour,
    Day,
    Month,
    Year,
}

impl TimeGranularity {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "HOUR" => Some(Self::Hour),
            "DAY" => Some(Self::Day),
            "MONTH" => Some(Self::Month),
            "YEAR" => Some(Self::Year),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "HOUR",
            Self::Day => "DAY",
            Self::Month => "MONTH",
            Self::Year => "YEAR",
        }
    }
}

/// How a table is partitioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Partitioning {
    /// Partition on a DATE/TIMESTAMP/DATETIME column.
    Time {
        granularity: TimeGranularity,
        field: String,
    },
    /// Partition on an INTEGER column in buckets of `interval` over `[start, end)`.
    Range {
        field: String,
        start: i64,
        end: i64,
        interval: i64,
    },
}

impl Partitioning {
    pub fn field(&self) -> &str {
        match self {
            Self::Time { field, .. } | Self::Range { field, .. } => field,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Time { .. } => "Time Partitioning",
            Self::Range { .. } => "Range Partitioning",
        }
    }
}

/// Everything needed to create a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_id: String,
    pub fields: Vec<FieldSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitioning: Option<Partitioning>,
}

impl TableDefinition {
    pub fn new(table_id: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            table_id: table_id.into(),
            fields,
            partitioning: None,
        }
    }

    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The `(tablename, latest_date)` watermark table.
    pub fn watermark_table(table_id: impl Into<String>) -> Self {
        Self::new(
            table_id,
            vec![
                FieldSchema::new("tablename", FieldType::String).required(),
                FieldSchema::new("latest_date", FieldType::Date),
            ],
        )
    }
}
