//! Schema descriptor parsing.
//!
//! ```json
//! {
//!   "columns": [
//!     {"name": "date", "field_type": "DATE", "mode": "REQUIRED"},
//!     {"name": "price", "field_type": "FLOAT"}
//!   ],
//!   "partitions": {"type": "TIME", "range": "MONTH", "field": "date"}
//! }
//! ```
//!
//! `partitions.type` is `TIME` (range = HOUR/DAY/MONTH/YEAR) or `INTEGER`
//! (range = bucket interval, with `start` and `end`). Any other type creates
//! the table unpartitioned.

use super::SchemaError;
use crate::warehouse::table::{
    FieldMode, FieldSchema, FieldType, Partitioning, TableDefinition, TimeGranularity,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// File-name suffix identifying a descriptor.
pub const SCHEMA_SUFFIX: &str = "_schema.json";

/// One column as written in a descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(alias = "type")]
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<ColumnDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub range: Option<Value>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDescriptor {
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub partitions: Option<PartitionDescriptor>,
}

impl SchemaDescriptor {
    pub fn from_file(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| SchemaError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn from_json(content: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(content).map_err(|e| SchemaError::Malformed {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })
    }
}

/// Table name for a descriptor file name, or `None` if the file is not a
/// descriptor (wrong suffix, or a template).
pub fn table_name_for(file_name: &str) -> Option<String> {
    if !file_name.ends_with(SCHEMA_SUFFIX) || file_name.contains("template") {
        return None;
    }
    let table = file_name.trim_end_matches(SCHEMA_SUFFIX);
    (!table.is_empty()).then(|| table.to_string())
}

/// Descriptor files in `dir` as `(table, path)` pairs, sorted by table name.
pub fn discover_descriptors(dir: &Path) -> Result<Vec<(String, PathBuf)>, SchemaError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SchemaError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SchemaError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let Some(table) = table_name_for(&file_name) {
            found.push((table, path));
        }
    }
    found.sort();
    Ok(found)
}

/// Translate a descriptor into a table definition.
pub fn parse_schema(table_id: &str, descriptor: &SchemaDescriptor) -> Result<TableDefinition, SchemaError> {
    if descriptor.columns.is_empty() {
        return Err(SchemaError::InvalidColumn(format!("{table_id} has no columns")));
    }
    let fields = convert_columns(&descriptor.columns)?;
    let mut definition = TableDefinition::new(table_id, fields);

    if let Some(spec) = &descriptor.partitions {
        if let Some(partitioning) = convert_partition(spec)? {
            let column = definition.field(partitioning.field()).ok_or_else(|| {
                SchemaError::InvalidPartition(format!(
                    "partition field '{}' is not a column of {table_id}",
                    partitioning.field()
                ))
            })?;
            check_partition_type(&partitioning, column.field_type)?;
            definition.partitioning = Some(partitioning);
        }
    }
    Ok(definition)
}

fn convert_columns(columns: &[ColumnDescriptor]) -> Result<Vec<FieldSchema>, SchemaError> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(columns.len());

    for column in columns {
        let name = column.name.trim();
        if name.is_empty() {
            return Err(SchemaError::InvalidColumn("column with empty name".into()));
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(SchemaError::InvalidColumn(format!("duplicate column '{name}'")));
        }

        let field_type = FieldType::parse(&column.field_type).ok_or_else(|| {
            SchemaError::InvalidColumn(format!("'{name}' has unknown type '{}'", column.field_type))
        })?;
        let mode = match column.mode.as_deref() {
            None => FieldMode::Nullable,
            Some(m) => FieldMode::parse(m)
                .ok_or_else(|| SchemaError::InvalidColumn(format!("'{name}' has unknown mode '{m}'")))?,
        };

        let nested = if field_type == FieldType::Record {
            if column.fields.is_empty() {
                return Err(SchemaError::InvalidColumn(format!("RECORD column '{name}' has no fields")));
            }
            convert_columns(&column.fields)?
        } else if !column.fields.is_empty() {
            return Err(SchemaError::InvalidColumn(format!(
                "'{name}' has sub-fields but type {field_type}"
            )));
        } else {
            Vec::new()
        };

        fields.push(FieldSchema {
            name: name.to_string(),
            field_type,
            mode,
            description: column.description.clone(),
            fields: nested,
        });
    }
    Ok(fields)
}

fn convert_partition(spec: &PartitionDescriptor) -> Result<Option<Partitioning>, SchemaError> {
    let kind = spec.kind.trim().to_ascii_uppercase();
    if kind != "TIME" && kind != "INTEGER" {
        warn!(
            "Partition type {} does not match \"TIME\" or \"INTEGER\". Defaulting to no partition.",
            spec.kind
        );
        return Ok(None);
    }

    let field = spec
        .field
        .clone()
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| SchemaError::InvalidPartition(format!("{kind} partition needs a field")))?;

    if kind == "TIME" {
        let range = spec.range.as_ref().and_then(Value::as_str).unwrap_or("");
        let granularity = TimeGranularity::parse(range).ok_or_else(|| {
            SchemaError::InvalidPartition(format!(
                "time partition range '{range}' is not HOUR, DAY, MONTH or YEAR"
            ))
        })?;
        return Ok(Some(Partitioning::Time { granularity, field }));
    }

    let interval = spec
        .range
        .as_ref()
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .ok_or_else(|| SchemaError::InvalidPartition("integer partition range must be an integer interval".into()))?;
    let (start, end) = match (spec.start, spec.end) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            return Err(SchemaError::InvalidPartition(
                "integer partition needs both start and end".into(),
            ))
        }
    };
    if interval <= 0 {
        return Err(SchemaError::InvalidPartition(format!("interval must be positive, got {interval}")));
    }
    if start >= end {
        return Err(SchemaError::InvalidPartition(format!("start {start} must be below end {end}")));
    }
    Ok(Some(Partitioning::Range {
        field,
        start,
        end,
        interval,
    }))
}

fn check_partition_type(partitioning: &Partitioning, field_type: FieldType) -> Result<(), SchemaError> {
    let ok = match partitioning {
        Partitioning::Time { .. } => field_type.is_time_partitionable(),
        Partitioning::Range { .. } => field_type == FieldType::Integer,
    };
    if ok {
        Ok(())
    } else {
        Err(SchemaError::InvalidPartition(format!(
            "{} cannot use {field_type} column '{}'",
            partitioning.label(),
            partitioning.field()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<TableDefinition, SchemaError> {
        parse_schema("t", &SchemaDescriptor::from_json(json)?)
    }

    #[test]
    fn table_names_from_file_names() {
        assert_eq!(table_name_for("items_schema.json").as_deref(), Some("items"));
        assert_eq!(table_name_for("template_schema.json"), None);
        assert_eq!(table_name_for("items_template_schema.json"), None);
        assert_eq!(table_name_for("items.json"), None);
        assert_eq!(table_name_for("_schema.json"), None);
    }

    #[test]
    fn time_partition() {
        let def = parse(
            r#"{"columns": [{"name": "date", "field_type": "DATE", "mode": "REQUIRED"},
                            {"name": "price", "type": "FLOAT64"}],
                "partitions": {"type": "TIME", "range": "MONTH", "field": "date"}}"#,
        )
        .unwrap();
        assert_eq!(def.fields[1].field_type, FieldType::Float);
        assert_eq!(def.fields[0].mode, FieldMode::Required);
        assert_eq!(
            def.partitioning,
            Some(Partitioning::Time {
                granularity: TimeGranularity::Month,
                field: "date".into()
            })
        );
    }

    #[test]
    fn integer_partition_uses_range_as_interval() {
        let def = parse(
            r#"{"columns": [{"name": "premise_code", "field_type": "INTEGER"}],
                "partitions": {"type": "INTEGER", "range": 100, "field": "premise_code",
                               "start": 0, "end": 5000}}"#,
        )
        .unwrap();
        assert_eq!(
            def.partitioning,
            Some(Partitioning::Range {
                field: "premise_code".into(),
                start: 0,
                end: 5000,
                interval: 100
            })
        );
    }

    #[test]
    fn integer_partition_without_bounds_is_rejected() {
        let err = parse(
            r#"{"columns": [{"name": "n", "field_type": "INTEGER"}],
                "partitions": {"type": "INTEGER", "range": 10, "field": "n"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidPartition(_)));
    }

    #[test]
    fn unknown_partition_type_means_no_partition() {
        let def = parse(
            r#"{"columns": [{"name": "n", "field_type": "INTEGER"}],
                "partitions": {"type": "HASH", "range": "DAY", "field": "n"}}"#,
        )
        .unwrap();
        assert!(def.partitioning.is_none());
    }

    #[test]
    fn missing_partitions_means_no_partition() {
        let def = parse(r#"{"columns": [{"name": "n", "field_type": "STRING"}]}"#).unwrap();
        assert!(def.partitioning.is_none());
    }

    #[test]
    fn bad_time_granularity_is_rejected() {
        let err = parse(
            r#"{"columns": [{"name": "d", "field_type": "DATE"}],
                "partitions": {"type": "TIME", "range": "WEEK", "field": "d"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("WEEK"));
    }

    #[test]
    fn partition_field_must_exist_and_have_matching_type() {
        let missing = parse(
            r#"{"columns": [{"name": "d", "field_type": "DATE"}],
                "partitions": {"type": "TIME", "range": "DAY", "field": "other"}}"#,
        );
        assert!(matches!(missing, Err(SchemaError::InvalidPartition(_))));

        let wrong_type = parse(
            r#"{"columns": [{"name": "d", "field_type": "STRING"}],
                "partitions": {"type": "TIME", "range": "DAY", "field": "d"}}"#,
        );
        assert!(matches!(wrong_type, Err(SchemaError::InvalidPartition(_))));
    }

    #[test]
    fn column_validation() {
        assert!(matches!(
            parse(r#"{"columns": [{"name": "a", "field_type": "VARCHAR"}]}"#),
            Err(SchemaError::InvalidColumn(_))
        ));
        assert!(matches!(
            parse(r#"{"columns": [{"name": "a", "field_type": "STRING", "mode": "OPTIONAL"}]}"#),
            Err(SchemaError::InvalidColumn(_))
        ));
        assert!(matches!(
            parse(r#"{"columns": [{"name": "a", "field_type": "STRING"}, {"name": "A", "field_type": "STRING"}]}"#),
            Err(SchemaError::InvalidColumn(_))
        ));
        assert!(matches!(
            parse(r#"{"columns": [{"name": "r", "field_type": "RECORD"}]}"#),
            Err(SchemaError::InvalidColumn(_))
        ));
        assert!(matches!(parse(r#"{"columns": []}"#), Err(SchemaError::InvalidColumn(_))));
    }

    #[test]
    fn nested_record_fields() {
        let def = parse(
            r#"{"columns": [{"name": "addr", "field_type": "STRUCT", "mode": "REPEATED",
                             "fields": [{"name": "state", "field_type": "STRING"}]}]}"#,
        )
        .unwrap();
        assert_eq!(def.fields[0].field_type, FieldType::Record);
        assert_eq!(def.fields[0].mode, FieldMode::Repeated);
        assert_eq!(def.fields[0].fields[0].name, "state");
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            SchemaDescriptor::from_json("{\"columns\": "),
            Err(SchemaError::Malformed { .. })
        ));
    }

    #[test]
    fn discover_skips_templates_and_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_schema.json", "a_schema.json", "template_schema.json", "notes.txt"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        std::fs::create_dir(dir.path().join("c_schema.json")).unwrap();

        let found = discover_descriptors(dir.path()).unwrap();
        let names: Vec<&str> = found.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
