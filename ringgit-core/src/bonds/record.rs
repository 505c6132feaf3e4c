//! Yield records, vehicle files and raw API responses.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// One security's yield quote for one trading day.
///
/// Only `trading_date` and the security type are interpreted; every other
/// field is carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldRecord {
    pub trading_date: NaiveDate,
    #[serde(default, alias = "securities_type", skip_serializing_if = "Option::is_none")]
    pub security_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl YieldRecord {
    /// Deduplication key.
    pub fn key(&self) -> (NaiveDate, String) {
        (self.trading_date, self.security_type.clone().unwrap_or_default())
    }
}

/// A local JSON file of yield history: `{"data": [...], ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleFile {
    #[serde(default)]
    pub data: Vec<YieldRecord>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl VehicleFile {
    /// Trading date of the last record, which is the latest one.
    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.data.last().map(|r| r.trading_date)
    }
}

/// What the API returned for one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldResponse {
    pub status: u16,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// One entry of a yearly raw snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub date: NaiveDate,
    pub data: Option<Value>,
    pub meta: Option<Value>,
    pub status: u16,
}

/// Status recorded for a request that produced no response.
pub const NO_RESPONSE_STATUS: u16 = 400;

impl SnapshotEntry {
    pub fn from_response(date: NaiveDate, response: YieldResponse) -> Self {
        Self {
            date,
            data: response.data,
            meta: response.meta,
            status: response.status,
        }
    }

    pub fn failed(date: NaiveDate) -> Self {
        Self {
            date,
            data: None,
            meta: None,
            status: NO_RESPONSE_STATUS,
        }
    }

    /// `meta.last_updated`, empty when absent.
    pub fn last_updated(&self) -> &str {
        self.meta
            .as_ref()
            .and_then(|m| m.get("last_updated"))
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Yield records carried by this entry.
    ///
    /// `data` may be a single object or an array of objects. Records without
    /// a `trading_date` are dated with the requested date; unparseable
    /// records are logged and dropped.
    pub fn records(&self) -> Vec<YieldRecord> {
        if !self.is_success() {
            return Vec::new();
        }
        let items: Vec<&Value> = match &self.data {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(obj @ Value::Object(_)) => vec![obj],
            _ => Vec::new(),
        };

        items
            .into_iter()
            .filter_map(|item| {
                let Some(obj) = item.as_object() else {
                    warn!("{}: skipping non-object record {item}", self.date);
                    return None;
                };
                let mut obj = obj.clone();
                if !obj.contains_key("trading_date") {
                    obj.insert(
                        "trading_date".into(),
                        Value::String(self.date.format("%Y-%m-%d").to_string()),
                    );
                }
                match serde_json::from_value(Value::Object(obj)) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!("{}: skipping unreadable record: {e}", self.date);
                        None
                    }
                }
            })
            .collect()
    }
}
