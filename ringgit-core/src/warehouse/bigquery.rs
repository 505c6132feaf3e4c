//! BigQuery backend over the REST v2 API.
//!
//! Uses a blocking `reqwest` client with a bearer token taken from the
//! environment. Only the calls the jobs need are implemented: tables.get,
//! tables.insert, multipart load-job upload, jobs.get polling and
//! parameterised queries for the watermark table.

use super::table::{Partitioning, TableDefinition};
use super::{validate_table_id, LoadOutcome, Warehouse, WarehouseError, WriteDisposition};
use crate::calendar::parse_date;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://bigquery.googleapis.com";

/// Connection settings for [`BigQueryWarehouse`].
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project: String,
    pub dataset: String,
    pub access_token: String,
    pub location: Option<String>,
    pub api_base: String,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
}

impl BigQueryConfig {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            access_token: access_token.into(),
            location: None,
            api_base: DEFAULT_API_BASE.into(),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(r), Some(m)) => format!("{r}: {m}"),
            (None, Some(m)) => m.clone(),
            (Some(r), None) => r.clone(),
            (None, None) => "unknown error".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    status: JobStatus,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

impl Job {
    fn output_rows(&self) -> u64 {
        self.statistics
            .as_ref()
            .and_then(|s| s.load.as_ref())
            .and_then(|l| l.output_rows.as_deref())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct Cell {
    v: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Row {
    f: Vec<Cell>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<Row>,
}

impl QueryResponse {
    /// First cell of the first row as a string, if present and non-null.
    fn first_value(&self) -> Option<String> {
        self.rows
            .first()
            .and_then(|row| row.f.first())
            .and_then(|cell| cell.v.as_ref())
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

/// A BigQuery dataset.
pub struct BigQueryWarehouse {
    client: reqwest::blocking::Client,
    config: BigQueryConfig,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig) -> Result<Self, WarehouseError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.job_timeout)
            .build()
            .map_err(|e| WarehouseError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn api(&self, path: &str) -> String {
        format!(
            "{}/bigquery/v2/projects/{}{path}",
            self.config.api_base.trim_end_matches('/'),
            self.config.project
        )
    }

    fn table_url(&self, table: &str) -> String {
        self.api(&format!("/datasets/{}/tables/{table}", self.config.dataset))
    }

    fn qualified(&self, table: &str) -> String {
        format!("`{}.{}.{table}`", self.config.project, self.config.dataset)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<reqwest::blocking::Response, WarehouseError> {
        request
            .bearer_auth(&self.config.access_token)
            .send()
            .map_err(|e| WarehouseError::Network(e.to_string()))
    }

    /// Turn a non-success response into an error, or parse its JSON body.
    fn json_body<T: serde::de::DeserializeOwned>(
        resp: reqwest::blocking::Response,
    ) -> Result<T, WarehouseError> {
        let status = resp.status();
        let text = resp.text().map_err(|e| WarehouseError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn get_job(&self, job_id: &str, location: Option<&str>) -> Result<Job, WarehouseError> {
        let mut request = self.client.get(self.api(&format!("/jobs/{job_id}")));
        if let Some(loc) = location {
            request = request.query(&[("location", loc)]);
        }
        Self::json_body(self.send(request)?)
    }

    /// Poll a job until it reaches DONE, failing on its error result.
    fn wait_for_job(&self, mut job: Job) -> Result<Job, WarehouseError> {
        let deadline = Instant::now() + self.config.job_timeout;
        loop {
            if job.status.state == "DONE" {
                if let Some(err) = &job.status.error_result {
                    return Err(WarehouseError::JobFailed {
                        job_id: job.job_reference.job_id.clone(),
                        reason: err.describe(),
                    });
                }
                return Ok(job);
            }
            if Instant::now() >= deadline {
                return Err(WarehouseError::Timeout(format!("job {}", job.job_reference.job_id)));
            }
            std::thread::sleep(self.config.poll_interval);
            let location = job.job_reference.location.clone();
            job = self.get_job(&job.job_reference.job_id, location.as_deref())?;
        }
    }

    /// Run a parameterised standard-SQL query and wait for its result.
    fn query(&self, sql: &str, params: Vec<Value>) -> Result<QueryResponse, WarehouseError> {
        let body = query_body(sql, params, self.config.location.as_deref(), self.config.job_timeout);
        let request = self.client.post(self.api("/queries")).json(&body);
        let response: QueryResponse = Self::json_body(self.send(request)?)?;
        if response.job_complete {
            return Ok(response);
        }

        let reference = response
            .job_reference
            .ok_or_else(|| WarehouseError::Api {
                status: 200,
                message: "incomplete query without a job reference".into(),
            })?;
        let job = self.get_job(&reference.job_id, reference.location.as_deref())?;
        let job = self.wait_for_job(job)?;

        let mut request = self
            .client
            .get(self.api(&format!("/queries/{}", job.job_reference.job_id)));
        if let Some(loc) = job.job_reference.location.as_deref() {
            request = request.query(&[("location", loc)]);
        }
        Self::json_body(self.send(request)?)
    }
}

impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &str {
        "bigquery"
    }

    fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        validate_table_id(table)?;
        let resp = self.send(self.client.get(self.table_url(table)))?;
        match resp.status().as_u16() {
            404 => Ok(false),
            s if (200..300).contains(&s) => Ok(true),
            s => Err(api_error(s, &resp.text().unwrap_or_default())),
        }
    }

    fn create_table(&self, definition: &TableDefinition) -> Result<(), WarehouseError> {
        validate_table_id(&definition.table_id)?;
        let body = table_resource(&self.config.project, &self.config.dataset, definition);
        let url = self.api(&format!("/datasets/{}/tables", self.config.dataset));
        let resp = self.send(self.client.post(url).json(&body))?;
        match resp.status().as_u16() {
            409 => Err(WarehouseError::AlreadyExists(definition.table_id.clone())),
            _ => Self::json_body::<Value>(resp).map(|_| ()),
        }
    }

    fn num_rows(&self, table: &str) -> Result<u64, WarehouseError> {
        validate_table_id(table)?;
        let resp = self.send(self.client.get(self.table_url(table)))?;
        if resp.status().as_u16() == 404 {
            return Err(WarehouseError::NotFound(table.to_string()));
        }
        let body: Value = Self::json_body(resp)?;
        Ok(body
            .get("numRows")
            .and_then(Value::as_str)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    fn load_parquet(
        &self,
        table: &str,
        parquet: Vec<u8>,
        disposition: WriteDisposition,
    ) -> Result<LoadOutcome, WarehouseError> {
        validate_table_id(table)?;
        let config = load_job_config(
            &self.config.project,
            &self.config.dataset,
            table,
            disposition,
            self.config.location.as_deref(),
        );
        let boundary = format!("ringgit_{:016x}", rand::random::<u64>());
        let body = multipart_related(&boundary, &config, &parquet)?;

        let url = format!(
            "{}/upload/bigquery/v2/projects/{}/jobs?uploadType=multipart",
            self.config.api_base.trim_end_matches('/'),
            self.config.project
        );
        let request = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);
        let job: Job = Self::json_body(self.send(request)?)?;
        debug!("load job {} submitted for {table}", job.job_reference.job_id);

        let job = self.wait_for_job(job)?;
        Ok(LoadOutcome {
            output_rows: job.output_rows(),
        })
    }

    fn read_watermark(&self, meta_table: &str, tablename: &str) -> Result<Option<NaiveDate>, WarehouseError> {
        validate_table_id(meta_table)?;
        if !self.table_exists(meta_table)? {
            return Err(WarehouseError::NotFound(meta_table.to_string()));
        }
        let sql = format!(
            "SELECT CAST(MAX(latest_date) AS STRING) AS latest_date FROM {} WHERE tablename = @tablename",
            self.qualified(meta_table)
        );
        let response = self.query(&sql, vec![string_param("tablename", tablename)])?;
        match response.first_value() {
            None => Ok(None),
            Some(v) => parse_date(&v)
                .map(Some)
                .map_err(|e| WarehouseError::InvalidData {
                    table: meta_table.to_string(),
                    reason: format!("latest_date '{v}': {e}"),
                }),
        }
    }

    fn write_watermark(&self, meta_table: &str, tablename: &str, date: NaiveDate) -> Result<(), WarehouseError> {
        validate_table_id(meta_table)?;
        let sql = format!(
            "MERGE {} T \
             USING (SELECT @tablename AS tablename, @latest_date AS latest_date) S \
             ON T.tablename = S.tablename \
             WHEN MATCHED THEN UPDATE SET latest_date = S.latest_date \
             WHEN NOT MATCHED THEN INSERT (tablename, latest_date) VALUES (S.tablename, S.latest_date)",
            self.qualified(meta_table)
        );
        self.query(
            &sql,
            vec![
                string_param("tablename", tablename),
                typed_param("latest_date", "DATE", &date.format("%Y-%m-%d").to_string()),
            ],
        )?;
        Ok(())
    }
}

/// JSON body for tables.insert.
fn table_resource(project: &str, dataset: &str, definition: &TableDefinition) -> Value {
    let mut body = json!({
        "tableReference": {
            "projectId": project,
            "datasetId": dataset,
            "tableId": definition.table_id,
        },
        "schema": { "fields": definition.fields },
    });
    match &definition.partitioning {
        Some(Partitioning::Time { granularity, field }) => {
            body["timePartitioning"] = json!({ "type": granularity.as_str(), "field": field });
        }
        Some(Partitioning::Range {
            field,
            start,
            end,
            interval,
        }) => {
            body["rangePartitioning"] = json!({
                "field": field,
                "range": {
                    "start": start.to_string(),
                    "end": end.to_string(),
                    "interval": interval.to_string(),
                },
            });
        }
        None => {}
    }
    body
}

/// Job resource for a parquet load.
fn load_job_config(
    project: &str,
    dataset: &str,
    table: &str,
    disposition: WriteDisposition,
    location: Option<&str>,
) -> Value {
    let mut job = json!({
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": project,
                    "datasetId": dataset,
                    "tableId": table,
                },
                "sourceFormat": "PARQUET",
                "writeDisposition": disposition.as_bigquery(),
            }
        },
    });
    if let Some(loc) = location {
        job["jobReference"] = json!({ "projectId": project, "location": loc });
    }
    job
}

/// `multipart/related` body: JSON metadata part followed by the media part.
fn multipart_related(boundary: &str, metadata: &Value, media: &[u8]) -> Result<Vec<u8>, WarehouseError> {
    let meta = serde_json::to_vec(metadata)?;
    let mut body = Vec::with_capacity(meta.len() + media.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n").as_bytes());
    body.extend_from_slice(&meta);
    body.extend_from_slice(format!("\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\r\n").as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok(body)
}

fn query_body(sql: &str, params: Vec<Value>, location: Option<&str>, timeout: Duration) -> Value {
    let mut body = json!({
        "query": sql,
        "useLegacySql": false,
        "parameterMode": "NAMED",
        "queryParameters": params,
        "timeoutMs": timeout.as_millis().min(200_000) as u64,
    });
    if let Some(loc) = location {
        body["location"] = json!(loc);
    }
    body
}

fn typed_param(name: &str, type_name: &str, value: &str) -> Value {
    json!({
        "name": name,
        "parameterType": { "type": type_name },
        "parameterValue": { "value": value },
    })
}

fn string_param(name: &str, value: &str) -> Value {
    typed_param(name, "STRING", value)
}

/// Error from a non-success API response, preferring the API's own message.
fn api_error(status: u16, body: &str) -> WarehouseError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(500).collect());
    WarehouseError::Api { status, message }
}
