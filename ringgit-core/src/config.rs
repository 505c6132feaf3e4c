//! Job configuration.
//!
//! Settings come from an optional TOML file (every field has a default),
//! then from the process environment (optionally seeded by a `.env` file),
//! then from CLI flags applied by the caller.

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "ringgit.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to load env file {path}: {reason}")]
    EnvFile { path: PathBuf, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level settings for all jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub warehouse: WarehouseSettings,
    pub schemas: SchemaSettings,
    pub bonds: BondSettings,
    pub pricecatcher: PricecatcherSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseBackend {
    /// Parquet files on local disk.
    #[default]
    Local,
    /// Google BigQuery over its REST API.
    Bigquery,
}

impl std::str::FromStr for WarehouseBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "bigquery" | "bq" => Ok(Self::Bigquery),
            other => Err(ConfigError::Invalid(format!(
                "unknown warehouse backend '{other}' (expected 'local' or 'bigquery')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WarehouseSettings {
    pub backend: WarehouseBackend,
    /// GCP project (BigQuery only).
    pub project: Option<String>,
    pub dataset: String,
    /// OAuth bearer token (BigQuery only). Normally supplied via `GCP_ACCESS_TOKEN`.
    pub access_token: Option<String>,
    /// BigQuery job location, e.g. `asia-southeast1`.
    pub location: Option<String>,
    /// Root directory of the local warehouse.
    pub root: PathBuf,
    /// Table holding `(tablename, latest_date)` watermark rows.
    pub meta_table: String,
    pub job_poll_interval_ms: u64,
    pub job_timeout_secs: u64,
}

impl Default for WarehouseSettings {
    fn default() -> Self {
        Self {
            backend: WarehouseBackend::Local,
            project: None,
            dataset: "ringgit".into(),
            access_token: None,
            location: None,
            root: PathBuf::from("warehouse"),
            meta_table: "meta_last_updated_date".into(),
            job_poll_interval_ms: 1_000,
            job_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchemaSettings {
    /// Directory holding `*_schema.json` descriptors.
    pub dir: PathBuf,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("infra_setup/schemas"),
        }
    }
}

/// One local JSON file of bond-yield history and the security types routed to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleSettings {
    pub file: String,
    pub security_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BondSettings {
    pub api_base_url: String,
    pub accept: String,
    pub vehicles_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub vehicles: Vec<VehicleSettings>,
    /// Watermark used when no vehicle file has data.
    pub floor_date: NaiveDate,
    /// Requests per batch.
    pub batch_size: usize,
    /// Requests in flight within a batch.
    pub concurrency: usize,
    pub batch_pause_ms: u64,
    /// Upper bound of the uniform jitter added to every batch pause.
    pub batch_jitter_ms: u64,
    pub year_pause_secs: u64,
    pub timeout_secs: u64,
}

impl Default for BondSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.bnm.gov.my".into(),
            accept: "application/vnd.BNM.API.v1+json".into(),
            vehicles_dir: PathBuf::from("data/investment_vehicles"),
            snapshot_dir: PathBuf::from("data/json"),
            vehicles: vec![
                VehicleSettings {
                    file: "government_investment_issues.json".into(),
                    security_types: vec!["GII".into()],
                },
                VehicleSettings {
                    file: "malaysian_government_securities.json".into(),
                    security_types: vec!["MGS".into()],
                },
                VehicleSettings {
                    file: "short_terms_bills.json".into(),
                    security_types: vec!["TB".into(), "MTB".into(), "BNMN".into()],
                },
            ],
            floor_date: NaiveDate::from_ymd_opt(2006, 9, 28).unwrap_or_default(),
            batch_size: 10,
            concurrency: 5,
            batch_pause_ms: 1_000,
            batch_jitter_ms: 1_000,
            year_pause_secs: 60,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricecatcherSettings {
    pub base_url: String,
    pub table: String,
    /// Maximum rows per load batch.
    pub batch_rows: usize,
    /// IANA timezone used to decide what "today" is.
    pub timezone: String,
    /// Watermark used when the meta table has no row yet.
    pub initial_watermark: NaiveDate,
    pub date_column: String,
    /// Composite key used to drop duplicate transactions.
    pub dedupe_keys: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for PricecatcherSettings {
    fn default() -> Self {
        Self {
            base_url: "https://storage.data.gov.my/pricecatcher".into(),
            table: "pricecatcher_transactional_record".into(),
            batch_rows: 1_000_000,
            timezone: "Asia/Kuala_Lumpur".into(),
            initial_watermark: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or_default(),
            date_column: "date".into(),
            dedupe_keys: vec!["date".into(), "premise_code".into(), "item_code".into()],
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for per-job log files. Empty disables file logging.
    pub dir: PathBuf,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: "info".into(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from an explicit path, or from [`DEFAULT_CONFIG_FILE`] if it exists,
    /// or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply environment overrides using `lookup` as the variable source.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(project) = lookup("GCP_PROJECT_NAME") {
            self.warehouse.project = Some(project);
        }
        if let Some(dataset) = lookup("GCP_DATASET_NAME") {
            self.warehouse.dataset = dataset;
        }
        if let Some(token) = lookup("GCP_ACCESS_TOKEN") {
            self.warehouse.access_token = Some(token);
        }
        if let Some(backend) = lookup("RINGGIT_WAREHOUSE") {
            self.warehouse.backend = backend.parse()?;
        }
        if let Some(root) = lookup("RINGGIT_WAREHOUSE_ROOT") {
            self.warehouse.root = PathBuf::from(root);
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Check cross-field constraints before any job starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bonds.batch_size == 0 {
            return Err(ConfigError::Invalid("bonds.batch_size must be > 0".into()));
        }
        if self.bonds.concurrency == 0 {
            return Err(ConfigError::Invalid("bonds.concurrency must be > 0".into()));
        }
        if self.bonds.vehicles.is_empty() {
            return Err(ConfigError::Invalid("bonds.vehicles must not be empty".into()));
        }
        if self.pricecatcher.batch_rows == 0 {
            return Err(ConfigError::Invalid("pricecatcher.batch_rows must be > 0".into()));
        }
        if self.pricecatcher.dedupe_keys.is_empty() {
            return Err(ConfigError::Invalid("pricecatcher.dedupe_keys must not be empty".into()));
        }
        self.timezone()?;

        if self.warehouse.backend == WarehouseBackend::Bigquery {
            if self.warehouse.project.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid(
                    "BigQuery backend requires a project (GCP_PROJECT_NAME)".into(),
                ));
            }
            if self.warehouse.access_token.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid(
                    "BigQuery backend requires an access token (GCP_ACCESS_TOKEN)".into(),
                ));
            }
        }
        if self.warehouse.dataset.is_empty() {
            return Err(ConfigError::Invalid("warehouse.dataset must not be empty".into()));
        }
        Ok(())
    }

    /// The price-catcher timezone.
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.pricecatcher.timezone.parse::<Tz>().map_err(|_| {
            ConfigError::Invalid(format!("unknown timezone '{}'", self.pricecatcher.timezone))
        })
    }

    /// Per-job log file inside the logging directory, if file logging is enabled.
    pub fn log_file(&self, file_name: &str) -> Option<PathBuf> {
        if self.logging.dir.as_os_str().is_empty() {
            None
        } else {
            Some(self.logging.dir.join(file_name))
        }
    }
}

/// Load a `.env` file into the process environment.
///
/// With no explicit path the current directory's `.env` is tried; a missing
/// file is not an error in either case.
pub fn load_env_file(path: Option<&Path>) -> Result<(), ConfigError> {
    let result = match path {
        Some(p) => dotenvy::from_path(p).map(|_| ()),
        None => dotenvy::dotenv().map(|_| ()),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(ConfigError::EnvFile {
            path: path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".env")),
            reason: e.to_string(),
        }),
    }
}
