//! Local vehicle files.

use super::record::VehicleFile;
use super::ScrapeError;
use crate::config::VehicleSettings;
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// The set of vehicle files under one directory.
#[derive(Debug, Clone)]
pub struct VehicleStore {
    dir: PathBuf,
    vehicles: Vec<VehicleSettings>,
}

impl VehicleStore {
    pub fn new(dir: impl Into<PathBuf>, vehicles: Vec<VehicleSettings>) -> Self {
        Self {
            dir: dir.into(),
            vehicles,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vehicles(&self) -> &[VehicleSettings] {
        &self.vehicles
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// File that records of `security_type` belong to.
    pub fn file_for(&self, security_type: &str) -> Option<&str> {
        self.vehicles
            .iter()
            .find(|v| v.security_types.iter().any(|t| t.eq_ignore_ascii_case(security_type)))
            .map(|v| v.file.as_str())
    }

    pub fn load(&self, file: &str) -> Result<VehicleFile, ScrapeError> {
        let path = self.path(file);
        let content = fs::read_to_string(&path).map_err(|source| ScrapeError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| ScrapeError::Json {
            path,
            reason: e.to_string(),
        })
    }

    /// Load a file, treating a missing one as empty.
    pub fn load_or_default(&self, file: &str) -> Result<VehicleFile, ScrapeError> {
        if self.path(file).exists() {
            self.load(file)
        } else {
            Ok(VehicleFile::default())
        }
    }

    /// Write a file atomically (tmp then rename).
    pub fn save(&self, file: &str, contents: &VehicleFile) -> Result<(), ScrapeError> {
        fs::create_dir_all(&self.dir).map_err(|source| ScrapeError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path(file);
        let bytes = serde_json::to_vec_pretty(contents).map_err(|e| ScrapeError::Json {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &bytes)
    }

    /// Latest trading date of one file, `None` when it is missing or empty.
    pub fn file_latest(&self, file: &str) -> Option<NaiveDate> {
        self.load(file).ok().and_then(|f| f.latest_date())
    }

    /// Latest trading date across all vehicle files.
    ///
    /// A missing or unreadable file is logged and skipped. An empty file is
    /// logged and contributes `floor`, as does the case where no file is
    /// readable at all.
    pub fn latest_datapoint(&self, floor: NaiveDate) -> NaiveDate {
        let mut latest: Option<NaiveDate> = None;

        for vehicle in &self.vehicles {
            let candidate = match self.load(&vehicle.file) {
                Ok(file) => match file.latest_date() {
                    Some(date) => date,
                    None => {
                        warn!("File {} is empty, do you wish to re-scrape the data?", vehicle.file);
                        floor
                    }
                },
                Err(ScrapeError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                    error!(
                        "Missing file {}. Please check if the file is in {}.",
                        vehicle.file,
                        self.dir.display()
                    );
                    continue;
                }
                Err(e) => {
                    error!("Could not read {}: {e}", vehicle.file);
                    continue;
                }
            };
            latest = Some(latest.map_or(candidate, |l| l.max(candidate)));
        }

        latest.unwrap_or(floor)
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ScrapeError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|source| ScrapeError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        ScrapeError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}
