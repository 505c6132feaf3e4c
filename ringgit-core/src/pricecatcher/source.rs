//! Monthly price-catcher snapshots.

use super::SnapshotError;
use std::time::Duration;

/// Something that serves one parquet file per `YYYY-MM` month.
pub trait SnapshotSource: Send + Sync {
    fn name(&self) -> &str;

    /// Raw parquet bytes for `month`.
    fn fetch_month(&self, month: &str) -> Result<Vec<u8>, SnapshotError>;
}

/// Client for the public data.gov.my storage bucket.
pub struct DataGovClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl DataGovClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SnapshotError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SnapshotError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn month_url(&self, month: &str) -> String {
        format!("{}/pricecatcher_{month}.parquet", self.base_url)
    }
}

impl SnapshotSource for DataGovClient {
    fn name(&self) -> &str {
        "data.gov.my"
    }

    fn fetch_month(&self, month: &str) -> Result<Vec<u8>, SnapshotError> {
        let url = self.month_url(month);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SnapshotError::Network(format!("{url}: {e}")))?;

        let status = resp.status();
        // The bucket answers 403 rather than 404 for keys that do not exist.
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SnapshotError::NotPublished(month.to_string()));
        }
        if !status.is_success() {
            return Err(SnapshotError::Http {
                month: month.to_string(),
                status: status.as_u16(),
            });
        }
        resp.bytes()
            .map(|b| b.to_vec())
            .map_err(|e| SnapshotError::Network(format!("{url}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_url_format() {
        let client = DataGovClient::new("https://storage.data.gov.my/pricecatcher/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.month_url("2024-03"),
            "https://storage.data.gov.my/pricecatcher/pricecatcher_2024-03.parquet"
        );
    }
}
