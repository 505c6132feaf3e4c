//! Bond-yield API client.
//!
//! The `YieldSource` trait abstracts the BNM government-securities yield
//! endpoint so the scraper can run against a fake in tests.

use super::record::YieldResponse;
use super::ScrapeError;
use crate::config::BondSettings;
use chrono::NaiveDate;
use serde_json::Value;
use std::time::Duration;

/// Something that can return the yield response for one date.
pub trait YieldSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the response for `date`.
    ///
    /// Any HTTP response is `Ok`, whatever its status; `Err` means no usable
    /// response was received.
    fn fetch(&self, date: NaiveDate) -> Result<YieldResponse, ScrapeError>;
}

/// BNM public API client.
pub struct BnmClient {
    client: reqwest::blocking::Client,
    base_url: String,
    accept: String,
}

impl BnmClient {
    pub fn new(base_url: &str, accept: &str, timeout: Duration) -> Result<Self, ScrapeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScrapeError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            accept: accept.to_string(),
        })
    }

    pub fn from_settings(settings: &BondSettings) -> Result<Self, ScrapeError> {
        Self::new(
            &settings.api_base_url,
            &settings.accept,
            Duration::from_secs(settings.timeout_secs),
        )
    }

    pub fn yield_url(&self, date: NaiveDate) -> String {
        format!("{}/public/gov-sec-yield?date={}", self.base_url, date.format("%Y-%m-%d"))
    }
}

impl YieldSource for BnmClient {
    fn name(&self) -> &str {
        "bnm"
    }

    fn fetch(&self, date: NaiveDate) -> Result<YieldResponse, ScrapeError> {
        let url = self.yield_url(date);
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, &self.accept)
            .send()
            .map_err(|e| ScrapeError::Network(format!("{url}: {e}")))?;

        let status = resp.status().as_u16();
        let body: Value = resp
            .json()
            .map_err(|e| ScrapeError::Decode(format!("{url} (HTTP {status}): {e}")))?;
        Ok(parse_body(status, body))
    }
}

fn parse_body(status: u16, mut body: Value) -> YieldResponse {
    let data = body.get_mut("data").map(Value::take).filter(|v| !v.is_null());
    let meta = body.get_mut("meta").map(Value::take).filter(|v| !v.is_null());
    YieldResponse { status, data, meta }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_format() {
        let client = BnmClient::new("https://api.bnm.gov.my/", "application/json", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.yield_url(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
            "https://api.bnm.gov.my/public/gov-sec-yield?date=2024-03-01"
        );
    }

    #[test]
    fn body_split_into_data_and_meta() {
        let r = parse_body(
            200,
            json!({"data": [{"security_type": "MGS"}], "meta": {"last_updated": "2024-03-01 17:00:00"}}),
        );
        assert_eq!(r.status, 200);
        assert!(r.data.unwrap().is_array());
        assert_eq!(r.meta.unwrap()["last_updated"], "2024-03-01 17:00:00");

        let r = parse_body(404, json!({"message": "No data", "data": null}));
        assert_eq!(r.status, 404);
        assert!(r.data.is_none());
        assert!(r.meta.is_none());
    }
}
