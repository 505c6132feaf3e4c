//! Year-by-year scrape loop.
//!
//! Years are walked from the current year back to the watermark year. Inside
//! each year the dates are requested newest first, in fixed-size batches
//! with a bounded number of requests in flight, pausing after every batch and
//! between years. Each year's raw responses are written to a snapshot file
//! before the records are merged into the vehicle files.

use super::merge::merge_into_store;
use super::record::SnapshotEntry;
use super::source::YieldSource;
use super::store::{write_atomic, VehicleStore};
use super::ScrapeError;
use crate::calendar::{days_descending, year_window};
use crate::config::BondSettings;
use chrono::{Datelike, NaiveDate};
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Batching and pacing for one scrape run.
#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub batch_pause: Duration,
    /// Upper bound of the random extra pause after each batch.
    pub batch_jitter: Duration,
    pub year_pause: Duration,
    pub snapshot_dir: PathBuf,
}

impl ScrapeOptions {
    pub fn from_settings(settings: &BondSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            concurrency: settings.concurrency,
            batch_pause: Duration::from_millis(settings.batch_pause_ms),
            batch_jitter: Duration::from_millis(settings.batch_jitter_ms),
            year_pause: Duration::from_secs(settings.year_pause_secs),
            snapshot_dir: settings.snapshot_dir.clone(),
        }
    }

    /// Same options with every pause removed.
    pub fn without_delays(mut self) -> Self {
        self.batch_pause = Duration::ZERO;
        self.batch_jitter = Duration::ZERO;
        self.year_pause = Duration::ZERO;
        self
    }

    fn batch_delay(&self) -> Duration {
        let jitter_ms = self.batch_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.batch_pause + Duration::from_millis(jitter)
    }
}

/// Per-year scrape statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct YearScrape {
    pub year: i32,
    pub requests: usize,
    pub failed: usize,
    pub elapsed_secs: f64,
    pub snapshot: PathBuf,
}

/// Outcome of a whole scrape run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeSummary {
    pub watermark: NaiveDate,
    pub years: Vec<YearScrape>,
    pub requests: usize,
    pub failed_requests: usize,
    pub appended: BTreeMap<String, usize>,
    pub unrouted: usize,
    /// Pauses taken between consecutive years.
    pub year_pauses: usize,
}

impl ScrapeSummary {
    pub fn total_appended(&self) -> usize {
        self.appended.values().sum()
    }
}

/// Request every date in `[start, end]`, newest first, in paced batches.
///
/// Failed requests become entries with no data and a 400 status. The result
/// is sorted by `meta.last_updated`.
pub fn scrape_window(
    source: &dyn YieldSource,
    pool: &rayon::ThreadPool,
    start: NaiveDate,
    end: NaiveDate,
    options: &ScrapeOptions,
) -> Vec<SnapshotEntry> {
    let dates = days_descending(start, end);
    let mut entries = Vec::with_capacity(dates.len());

    for batch in dates.chunks(options.batch_size.max(1)) {
        let fetched: Vec<SnapshotEntry> = pool.install(|| {
            batch
                .par_iter()
                .map(|&date| fetch_one(source, date))
                .collect()
        });
        entries.extend(fetched);

        let delay = options.batch_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    entries.sort_by(|a, b| a.last_updated().cmp(b.last_updated()));
    entries
}

fn fetch_one(source: &dyn YieldSource, date: NaiveDate) -> SnapshotEntry {
    match source.fetch(date) {
        Ok(response) => {
            if !(200..300).contains(&response.status) {
                debug!("{} returned HTTP {} for {date}", source.name(), response.status);
            }
            SnapshotEntry::from_response(date, response)
        }
        Err(e) => {
            warn!("request for {date} failed: {e}");
            SnapshotEntry::failed(date)
        }
    }
}

/// Path of the raw snapshot for `year`.
pub fn snapshot_path(dir: &Path, year: i32) -> PathBuf {
    dir.join(format!("bonds_data_{year}.json"))
}

/// Write one year's raw responses.
pub fn write_snapshot(dir: &Path, year: i32, entries: &[SnapshotEntry]) -> Result<PathBuf, ScrapeError> {
    std::fs::create_dir_all(dir).map_err(|source| ScrapeError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = snapshot_path(dir, year);
    let bytes = serde_json::to_vec_pretty(entries).map_err(|e| ScrapeError::Json {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    write_atomic(&path, &bytes)?;
    Ok(path)
}

/// Scrape everything since the vehicle files' latest date and merge it in.
pub fn run_scrape(
    source: &dyn YieldSource,
    store: &VehicleStore,
    options: &ScrapeOptions,
    floor: NaiveDate,
    today: NaiveDate,
) -> Result<ScrapeSummary, ScrapeError> {
    let watermark = store.latest_datapoint(floor);
    info!("Latest datapoint on disk: {watermark}");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.concurrency.max(1))
        .build()
        .map_err(|e| ScrapeError::Pool(e.to_string()))?;

    let (max_year, min_year) = (today.year(), watermark.year());
    let mut years: Vec<YearScrape> = Vec::new();
    let mut all_entries = Vec::new();
    let mut year_pauses = 0;

    for year in (min_year..=max_year).rev() {
        let Some((start, end)) = year_window(year, watermark, today) else {
            continue;
        };
        if !years.is_empty() && !options.year_pause.is_zero() {
            info!("Sleeping for {} seconds", options.year_pause.as_secs());
            std::thread::sleep(options.year_pause);
            year_pauses += 1;
        }

        let started = Instant::now();
        let entries = scrape_window(source, &pool, start, end, options);
        let elapsed_secs = started.elapsed().as_secs_f64();
        info!("Scraped {} rows of data from {year} in {elapsed_secs:.3} seconds", entries.len());

        let snapshot = write_snapshot(&options.snapshot_dir, year, &entries)?;
        years.push(YearScrape {
            year,
            requests: entries.len(),
            failed: entries.iter().filter(|e| !e.is_success()).count(),
            elapsed_secs,
            snapshot,
        });
        all_entries.extend(entries);
    }

    let merged = merge_into_store(store, &all_entries)?;
    let summary = ScrapeSummary {
        watermark,
        requests: years.iter().map(|y| y.requests).sum(),
        failed_requests: years.iter().map(|y| y.failed).sum(),
        years,
        appended: merged.appended,
        unrouted: merged.unrouted,
        year_pauses,
    };
    info!(
        "Scrape finished: {} requests, {} failed, {} records appended",
        summary.requests,
        summary.failed_requests,
        summary.total_appended()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonds::record::YieldResponse;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Fake {
        calls: Mutex<Vec<NaiveDate>>,
    }

    impl YieldSource for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        fn fetch(&self, date: NaiveDate) -> Result<YieldResponse, ScrapeError> {
            self.calls.lock().unwrap().push(date);
            if date.day() == 13 {
                return Err(ScrapeError::Network("boom".into()));
            }
            Ok(YieldResponse {
                status: 200,
                data: Some(json!([{"security_type": "MGS"}])),
                meta: Some(json!({"last_updated": date.to_string()})),
            })
        }
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn options(dir: &Path, batch_size: usize) -> ScrapeOptions {
        ScrapeOptions {
            batch_size,
            concurrency: 3,
            batch_pause: Duration::ZERO,
            batch_jitter: Duration::ZERO,
            year_pause: Duration::ZERO,
            snapshot_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn window_requests_every_day_and_sorts_by_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Fake { calls: Mutex::new(Vec::new()) };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();

        let entries = scrape_window(&fake, &pool, d(2024, 3, 10), d(2024, 3, 15), &options(dir.path(), 4));
        assert_eq!(entries.len(), 6);
        assert_eq!(fake.calls.lock().unwrap().len(), 6);

        // The failed request has no meta and sorts first.
        assert_eq!(entries[0].date, d(2024, 3, 13));
        assert_eq!(entries[0].status, 400);
        let rest: Vec<NaiveDate> = entries[1..].iter().map(|e| e.date).collect();
        assert_eq!(rest, vec![d(2024, 3, 10), d(2024, 3, 11), d(2024, 3, 12), d(2024, 3, 14), d(2024, 3, 15)]);
    }

    #[test]
    fn run_scrape_writes_snapshots_per_year_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let store = VehicleStore::new(dir.path().join("vehicles"), BondSettings::default().vehicles);
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(
            store.path("malaysian_government_securities.json"),
            json!({"data": [{"trading_date": "2023-12-30", "security_type": "MGS"}]}).to_string(),
        )
        .unwrap();

        let fake = Fake { calls: Mutex::new(Vec::new()) };
        let opts = options(&dir.path().join("json"), 10);
        let summary = run_scrape(&fake, &store, &opts, d(2006, 9, 28), d(2024, 1, 2)).unwrap();

        assert_eq!(summary.watermark, d(2023, 12, 30));
        assert_eq!(summary.years.iter().map(|y| y.year).collect::<Vec<_>>(), vec![2024, 2023]);
        assert_eq!(summary.requests, 4);
        assert_eq!(summary.failed_requests, 0);
        assert!(snapshot_path(&opts.snapshot_dir, 2023).exists());
        assert!(snapshot_path(&opts.snapshot_dir, 2024).exists());

        // 12-30 is already on disk; 12-31, 01-01, 01-02 are new.
        assert_eq!(summary.appended["malaysian_government_securities.json"], 3);
        let mgs = store.load("malaysian_government_securities.json").unwrap();
        assert_eq!(mgs.latest_date(), Some(d(2024, 1, 2)));
    }

    /// Source that tracks how many fetches run at the same time.
    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl YieldSource for Gauge {
        fn name(&self) -> &str {
            "gauge"
        }

        fn fetch(&self, date: NaiveDate) -> Result<YieldResponse, ScrapeError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(YieldResponse {
                status: 200,
                data: Some(json!([])),
                meta: Some(json!({"last_updated": date.to_string()})),
            })
        }
    }

    #[test]
    fn requests_in_flight_never_exceed_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let store = VehicleStore::new(dir.path().join("vehicles"), BondSettings::default().vehicles);
        let gauge = Gauge::default();
        let opts = ScrapeOptions {
            concurrency: 2,
            ..options(&dir.path().join("json"), 8)
        };

        let summary = run_scrape(&gauge, &store, &opts, d(2024, 3, 1), d(2024, 3, 24)).unwrap();
        assert_eq!(summary.requests, 24);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak {peak}");
    }

    #[test]
    fn pauses_between_years_but_not_after_the_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = VehicleStore::new(dir.path().join("vehicles"), BondSettings::default().vehicles);
        let fake = Fake { calls: Mutex::new(Vec::new()) };
        let opts = ScrapeOptions {
            year_pause: Duration::from_millis(1),
            ..options(&dir.path().join("json"), 10)
        };

        // No vehicle files: the floor in 2022 spans three years.
        let summary = run_scrape(&fake, &store, &opts, d(2022, 12, 30), d(2024, 1, 1)).unwrap();
        assert_eq!(summary.years.len(), 3);
        assert_eq!(summary.year_pauses, 2);

        let single = run_scrape(&fake, &store, &opts, d(2024, 1, 1), d(2024, 1, 1)).unwrap();
        assert_eq!(single.years.len(), 1);
        assert_eq!(single.year_pauses, 0);
    }

    #[test]
    fn no_delay_options_zero_every_pause() {
        let opts = ScrapeOptions::from_settings(&BondSettings::default()).without_delays();
        assert!(opts.batch_delay().is_zero());
        assert!(opts.year_pause.is_zero());
    }

    proptest! {
        #[test]
        fn batch_delay_stays_within_jitter(pause in 0u64..2000, jitter in 0u64..2000) {
            let opts = ScrapeOptions {
                batch_pause: Duration::from_millis(pause),
                batch_jitter: Duration::from_millis(jitter),
                ..options(Path::new("."), 10)
            };
            let delay = opts.batch_delay();
            prop_assert!(delay >= Duration::from_millis(pause));
            prop_assert!(delay <= Duration::from_millis(pause + jitter));
        }
    }
}
