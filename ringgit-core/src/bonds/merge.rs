//! Merge scraped responses into the vehicle files.

use super::record::{SnapshotEntry, YieldRecord};
use super::store::VehicleStore;
use super::ScrapeError;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// What a merge appended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Records appended, by vehicle file.
    pub appended: BTreeMap<String, usize>,
    /// Records whose security type maps to no vehicle file.
    pub unrouted: usize,
    /// Records dropped as repeats of an earlier `(trading_date, security_type)`.
    pub duplicates: usize,
}

impl MergeReport {
    pub fn total_appended(&self) -> usize {
        self.appended.values().sum()
    }
}

/// Flatten entries into records, deduplicated by `(trading_date, security_type)`.
///
/// Entries are expected in `meta.last_updated` order; the last occurrence of a
/// key wins. Output is sorted by trading date, then security type.
pub fn dedupe_records(entries: &[SnapshotEntry]) -> (Vec<YieldRecord>, usize) {
    let mut by_key: BTreeMap<(NaiveDate, String), YieldRecord> = BTreeMap::new();
    let mut duplicates = 0;
    for record in entries.iter().flat_map(SnapshotEntry::records) {
        if by_key.insert(record.key(), record).is_some() {
            duplicates += 1;
        }
    }
    (by_key.into_values().collect(), duplicates)
}

/// Append new records to the vehicle files they belong to.
///
/// Only records strictly after a file's own latest trading date are appended,
/// so files stay sorted and a rerun over the same window adds nothing.
pub fn merge_into_store(store: &VehicleStore, entries: &[SnapshotEntry]) -> Result<MergeReport, ScrapeError> {
    let (records, duplicates) = dedupe_records(entries);
    let mut report = MergeReport {
        duplicates,
        ..MergeReport::default()
    };

    let mut routed: BTreeMap<String, Vec<YieldRecord>> = BTreeMap::new();
    let mut unknown: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        let security_type = record.security_type.clone().unwrap_or_default();
        match store.file_for(&security_type) {
            Some(file) => routed.entry(file.to_string()).or_default().push(record),
            None => *unknown.entry(security_type).or_default() += 1,
        }
    }
    for (security_type, n) in &unknown {
        warn!("Dropping {n} record(s) with unmapped security type '{security_type}'");
        report.unrouted += n;
    }

    for (file, records) in routed {
        let mut vehicle = store.load_or_default(&file)?;
        let latest = vehicle.latest_date();
        let fresh: Vec<YieldRecord> = records
            .into_iter()
            .filter(|r| latest.map_or(true, |l| r.trading_date > l))
            .collect();

        if fresh.is_empty() {
            report.appended.insert(file, 0);
            continue;
        }
        let n = fresh.len();
        vehicle.data.extend(fresh);
        store.save(&file, &vehicle)?;
        info!("Appended {n} record(s) to {file}");
        report.appended.insert(file, n);
    }

    Ok(report)
}
