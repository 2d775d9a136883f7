//! Per-status forwarding statistics.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

/// Attempts beyond this index share the last column.
const MAX_TRIES_TRACKED: usize = 9;

/// Counts of reply status codes, broken down by which forwarding attempt
/// produced them.
///
/// Every attempt is recorded, including the first; attempt numbers above
/// the tracked maximum share the last column.
#[derive(Debug, Default)]
pub struct ReplyStats {
    /// status code -> per-attempt-index counters.
    codes: Mutex<BTreeMap<u16, [u64; MAX_TRIES_TRACKED + 1]>>,
}

impl ReplyStats {
    /// Construct an empty table.
    pub fn new() -> Self {
        ReplyStats::default()
    }

    /// Record a reply with the given status on attempt number `tries`.
    pub fn record(&self, tries: u32, status: u16) {
        let idx = (tries as usize).min(MAX_TRIES_TRACKED);
        let mut codes = self.codes.lock().expect("poisoned lock");
        codes.entry(status).or_default()[idx] += 1;
    }

    /// Return the per-attempt counters recorded for `status`.
    pub fn counts(&self, status: u16) -> [u64; MAX_TRIES_TRACKED + 1] {
        let codes = self.codes.lock().expect("poisoned lock");
        codes.get(&status).copied().unwrap_or_default()
    }

    /// Render the table for a management report.
    pub fn report(&self) -> String {
        let codes = self.codes.lock().expect("poisoned lock");
        let mut out = String::from("Status");
        for try_idx in 0..=MAX_TRIES_TRACKED {
            let _ = write!(out, "\ttry#{}", try_idx);
        }
        out.push('\n');
        for (status, row) in codes.iter() {
            let _ = write!(out, "{:3}", status);
            for count in row {
                let _ = write!(out, "\t{}", count);
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn first_attempts_are_counted() {
        let stats = ReplyStats::new();
        stats.record(0, 200);
        stats.record(1, 200);
        stats.record(1, 502);
        let row = stats.counts(200);
        assert_eq!(row[0], 1);
        assert_eq!(row[1], 1);
        assert_eq!(stats.counts(502)[1], 1);
    }

    #[test]
    fn excess_attempts_share_last_column() {
        let stats = ReplyStats::new();
        stats.record(40, 504);
        assert_eq!(stats.counts(504)[MAX_TRIES_TRACKED], 1);
    }

    #[test]
    fn report_has_a_column_per_attempt() {
        let stats = ReplyStats::new();
        stats.record(0, 200);
        let report = stats.report();
        assert!(report.starts_with("Status\ttry#0\ttry#1"));
        assert!(report.contains("200\t1"));
    }
}
