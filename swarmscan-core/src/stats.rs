use crate::state::Status;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw per-participant counters, persisted in snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub pages_audited: usize,
    /// Pages handed to other participants; counts toward the page limit.
    pub pages_dispatched: usize,
    pub elements_audited: usize,
    pub elements_seen: usize,
    /// Issues found locally. Issues reported by slaves are not counted here.
    pub issues: usize,
    pub fetch_failures: usize,
    pub check_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub pages_audited: usize,
    pub elements_audited: usize,
    pub urls_seen: usize,
    pub issues: usize,
    pub fetch_failures: usize,
    pub check_errors: usize,
    pub runtime_secs: f64,
    pub pages_per_second: f64,
}

impl Statistics {
    pub fn from_counters(counters: &Counters, urls_seen: usize, runtime: Duration) -> Self {
        let runtime_secs = runtime.as_secs_f64();
        let pages_per_second = if runtime_secs > 0.0 {
            counters.pages_audited as f64 / runtime_secs
        } else {
            0.0
        };

        Self {
            pages_audited: counters.pages_audited,
            elements_audited: counters.elements_audited,
            urls_seen,
            issues: counters.issues,
            fetch_failures: counters.fetch_failures,
            check_errors: counters.check_errors,
            runtime_secs,
            pages_per_second,
        }
    }
}

/// Fold statistics of several participants into one.
///
/// Counters are summed; `runtime_secs` and `pages_per_second` are averaged
/// over the participants that reported. `None` entries are skipped entirely.
pub fn merge_statistics(list: &[Option<Statistics>]) -> Statistics {
    let reported: Vec<&Statistics> = list.iter().flatten().collect();
    let mut merged = Statistics::default();
    if reported.is_empty() {
        return merged;
    }

    for stats in &reported {
        merged.pages_audited += stats.pages_audited;
        merged.elements_audited += stats.elements_audited;
        merged.urls_seen += stats.urls_seen;
        merged.issues += stats.issues;
        merged.fetch_failures += stats.fetch_failures;
        merged.check_errors += stats.check_errors;
        merged.runtime_secs += stats.runtime_secs;
        merged.pages_per_second += stats.pages_per_second;
    }

    let count = reported.len() as f64;
    merged.runtime_secs /= count;
    merged.pages_per_second /= count;
    merged
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: Status,
    /// Whether the instance still has local work or outstanding collaborators.
    pub busy: bool,
    pub url_queue: usize,
    pub page_queue: usize,
    pub statistics: Statistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pages: usize, rate: f64) -> Statistics {
        Statistics {
            pages_audited: pages,
            issues: 1,
            runtime_secs: 10.0,
            pages_per_second: rate,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_sums_counters_and_averages_rates() {
        let merged = merge_statistics(&[Some(stats(10, 1.0)), None, Some(stats(30, 3.0))]);
        assert_eq!(merged.pages_audited, 40);
        assert_eq!(merged.issues, 2);
        assert!((merged.pages_per_second - 2.0).abs() < f64::EPSILON);
        assert!((merged.runtime_secs - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_of_nothing_is_zero() {
        assert_eq!(merge_statistics(&[None, None]), Statistics::default());
    }

    #[test]
    fn test_rate_from_counters() {
        let counters = Counters {
            pages_audited: 20,
            ..Default::default()
        };
        let stats = Statistics::from_counters(&counters, 5, Duration::from_secs(4));
        assert_eq!(stats.urls_seen, 5);
        assert!((stats.pages_per_second - 5.0).abs() < f64::EPSILON);
    }
}
