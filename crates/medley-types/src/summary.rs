//! Summary — the aggregate result of one full scheduler run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::ExitRecord;

/// Aggregate outcome of a scheduler run.
///
/// `results` is always ordered identically to the input spec list,
/// regardless of actual start or finish order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Number of scripts in the run.
    pub total_count: usize,
    /// Number of scripts that exited 0.
    pub success_count: usize,
    /// Number of scripts that exited non-zero.
    pub failure_count: usize,
    /// True iff every script succeeded.
    pub all_success: bool,
    /// Wall-clock start of the run (policy resolution time).
    pub started_at: DateTime<Utc>,
    /// Wall-clock time of the last completion.
    pub finished_at: DateTime<Utc>,
    /// Monotonic duration of the whole run in milliseconds.
    pub duration_ms: u64,
    /// Per-script records, in input order.
    pub results: Vec<ExitRecord>,
}

impl Summary {
    /// Build a summary from per-script records; counts are derived.
    pub fn new(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
        results: Vec<ExitRecord>,
    ) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let failure_count = results.len() - success_count;
        Self {
            total_count: results.len(),
            success_count,
            failure_count,
            all_success: failure_count == 0,
            started_at,
            finished_at,
            duration_ms,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ScriptTag;

    fn record(script: &str, code: i32) -> ExitRecord {
        ExitRecord::failed_now(ScriptTag::new("pkg", script), code)
    }

    #[test]
    fn counts_are_derived_from_results() {
        let now = Utc::now();
        let summary = Summary::new(
            now,
            now,
            0,
            vec![record("a", 1), record("b", 0), record("c", 0)],
        );
        assert_eq!(summary.total_count, 3);
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 1);
        assert!(!summary.all_success);
    }

    #[test]
    fn empty_run_is_all_success() {
        let now = Utc::now();
        let summary = Summary::new(now, now, 0, vec![]);
        assert_eq!(summary.total_count, 0);
        assert!(summary.all_success);
    }

    #[test]
    fn serializes_camel_case() {
        let now = Utc::now();
        let summary = Summary::new(now, now, 12, vec![record("a", 0)]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["totalCount"], 1);
        assert_eq!(json["allSuccess"], true);
        assert_eq!(json["durationMs"], 12);
    }
}
