//! Concurrency configuration: the raw `ParallelMax` setting and the
//! resolved `ConcurrencyPolicy`.
//!
//! `ParallelMax` is what callers configure (an integer, `auto`, `default`,
//! a percentage, `unbounded`, or nothing at all). The engine resolves it
//! against the host's parallel execution unit count into a
//! `ConcurrencyPolicy` before scheduling.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Caller-supplied concurrency setting, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParallelMax {
    /// Fixed number of concurrent scripts, used as-is.
    Count(usize),
    /// Number of available parallel execution units on the host.
    Auto,
    /// Environment-configured value (`MEDLEY_PARALLEL`), falling back to
    /// `Auto` when unset — or when the configured value is itself
    /// `"default"`.
    Default,
    /// Percentage of the host's unit count, floored, minimum 1.
    Percent(u32),
    /// No cap at all.
    Unbounded,
    /// Strictly one at a time, in input order.
    Series,
}

impl FromStr for ParallelMax {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "auto" => Ok(ParallelMax::Auto),
            "default" => Ok(ParallelMax::Default),
            "unbounded" => Ok(ParallelMax::Unbounded),
            "series" | "serial" | "false" => Ok(ParallelMax::Series),
            _ => {
                if let Some(pct) = s.strip_suffix('%') {
                    let pct: u32 = pct
                        .parse()
                        .map_err(|_| PolicyError::Invalid(s.to_string()))?;
                    return Ok(ParallelMax::Percent(pct));
                }
                let n: usize = s.parse().map_err(|_| PolicyError::Invalid(s.to_string()))?;
                if n == 0 {
                    return Err(PolicyError::Invalid(s.to_string()));
                }
                Ok(ParallelMax::Count(n))
            }
        }
    }
}

impl Default for ParallelMax {
    /// Absent configuration means strict series execution.
    fn default() -> Self {
        ParallelMax::Series
    }
}

/// Resolved concurrency rule governing how many scripts run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyPolicy {
    /// One at a time (`K = 1`).
    Series,
    /// At most N concurrently.
    Bounded(usize),
    /// No cap.
    Unbounded,
}

impl ConcurrencyPolicy {
    /// Effective slot count for a run of `script_count` scripts:
    /// `K = min(resolved max, script_count)`.
    pub fn slots(&self, script_count: usize) -> usize {
        match self {
            ConcurrencyPolicy::Series => 1,
            ConcurrencyPolicy::Bounded(n) => (*n).min(script_count.max(1)),
            ConcurrencyPolicy::Unbounded => script_count.max(1),
        }
    }

    /// Value injected into spawned processes as `MEDLEY_MAX_PARALLEL`.
    pub fn env_value(&self) -> String {
        match self {
            ConcurrencyPolicy::Series => "1".to_string(),
            ConcurrencyPolicy::Bounded(n) => n.to_string(),
            ConcurrencyPolicy::Unbounded => "unbounded".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keywords() {
        assert_eq!("auto".parse::<ParallelMax>().unwrap(), ParallelMax::Auto);
        assert_eq!(
            "default".parse::<ParallelMax>().unwrap(),
            ParallelMax::Default
        );
        assert_eq!(
            "unbounded".parse::<ParallelMax>().unwrap(),
            ParallelMax::Unbounded
        );
        assert_eq!("false".parse::<ParallelMax>().unwrap(), ParallelMax::Series);
    }

    #[test]
    fn parses_integers_and_percentages() {
        assert_eq!("4".parse::<ParallelMax>().unwrap(), ParallelMax::Count(4));
        assert_eq!(
            "50%".parse::<ParallelMax>().unwrap(),
            ParallelMax::Percent(50)
        );
    }

    #[test]
    fn rejects_zero_and_garbage() {
        assert!("0".parse::<ParallelMax>().is_err());
        assert!("lots".parse::<ParallelMax>().is_err());
        assert!("%".parse::<ParallelMax>().is_err());
    }

    #[test]
    fn slots_never_exceed_script_count() {
        assert_eq!(ConcurrencyPolicy::Bounded(8).slots(3), 3);
        assert_eq!(ConcurrencyPolicy::Bounded(2).slots(10), 2);
        assert_eq!(ConcurrencyPolicy::Unbounded.slots(5), 5);
        assert_eq!(ConcurrencyPolicy::Series.slots(10), 1);
    }

    #[test]
    fn env_value_round_trips() {
        assert_eq!(ConcurrencyPolicy::Bounded(4).env_value(), "4");
        assert_eq!(ConcurrencyPolicy::Unbounded.env_value(), "unbounded");
        assert_eq!(ConcurrencyPolicy::Series.env_value(), "1");
    }
}
