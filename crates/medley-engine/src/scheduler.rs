//! Concurrency scheduler — runs a fixed list of script specs under a
//! concurrency policy and produces a summary.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      scheduler task                          │
//! │  specs[next..] ──▶ fill slots while running < K              │
//! │       │                 │                                    │
//! │       │          ScriptExecutor (per script)                 │
//! │       │            ├── output ──▶ global MergeHandle         │
//! │       │            └── wait() ──▶ FuturesUnordered           │
//! │       │                               │                      │
//! │       └◀── completion: running -= 1, refill ◀────────────────┘
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `running`/`next` counters live only in this task and are touched
//! only in its single completion-handling loop; completions arrive through
//! the `FuturesUnordered`, so no locking is needed. Every script's two
//! output channels feed one global multiplexer spanning the entire run, so
//! output from concurrently running scripts interleaves live.
//!
//! A script's non-zero exit is recorded, never raised, and does not stop
//! the remaining scripts from starting. `Summary.results` is always in
//! input order, regardless of start or finish order.

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::oneshot;

use medley_types::{ConcurrencyPolicy, ExitRecord, ParallelMax, PolicyError, ScriptSpec, Summary};

use crate::executor::{ScriptExecutor, ENV_MAX_PARALLEL};
use crate::merge::{merger, MergeHandle, OutputMerger};

/// Environment variable consulted by the `default` parallel-max setting.
pub const ENV_PARALLEL_DEFAULT: &str = "MEDLEY_PARALLEL";

/// Resolve a caller-supplied `ParallelMax` against this host.
///
/// Exceeding the host's available execution units is a warning, not an
/// error; only a malformed setting fails.
pub fn resolve_parallel_max(max: &ParallelMax) -> Result<ConcurrencyPolicy, PolicyError> {
    let configured = std::env::var(ENV_PARALLEL_DEFAULT).ok();
    resolve_with_units(max, available_units(), configured.as_deref())
}

/// Host parallel execution unit count (at least 1).
pub fn available_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn resolve_with_units(
    max: &ParallelMax,
    units: usize,
    configured: Option<&str>,
) -> Result<ConcurrencyPolicy, PolicyError> {
    let policy = match max {
        ParallelMax::Series => ConcurrencyPolicy::Series,
        ParallelMax::Unbounded => ConcurrencyPolicy::Unbounded,
        ParallelMax::Count(n) => {
            if *n == 0 {
                return Err(PolicyError::Invalid("0".to_string()));
            }
            ConcurrencyPolicy::Bounded(*n)
        }
        ParallelMax::Auto => ConcurrencyPolicy::Bounded(units),
        ParallelMax::Percent(pct) => {
            ConcurrencyPolicy::Bounded((units * *pct as usize / 100).max(1))
        }
        ParallelMax::Default => match configured {
            // Unset, empty, or itself "default": fall back to auto.
            None | Some("") | Some("default") => ConcurrencyPolicy::Bounded(units),
            Some(value) => {
                let parsed: ParallelMax = value.parse()?;
                resolve_with_units(&parsed, units, None)?
            }
        },
    };
    if let ConcurrencyPolicy::Bounded(n) = policy {
        if n > units {
            tracing::warn!(
                configured = n,
                available = units,
                "parallel max exceeds available execution units"
            );
        }
    }
    Ok(policy)
}

/// Schedules a fixed list of scripts under a resolved policy.
pub struct Scheduler {
    specs: Vec<ScriptSpec>,
    policy: ConcurrencyPolicy,
    // Run timing starts at policy resolution, not at the first spawn.
    started_wall: DateTime<Utc>,
    started: Instant,
}

impl Scheduler {
    /// Resolve the policy and build a scheduler. Fails only on a
    /// malformed setting, before any script starts.
    pub fn new(specs: Vec<ScriptSpec>, max: ParallelMax) -> Result<Self, PolicyError> {
        let policy = resolve_parallel_max(&max)?;
        Ok(Self::with_policy(specs, policy))
    }

    /// Build a scheduler from an already-resolved policy.
    pub fn with_policy(specs: Vec<ScriptSpec>, policy: ConcurrencyPolicy) -> Self {
        Self {
            specs,
            policy,
            started_wall: Utc::now(),
            started: Instant::now(),
        }
    }

    /// The resolved concurrency policy for this run.
    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Start the run. Returns immediately; output streams live and the
    /// summary resolves once every script has exited.
    pub fn start(self) -> ScriptRun {
        let (handle, output) = merger();
        let (summary_tx, summary_rx) = oneshot::channel();
        tokio::spawn(run_all(self, handle, summary_tx));
        ScriptRun { output, summary_rx }
    }
}

/// A run in flight: the global merged output plus the summary future.
pub struct ScriptRun {
    output: OutputMerger,
    summary_rx: oneshot::Receiver<Summary>,
}

impl ScriptRun {
    /// The multiplexer spanning all scripts × both streams.
    pub fn output(&mut self) -> &mut OutputMerger {
        &mut self.output
    }

    /// Wait for every script to exit and return the aggregate summary.
    pub async fn summary(self) -> Summary {
        match self.summary_rx.await {
            Ok(summary) => summary,
            Err(_) => {
                // The scheduler task never drops its sender before
                // sending unless the runtime is tearing down.
                tracing::error!("scheduler task vanished before producing a summary");
                let now = Utc::now();
                Summary::new(now, now, 0, Vec::new())
            }
        }
    }
}

async fn run_all(
    scheduler: Scheduler,
    handle: MergeHandle,
    summary_tx: oneshot::Sender<Summary>,
) {
    let Scheduler {
        specs,
        policy,
        started_wall,
        started,
    } = scheduler;
    let total = specs.len();
    let slots = policy.slots(total);
    let env_value = policy.env_value();
    tracing::debug!(total, slots, "run starting");

    let mut queue: Vec<Option<ScriptSpec>> = specs.into_iter().map(Some).collect();
    let mut results: Vec<Option<ExitRecord>> = (0..total).map(|_| None).collect();
    let mut pending = FuturesUnordered::new();
    let mut running = 0usize;
    let mut completed = 0usize;
    let mut next = 0usize;

    while completed < total {
        // Fill free slots in input order.
        while running < slots && next < total {
            let idx = next;
            next += 1;
            let Some(spec) = queue[idx].take() else { continue };
            match ScriptExecutor::spawn_with_env(&spec, &[(ENV_MAX_PARALLEL, env_value.clone())])
            {
                Ok(mut ex) => {
                    match ex.output().bytes() {
                        Ok(stream) => handle.attach(stream),
                        // Unreachable for a freshly spawned executor.
                        Err(e) => tracing::warn!(error = %e, "executor output unavailable"),
                    }
                    running += 1;
                    pending.push(async move {
                        let record = ex.wait().await;
                        (idx, record)
                    });
                }
                Err(e) => {
                    // Spawn failure is isolated to this script; siblings
                    // keep running and the summary stays total.
                    tracing::warn!(tag = %spec.tag, error = %e, "spawn failed");
                    results[idx] = Some(
                        ExitRecord::failed_now(spec.tag.clone(), 127).with_metadata(spec.metadata),
                    );
                    completed += 1;
                }
            }
        }
        if completed >= total {
            break;
        }
        match pending.next().await {
            Some((idx, record)) => {
                tracing::debug!(tag = %record.tag, code = record.exit_code, "script finished");
                results[idx] = Some(record);
                running -= 1;
                completed += 1;
            }
            None => break,
        }
    }

    // Close the global multiplexer; consumers see end-of-stream once the
    // already-queued chunks drain.
    drop(handle);

    let finished_wall = Utc::now();
    let duration_ms = started.elapsed().as_millis() as u64;
    let results: Vec<ExitRecord> = results.into_iter().flatten().collect();
    let _ = summary_tx.send(Summary::new(started_wall, finished_wall, duration_ms, results));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_count_is_used_unchanged() {
        let policy = resolve_with_units(&ParallelMax::Count(3), 8, None).unwrap();
        assert_eq!(policy, ConcurrencyPolicy::Bounded(3));
    }

    #[test]
    fn zero_count_is_malformed() {
        assert!(resolve_with_units(&ParallelMax::Count(0), 8, None).is_err());
    }

    #[test]
    fn auto_resolves_to_unit_count() {
        let policy = resolve_with_units(&ParallelMax::Auto, 8, None).unwrap();
        assert_eq!(policy, ConcurrencyPolicy::Bounded(8));
    }

    #[test]
    fn percentage_floors_with_minimum_one() {
        assert_eq!(
            resolve_with_units(&ParallelMax::Percent(50), 8, None).unwrap(),
            ConcurrencyPolicy::Bounded(4)
        );
        assert_eq!(
            resolve_with_units(&ParallelMax::Percent(30), 8, None).unwrap(),
            ConcurrencyPolicy::Bounded(2)
        );
        assert_eq!(
            resolve_with_units(&ParallelMax::Percent(1), 8, None).unwrap(),
            ConcurrencyPolicy::Bounded(1)
        );
    }

    #[test]
    fn unbounded_has_no_cap() {
        assert_eq!(
            resolve_with_units(&ParallelMax::Unbounded, 8, None).unwrap(),
            ConcurrencyPolicy::Unbounded
        );
    }

    #[test]
    fn default_falls_back_to_auto_when_unset() {
        assert_eq!(
            resolve_with_units(&ParallelMax::Default, 8, None).unwrap(),
            ConcurrencyPolicy::Bounded(8)
        );
    }

    #[test]
    fn default_uses_configured_value() {
        assert_eq!(
            resolve_with_units(&ParallelMax::Default, 8, Some("3")).unwrap(),
            ConcurrencyPolicy::Bounded(3)
        );
        assert_eq!(
            resolve_with_units(&ParallelMax::Default, 8, Some("unbounded")).unwrap(),
            ConcurrencyPolicy::Unbounded
        );
    }

    #[test]
    fn configured_default_means_auto_not_recursion() {
        assert_eq!(
            resolve_with_units(&ParallelMax::Default, 8, Some("default")).unwrap(),
            ConcurrencyPolicy::Bounded(8)
        );
    }

    #[test]
    fn configured_garbage_is_malformed() {
        assert!(resolve_with_units(&ParallelMax::Default, 8, Some("many")).is_err());
    }

    #[test]
    fn series_is_one_at_a_time() {
        assert_eq!(
            resolve_with_units(&ParallelMax::Series, 8, None).unwrap(),
            ConcurrencyPolicy::Series
        );
    }
}
