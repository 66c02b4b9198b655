//! ExitRecord — the immutable outcome of one finished script execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::ScriptTag;

/// The outcome of one script execution.
///
/// Created once, when the process terminates; never mutated afterward.
/// Any exit code — including non-zero — is a normal completion, not an
/// error: failure shows up as `success == false`, nothing is thrown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitRecord {
    /// Which workspace/script this record belongs to.
    pub tag: ScriptTag,
    /// Process exit code. Signal terminations map to `128 + signo`.
    pub exit_code: i32,
    /// Terminating signal name, if the process died from a signal.
    pub signal: Option<String>,
    /// True iff `exit_code == 0`.
    pub success: bool,
    /// Wall-clock start of the execution.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end of the execution.
    pub finished_at: DateTime<Utc>,
    /// Monotonic duration of the execution in milliseconds.
    pub duration_ms: u64,
    /// Caller data carried over from the spec.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExitRecord {
    /// Create a record from an exit code and timing data.
    pub fn new(
        tag: ScriptTag,
        exit_code: i32,
        signal: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tag,
            exit_code,
            signal,
            success: exit_code == 0,
            started_at,
            finished_at,
            duration_ms,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// A synthetic failed record for a script that never ran properly
    /// (spawn failure, lost wait task). Start and end coincide.
    pub fn failed_now(tag: ScriptTag, exit_code: i32) -> Self {
        let now = Utc::now();
        Self::new(tag, exit_code, None, now, now, 0)
    }
}
