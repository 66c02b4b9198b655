//! Single script executor — runs exactly one script spec to completion.
//!
//! Spawns `sh -c <command>` with the spec's working directory and merged
//! environment, wraps the child's stdout and stderr in two eagerly-drained
//! output channels, and exposes them combined through a 2-source
//! multiplexer. Process exit with any code — zero or not — is a normal
//! completion; only an OS-level spawn failure is an executor error.

use std::process::Stdio;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use medley_types::{ChunkMeta, ExitRecord, ScriptSpec, ScriptTag, StreamName};

use crate::channel::{CancelHandle, OutputChannel};
use crate::merge::OutputMerger;

/// Marker variable set in every process medley spawns.
pub const ENV_SHELL_MARKER: &str = "MEDLEY_SHELL";

/// Variable carrying the resolved concurrency limit, for scripts that
/// wish to introspect it.
pub const ENV_MAX_PARALLEL: &str = "MEDLEY_MAX_PARALLEL";

/// The OS refused to spawn the process (e.g. no shell binary).
#[derive(Debug, Error)]
#[error("failed to spawn `{command}`: {source}")]
pub struct SpawnError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// One running script: its output, its kill switch, and its exit record.
pub struct ScriptExecutor {
    tag: ScriptTag,
    output: OutputMerger,
    kill_token: CancellationToken,
    channel_cancels: [CancelHandle; 2],
    exit_rx: Option<oneshot::Receiver<ExitRecord>>,
    result: Option<ExitRecord>,
}

impl ScriptExecutor {
    /// Spawn a script with no scheduler-injected environment.
    pub fn spawn(spec: &ScriptSpec) -> Result<Self, SpawnError> {
        Self::spawn_with_env(spec, &[])
    }

    /// Spawn a script, adding scheduler-injected environment variables
    /// (such as the resolved concurrency limit) on top of the spec's own.
    pub fn spawn_with_env(
        spec: &ScriptSpec,
        injected: &[(&str, String)],
    ) -> Result<Self, SpawnError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !spec.args.is_empty() {
            // `$0` for the shell, then the positional parameters.
            cmd.arg("sh").args(&spec.args);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        for (key, value) in injected {
            cmd.env(key, value);
        }
        cmd.env(ENV_SHELL_MARKER, "1");

        let started_wall = Utc::now();
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SpawnError {
            command: spec.command.clone(),
            source,
        })?;
        tracing::debug!(tag = %spec.tag, command = %spec.command, "script started");

        let stdout_meta =
            ChunkMeta::new(spec.tag.clone(), StreamName::Stdout).with_metadata(spec.metadata.clone());
        let stderr_meta =
            ChunkMeta::new(spec.tag.clone(), StreamName::Stderr).with_metadata(spec.metadata.clone());
        let stdout_chan = match child.stdout.take() {
            Some(pipe) => OutputChannel::spawn(pipe, stdout_meta),
            None => OutputChannel::spawn(tokio::io::empty(), stdout_meta),
        };
        let stderr_chan = match child.stderr.take() {
            Some(pipe) => OutputChannel::spawn(pipe, stderr_meta),
            None => OutputChannel::spawn(tokio::io::empty(), stderr_meta),
        };
        let channel_cancels = [stdout_chan.cancel_handle(), stderr_chan.cancel_handle()];
        let output = OutputMerger::from_channels([stdout_chan, stderr_chan])
            .map_err(|_| SpawnError {
                command: spec.command.clone(),
                source: std::io::Error::other("fresh channel already subscribed"),
            })?;

        let kill_token = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = kill_token.clone();
        let tag = spec.tag.clone();
        let task_tag = tag.clone();
        let metadata = spec.metadata.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let finished_wall = Utc::now();
            let duration_ms = started.elapsed().as_millis() as u64;
            let record = match status {
                Ok(status) => {
                    let (code, signal) = exit_code_of(status);
                    ExitRecord::new(task_tag, code, signal, started_wall, finished_wall, duration_ms)
                }
                Err(e) => {
                    tracing::warn!(tag = %task_tag, error = %e, "waiting on child failed");
                    ExitRecord::new(task_tag, 1, None, started_wall, finished_wall, duration_ms)
                }
            }
            .with_metadata(metadata);
            let _ = exit_tx.send(record);
        });

        Ok(Self {
            tag,
            output,
            kill_token,
            channel_cancels,
            exit_rx: Some(exit_rx),
            result: None,
        })
    }

    /// Which workspace/script this executor is running.
    pub fn tag(&self) -> &ScriptTag {
        &self.tag
    }

    /// The 2-source multiplexer over the child's stdout and stderr.
    pub fn output(&mut self) -> &mut OutputMerger {
        &mut self.output
    }

    /// Kill the process and cancel both output channels.
    ///
    /// The exit record still resolves (with the terminating signal); the
    /// channels resolve their completion signals without error.
    pub fn kill(&self) {
        tracing::debug!(tag = %self.tag, "killing script");
        for cancel in &self.channel_cancels {
            cancel.cancel("script killed");
        }
        self.kill_token.cancel();
    }

    /// Wait for the process to terminate. Idempotent; the record is
    /// cached after the first await.
    pub async fn wait(&mut self) -> ExitRecord {
        if let Some(record) = &self.result {
            return record.clone();
        }
        let record = match self.exit_rx.take() {
            Some(rx) => match rx.await {
                Ok(record) => record,
                Err(_) => ExitRecord::failed_now(self.tag.clone(), 1),
            },
            None => ExitRecord::failed_now(self.tag.clone(), 1),
        };
        self.result = Some(record.clone());
        record
    }
}

/// Map an exit status to `(code, signal_name)`.
///
/// Signal terminations use the shell convention `128 + signo`.
fn exit_code_of(status: std::process::ExitStatus) -> (i32, Option<String>) {
    match status.code() {
        Some(code) => (code, None),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                let signo = status.signal().unwrap_or(0);
                (128 + signo, Some(signal_name(signo)))
            }
            #[cfg(not(unix))]
            {
                (-1, None)
            }
        }
    }
}

#[cfg(unix)]
fn signal_name(signo: i32) -> String {
    match signo {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        13 => "SIGPIPE".to_string(),
        14 => "SIGALRM".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}
