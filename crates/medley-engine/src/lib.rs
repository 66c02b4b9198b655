//! medley-engine: script execution and concurrent orchestration.
//!
//! This crate provides:
//!
//! - **Channel**: Single-subscriber output channel that drains a subprocess
//!   pipe eagerly, with byte and text consumption modes
//! - **Decode**: Incremental UTF-8 decoding across chunk boundaries
//! - **Merge**: Fan-in multiplexer combining many channels into one stream
//! - **Executor**: Spawns one script, wires both pipes, reports an exit record
//! - **Scheduler**: Slot-filling concurrent runner producing a run summary
//! - **Format**: Escape-sequence sanitization and prefixed line buffering

pub mod channel;
pub mod decode;
pub mod executor;
pub mod format;
pub mod merge;
pub mod scheduler;

pub use channel::{ByteChunks, CancelHandle, DrainError, OutputChannel, TextChunks};
pub use decode::Utf8Decoder;
pub use executor::{ScriptExecutor, SpawnError, ENV_MAX_PARALLEL, ENV_SHELL_MARKER};
pub use format::{sanitize, OutputFormatter};
pub use merge::{merger, MergeHandle, MergedBytes, MergedText, OutputMerger};
pub use scheduler::{
    available_units, resolve_parallel_max, Scheduler, ScriptRun, ENV_PARALLEL_DEFAULT,
};
