//! medley-types: shared data types for the medley script runner.
//!
//! This crate provides:
//!
//! - **ScriptSpec**: the command, working directory, environment, and tag
//!   describing one script execution
//! - **ExitRecord**: the immutable outcome of one finished execution
//! - **ChunkMeta / ByteChunk / TextChunk**: tagged output chunks
//! - **Summary**: the aggregate result of a full scheduler run
//! - **ParallelMax / ConcurrencyPolicy**: concurrency configuration
//! - **Error types**: `OutputStreamError`, `PolicyError`

pub mod chunk;
pub mod error;
pub mod policy;
pub mod record;
pub mod spec;
pub mod summary;

pub use chunk::{ByteChunk, ChunkMeta, StreamName, TextChunk};
pub use error::{OutputStreamError, PolicyError};
pub use policy::{ConcurrencyPolicy, ParallelMax};
pub use record::ExitRecord;
pub use spec::{ScriptSpec, ScriptTag};
pub use summary::Summary;
