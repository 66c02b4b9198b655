//! Typed errors shared across the medley workspace.

use thiserror::Error;

/// Usage errors on an output channel or multiplexer.
///
/// These are programmer misuse, thrown synchronously at the call site:
/// consuming the same source twice, or after it has fully drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutputStreamError {
    /// The source already has a subscriber (bytes or text).
    #[error("output stream already started")]
    Started,
    /// The source has fully drained; nothing left to consume.
    #[error("output stream already done")]
    Done,
}

/// A malformed concurrency setting.
///
/// Fatal before any script starts; never raised once a run is underway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("invalid parallel max value: {0:?}")]
    Invalid(String),
}
