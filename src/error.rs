//! Error taxonomy of the engine.
//!
//! Every kind here ends up in exactly one verdict: `ResourceExhausted` and
//! `LaunchFailure` error the offending test, `Timeout` and
//! `AssertionFailure` become TIMED_OUT/FAILED, `AbortDetected`
//! short-circuits only its own test, and `Cancelled` is the one kind that
//! propagates top-down from the scheduler into every blocking wait.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Which leased resource an allocation failure was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Port,
    Directory,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Port => write!(f, "port"),
            ResourceKind::Directory => write!(f, "directory"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The allocator could not produce a free resource before its deadline.
    #[error("no free {kind} after waiting {waited:?}")]
    ResourceExhausted {
        kind: ResourceKind,
        waited: Duration,
    },

    /// The operating system refused to start a process.
    #[error("could not launch `{command}`: {source}")]
    LaunchFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A wait, or the whole test, exceeded its deadline.
    #[error("{operation} did not complete within {limit:?}")]
    Timeout { operation: String, limit: Duration },

    /// A validation check did not hold.
    #[error("assertion failed: {0}")]
    AssertionFailure(String),

    /// A fatal pattern appeared in monitored output.
    #[error("abort pattern `{pattern}` matched in {}", file.display())]
    AbortDetected { pattern: String, file: PathBuf },

    /// Global or per-test cancellation was requested.
    #[error("cancelled")]
    Cancelled,

    /// A process could not be terminated or a lease could not be released.
    #[error("cleanup failed: {0}")]
    CleanupFailure(String),

    /// A wait was given an invalid regular expression.
    #[error("invalid pattern `{pattern}`: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error came from a cancellation request rather than from
    /// anything the test did.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
