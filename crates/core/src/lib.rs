//! Incremental, content-addressed build memoization engine.
//!
//! Client code declaratively submits read, write, copy, mkdir, delete,
//! wait and process-spawn operations to a [`Memo`]. Each operation is
//! hashed over its semantic inputs; a persistent file cache is consulted to
//! revive previously executed work, and the remainder is scheduled for
//! parallel execution bounded by a jobs budget. Completions run
//! continuations, which may submit more operations.
//!
//! The engine is single-threaded and cooperative at the memoizer level; the
//! only parallelism comes from child processes. See [`memo::Memo::stir`]
//! for the drive loop.

use std::path::Path;
use thiserror::Error;

pub mod config;
pub mod exec;
pub mod fiber;
pub mod guard;
pub mod memo;
pub mod op;
pub mod reviver;
pub mod store;
pub mod tool;

pub use fiber::{Abort, FiberResult, Future};
pub use memo::{BuildError, CopySpec, Feedback, FeedbackFn, Memo, MemoConfig, SpawnSpec, WriteSpec};
pub use op::{FailureKind, NotifyKind, Op, OpKind, OpRef, Sink, SpawnCmd, Status};
pub use store::{Store, StoreKey};
pub use tool::{ResponseFile, ToolEnv, ARGS0, DEFAULT_UNSTAMPED_VARS};

/// Main error type for engine setup and execution plumbing
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error outside an operation's own failure record
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed
        operation: String,
    },

    /// Configuration error, reported at setup time
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error bubbled up from the file cache
    #[error("Cache error: {0}")]
    Cache(#[from] stoke_cache::Error),

    /// Executor setup or scheduling error
    #[error("Executor error: {0}")]
    Exec(String),
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Error::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an executor error
    #[must_use]
    pub fn exec(msg: impl Into<String>) -> Self {
        Error::Exec(msg.into())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;
