//! Error types for the collector.
//!
//! Recoverable failures surface as [`GcError`]. Broken heap invariants go
//! through [`fatal!`](crate::fatal), which logs and panics; release builds
//! abort on panic.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type GcResult<T> = Result<T, GcError>;

/// Recoverable collector errors
#[derive(Debug, Error)]
pub enum GcError {
    /// Allocation failed even after an out-of-memory collection
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory {
        /// Requested allocation size in bytes
        requested: usize,
    },

    /// Settings failed validation
    #[error("invalid gc settings: {0}")]
    InvalidSettings(String),

    /// Settings file could not be read
    #[error("failed to read gc settings from {path}: {source}")]
    SettingsIo {
        /// Path that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Settings file is not valid TOML for [`GcSettings`](crate::GcSettings)
    #[error("failed to parse gc settings: {0}")]
    SettingsParse(#[from] toml::de::Error),

    /// The background collector thread could not be started
    #[error("failed to spawn gc worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A class id has no registered descriptor
    #[error("unknown class id {0}")]
    UnknownClass(u32),

    /// A class cannot be allocated the way it was requested
    #[error("invalid class: {0}")]
    InvalidClass(String),

    /// An object was requested from a space that cannot hold it
    #[error("object of {size} bytes does not fit any space")]
    ObjectTooLarge {
        /// Requested size in bytes
        size: usize,
    },
}

/// Report a broken heap invariant and stop.
///
/// Logs through `tracing` first so the message reaches the embedder's
/// subscriber even when the panic aborts the process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        $crate::__tracing::error!(target: "strata::gc", $($arg)+);
        panic!($($arg)+)
    }};
}
