//! Error types for the edge isolate runtime.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The startup snapshot is unusable. Fatal at process start.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("startup snapshot is empty")]
    Empty,

    #[error("startup snapshot is missing polyfill `{0}`")]
    MissingPolyfill(String),

    #[error("startup snapshot verification failed: {0}")]
    Verify(String),
}

/// A sandbox manager could not be constructed.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to create host fetch client: {0}")]
    Fetch(#[source] anyhow::Error),
}

/// Budget that ended an invocation early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    /// Wall-clock budget in milliseconds.
    WallClock(u64),
    /// Heap budget in bytes.
    Heap(usize),
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLimit::WallClock(ms) => write!(f, "wall-clock limit of {ms}ms"),
            ResourceLimit::Heap(bytes) => write!(f, "heap limit of {}MB", bytes / (1024 * 1024)),
        }
    }
}

/// Errors surfaced to the host for a single invocation.
///
/// None of these affect other sandboxes. The sandbox has always been
/// disposed by the time one is returned.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Global setup, a capability installer, or evaluation of the deployment
    /// source failed.
    #[error("sandbox initialization failed: {message}")]
    Init { message: String },

    /// The host's request could not be turned into a `Request`, e.g. a GET
    /// with a body. The handler was not called.
    #[error("invalid request: {message}")]
    Request { message: String },

    /// The deployment's handler threw or rejected. The message is sanitized.
    #[error("handler error: {message}")]
    Handler { message: String },

    #[error("invocation exceeded its {limit}")]
    Timeout { limit: ResourceLimit },

    #[error("concurrency limit reached (max {max} concurrent sandboxes)")]
    ConcurrencyLimit { max: usize },

    /// The sandbox thread failed outside of JavaScript.
    #[error("sandbox failed: {0}")]
    Internal(#[from] anyhow::Error),
}

impl InvocationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, InvocationError::Timeout { .. })
    }
}

/// Errors from the on-disk deployment store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid deployment id `{0}`")]
    InvalidId(String),

    #[error("invalid asset name `{0}`")]
    InvalidAssetName(String),

    #[error("deployment `{0}` has no code in the store")]
    NotFound(String),

    #[error("store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
