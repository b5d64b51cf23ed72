//! Error taxonomy for subscription parsing, node selection, config
//! generation and engine supervision.

use std::path::PathBuf;

/// Failures surfaced by the `proxy` module.
///
/// Per-entry and per-source failures are handled inside the parsers and the
/// multi-source loops; a `ProxyError` means every alternative was exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to parse subscription: {0}")]
    Parse(String),

    #[error("no reachable nodes found ({total} probed)")]
    NoReachableNode { total: usize },

    #[error("unsupported node type: {0}")]
    UnsupportedKind(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("invalid engine archive: {0}")]
    Archive(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode engine config: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Engine lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("xray-core not found at {}, run `install` first", .0.display())]
    BinaryMissing(PathBuf),

    #[error("xray-core is already running (PID {0})")]
    AlreadyRunning(u32),

    #[error("failed to start xray-core: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to record engine PID at {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProxyError>;
