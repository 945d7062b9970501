use std::sync::Arc;

use thiserror::Error;

/// Workspace-wide error type. Cloneable so that a single failure can be
/// fanned out to every caller waiting on the same fetch.
#[derive(Error, Debug, Clone)]
pub enum QuiverError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Not Found: {0} missing on every repository")]
    NotFound(String),

    #[error("Not In Cache: {0}")]
    NotInCache(String),

    #[error("Checksum Mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Transport Error for {url}: {reason}")]
    TransportError { url: String, reason: String },

    #[error("Unauthorized ({status}): {url}")]
    Unauthorized { url: String, status: u16 },

    #[error("Parse Error in {source_name} at byte {offset}: {reason}")]
    ParseError {
        source_name: String,
        offset: usize,
        reason: String,
    },

    #[error("Property Cycle: ${{{0}}} refers to itself")]
    PropertyCycle(String),

    #[error("Parent Cycle involving {0}")]
    ParentCycle(String),

    #[error("Resolution did not converge after {0} iterations")]
    MaxIterations(usize),

    #[error("Version Conflict for {module}: {versions:?}")]
    VersionConflict {
        module: String,
        versions: Vec<String>,
    },

    #[error("Unknown Version: no listing entry for {0}")]
    UnknownVersion(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Cache Error: {0}")]
    Cache(String),

    #[error("Credential Error: {0}")]
    Credential(String),
}

impl From<std::io::Error> for QuiverError {
    fn from(err: std::io::Error) -> Self {
        QuiverError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for QuiverError {
    fn from(err: reqwest::Error) -> Self {
        QuiverError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for QuiverError {
    fn from(err: serde_json::Error) -> Self {
        QuiverError::Json(Arc::new(err))
    }
}

impl QuiverError {
    /// Errors that abort the whole resolution rather than a single
    /// coordinate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QuiverError::MaxIterations(_)
                | QuiverError::ParentCycle(_)
                | QuiverError::PropertyCycle(_)
                | QuiverError::VersionConflict { .. }
                | QuiverError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, QuiverError>;
