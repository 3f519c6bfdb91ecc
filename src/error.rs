//! Error taxonomy for indexing runs.
//!
//! Unit-local and entity-local failures (`ParseError`, store write failures,
//! `EnrichmentError`) are collected into the run report and never abort a
//! repository-wide run. `IdentityCollisionError` and store connectivity loss
//! are run-fatal.

use std::path::PathBuf;
use std::time::Duration;

/// A source unit that could not be turned into a syntax tree.
#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error in {path}: {message}")]
pub struct ParseError {
    pub path: String,
    pub message: String,
    pub line: Option<usize>,
}

impl ParseError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

/// Two distinct entities resolved to the same qualified name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("identity collision on `{key}`: claimed by {first_path} and {second_path}")]
pub struct IdentityCollisionError {
    pub key: String,
    pub first_path: String,
    pub second_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("invalid stored value: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Whether this error means the store itself is unreachable, as opposed
    /// to a single write failing.
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Pool(_) | StoreError::Poisoned => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::DiskFull
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EnrichmentError {
    #[error("enrichment timed out after {0:?}")]
    Timeout(Duration),

    #[error("enrichment failed: {0}")]
    Failed(String),

    #[error("enrichment returned an invalid payload: {0}")]
    InvalidPayload(String),

    #[error("enrichment worker exited without a result")]
    Disconnected,

    #[error("all {0} enrichment slots stayed busy")]
    Saturated(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    IdentityCollision(#[from] IdentityCollisionError),

    #[error("store write failed for `{key}` after {attempts} attempt(s): {source}")]
    StoreWrite {
        key: String,
        attempts: usize,
        #[source]
        source: StoreError,
    },

    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("enrichment failed for `{key}`: {source}")]
    Enrichment {
        key: String,
        #[source]
        source: EnrichmentError,
    },

    #[error("indexing run cancelled")]
    Cancelled,

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Setup(String),
}

pub type IndexResult<T> = Result<T, IndexError>;
