use std::path::PathBuf;
use thiserror::Error;

use crate::prediction::{PredictionStatus, Transition};

/// Errors from the persisted prediction ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Another run holds the ledger lock. Runs never wait for it.
    #[error("prediction ledger is locked by another run ({holder}); lock file: {path}")]
    Locked { path: PathBuf, holder: String },

    #[error("unsupported ledger version {found}, expected {expected}")]
    UnsupportedVersion { found: String, expected: String },

    #[error("failed to parse ledger {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("prediction {0} already exists in the ledger")]
    Duplicate(String),
}

/// Violations of the article store's id and cluster invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("article {0} already stored")]
    DuplicateId(String),

    #[error("unknown article {0}")]
    UnknownArticle(String),

    #[error("article {id} already belongs to cluster {existing}, cannot move it to {requested}")]
    ClusterReassigned {
        id: String,
        existing: String,
        requested: String,
    },
}

/// An illegal prediction state change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("prediction {prediction_id}: cannot {attempted:?} from {from:?}")]
pub struct TransitionError {
    pub prediction_id: String,
    pub from: PredictionStatus,
    pub attempted: Transition,
}

/// Failures of an LLM-backed judgment after retries are exhausted.
#[derive(Debug, Error)]
pub enum JudgmentError {
    #[error("no LLM backend configured and no cached judgment")]
    Unavailable,

    #[error("LLM call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed LLM response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
