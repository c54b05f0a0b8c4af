use crate::mutex::MutexState;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of the record store behind the replicated table.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store at {path} is unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("failed to write {location}: {source}")]
    Write {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode records for {location}: {source}")]
    Encode {
        location: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("participant {participant} cannot {operation} while {state:?}")]
    InvalidState {
        participant: String,
        operation: &'static str,
        state: MutexState,
    },

    #[error("call to {peer} failed: {reason}")]
    Call { peer: String, reason: String },

    #[error("unexpected reply from {peer}: {reply}")]
    UnexpectedReply { peer: String, reply: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
