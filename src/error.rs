use std::path::PathBuf;
use thiserror::Error;

/// Failure to read one chapter resource. Callers fall back rather than fail.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("phrase {0:?} contains no words")]
    EmptyPhrase(String),
    #[error("entry body cannot be empty")]
    EmptyBody,
    #[error("no entry {id:?} in chapter {chapter}")]
    UnknownEntry { chapter: u32, id: String },
    #[error("unknown collection {0:?}; expected `vocab` or `notes`")]
    UnknownKind(String),
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("endpoint template {0:?} has no {{word}} placeholder")]
    Endpoint(String),
    #[cfg(feature = "web")]
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}
