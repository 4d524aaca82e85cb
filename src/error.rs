use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EchomapError {
    #[error("auth failed against upstream API: {0}")]
    AuthFailed(String),

    #[error("checkpoint unusable: {}", problems.join("; "))]
    CheckpointCorrupt { problems: Vec<String> },

    #[error("topology file invalid: {0}")]
    Topology(String),

    #[error("archive invalid: {0}")]
    Archive(String),

    #[error("legacy checkpoint migration failed: {0}")]
    Migration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EchomapError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(problems: Vec<String>) -> Self {
        Self::CheckpointCorrupt { problems }
    }

    /// True for failures that must terminate the run with a non-zero exit
    /// code (invalid credentials, unusable checkpoint, filesystem damage).
    /// Per-sample API trouble never reaches this type; it is absorbed as a
    /// `FetchOutcome` value at the call site.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Request(_))
    }
}
