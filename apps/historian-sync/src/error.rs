use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal before any fetch: the run has nothing to work with.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("tag source for unit {unit} not found at {}", path.display())]
    MissingSource { unit: String, path: PathBuf },

    #[error("tag source {} for unit {unit} yielded zero tags", path.display())]
    NoTags { unit: String, path: PathBuf },

    #[error("failed to read {}: {detail}", path.display())]
    Unreadable { path: PathBuf, detail: String },

    #[error("invalid setting {key}: {detail}")]
    InvalidSetting { key: String, detail: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleFailureKind {
    Timeout,
    InvalidTag,
    NotFound,
    Empty,
    /// The session itself failed to accept or return a request.
    Session,
}

impl OracleFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::InvalidTag => "invalid_tag",
            Self::NotFound => "not_found",
            Self::Empty => "empty",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for OracleFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recoverable, per-tag. Recorded and skipped by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize)]
#[error("oracle {kind} for tag {tag}: {detail}")]
pub struct OracleFailure {
    pub tag: String,
    pub kind: OracleFailureKind,
    pub detail: String,
}

impl OracleFailure {
    pub fn new(tag: impl Into<String>, kind: OracleFailureKind, detail: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("schema error in {source_name}: {detail}")]
pub struct SchemaError {
    pub source_name: String,
    pub detail: String,
}

#[derive(Debug, Error)]
#[error("master {} is unreadable: {detail}", path.display())]
pub struct CorruptMasterError {
    pub path: PathBuf,
    pub detail: String,
}

/// Non-fatal: a merge was requested with nothing to merge.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EmptyMergeWarning {
    pub unit: String,
}

impl fmt::Display for EmptyMergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no new samples for unit {}; master left unchanged", self.unit)
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    CorruptMaster(#[from] CorruptMasterError),

    #[error("master for unit {unit} is locked by another writer")]
    Locked { unit: String },

    #[error("master io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("master storage error: {0}")]
    Storage(#[from] duckdb::Error),

    #[error("merge task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("oracle session for unit {unit} unavailable: {detail}")]
    Session { unit: String, detail: String },

    #[error("run for unit {unit} cancelled before merge")]
    Cancelled { unit: String },
}
