//! Error types for the vault engine.

use std::path::PathBuf;

use thiserror::Error;

/// Distinct failure points of the archive reader.
///
/// Callers branch on these to tell "the file is not an archive" apart from
/// "the archive has no manifest" apart from "the manifest does not parse",
/// so each stage gets its own variant instead of one stringly error.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("cannot open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a readable backup archive: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("failed reading archive entry {entry}: {reason}")]
    Stream { entry: String, reason: String },

    #[error("manifest entry {0} is not valid JSON: {1}")]
    Parse(&'static str, #[source] serde_json::Error),

    #[error("archive contains no {0} entry")]
    ManifestMissing(&'static str),

    #[error("manifest is incomplete: {0}")]
    ManifestInvalid(String),
}

#[derive(Error, Debug)]
pub enum VaultError {
    /// The archive failed validation before any mutation took place.
    /// Recoverable by picking a different file.
    #[error("archive validation failed: {0}")]
    Validation(#[from] ArchiveError),

    /// A file or directory stayed locked through the whole retry budget.
    #[error("{operation} still failing after {attempts} attempts: {source}")]
    TransientIo {
        operation: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The restored store failed its read-back check.
    #[error("post-restore verification failed: {0}")]
    Verification(String),

    /// Automatic rollback itself failed; the data tree needs manual recovery.
    #[error("restore failed ({reason}) and rollback also failed, manual intervention required: {source}")]
    RollbackFailed {
        reason: String,
        #[source]
        source: Box<VaultError>,
    },

    /// A backup or restore currently owns the storage engine.
    #[error("a {0} operation is in progress and owns the storage")]
    OperationInProgress(&'static str),

    #[error("storage is closed")]
    StorageClosed,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("archive write error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    /// True when the error happened before any mutation, i.e. the data tree
    /// is untouched and no rollback is needed.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            VaultError::Validation(_) | VaultError::OperationInProgress(_)
        )
    }
}
