//! Domain types shared across the vault: the record module enumeration,
//! the archive manifest, and the last-backup status record.

pub mod manifest;
pub mod modules;
pub mod status;

pub use manifest::{Manifest, MANIFEST_ENTRY};
pub use modules::RecordModule;
pub use status::BackupStatusRecord;

use serde::{Deserialize, Serialize};

/// The person a backup or restore runs on behalf of. Recorded in the
/// manifest and in every audit entry the operation writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub id: String,
    pub username: String,
    pub display_name: String,
}

impl Operator {
    /// Synthetic operator for unattended operations (scheduled snapshots,
    /// maintenance tooling).
    pub fn system() -> Self {
        Operator {
            id: "system".to_string(),
            username: "system".to_string(),
            display_name: "System".to_string(),
        }
    }
}
