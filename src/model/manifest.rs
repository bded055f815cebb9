//! The snapshot manifest embedded as the first entry of every archive.
//!
//! The manifest is the only part of an archive that tooling reads without
//! full extraction, so its schema is the compatibility surface between app
//! versions. Fields are snake_case JSON; unknown fields are ignored on read
//! so older builds can open newer archives for inspection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::modules::RecordModule;
use super::Operator;

/// Entry name of the manifest inside an archive. Written first so readers
/// can stream it out without touching the data entries.
pub const MANIFEST_ENTRY: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub backup_date: DateTime<Utc>,
    pub backup_by_user_id: String,
    pub backup_by_username: String,
    pub backup_by_display_name: String,
    pub app_version: String,
    pub schema_version: i64,
    pub total_size_bytes: u64,
    pub file_count: u64,
    #[serde(default)]
    pub module_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub includes_emails: bool,
}

impl Manifest {
    /// Start a manifest for a snapshot taken now. Size and file count are
    /// zero until the archive writer has streamed the entries and knows
    /// the real totals.
    pub fn new(
        operator: &Operator,
        schema_version: i64,
        module_counts: BTreeMap<String, u64>,
        includes_emails: bool,
    ) -> Self {
        Manifest {
            backup_date: Utc::now(),
            backup_by_user_id: operator.id.clone(),
            backup_by_username: operator.username.clone(),
            backup_by_display_name: operator.display_name.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version,
            total_size_bytes: 0,
            file_count: 0,
            module_counts,
            includes_emails,
        }
    }

    /// Completeness check for manifests that parsed structurally.
    ///
    /// Parsing already rejects missing fields; this catches manifests that
    /// are well-formed JSON but useless, such as an empty count table or a
    /// zeroed timestamp from a buggy writer.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.backup_date.timestamp() <= 0 {
            return Err("backup_date is missing or zero".to_string());
        }
        if self.module_counts.is_empty() {
            return Err("module_counts is empty".to_string());
        }
        for key in self.module_counts.keys() {
            if RecordModule::from_key(key).is_none() {
                return Err(format!("module_counts has unknown module '{key}'"));
            }
        }
        Ok(())
    }

    /// Operator recorded at snapshot time.
    pub fn operator(&self) -> Operator {
        Operator {
            id: self.backup_by_user_id.clone(),
            username: self.backup_by_username.clone(),
            display_name: self.backup_by_display_name.clone(),
        }
    }
}
