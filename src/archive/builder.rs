//! Streams the data tree into a snapshot archive.
//!
//! The manifest goes in first so tooling can read it without touching the
//! data entries. Files are streamed one at a time through the Deflate
//! writer; nothing is staged in memory or on disk, so snapshotting a large
//! attachment tree needs no scratch space.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{entry_name, DATA_PREFIX, EMAIL_PREFIX};
use crate::config::{VaultPaths, SYSTEM_DIR, TMP_DIR};
use crate::error::{Result, VaultError};
use crate::model::{Manifest, MANIFEST_ENTRY};
use crate::progress::{ProgressSpan, ProgressTracker};

/// One file scheduled for archiving.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub name: String,
    pub size: u64,
}

pub struct SnapshotBuilder<'a> {
    paths: &'a VaultPaths,
    progress: &'a ProgressTracker,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(paths: &'a VaultPaths, progress: &'a ProgressTracker) -> Self {
        SnapshotBuilder { paths, progress }
    }

    /// Collect the files a snapshot must carry: the data tree minus the
    /// guarded directories and WAL side files, plus the email tree when
    /// requested and configured.
    pub fn collect_entries(&self, include_emails: bool) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        collect_tree(&mut entries, &self.paths.data_dir, DATA_PREFIX, true)?;

        if include_emails {
            if let Some(email_dir) = &self.paths.email_dir {
                if email_dir.is_dir() {
                    collect_tree(&mut entries, email_dir, EMAIL_PREFIX, false)?;
                }
            }
        }

        // Deterministic archive layout regardless of directory read order
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(files = entries.len(), "[archive] Collected snapshot entries");
        Ok(entries)
    }

    /// Write the archive: manifest first, then every entry, reporting
    /// per-file progress on the given span. Fills in the manifest's size
    /// and file-count totals. Returns the finished archive's size.
    pub fn write_archive(
        &self,
        dest: &std::path::Path,
        manifest: &mut Manifest,
        entries: &[ArchiveEntry],
        span: ProgressSpan,
    ) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        manifest.total_size_bytes = entries.iter().map(|e| e.size).sum();
        manifest.file_count = entries.len() as u64;

        let file = File::create(dest)?;
        let mut zip = ZipWriter::new(file);
        // large_file keeps attachment trees past 4 GiB writable (zip64)
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(6))
            .large_file(true);

        zip.start_file(MANIFEST_ENTRY, options)?;
        zip.write_all(&serde_json::to_vec_pretty(manifest)?)?;

        let total = entries.len();
        for (idx, entry) in entries.iter().enumerate() {
            zip.start_file(entry.name.as_str(), options)?;
            let mut source = File::open(&entry.source)?;
            std::io::copy(&mut source, &mut zip)?;

            let done = idx + 1;
            self.progress.report_file(
                span.phase,
                span.at(done, total),
                format!("Archived {done} of {total} files"),
                entry.name.clone(),
            );
        }
        zip.finish()?;

        let size = std::fs::metadata(dest)?.len();
        info!(
            path = %dest.display(),
            size_bytes = size,
            files = total,
            "[archive] Snapshot written"
        );
        Ok(size)
    }
}

fn collect_tree(
    entries: &mut Vec<ArchiveEntry>,
    root: &std::path::Path,
    prefix: &str,
    guard_vault_dirs: bool,
) -> Result<()> {
    for result in WalkDir::new(root).follow_links(false) {
        let entry = result.map_err(|e| VaultError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if guard_vault_dirs && is_guarded(rel) {
            continue;
        }
        if is_volatile(rel) {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| VaultError::Io(e.into()))?;
        entries.push(ArchiveEntry {
            name: entry_name(prefix, rel),
            source: entry.into_path(),
            size: metadata.len(),
        });
    }
    Ok(())
}

fn is_guarded(rel: &std::path::Path) -> bool {
    matches!(
        rel.components().next(),
        Some(component) if component.as_os_str() == SYSTEM_DIR || component.as_os_str() == TMP_DIR
    )
}

/// WAL and journal side files are snapshots of in-flight writes; the
/// checkpoint before archiving folds their content into the main store.
fn is_volatile(rel: &std::path::Path) -> bool {
    let name = rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.ends_with("-wal") || name.ends_with("-shm") || name.ends_with("-journal")
}
