//! Opens untrusted archives and reads them defensively.
//!
//! Opening parses only the central directory; [`ArchiveReader::read_manifest`]
//! then streams just the manifest entry, with a size bound, so a corrupt or
//! hostile file is rejected cheaply before a restore commits to anything.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use super::EntryRoutes;
use crate::error::{ArchiveError, Result};
use crate::model::{Manifest, MANIFEST_ENTRY};
use crate::progress::{ProgressSpan, ProgressTracker};

/// A manifest bigger than this is not a manifest.
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct ArchiveReader {
    archive: ZipArchive<File>,
    path: PathBuf,
}

impl ArchiveReader {
    /// Open the archive and parse its central directory. No entry data is
    /// decompressed yet.
    pub fn open(path: &Path) -> std::result::Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let archive = ZipArchive::new(file).map_err(|e| match e {
            ZipError::Io(source) => ArchiveError::Open {
                path: path.to_path_buf(),
                source,
            },
            other => ArchiveError::Format {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        })?;
        Ok(ArchiveReader {
            archive,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> usize {
        self.archive.len()
    }

    /// Stream out and validate the manifest without touching data entries.
    pub fn read_manifest(&mut self) -> std::result::Result<Manifest, ArchiveError> {
        let mut entry = match self.archive.by_name(MANIFEST_ENTRY) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(ArchiveError::ManifestMissing(MANIFEST_ENTRY))
            }
            Err(e) => {
                return Err(ArchiveError::Stream {
                    entry: MANIFEST_ENTRY.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let mut buf = Vec::new();
        entry
            .by_ref()
            .take(MAX_MANIFEST_BYTES + 1)
            .read_to_end(&mut buf)
            .map_err(|e| ArchiveError::Stream {
                entry: MANIFEST_ENTRY.to_string(),
                reason: e.to_string(),
            })?;
        if buf.len() as u64 > MAX_MANIFEST_BYTES {
            return Err(ArchiveError::ManifestInvalid(
                "manifest entry exceeds the size bound".to_string(),
            ));
        }

        let manifest: Manifest =
            serde_json::from_slice(&buf).map_err(|e| ArchiveError::Parse(MANIFEST_ENTRY, e))?;
        manifest.validate().map_err(ArchiveError::ManifestInvalid)?;
        Ok(manifest)
    }

    /// Extract every routed entry, creating parent directories as needed.
    /// Unrouted entries (manifest, guarded paths, traversal attempts,
    /// emails without an email tree) are skipped with a debug note.
    /// Returns the number of files written.
    pub fn extract_entries(
        &mut self,
        routes: &EntryRoutes,
        span: ProgressSpan,
        progress: &ProgressTracker,
    ) -> Result<usize> {
        let total = self.archive.len();
        let mut extracted = 0usize;

        for index in 0..total {
            let mut entry = self.archive.by_index(index)?;
            let name = entry.name().to_string();

            let Some(dest) = routes.resolve(&name) else {
                if name != MANIFEST_ENTRY {
                    debug!(entry = %name, "[archive] Skipping unrouted entry");
                }
                continue;
            };

            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&dest)?;
            std::io::copy(&mut entry, &mut out)?;
            extracted += 1;

            progress.report_file(
                span.phase,
                span.at(index + 1, total),
                format!("Extracted {extracted} files"),
                name,
            );
        }
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operator;
    use crate::progress::{NullSink, ProgressPhase};
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Arc;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn valid_manifest_json() -> Vec<u8> {
        let mut counts = BTreeMap::new();
        counts.insert("letters".to_string(), 1u64);
        let manifest = Manifest::new(&Operator::system(), 3, counts, false);
        serde_json::to_vec(&manifest).unwrap()
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn reads_manifest_from_valid_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.zip");
        let manifest_json = valid_manifest_json();
        write_zip(
            &path,
            &[
                (MANIFEST_ENTRY, manifest_json.as_slice()),
                ("data/records.db", b"db"),
            ],
        );

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.entry_count(), 2);
        let manifest = reader.read_manifest().unwrap();
        assert_eq!(manifest.module_counts["letters"], 1);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArchiveReader::open(&dir.path().join("absent.zip")).unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }));
    }

    #[test]
    fn garbage_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.zip");
        std::fs::write(&path, b"this is not a zip archive at all").unwrap();

        let err = ArchiveReader::open(&path).unwrap_err();
        assert!(matches!(err, ArchiveError::Format { .. }));
    }

    #[test]
    fn truncated_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.zip");
        let manifest_json = valid_manifest_json();
        write_zip(&path, &[(MANIFEST_ENTRY, manifest_json.as_slice())]);

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();

        assert!(ArchiveReader::open(&path).is_err());
    }

    #[test]
    fn archive_without_manifest_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nomanifest.zip");
        write_zip(&path, &[("data/records.db", b"db")]);

        let mut reader = ArchiveReader::open(&path).unwrap();
        let err = reader.read_manifest().unwrap_err();
        assert!(matches!(err, ArchiveError::ManifestMissing(_)));
    }

    #[test]
    fn unparseable_manifest_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("badjson.zip");
        write_zip(&path, &[(MANIFEST_ENTRY, b"{not json".as_slice())]);

        let mut reader = ArchiveReader::open(&path).unwrap();
        let err = reader.read_manifest().unwrap_err();
        assert!(matches!(err, ArchiveError::Parse(_, _)));
    }

    #[test]
    fn incomplete_manifest_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty-counts.zip");
        let mut counts = BTreeMap::new();
        counts.insert("letters".to_string(), 1u64);
        let mut manifest = Manifest::new(&Operator::system(), 3, counts, false);
        manifest.module_counts.clear();
        let body = serde_json::to_vec(&manifest).unwrap();
        write_zip(&path, &[(MANIFEST_ENTRY, body.as_slice())]);

        let mut reader = ArchiveReader::open(&path).unwrap();
        let err = reader.read_manifest().unwrap_err();
        assert!(matches!(err, ArchiveError::ManifestInvalid(_)));
    }

    #[test]
    fn extracts_routed_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.zip");
        let manifest_json = valid_manifest_json();
        write_zip(
            &path,
            &[
                (MANIFEST_ENTRY, manifest_json.as_slice()),
                ("data/records.db", b"db-bytes"),
                ("data/attachments/a.pdf", b"pdf"),
                ("data/system/rollback/evil.zip", b"no"),
                ("data/../escape.txt", b"no"),
                ("emails/msg.eml", b"mail"),
            ],
        );

        let out = dir.path().join("out");
        let routes = EntryRoutes {
            data_root: out.join("data"),
            email_root: None,
        };
        let progress = ProgressTracker::new(Arc::new(NullSink));
        let span = ProgressSpan {
            phase: ProgressPhase::Extracting,
            floor: 40,
            span: 35,
            cap: 75,
        };

        let mut reader = ArchiveReader::open(&path).unwrap();
        let extracted = reader.extract_entries(&routes, span, &progress).unwrap();

        assert_eq!(extracted, 2);
        assert_eq!(
            std::fs::read(out.join("data/records.db")).unwrap(),
            b"db-bytes"
        );
        assert!(out.join("data/attachments/a.pdf").exists());
        assert!(!out.join("data/system").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }
}
