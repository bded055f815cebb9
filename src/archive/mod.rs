//! The backup archive container: a ZIP whose first entry is the manifest,
//! followed by the data tree under `data/` and, optionally, the filed-email
//! tree under `emails/`.

pub mod builder;
pub mod reader;

pub use builder::{ArchiveEntry, SnapshotBuilder};
pub use reader::ArchiveReader;

use std::path::{Component, Path, PathBuf};

use crate::config::VaultPaths;
use crate::model::MANIFEST_ENTRY;

/// Entry-name prefix for files from the data tree.
pub const DATA_PREFIX: &str = "data/";

/// Entry-name prefix for files from the email tree.
pub const EMAIL_PREFIX: &str = "emails/";

/// Build an archive entry name from a prefix and a relative path, always
/// with forward slashes regardless of host separator.
pub(crate) fn entry_name(prefix: &str, rel: &Path) -> String {
    let mut name = String::from(prefix);
    let mut first = true;
    for component in rel.components() {
        if !first {
            name.push('/');
        }
        name.push_str(&component.as_os_str().to_string_lossy());
        first = false;
    }
    name
}

/// Maps archive entry names to extraction destinations.
///
/// Routing is also the safety filter: the manifest, anything under the
/// guarded `system/` and `tmp/` prefixes, entries with traversal components,
/// and email entries on a system with no email tree configured all resolve
/// to `None` and are skipped.
pub struct EntryRoutes {
    pub data_root: PathBuf,
    pub email_root: Option<PathBuf>,
}

impl EntryRoutes {
    pub fn for_paths(paths: &VaultPaths) -> Self {
        EntryRoutes {
            data_root: paths.data_dir.clone(),
            email_root: paths.email_dir.clone(),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name == MANIFEST_ENTRY || name.ends_with('/') {
            return None;
        }
        if let Some(rest) = name.strip_prefix(DATA_PREFIX) {
            if rest == "system" || rest == "tmp" {
                return None;
            }
            if rest.starts_with("system/") || rest.starts_with("tmp/") {
                return None;
            }
            return sanitized(rest).map(|rel| self.data_root.join(rel));
        }
        if let Some(rest) = name.strip_prefix(EMAIL_PREFIX) {
            let root = self.email_root.as_ref()?;
            return sanitized(rest).map(|rel| root.join(rel));
        }
        None
    }
}

/// Reject absolute paths and any component that is not a plain name, so a
/// crafted entry cannot escape its extraction root (zip-slip).
fn sanitized(rest: &str) -> Option<PathBuf> {
    let path = Path::new(rest);
    if path.is_absolute() {
        return None;
    }
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}
