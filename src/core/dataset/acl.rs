//! The three flat-file allow/block lists: IP block list, subscription email
//! block list, unlimited IP allow list. Grounded on
//! `original_source/erddaputil/erddap/datasets.py::AllowBlockListFile`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::core::errors::CoreError;

type Validator = fn(&str) -> Result<(), CoreError>;

struct Cache {
    mtime: Option<SystemTime>,
    entries: BTreeSet<String>,
}

/// One ACL flat file: one entry per line, blank lines and `#`-prefixed
/// comments ignored, entries validated by `validator` before being
/// accepted. Reads are cached and only re-parsed when the file's mtime
/// advances, matching the original's `_check_cache_reload`.
pub struct AclFile {
    path: PathBuf,
    validator: Validator,
    cache: Mutex<Cache>,
}

impl AclFile {
    pub fn new(path: impl Into<PathBuf>, validator: Validator) -> Self {
        Self {
            path: path.into(),
            validator,
            cache: Mutex::new(Cache {
                mtime: None,
                entries: BTreeSet::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).ok().and_then(|m| m.modified().ok())
    }

    /// Returns the current set of entries, re-reading from disk only if
    /// the file's mtime has advanced since the last read. A missing file
    /// is treated as an empty list, not an error.
    pub fn read_all(&self) -> Result<BTreeSet<String>, CoreError> {
        let current_mtime = self.file_mtime();
        let mut cache = self.cache.lock();
        if cache.mtime == current_mtime && current_mtime.is_some() {
            return Ok(cache.entries.clone());
        }
        let entries = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_lowercase)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        cache.mtime = current_mtime;
        cache.entries = entries.clone();
        Ok(entries)
    }

    /// Overwrites the file with `entries`, one per line, sorted for a
    /// stable diff. Writes to a sibling temp file and renames into place
    /// so a concurrent reader never observes a half-written file.
    pub fn write_all(&self, entries: &BTreeSet<String>) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut body = String::new();
        for entry in entries {
            body.push_str(entry);
            body.push('\n');
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &self.path)?;

        let mut cache = self.cache.lock();
        cache.mtime = self.file_mtime();
        cache.entries = entries.clone();
        Ok(())
    }

    /// Adds or removes `value` (validated, then normalized to its
    /// lower-cased, trimmed form per the ACL file's own uniqueness rule).
    /// Returns `Ok(true)` if the file's contents actually changed, `Ok(false)`
    /// if `value` was already absent/present respectively — callers use
    /// this to skip an unnecessary recompilation.
    pub fn append_or_remove(&self, value: &str, remove: bool) -> Result<bool, CoreError> {
        (self.validator)(value)?;
        let value = value.trim().to_lowercase();
        let mut entries = self.read_all()?;
        let changed = if remove {
            entries.remove(&value)
        } else {
            entries.insert(value)
        };
        if changed {
            self.write_all(&entries)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::ip::validate_email;

    #[test]
    fn append_then_remove_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.txt");
        let acl = AclFile::new(&path, validate_email);

        assert!(acl.append_or_remove("person@example.com", false).unwrap());
        assert_eq!(acl.read_all().unwrap().len(), 1);

        // Re-adding the same value is a no-op.
        assert!(!acl.append_or_remove("person@example.com", false).unwrap());

        assert!(acl.append_or_remove("person@example.com", true).unwrap());
        assert!(acl.read_all().unwrap().is_empty());
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.txt");
        let acl = AclFile::new(&path, validate_email);
        assert!(acl.read_all().unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_entries_without_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.txt");
        let acl = AclFile::new(&path, validate_email);
        assert!(acl.append_or_remove("not-an-email", false).is_err());
        assert!(!path.exists());
    }
}
