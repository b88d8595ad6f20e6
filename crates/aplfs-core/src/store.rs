//! Named slots of user-written APL, persisted one file per slot.
//!
//! The directory on disk is the source of truth; the store is just a
//! serialized view over it. Slot names are restricted to a filesystem-safe
//! charset so a slot can never escape the directory.

use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::warn;

pub struct QueryStore {
    lock: Mutex<()>,
    dir: PathBuf,
}

impl QueryStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        let dir = dir.unwrap_or_else(|| std::env::temp_dir().join("aplfs-queries"));
        if let Err(err) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), %err, "failed to create query dir");
        }
        Self {
            lock: Mutex::new(()),
            dir,
        }
    }

    /// Current bytes of a slot; empty when the slot is missing or the name
    /// is invalid.
    pub fn get(&self, name: &str) -> Vec<u8> {
        if !is_valid_slot_name(name) {
            return Vec::new();
        }
        let _guard = self.lock.lock();
        std::fs::read(self.slot_path(name)).unwrap_or_default()
    }

    /// Replaces a slot's contents atomically (temp file + rename).
    pub fn set(&self, name: &str, data: &[u8]) {
        if !is_valid_slot_name(name) {
            return;
        }
        let _guard = self.lock.lock();
        let result = tempfile::NamedTempFile::new_in(&self.dir).and_then(|tmp| {
            std::fs::write(tmp.path(), data)?;
            tmp.persist(self.slot_path(name))
                .map_err(|err| err.error)?;
            Ok(())
        });
        if let Err(err) = result {
            warn!(slot = name, %err, "failed to write query slot");
        }
    }

    pub fn truncate(&self, name: &str) {
        if !is_valid_slot_name(name) {
            return;
        }
        let _guard = self.lock.lock();
        if let Err(err) = std::fs::write(self.slot_path(name), b"") {
            warn!(slot = name, %err, "failed to truncate query slot");
        }
    }

    /// Sorted names of existing slots.
    pub fn names(&self) -> Vec<String> {
        let _guard = self.lock.lock();
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let file_name = file_name.to_str()?;
                let name = file_name.strip_suffix(".apl")?;
                is_valid_slot_name(name).then(|| name.to_string())
            })
            .collect();
        names.sort();
        names
    }

    fn slot_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.apl"))
    }
}

/// Slot names: 1..=64 chars of `[A-Za-z0-9._-]`, no `..`.
pub fn is_valid_slot_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    if name.contains("..") {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}
