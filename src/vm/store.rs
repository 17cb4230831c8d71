//! VM Record Store - one JSON file per VM under `{base}/vms/`
//!
//! There is no daemon serializing access, so every command reads the
//! records fresh from disk. Operations that read-modify-write across all
//! records (IP lease allocation) hold [`StoreLock`], an exclusive advisory
//! `flock` on `{base}/run/vmm.lock` shared by all invocations.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;

use fs2::FileExt;
use tracing::debug;

use super::record::VMRecord;
use crate::config::Paths;
use crate::error::{Result, ResultExt, VmmError};

pub struct VMStore {
    paths: Paths,
}

impl VMStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn exists(&self, name: &str) -> bool {
        self.paths.record_path(name).exists()
    }

    pub fn load(&self, name: &str) -> Result<VMRecord> {
        let path = self.paths.record_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VmmError::NotFound(format!("VM '{}'", name)))
            }
            Err(e) => return Err(e).with_context(|| format!("reading record {}", path.display())),
        };
        serde_json::from_str(&raw).with_context(|| format!("parsing record {}", path.display()))
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn save(&self, record: &VMRecord) -> Result<()> {
        let path = self.paths.record_path(&record.name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)
            .with_context(|| format!("writing record {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming record {}", path.display()))?;
        debug!(vm = %record.name, state = %record.state, "record saved");
        Ok(())
    }

    /// All records, sorted by name. A missing directory is an empty store.
    pub fn list(&self) -> Result<Vec<VMRecord>> {
        let dir = self.paths.vms_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            records.push(self.load(name)?);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Remove a record; already absent is success
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.paths.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting record {}", path.display())),
        }
    }

    /// Block until the store-wide exclusive lock is held
    pub fn lock(&self) -> Result<StoreLock> {
        let path = self.paths.lock_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(StoreLock { file })
    }
}

/// Held advisory lock over the record store, released on drop
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
