//! File-backed credential store.
//!
//! One JSON envelope per session id under the session directory:
//! `{ "schemaVersion": 1, "checksum": "<sha256 hex>", "record": { ... } }`.
//! The checksum covers the serialized `record` value.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{CredentialStore, SessionRecord, StoreError, StoreLock, StoreResult, SCHEMA_VERSION};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    schema_version: u32,
    checksum: String,
    record: serde_json::Value,
}

fn checksum(record: &serde_json::Value) -> StoreResult<String> {
    let body = serde_json::to_vec(record)
        .map_err(|e| StoreError::Corruption(format!("serializing record: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&body)))
}

/// Credential store keeping `<dir>/<session_id>.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    directory: PathBuf,
    session_id: String,
}

impl FileCredentialStore {
    pub fn new(directory: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            session_id: session_id.into(),
        }
    }

    /// Path of the record file.
    pub fn record_path(&self) -> PathBuf {
        self.directory.join(format!("{}.json", self.session_id))
    }

    fn lock_path(&self) -> PathBuf {
        self.directory.join(format!("{}.lock", self.session_id))
    }

    fn temp_path(&self) -> PathBuf {
        self.directory.join(format!(".{}.json.tmp", self.session_id))
    }

    fn ensure_directory(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.directory).map_err(|e| StoreError::io(&self.directory, e))
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> StoreResult<()> {
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path).map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(bytes).map_err(|e| StoreError::io(&temp_path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, target) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(target, e));
        }

        // Make the rename itself durable
        #[cfg(unix)]
        if let Ok(dir) = File::open(&self.directory) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> StoreResult<Option<SessionRecord>> {
        let path = self.record_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Corruption(format!("{}: {}", path.display(), e)))?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(StoreError::Corruption(format!(
                "{}: schema version {} (expected {})",
                path.display(),
                envelope.schema_version,
                SCHEMA_VERSION
            )));
        }
        if checksum(&envelope.record)? != envelope.checksum {
            return Err(StoreError::Corruption(format!("{}: checksum mismatch", path.display())));
        }

        let record: SessionRecord = serde_json::from_value(envelope.record)
            .map_err(|e| StoreError::Corruption(format!("{}: {}", path.display(), e)))?;
        if record.session_id != self.session_id {
            return Err(StoreError::Corruption(format!(
                "{}: belongs to session {:?}",
                path.display(),
                record.session_id
            )));
        }

        debug!("loaded session {} (paired: {})", self.session_id, record.is_paired());
        Ok(Some(record))
    }

    fn save(&self, record: &SessionRecord) -> StoreResult<()> {
        self.ensure_directory()?;

        let value = serde_json::to_value(record)
            .map_err(|e| StoreError::Corruption(format!("serializing record: {}", e)))?;
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            checksum: checksum(&value)?,
            record: value,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| StoreError::Corruption(format!("serializing envelope: {}", e)))?;

        self.write_atomic(&self.record_path(), &bytes)?;
        debug!("saved session {}", self.session_id);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        let path = self.record_path();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("cleared session {}", self.session_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn lock(&self) -> StoreResult<StoreLock> {
        self.ensure_directory()?;
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired lock {}", path.display());
                Ok(StoreLock::new(LockFile { file, path }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(StoreError::Locked(path)),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

/// Holds the advisory lock until dropped.
struct LockFile {
    file: File,
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("failed to release {}: {}", self.path.display(), e);
        } else {
            debug!("released lock {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::paired_record;

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path(), "default");
        assert!(store.load().unwrap().is_none());
        assert!(store.clear().is_ok());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested"), "default");
        let record = paired_record("default");

        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
        assert!(!store.temp_path().exists());

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_sessions_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let work = FileCredentialStore::new(dir.path(), "work");
        let home = FileCredentialStore::new(dir.path(), "home");

        work.save(&paired_record("work")).unwrap();
        assert!(home.load().unwrap().is_none());
        assert!(dir.path().join("work.json").exists());
    }

    #[test]
    fn test_garbage_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path(), "default");
        fs::write(store.record_path(), b"{not json").unwrap();

        assert!(matches!(store.load(), Err(StoreError::Corruption(_))));
        // Nothing was rewritten behind the caller's back
        assert_eq!(fs::read(store.record_path()).unwrap(), b"{not json");
    }

    #[test]
    fn test_tampered_record_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path(), "default");
        store.save(&paired_record("default")).unwrap();

        let raw = fs::read_to_string(store.record_path()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        envelope["record"]["registrationId"] = serde_json::json!(42);
        fs::write(store.record_path(), serde_json::to_vec(&envelope).unwrap()).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, StoreError::Corruption(ref msg) if msg.contains("checksum")));
    }

    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path(), "default");
        store.save(&paired_record("default")).unwrap();

        let raw = fs::read_to_string(store.record_path()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&raw).unwrap();
        envelope["schemaVersion"] = serde_json::json!(99);
        fs::write(store.record_path(), serde_json::to_vec(&envelope).unwrap()).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, StoreError::Corruption(ref msg) if msg.contains("schema version")));
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path(), "default");

        let held = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(StoreError::Locked(_))));

        // Other session ids are unaffected
        assert!(FileCredentialStore::new(dir.path(), "other").lock().is_ok());

        drop(held);
        assert!(store.lock().is_ok());
    }
}
