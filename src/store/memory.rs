//! In-memory credential store for tests and embedders that persist elsewhere.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::store::{CredentialStore, SessionRecord, StoreError, StoreLock, StoreResult};

/// In-memory implementation of [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStore {
    record: RwLock<Option<SessionRecord>>,
    locked: Arc<AtomicBool>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

fn poisoned() -> StoreError {
    StoreError::io(
        "<memory>",
        std::io::Error::new(std::io::ErrorKind::Other, "lock poisoned"),
    )
}

impl MemoryCredentialStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `record`.
    pub fn with_record(record: SessionRecord) -> Self {
        let store = Self::new();
        if let Ok(mut slot) = store.record.write() {
            *slot = Some(record);
        }
        store
    }

    /// Make subsequent `save`/`clear` calls fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::io(
                "<memory>",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "writes disabled"),
            ));
        }
        Ok(())
    }
}

struct MemoryLock(Arc<AtomicBool>);

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> StoreResult<Option<SessionRecord>> {
        let record = self.record.read().map_err(|_| poisoned())?;
        Ok(record.clone())
    }

    fn save(&self, record: &SessionRecord) -> StoreResult<()> {
        self.check_writable()?;
        let mut slot = self.record.write().map_err(|_| poisoned())?;
        *slot = Some(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        self.check_writable()?;
        let mut slot = self.record.write().map_err(|_| poisoned())?;
        *slot = None;
        Ok(())
    }

    fn lock(&self) -> StoreResult<StoreLock> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Locked("<memory>".into()));
        }
        Ok(StoreLock::new(MemoryLock(self.locked.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::paired_record;

    #[test]
    fn test_memory_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.load().unwrap().is_none());

        let record = paired_record("default");
        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap(), Some(record));
        assert_eq!(store.save_count(), 1);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_failed_write_keeps_previous_record() {
        let record = paired_record("default");
        let store = MemoryCredentialStore::with_record(record.clone());
        store.set_fail_writes(true);

        assert!(matches!(store.save(&SessionRecord::new("default")), Err(StoreError::Io { .. })));
        assert_eq!(store.load().unwrap(), Some(record));
    }

    #[test]
    fn test_memory_lock() {
        let store = MemoryCredentialStore::new();
        let held = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(StoreError::Locked(_))));
        drop(held);
        assert!(store.lock().is_ok());
    }
}
