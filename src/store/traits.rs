//! Store trait for session persistence.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::SessionRecord;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupted session record: {0}")]
    Corruption(String),
    #[error("session locked: {0}")]
    Locked(PathBuf),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Exclusive hold on a session. Released when dropped.
pub struct StoreLock {
    _guard: Box<dyn Send + Sync>,
}

impl StoreLock {
    pub fn new(guard: impl Send + Sync + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreLock")
    }
}

/// Durable storage for one session's identity and credential.
///
/// `load` distinguishes "nothing stored" (`Ok(None)`) from a record that fails
/// its integrity checks (`StoreError::Corruption`). Writes are atomic: a reader
/// sees the old record or the new one, never a mix.
pub trait CredentialStore: Send + Sync {
    /// Read the stored record.
    fn load(&self) -> StoreResult<Option<SessionRecord>>;

    /// Replace the stored record.
    fn save(&self, record: &SessionRecord) -> StoreResult<()>;

    /// Remove the stored record. Clearing an empty store succeeds.
    fn clear(&self) -> StoreResult<()>;

    /// Take the per-session exclusivity lock without blocking.
    fn lock(&self) -> StoreResult<StoreLock>;
}
