//! Error taxonomy for the session engine.
//!
//! Layer errors (store, socket, codec, cipher) convert into [`Error`] so callers
//! only ever match on one type. `Error` is `Clone` so it can travel inside
//! connection events and be kept as the coordinator's last error.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::binary::DecodeError;
use crate::crypto::CipherError;
use crate::socket::SocketError;
use crate::store::StoreError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("i/o error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("stored session is corrupted: {0}")]
    Corruption(String),
    #[error("session {0} is locked by another process")]
    SessionLocked(PathBuf),
    #[error("pairing timed out")]
    PairingTimeout,
    #[error("invalid pairing code: {0}")]
    InvalidPairingCode(String),
    #[error("pairing rejected by server: {0}")]
    PairingRejected(String),
    #[error("handshake verification failed: {0}")]
    HandshakeVerificationFailed(String),
    #[error("credential revoked by server: {0}")]
    CredentialRevoked(String),
    #[error("transport closed: {0}")]
    TransportClosed(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("request {0} timed out")]
    RequestTimeout(String),
    #[error("server returned error {code}: {text}")]
    ServerError { code: u16, text: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Whether the coordinator must stop instead of scheduling a reconnect.
    pub fn is_fatal_for_link(&self) -> bool {
        matches!(
            self,
            Error::CredentialRevoked(_)
                | Error::HandshakeVerificationFailed(_)
                | Error::Corruption(_)
                | Error::SessionLocked(_)
        )
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io { path, source } => Error::Io {
                context: path.display().to_string(),
                source: Arc::new(source),
            },
            StoreError::Corruption(reason) => Error::Corruption(reason),
            StoreError::Locked(path) => Error::SessionLocked(path),
        }
    }
}

impl From<SocketError> for Error {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::Noise(reason) => Error::HandshakeVerificationFailed(reason),
            other => Error::TransportClosed(other.to_string()),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<CipherError> for Error {
    fn from(err: CipherError) -> Self {
        Error::HandshakeVerificationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let corrupted: Error = StoreError::Corruption("checksum mismatch".into()).into();
        assert!(matches!(corrupted, Error::Corruption(_)));

        let io: Error = StoreError::Io {
            path: PathBuf::from("/tmp/x.json"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }
        .into();
        assert!(matches!(io, Error::Io { .. }));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::CredentialRevoked("401".into()).is_fatal_for_link());
        assert!(!Error::TransportClosed("eof".into()).is_fatal_for_link());
        assert!(!Error::Cancelled.is_fatal_for_link());
    }
}
