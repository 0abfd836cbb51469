//! Storage module for session persistence.
//!
//! Provides the device identity and credential records, the
//! [`CredentialStore`] trait and its file and in-memory implementations.

mod device;
mod file;
mod memory;
mod traits;

pub use device::*;
pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;
pub use traits::*;
