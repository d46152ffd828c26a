//! storekeeper — local key-value storage with integrity checks and auto-save.
//!
//! ARCHITECTURE
//! ============
//! A [`backend::StorageBackend`] holds string values. Services in
//! [`services`] layer key and JSON validation, checksums with backup
//! recovery, CRUD operations and a debounced auto-save queue on top of it.
//! [`Storage`] wires them to one backend and one [`config::StoreConfig`].

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod services;
pub mod state;
pub mod store;

pub use error::{ErrorCode, Failure, StorageError};
pub use store::Storage;

#[cfg(test)]
pub(crate) use state::test_helpers;
