//! Storage services built on one shared [`crate::state::StoreContext`].
//!
//! ARCHITECTURE
//! ============
//! Validators and integrity are leaves; `save`, `read` and `delete` compose
//! them; `loader`, `autosave` and `bridge` sit on top of the CRUD services. Every
//! service is a cheap-to-clone handle over the same context.

pub mod autosave;
pub mod backup;
pub mod batch;
pub mod bridge;
pub mod codec;
pub mod delete;
pub mod integrity;
pub mod json;
pub mod keys;
pub mod loader;
pub mod oplog;
pub mod read;
pub mod save;
