//! Disk Registry Store - persistence collaborator
//!
//! This crate defines the logical persistence interface the registry core
//! writes through, an in-memory journal implementing it, and a redb store
//! that applies one journal per top-level operation atomically.

pub mod batch;
pub mod database;
pub mod store;
pub mod tables;

// Re-exports
pub use batch::WriteBatch;
pub use database::{DiskRegistryDatabase, WriteOp};
pub use store::{DiskRegistryStore, StoreError, StoreResult};
