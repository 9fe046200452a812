//! Disk Registry Common - Shared types and utilities
//!
//! This crate provides the identifiers, persisted records, error taxonomy and
//! configuration used across all Disk Registry components.

pub mod backup;
pub mod config;
pub mod critical;
pub mod error;
pub mod types;

pub use backup::{DiskRegistryBackup, DiskToReallocate, OutdatedVolumeConfig};
pub use config::{DevicePoolConfig, DiskRegistryConfig, StorageConfig};
pub use error::{Error, ErrorCode, Result, Status};
pub use types::*;
