//! Disk Registry Admin - service wrapper and settings
//!
//! [`DiskRegistryService`] serializes access to the registry state and
//! commits the journal of every operation to the store as one transaction.

pub mod service;
pub mod settings;

pub use service::{DiskRegistryService, ServiceError};
pub use settings::AdminSettings;
