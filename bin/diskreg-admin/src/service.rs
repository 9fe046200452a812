//! Serialized registry service
//!
//! The registry state has no internal locking. This wrapper owns it behind
//! a mutex together with the store, runs one operation at a time and
//! commits the journal the operation produced.

use crate::settings::AdminSettings;
use diskreg_common::{DiskRegistryBackup, Timestamp};
use diskreg_state::DiskRegistryState;
use diskreg_store::{DiskRegistryStore, StoreError, WriteBatch};
use parking_lot::Mutex;
use tracing::{debug, error, info};

/// Error type for service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("registry error: {0}")]
    Registry(#[from] diskreg_common::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("store is not empty")]
    NotEmpty,
}

/// Registry state and its store, accessed one operation at a time
pub struct DiskRegistryService {
    state: Mutex<DiskRegistryState>,
    store: DiskRegistryStore,
}

impl DiskRegistryService {
    /// Open the store at `settings.data_path` and load the state from it
    pub fn open(settings: &AdminSettings, now: Timestamp) -> Result<Self, ServiceError> {
        let store = DiskRegistryStore::open(&settings.data_path)?;
        let backup = store.load_snapshot(now, settings.storage.user_notification_ttl())?;
        let state = DiskRegistryState::new(settings.storage.clone(), backup);

        info!("Registry opened at {}", settings.data_path.display());

        Ok(Self {
            state: Mutex::new(state),
            store,
        })
    }

    /// Seed an empty store with `backup` and open it
    pub fn restore(
        settings: &AdminSettings,
        backup: &DiskRegistryBackup,
        now: Timestamp,
    ) -> Result<Self, ServiceError> {
        {
            let store = DiskRegistryStore::open(&settings.data_path)?;
            let existing = store.load_snapshot(now, settings.storage.user_notification_ttl())?;
            if !existing.is_empty() {
                return Err(ServiceError::NotEmpty);
            }
            store.restore(backup)?;
        }

        info!(
            "Registry restored: {} agents, {} disks",
            backup.agents.len(),
            backup.disks.len()
        );

        Self::open(settings, now)
    }

    /// Run a mutating operation and commit what it recorded
    ///
    /// The journal is committed whatever the operation returned; a commit
    /// failure leaves the in-memory state ahead of the store.
    pub fn execute<T>(
        &self,
        op: impl FnOnce(&mut DiskRegistryState, &mut WriteBatch) -> T,
    ) -> Result<T, ServiceError> {
        let mut state = self.state.lock();
        let mut batch = WriteBatch::new();

        let result = op(&mut state, &mut batch);

        debug!("Committing {} writes", batch.len());
        if let Err(e) = self.store.commit(&mut batch) {
            error!("Failed to commit registry changes: {}", e);
            return Err(e.into());
        }

        Ok(result)
    }

    /// Run a read-only query
    pub fn read<T>(&self, op: impl FnOnce(&DiskRegistryState) -> T) -> T {
        op(&self.state.lock())
    }

    #[must_use]
    pub fn backup(&self) -> DiskRegistryBackup {
        self.state.lock().backup_state()
    }
}
