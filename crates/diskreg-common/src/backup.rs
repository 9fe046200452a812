//! Flat snapshot of the whole registry
//!
//! Every top-level collection of the registry has a field here. The store
//! keeps one table per field, plus one for the old-agent index.

use crate::config::DiskRegistryConfig;
use crate::types::{
    AgentConfig, AgentId, AgentListParams, AutomaticallyReplacedDeviceInfo, BrokenDiskInfo,
    DirtyDevice, DiskConfig, DiskId, DiskStateUpdate, PlacementGroupConfig, SuspendedDevice,
    UserNotification,
};
use serde::{Deserialize, Serialize};

/// Number of top-level collections in [`DiskRegistryBackup`]
pub const BACKUP_COLLECTIONS: usize = 15;

/// A disk waiting for a reallocate acknowledgment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskToReallocate {
    pub disk_id: DiskId,
    pub seq_no: u64,
}

/// A disk whose volume config must be re-pushed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutdatedVolumeConfig {
    pub disk_id: DiskId,
    pub seq_no: u64,
}

/// Full registry snapshot
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskRegistryBackup {
    pub config: DiskRegistryConfig,
    pub agents: Vec<AgentConfig>,
    pub disks: Vec<DiskConfig>,
    pub placement_groups: Vec<PlacementGroupConfig>,
    pub dirty_devices: Vec<DirtyDevice>,
    pub suspended_devices: Vec<SuspendedDevice>,
    pub broken_disks: Vec<BrokenDiskInfo>,
    pub disks_to_cleanup: Vec<DiskId>,
    pub disks_to_reallocate: Vec<DiskToReallocate>,
    pub outdated_volume_configs: Vec<OutdatedVolumeConfig>,
    pub disk_state_changes: Vec<DiskStateUpdate>,
    pub user_notifications: Vec<UserNotification>,
    pub automatically_replaced_devices: Vec<AutomaticallyReplacedDeviceInfo>,
    pub agent_list_params: Vec<(AgentId, AgentListParams)>,
    /// Mirrors `config.writable_state`, stored separately
    pub writable_state: bool,
}

impl DiskRegistryBackup {
    /// Check whether the snapshot holds nothing at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
            && self.disks.is_empty()
            && self.placement_groups.is_empty()
            && self.dirty_devices.is_empty()
            && self.suspended_devices.is_empty()
            && self.broken_disks.is_empty()
            && self.disks_to_cleanup.is_empty()
            && self.disks_to_reallocate.is_empty()
            && self.outdated_volume_configs.is_empty()
            && self.disk_state_changes.is_empty()
            && self.user_notifications.is_empty()
            && self.automatically_replaced_devices.is_empty()
            && self.agent_list_params.is_empty()
    }
}
