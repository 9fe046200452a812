//! Snapshot of the whole state

use super::DiskRegistryState;
use diskreg_common::{DirtyDevice, DiskRegistryBackup};
use tracing::debug;

impl DiskRegistryState {
    /// Build a full snapshot
    ///
    /// Restoring the snapshot with [`DiskRegistryState::new`] and taking a
    /// new one yields an equal value.
    #[must_use]
    pub fn backup_state(&self) -> DiskRegistryBackup {
        let mut config = self.current_config.clone();
        config.last_disk_state_seq_no = self.notifications.last_disk_state_seq_no();
        config.last_disk_seq_no = self.notifications.last_disk_seq_no();

        let dirty_devices = self
            .device_list
            .dirty_device_ids()
            .into_iter()
            .map(|id| DirtyDevice {
                disk_id: self.pending_cleanup.find_disk_id(&id).to_string(),
                id,
            })
            .collect();

        let mut broken_disks = self.broken_disks.clone();
        broken_disks.sort_by_key(|d| d.ts_to_destroy);

        let mut automatically_replaced_devices: Vec<_> =
            self.automatically_replaced_devices.iter().cloned().collect();
        automatically_replaced_devices.sort_by_key(|d| d.replacement_ts);

        let backup = DiskRegistryBackup {
            writable_state: config.writable_state,
            config,
            agents: self.agent_list.agents().cloned().collect(),
            disks: self
                .disks
                .iter()
                .map(|(id, disk)| self.build_disk_config(id, disk))
                .collect(),
            placement_groups: self.placement_groups.values().cloned().collect(),
            dirty_devices,
            suspended_devices: self.device_list.get_suspended_devices(),
            broken_disks,
            disks_to_cleanup: self.disks_to_cleanup.iter().cloned().collect(),
            disks_to_reallocate: self.notifications.disks_to_reallocate_backup(),
            outdated_volume_configs: self.notifications.outdated_volume_configs_backup(),
            disk_state_changes: self.notifications.disk_state_changes().to_vec(),
            user_notifications: self.notifications.user_notifications(),
            automatically_replaced_devices,
            agent_list_params: self.agent_list.params(),
        };

        debug!(
            "Backup built: {} agents, {} disks",
            backup.agents.len(),
            backup.disks.len()
        );

        backup
    }
}
