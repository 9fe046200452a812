//! In-memory write journal

use crate::database::{DiskRegistryDatabase, WriteOp};
use diskreg_common::{
    AgentConfig, AgentListParams, AutomaticallyReplacedDeviceInfo, BrokenDiskInfo, DirtyDevice,
    DiskConfig, DiskRegistryConfig, DiskStateUpdate, NodeId, PlacementGroupConfig,
    SuspendedDevice, UserNotification,
};

/// Ordered list of persistence operations of one top-level call
///
/// Applied to durable storage as a unit by
/// [`crate::DiskRegistryStore::commit`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Take the recorded operations, leaving the batch empty
    pub fn take(&mut self) -> Vec<WriteOp> {
        std::mem::take(&mut self.ops)
    }

    fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }
}

impl DiskRegistryDatabase for WriteBatch {
    fn update_agent(&mut self, agent: &AgentConfig) {
        self.push(WriteOp::UpdateAgent(agent.clone()));
    }

    fn delete_agent(&mut self, agent_id: &str) {
        self.push(WriteOp::DeleteAgent(agent_id.to_string()));
    }

    fn update_old_agent(&mut self, agent: &AgentConfig) {
        self.push(WriteOp::UpdateOldAgent(agent.clone()));
    }

    fn delete_old_agent(&mut self, node_id: NodeId) {
        self.push(WriteOp::DeleteOldAgent(node_id));
    }

    fn update_disk(&mut self, disk: &DiskConfig) {
        self.push(WriteOp::UpdateDisk(disk.clone()));
    }

    fn delete_disk(&mut self, disk_id: &str) {
        self.push(WriteOp::DeleteDisk(disk_id.to_string()));
    }

    fn update_placement_group(&mut self, group: &PlacementGroupConfig) {
        self.push(WriteOp::UpdatePlacementGroup(group.clone()));
    }

    fn delete_placement_group(&mut self, group_id: &str) {
        self.push(WriteOp::DeletePlacementGroup(group_id.to_string()));
    }

    fn update_dirty_device(&mut self, device_id: &str, disk_id: &str) {
        self.push(WriteOp::UpdateDirtyDevice(DirtyDevice {
            id: device_id.to_string(),
            disk_id: disk_id.to_string(),
        }));
    }

    fn delete_dirty_device(&mut self, device_id: &str) {
        self.push(WriteOp::DeleteDirtyDevice(device_id.to_string()));
    }

    fn update_suspended_device(&mut self, device: &SuspendedDevice) {
        self.push(WriteOp::UpdateSuspendedDevice(device.clone()));
    }

    fn delete_suspended_device(&mut self, device_id: &str) {
        self.push(WriteOp::DeleteSuspendedDevice(device_id.to_string()));
    }

    fn add_broken_disk(&mut self, info: &BrokenDiskInfo) {
        self.push(WriteOp::AddBrokenDisk(info.clone()));
    }

    fn delete_broken_disk(&mut self, disk_id: &str) {
        self.push(WriteOp::DeleteBrokenDisk(disk_id.to_string()));
    }

    fn add_disk_to_cleanup(&mut self, disk_id: &str) {
        self.push(WriteOp::AddDiskToCleanup(disk_id.to_string()));
    }

    fn delete_disk_to_cleanup(&mut self, disk_id: &str) {
        self.push(WriteOp::DeleteDiskToCleanup(disk_id.to_string()));
    }

    fn add_automatically_replaced_device(&mut self, info: &AutomaticallyReplacedDeviceInfo) {
        self.push(WriteOp::AddAutomaticallyReplacedDevice(info.clone()));
    }

    fn delete_automatically_replaced_device(&mut self, device_id: &str) {
        self.push(WriteOp::DeleteAutomaticallyReplacedDevice(
            device_id.to_string(),
        ));
    }

    fn add_agent_list_params(&mut self, agent_id: &str, params: &AgentListParams) {
        self.push(WriteOp::AddAgentListParams(agent_id.to_string(), *params));
    }

    fn delete_agent_list_params(&mut self, agent_id: &str) {
        self.push(WriteOp::DeleteAgentListParams(agent_id.to_string()));
    }

    fn write_config(&mut self, config: &DiskRegistryConfig) {
        self.push(WriteOp::WriteConfig(config.clone()));
    }

    fn add_disk_to_reallocate(&mut self, disk_id: &str, seq_no: u64) {
        self.push(WriteOp::AddDiskToReallocate(disk_id.to_string(), seq_no));
    }

    fn delete_disk_to_reallocate(&mut self, disk_id: &str) {
        self.push(WriteOp::DeleteDiskToReallocate(disk_id.to_string()));
    }

    fn add_outdated_volume_config(&mut self, disk_id: &str, seq_no: u64) {
        self.push(WriteOp::AddOutdatedVolumeConfig(disk_id.to_string(), seq_no));
    }

    fn delete_outdated_volume_config(&mut self, disk_id: &str) {
        self.push(WriteOp::DeleteOutdatedVolumeConfig(disk_id.to_string()));
    }

    fn add_disk_state_change(&mut self, update: &DiskStateUpdate) {
        self.push(WriteOp::AddDiskStateChange(update.clone()));
    }

    fn delete_disk_state_changes(&mut self, disk_id: &str, seq_no: u64) {
        self.push(WriteOp::DeleteDiskStateChanges(disk_id.to_string(), seq_no));
    }

    fn write_last_disk_state_seq_no(&mut self, seq_no: u64) {
        self.push(WriteOp::WriteLastDiskStateSeqNo(seq_no));
    }

    fn write_last_disk_seq_no(&mut self, seq_no: u64) {
        self.push(WriteOp::WriteLastDiskSeqNo(seq_no));
    }

    fn add_user_notification(&mut self, notification: &UserNotification) {
        self.push(WriteOp::AddUserNotification(notification.clone()));
    }

    fn delete_user_notification(&mut self, seq_no: u64) {
        self.push(WriteOp::DeleteUserNotification(seq_no));
    }

    fn write_writable_state(&mut self, writable: bool) {
        self.push(WriteOp::WriteWritableState(writable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_records_in_order() {
        let mut batch = WriteBatch::new();
        let db: &mut dyn DiskRegistryDatabase = &mut batch;
        db.add_disk_to_cleanup("vol0");
        db.update_dirty_device("dev1", "vol0");
        db.delete_disk("vol0");

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.ops()[0], WriteOp::AddDiskToCleanup("vol0".into()));
        assert_eq!(
            batch.ops()[1],
            WriteOp::UpdateDirtyDevice(DirtyDevice {
                id: "dev1".into(),
                disk_id: "vol0".into()
            })
        );

        let ops = batch.take();
        assert_eq!(ops.len(), 3);
        assert!(batch.is_empty());
    }
}
