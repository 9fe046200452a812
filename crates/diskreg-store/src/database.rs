//! Logical persistence interface of the registry
//!
//! The registry core never talks to storage directly. Every public operation
//! receives a `&mut dyn DiskRegistryDatabase` and records its changes through
//! it. Calls are infallible: implementations either buffer them (see
//! [`crate::WriteBatch`]) or apply them inside a transaction that is
//! committed once per top-level operation.

use diskreg_common::{
    AgentConfig, AgentId, AgentListParams, AutomaticallyReplacedDeviceInfo, BrokenDiskInfo,
    DeviceId, DirtyDevice, DiskConfig, DiskId, DiskRegistryConfig, DiskStateUpdate, GroupId,
    NodeId, PlacementGroupConfig, SuspendedDevice, UserNotification,
};

/// Persistence operations issued by the registry
pub trait DiskRegistryDatabase {
    fn update_agent(&mut self, agent: &AgentConfig);
    fn delete_agent(&mut self, agent_id: &str);

    /// Secondary record of an agent keyed by its node id
    fn update_old_agent(&mut self, agent: &AgentConfig);
    fn delete_old_agent(&mut self, node_id: NodeId);

    fn update_disk(&mut self, disk: &DiskConfig);
    fn delete_disk(&mut self, disk_id: &str);

    fn update_placement_group(&mut self, group: &PlacementGroupConfig);
    fn delete_placement_group(&mut self, group_id: &str);

    fn update_dirty_device(&mut self, device_id: &str, disk_id: &str);
    fn delete_dirty_device(&mut self, device_id: &str);

    fn update_suspended_device(&mut self, device: &SuspendedDevice);
    fn delete_suspended_device(&mut self, device_id: &str);

    fn add_broken_disk(&mut self, info: &BrokenDiskInfo);
    fn delete_broken_disk(&mut self, disk_id: &str);

    fn add_disk_to_cleanup(&mut self, disk_id: &str);
    fn delete_disk_to_cleanup(&mut self, disk_id: &str);

    fn add_automatically_replaced_device(&mut self, info: &AutomaticallyReplacedDeviceInfo);
    fn delete_automatically_replaced_device(&mut self, device_id: &str);

    fn add_agent_list_params(&mut self, agent_id: &str, params: &AgentListParams);
    fn delete_agent_list_params(&mut self, agent_id: &str);

    fn write_config(&mut self, config: &DiskRegistryConfig);

    fn add_disk_to_reallocate(&mut self, disk_id: &str, seq_no: u64);
    fn delete_disk_to_reallocate(&mut self, disk_id: &str);

    fn add_outdated_volume_config(&mut self, disk_id: &str, seq_no: u64);
    fn delete_outdated_volume_config(&mut self, disk_id: &str);

    fn add_disk_state_change(&mut self, update: &DiskStateUpdate);
    fn delete_disk_state_changes(&mut self, disk_id: &str, seq_no: u64);
    fn write_last_disk_state_seq_no(&mut self, seq_no: u64);
    fn write_last_disk_seq_no(&mut self, seq_no: u64);

    fn add_user_notification(&mut self, notification: &UserNotification);
    fn delete_user_notification(&mut self, seq_no: u64);

    fn write_writable_state(&mut self, writable: bool);
}

/// A single recorded persistence operation
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    UpdateAgent(AgentConfig),
    DeleteAgent(AgentId),
    UpdateOldAgent(AgentConfig),
    DeleteOldAgent(NodeId),
    UpdateDisk(DiskConfig),
    DeleteDisk(DiskId),
    UpdatePlacementGroup(PlacementGroupConfig),
    DeletePlacementGroup(GroupId),
    UpdateDirtyDevice(DirtyDevice),
    DeleteDirtyDevice(DeviceId),
    UpdateSuspendedDevice(SuspendedDevice),
    DeleteSuspendedDevice(DeviceId),
    AddBrokenDisk(BrokenDiskInfo),
    DeleteBrokenDisk(DiskId),
    AddDiskToCleanup(DiskId),
    DeleteDiskToCleanup(DiskId),
    AddAutomaticallyReplacedDevice(AutomaticallyReplacedDeviceInfo),
    DeleteAutomaticallyReplacedDevice(DeviceId),
    AddAgentListParams(AgentId, AgentListParams),
    DeleteAgentListParams(AgentId),
    WriteConfig(DiskRegistryConfig),
    AddDiskToReallocate(DiskId, u64),
    DeleteDiskToReallocate(DiskId),
    AddOutdatedVolumeConfig(DiskId, u64),
    DeleteOutdatedVolumeConfig(DiskId),
    AddDiskStateChange(DiskStateUpdate),
    DeleteDiskStateChanges(DiskId, u64),
    WriteLastDiskStateSeqNo(u64),
    WriteLastDiskSeqNo(u64),
    AddUserNotification(UserNotification),
    DeleteUserNotification(u64),
    WriteWritableState(bool),
}
