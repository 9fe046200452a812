//! Read-side queries, notification acknowledgments and counters

use super::placement::max_disks_in_group;
use super::{Disk, DiskRegistryState};
use crate::replica_table::MirroredDiskInfo;
use diskreg_common::{
    AgentConfig, AgentId, AgentState, AutomaticallyReplacedDeviceInfo, BrokenDiskInfo, DeviceConfig,
    DeviceId, DevicePoolKind, DeviceState, DiskId, DiskRef, DiskState, DiskStateUpdate, Error,
    FinishedMigration, GroupId, MediaKind, Result, SuspendedDevice, Timestamp, UserNotification,
};
use diskreg_placement::AllocationQuery;
use diskreg_store::DiskRegistryDatabase;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

/// A running migration as seen by clients
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceMigrationInfo {
    pub source_device_id: DeviceId,
    pub target_device: DeviceConfig,
}

/// Full description of a disk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskInfo {
    /// Devices of the disk, or of the first replica for a mirrored disk
    pub devices: Vec<DeviceConfig>,
    pub migrations: Vec<DeviceMigrationInfo>,
    /// Devices of the remaining replicas of a mirrored disk
    pub replicas: Vec<Vec<DeviceConfig>>,
    pub finished_migrations: Vec<FinishedMigration>,
    pub device_replacement_ids: Vec<DeviceId>,
    pub cloud_id: String,
    pub folder_id: String,
    pub user_id: String,
    pub logical_block_size: u32,
    pub state: DiskState,
    pub state_ts: Timestamp,
    pub placement_group_id: GroupId,
    pub placement_partition_index: u32,
    pub media_kind: MediaKind,
    pub master_disk_id: DiskId,
}

/// Volume config fields that changed after a placement group update
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeConfigUpdate {
    pub disk_id: DiskId,
    pub placement_group_id: GroupId,
    pub placement_partition_index: u32,
    pub seq_no: u64,
}

/// Free chunks of one size on an agent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgentStorageInfo {
    pub chunk_size: u64,
    pub chunk_count: u32,
}

/// Device counters of one pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCounters {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub allocated_devices: u64,
    pub dirty_devices: u64,
    pub devices_in_online_state: u64,
    pub devices_in_warning_state: u64,
    pub devices_in_error_state: u64,
}

/// Point-in-time snapshot of the registry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryCounters {
    /// Keyed by pool name; the default pool is "default", local pools "local"
    pub pools: BTreeMap<String, PoolCounters>,
    pub agents_in_online_state: u32,
    pub agents_in_warning_state: u32,
    pub agents_in_unavailable_state: u32,
    pub allocated_disks: u32,
    pub disks_in_online_state: u32,
    pub disks_in_migration_state: u32,
    pub disks_in_temporarily_unavailable_state: u32,
    pub disks_in_error_state: u32,
    /// Running migrations plus queued ones
    pub devices_in_migration_state: u32,
    pub max_migration_time: Duration,
    pub placement_groups: u32,
    /// Groups that cannot take another copy of their biggest disk
    pub full_placement_groups: u32,
    pub allocated_disks_in_groups: u32,
    pub placement_groups_with_broken_single_disk: u32,
    pub placement_groups_with_broken_two_or_more_disks: u32,
    pub automatically_replaced_devices: u32,
    pub mean_time_between_failures: Option<Duration>,
}

fn pool_name_for_counters(device: &DeviceConfig) -> String {
    match device.pool_kind {
        DevicePoolKind::Local => "local".to_string(),
        DevicePoolKind::Default => "default".to_string(),
        DevicePoolKind::Global => device.pool_name.clone(),
    }
}

impl DiskRegistryState {
    /// Devices of a simple disk with per-disk block count overrides applied
    pub(super) fn collect_disk_devices(
        &self,
        disk_id: &str,
        disk: &Disk,
    ) -> Result<Vec<DeviceConfig>> {
        let overrides = self.device_overrides.get(disk_id);

        disk.devices
            .iter()
            .map(|uuid| {
                let mut device = self
                    .device_list
                    .find_device(uuid)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("device '{uuid}' not found")))?;

                if let Some(&blocks) = overrides.and_then(|o| o.get(uuid)) {
                    device.blocks_count = blocks;
                }

                Ok(device)
            })
            .collect()
    }

    /// Running migrations of a simple disk, sorted by source
    pub(super) fn collect_disk_migrations(&self, disk: &Disk) -> Result<Vec<DeviceMigrationInfo>> {
        let mut migrations = disk
            .migration_target_to_source
            .iter()
            .map(|(target, source)| {
                let target_device = self
                    .device_list
                    .find_device(target)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("device '{target}' not found")))?;

                Ok(DeviceMigrationInfo {
                    source_device_id: source.clone(),
                    target_device,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        migrations.sort_by(|a, b| a.source_device_id.cmp(&b.source_device_id));
        Ok(migrations)
    }

    fn replica(&self, master_id: &str, index: u32) -> Result<(DiskId, &Disk)> {
        let replica_id = DiskRef::replica(master_id, index).disk_id();
        match self.disks.get(&replica_id) {
            Some(disk) => Ok((replica_id, disk)),
            None => Err(Error::not_found(format!("disk '{replica_id}' not found"))),
        }
    }

    fn fill_all_disk_devices(&self, disk_id: &str, disk: &Disk, info: &mut DiskInfo) -> Result<()> {
        if disk.replica_count == 0 {
            info.devices = self.collect_disk_devices(disk_id, disk)?;
            info.migrations = self.collect_disk_migrations(disk)?;
            return Ok(());
        }

        for index in 0..=disk.replica_count {
            let (replica_id, replica) = self.replica(disk_id, index)?;
            let devices = self.collect_disk_devices(&replica_id, replica)?;
            if index == 0 {
                info.devices = devices;
            } else {
                info.replicas.push(devices);
            }
            info.migrations
                .extend(self.collect_disk_migrations(replica)?);
        }

        Ok(())
    }

    fn disk(&self, disk_id: &str) -> Result<&Disk> {
        self.disks
            .get(disk_id)
            .ok_or_else(|| Error::not_found(format!("disk '{disk_id}' not found")))
    }

    /// Describe a disk with its layout
    ///
    /// A mirrored disk reports the first replica as `devices`, the others as
    /// `replicas`, and the migrations of all of them.
    pub fn get_disk_info(&self, disk_id: &str) -> Result<DiskInfo> {
        let disk = self.disk(disk_id)?;

        let mut info = DiskInfo {
            finished_migrations: disk.finished_migrations.clone(),
            device_replacement_ids: disk.device_replacement_ids.clone(),
            cloud_id: disk.cloud_id.clone(),
            folder_id: disk.folder_id.clone(),
            user_id: disk.user_id.clone(),
            logical_block_size: disk.logical_block_size,
            state: disk.state,
            state_ts: disk.state_ts,
            placement_group_id: disk.placement_group_id.clone(),
            placement_partition_index: disk.placement_partition_index,
            media_kind: disk.media_kind,
            master_disk_id: disk.master_disk_id.clone(),
            ..Default::default()
        };

        self.fill_all_disk_devices(disk_id, disk, &mut info)
            .map_err(|e| match e {
                Error::NotFound(message) => Error::InvalidState(message),
                e => e,
            })?;

        Ok(info)
    }

    /// Devices of a simple disk
    pub fn get_disk_devices(&self, disk_id: &str) -> Result<Vec<DeviceConfig>> {
        self.collect_disk_devices(disk_id, self.disk(disk_id)?)
    }

    #[must_use]
    pub fn get_disk_ids(&self) -> Vec<DiskId> {
        self.disks.keys().cloned().collect()
    }

    /// Disks that are not replicas
    #[must_use]
    pub fn get_master_disk_ids(&self) -> Vec<DiskId> {
        self.disks
            .iter()
            .filter(|(_, d)| !d.is_replica())
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn get_mirrored_disk_ids(&self) -> Vec<DiskId> {
        self.disks
            .iter()
            .filter(|(_, d)| d.replica_count > 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Disks using devices of an agent, optionally only the devices at `path`
    pub fn get_dependent_disks(&self, agent_id: &str, path: &str) -> Result<Vec<DiskId>> {
        let agent = self
            .agent_list
            .find_agent(agent_id)
            .ok_or_else(|| Error::not_found(format!("agent '{agent_id}' not found")))?;

        let mut disk_ids: Vec<DiskId> = Vec::new();
        for device in &agent.devices {
            if !path.is_empty() && device.device_name != path {
                continue;
            }

            let disk_id = self.find_disk(&device.device_uuid);
            if !disk_id.is_empty() && !disk_ids.iter().any(|id| id == disk_id) {
                disk_ids.push(disk_id.to_string());
            }
        }

        Ok(disk_ids)
    }

    #[must_use]
    pub fn get_device(&self, device_id: &str) -> Option<DeviceConfig> {
        self.device_list.find_device(device_id).cloned()
    }

    #[must_use]
    pub fn get_devices_by_agent(&self, agent_id: &str) -> Vec<DeviceConfig> {
        self.agent_list
            .find_agent(agent_id)
            .map(|a| a.devices.clone())
            .unwrap_or_default()
    }

    /// Devices of an agent at `path`
    #[must_use]
    pub fn find_devices(&self, agent_id: &str, path: &str) -> Vec<DeviceConfig> {
        self.agent_list
            .find_agent(agent_id)
            .map(|a| {
                a.devices
                    .iter()
                    .filter(|d| d.device_name == path)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve a device named by uuid, or by agent id and path
    pub fn find_device(&self, query: &DeviceConfig) -> Result<DeviceConfig> {
        if !query.device_uuid.is_empty() {
            return self.get_device(&query.device_uuid).ok_or_else(|| {
                Error::not_found(format!("device with id {} not found", query.device_uuid))
            });
        }

        let mut devices = self.find_devices(&query.agent_id, &query.device_name);
        match devices.len() {
            0 => Err(Error::not_found(format!(
                "device with AgentId={} and DeviceName={} not found",
                query.agent_id, query.device_name
            ))),
            1 => Ok(devices.remove(0)),
            n => Err(Error::argument(format!(
                "too many devices with AgentId={} and DeviceName={}: {}",
                query.agent_id, query.device_name, n
            ))),
        }
    }

    #[must_use]
    pub fn get_broken_devices(&self) -> Vec<DeviceConfig> {
        self.device_list.get_broken_devices()
    }

    #[must_use]
    pub fn get_dirty_devices(&self) -> Vec<DeviceConfig> {
        self.device_list.get_dirty_devices()
    }

    #[must_use]
    pub fn get_suspended_devices(&self) -> Vec<SuspendedDevice> {
        self.device_list.get_suspended_devices()
    }

    #[must_use]
    pub fn get_automatically_replaced_devices(&self) -> Vec<AutomaticallyReplacedDeviceInfo> {
        self.automatically_replaced_devices.iter().cloned().collect()
    }

    #[must_use]
    pub fn get_agents(&self) -> Vec<AgentConfig> {
        self.agent_list.agents().cloned().collect()
    }

    #[must_use]
    pub fn find_agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agent_list.find_agent(agent_id)
    }

    #[must_use]
    pub fn get_pool_names(&self) -> Vec<String> {
        self.device_pools.keys().cloned().collect()
    }

    /// Kind of a pool (`Default` for unknown pools)
    #[must_use]
    pub fn get_device_pool_kind(&self, pool_name: &str) -> DevicePoolKind {
        self.device_pools
            .get(pool_name)
            .map_or(DevicePoolKind::Default, |p| p.kind)
    }

    /// Free chunks of each agent, in the order of `agent_ids`
    pub fn query_available_storage(
        &self,
        agent_ids: &[AgentId],
        pool_name: &str,
        pool_kind: DevicePoolKind,
    ) -> Result<Vec<(AgentId, Vec<AgentStorageInfo>)>> {
        agent_ids
            .iter()
            .map(|id| {
                let infos = self.query_agent_available_storage(id, pool_name, pool_kind)?;
                Ok((id.clone(), infos))
            })
            .collect()
    }

    /// Count the allocatable chunks of an agent, grouped by chunk size
    pub fn query_agent_available_storage(
        &self,
        agent_id: &str,
        pool_name: &str,
        pool_kind: DevicePoolKind,
    ) -> Result<Vec<AgentStorageInfo>> {
        if !pool_name.is_empty() {
            let Some(pool) = self.device_pools.get(pool_name) else {
                return Ok(Vec::new());
            };

            if pool.kind != pool_kind {
                return Err(Error::argument(format!(
                    "Unexpected device pool kind (actual: {}, expected: {}) for the device pool \"{}\".",
                    pool_kind, pool.kind, pool_name
                )));
            }
        }

        let agent = self
            .agent_list
            .find_agent(agent_id)
            .ok_or_else(|| Error::not_found(format!("agent '{agent_id}' not found")))?;

        if agent.state != AgentState::Online {
            return Ok(Vec::new());
        }

        let mut chunks: BTreeMap<u64, u32> = BTreeMap::new();
        for device in &agent.devices {
            if device.pool_kind != pool_kind
                || (!pool_name.is_empty() && device.pool_name != pool_name)
                || device.state != DeviceState::Online
                || self.device_list.is_suspended_device(&device.device_uuid)
            {
                continue;
            }

            *chunks
                .entry(self.get_allocation_unit(&device.pool_name))
                .or_default() += 1;
        }

        Ok(chunks
            .into_iter()
            .map(|(chunk_size, chunk_count)| AgentStorageInfo {
                chunk_size,
                chunk_count,
            })
            .collect())
    }

    fn is_placement_group_full(&self, group_id: &str) -> bool {
        let Some(group) = self.placement_groups.get(group_id) else {
            return false;
        };

        let mut biggest_size = 0;
        let mut logical_block_size = 0;
        for member in &group.disks {
            let Some(disk) = self.disks.get(&member.disk_id) else {
                continue;
            };
            let size: u64 = disk
                .devices
                .iter()
                .filter_map(|uuid| self.device_list.find_device(uuid))
                .map(DeviceConfig::byte_count)
                .sum();
            if size > biggest_size {
                biggest_size = size;
                logical_block_size = disk.logical_block_size;
            }
        }

        if logical_block_size == 0 {
            return false;
        }

        let forbidden_racks: BTreeSet<String> = group
            .disks
            .iter()
            .flat_map(|d| d.device_racks.iter().cloned())
            .collect();

        self.device_pools
            .values()
            .filter(|p| p.kind != DevicePoolKind::Local)
            .any(|pool| {
                let query = AllocationQuery {
                    forbidden_racks: forbidden_racks.clone(),
                    logical_block_size,
                    block_count: biggest_size / u64::from(logical_block_size),
                    pool_name: pool.name.clone(),
                    pool_kind: pool.kind,
                    ..Default::default()
                };
                !self.device_list.can_allocate_devices(&query)
            })
    }

    /// Snapshot the registry counters
    #[must_use]
    pub fn publish_counters(&self, now: Timestamp) -> RegistryCounters {
        let mut counters = RegistryCounters::default();

        for agent in self.agent_list.agents() {
            match agent.state {
                AgentState::Online => counters.agents_in_online_state += 1,
                AgentState::Warning => counters.agents_in_warning_state += 1,
                AgentState::Unavailable => counters.agents_in_unavailable_state += 1,
            }

            for device in &agent.devices {
                let bytes = device.byte_count();
                let allocated = !self.find_disk(&device.device_uuid).is_empty();
                let dirty = self.device_list.is_dirty_device(&device.device_uuid);

                let pool = counters
                    .pools
                    .entry(pool_name_for_counters(device))
                    .or_default();

                pool.total_bytes += bytes;
                pool.allocated_devices += u64::from(allocated);
                pool.dirty_devices += u64::from(dirty);

                match device.state {
                    DeviceState::Online => {
                        if !allocated && !dirty && agent.state == AgentState::Online {
                            pool.free_bytes += bytes;
                        }
                        pool.devices_in_online_state += 1;
                    }
                    DeviceState::Warning => pool.devices_in_warning_state += 1,
                    DeviceState::Error => pool.devices_in_error_state += 1,
                }
            }
        }

        for disk in self.disks.values() {
            match disk.state {
                DiskState::Online => counters.disks_in_online_state += 1,
                DiskState::Migration => {
                    counters.disks_in_migration_state += 1;
                    counters.max_migration_time = counters
                        .max_migration_time
                        .max(now.saturating_duration_since(disk.state_ts));
                }
                DiskState::TemporarilyUnavailable => {
                    counters.disks_in_temporarily_unavailable_state += 1;
                }
                DiskState::Error => counters.disks_in_error_state += 1,
            }
        }

        counters.allocated_disks = u32::try_from(self.disks.len()).unwrap_or(u32::MAX);
        counters.devices_in_migration_state =
            u32::try_from(self.device_migrations_in_progress + self.migrations.len())
                .unwrap_or(u32::MAX);
        counters.placement_groups = u32::try_from(self.placement_groups.len()).unwrap_or(u32::MAX);

        for (group_id, group) in &self.placement_groups {
            let size = u32::try_from(group.disks.len()).unwrap_or(u32::MAX);
            counters.allocated_disks_in_groups += size;

            let broken = group
                .disks
                .iter()
                .filter(|d| {
                    self.disks
                        .get(&d.disk_id)
                        .is_some_and(|disk| disk.state == DiskState::Error)
                })
                .count();
            match broken {
                0 => {}
                1 => counters.placement_groups_with_broken_single_disk += 1,
                _ => counters.placement_groups_with_broken_two_or_more_disks += 1,
            }

            let limit = max_disks_in_group(&self.storage_config, group);
            if size == 0 || size >= limit {
                continue;
            }

            if self.is_placement_group_full(group_id) {
                counters.full_placement_groups += 1;
            }
        }

        counters.automatically_replaced_devices =
            u32::try_from(self.automatically_replaced_devices.len()).unwrap_or(u32::MAX);
        counters.mean_time_between_failures = self.agent_list.mean_time_between_failures();

        counters
    }

    /// Acknowledge reallocate requests of a disk up to `seq_no`
    ///
    /// Releases the sources of migrations finished before that request.
    pub fn delete_disk_to_reallocate(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        seq_no: u64,
    ) {
        self.notifications
            .delete_disk_to_reallocate(db, disk_id, seq_no);
        self.remove_finished_migrations(db, disk_id, seq_no);
    }

    /// Pending reallocate requests as `(disk, seq_no)`
    #[must_use]
    pub fn get_disks_to_reallocate(&self) -> Vec<(DiskId, u64)> {
        self.notifications
            .disks_to_reallocate()
            .iter()
            .map(|(id, &seq_no)| (id.clone(), seq_no))
            .collect()
    }

    #[must_use]
    pub fn get_outdated_volume_configs(&self) -> Vec<DiskId> {
        self.notifications.outdated_volume_configs()
    }

    /// Placement fields to push into the volume config of `disk_id`
    #[must_use]
    pub fn get_volume_config_update(&self, disk_id: &str) -> Option<VolumeConfigUpdate> {
        let seq_no = self.notifications.outdated_volume_config_seq_no(disk_id)?;
        let disk = self.disks.get(disk_id)?;

        Some(VolumeConfigUpdate {
            disk_id: disk_id.to_string(),
            placement_group_id: disk.placement_group_id.clone(),
            placement_partition_index: disk.placement_partition_index,
            seq_no,
        })
    }

    pub fn delete_outdated_volume_config(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) {
        self.notifications.delete_outdated_volume_config(db, disk_id);
    }

    #[must_use]
    pub fn get_disk_state_changes(&self) -> Vec<DiskStateUpdate> {
        self.notifications.disk_state_changes().to_vec()
    }

    pub fn delete_disk_state_changes(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        seq_no: u64,
    ) {
        self.notifications
            .delete_disk_state_changes(db, disk_id, seq_no);
    }

    #[must_use]
    pub fn get_user_notifications(&self) -> Vec<UserNotification> {
        self.notifications.user_notifications()
    }

    pub fn delete_user_notification(&mut self, db: &mut dyn DiskRegistryDatabase, seq_no: u64) {
        self.notifications.delete_user_notification(db, seq_no);
    }

    pub fn set_user_id(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let Some(disk) = self.disks.get_mut(disk_id) else {
            return Err(Error::not_found(format!("disk '{disk_id}' not found")));
        };
        disk.user_id = user_id.to_string();
        self.persist_disk(db, disk_id);
        Ok(())
    }

    /// Begin handing the devices of a disk to a client
    pub fn start_acquire_disk(&mut self, disk_id: &str) -> Result<DiskInfo> {
        let disk = self.disk(disk_id)?;

        if disk.acquire_in_progress {
            return Err(Error::Rejected(format!(
                "disk '{disk_id}' acquire in progress"
            )));
        }

        let mut info = DiskInfo {
            logical_block_size: disk.logical_block_size,
            ..Default::default()
        };
        self.fill_all_disk_devices(disk_id, disk, &mut info)?;

        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.acquire_in_progress = true;
        }

        Ok(info)
    }

    pub fn finish_acquire_disk(&mut self, disk_id: &str) {
        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.acquire_in_progress = false;
        }
    }

    #[must_use]
    pub fn is_acquire_in_progress(&self, disk_id: &str) -> bool {
        self.disks
            .get(disk_id)
            .is_some_and(|d| d.acquire_in_progress)
    }

    #[must_use]
    pub fn get_broken_disks(&self) -> Vec<BrokenDiskInfo> {
        self.broken_disks.clone()
    }

    /// Forget broken disks that have been destroyed
    pub fn delete_broken_disks(&mut self, db: &mut dyn DiskRegistryDatabase, disk_ids: &[DiskId]) {
        for id in disk_ids {
            db.delete_broken_disk(id);
        }

        self.broken_disks.retain(|d| !disk_ids.contains(&d.disk_id));
        debug!("Deleted {} broken disks", disk_ids.len());
    }

    #[must_use]
    pub fn get_disks_to_cleanup(&self) -> Vec<DiskId> {
        self.disks_to_cleanup.iter().cloned().collect()
    }

    /// Replica table row of a mirrored disk
    #[must_use]
    pub fn get_replica_table_info(&self, master_id: &str) -> Option<MirroredDiskInfo> {
        self.replica_table.disk_info(master_id)
    }

    #[must_use]
    pub fn get_replica_table_infos(&self) -> Vec<MirroredDiskInfo> {
        self.replica_table.infos()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::AllocateDiskParams;
    use super::*;
    use diskreg_common::StorageConfig;

    fn two_rack_state() -> (DiskRegistryState, diskreg_store::WriteBatch) {
        create_state(
            StorageConfig::default(),
            vec![
                agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")]),
                agent("a2", 2, &[device("d3", "r2"), device("d4", "r2")]),
            ],
        )
    }

    #[test]
    fn test_disk_info_of_mirrored_disk() {
        let (mut state, mut db) = two_rack_state();
        state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 1,
                    cloud_id: "cloud".into(),
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();

        let info = state.get_disk_info("vol0").unwrap();
        assert_eq!(info.devices.len(), 1);
        assert_eq!(info.replicas.len(), 1);
        assert_eq!(info.replicas[0].len(), 1);
        assert_ne!(info.devices[0].rack, info.replicas[0][0].rack);
        assert_eq!(info.cloud_id, "cloud");
        assert!(info.master_disk_id.is_empty());

        assert_eq!(state.get_mirrored_disk_ids(), vec!["vol0".to_string()]);
        assert_eq!(state.get_master_disk_ids(), vec!["vol0".to_string()]);
        assert_eq!(state.get_disk_ids().len(), 3);

        let err = state.get_disk_info("nope").unwrap_err();
        assert_eq!(err, Error::not_found("disk 'nope' not found"));
    }

    #[test]
    fn test_find_device() {
        let (state, _) = two_rack_state();

        let by_id = state
            .find_device(&DeviceConfig {
                device_uuid: "d3".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_id.agent_id, "a2");

        let by_path = state
            .find_device(&DeviceConfig {
                agent_id: "a1".into(),
                device_name: "/dev/d2".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_path.device_uuid, "d2");

        let err = state
            .find_device(&DeviceConfig {
                device_uuid: "d9".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.message(), "device with id d9 not found");

        let err = state
            .find_device(&DeviceConfig {
                agent_id: "a1".into(),
                device_name: "/dev/x".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_dependent_disks() {
        let (mut state, mut db) = two_rack_state();
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        let used = &result.devices[0];

        assert_eq!(
            state.get_dependent_disks(&used.agent_id, "").unwrap(),
            vec!["vol0".to_string()]
        );
        assert_eq!(
            state
                .get_dependent_disks(&used.agent_id, &used.device_name)
                .unwrap(),
            vec!["vol0".to_string()]
        );
        assert!(
            state
                .get_dependent_disks(&used.agent_id, "/dev/other")
                .unwrap()
                .is_empty()
        );
        assert!(state.get_dependent_disks("nope", "").unwrap_err().is_not_found());
    }

    #[test]
    fn test_query_available_storage() {
        let (mut state, mut db) = two_rack_state();
        state.suspend_device(&mut db, "d2").unwrap();

        let infos = state
            .query_available_storage(
                &["a1".to_string(), "a2".to_string()],
                "",
                DevicePoolKind::Default,
            )
            .unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(
            infos[0].1,
            vec![AgentStorageInfo {
                chunk_size: DEVICE_BYTES,
                chunk_count: 1,
            }]
        );
        assert_eq!(infos[1].1[0].chunk_count, 2);

        assert!(
            state
                .query_agent_available_storage("a1", "unknown", DevicePoolKind::Global)
                .unwrap()
                .is_empty()
        );
        assert!(
            state
                .query_available_storage(&["nope".to_string()], "", DevicePoolKind::Default)
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_acquire_disk() {
        let (mut state, mut db) = two_rack_state();
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        let info = state.start_acquire_disk("vol0").unwrap();
        assert_eq!(info.devices.len(), 1);
        assert!(state.is_acquire_in_progress("vol0"));

        let err = state.start_acquire_disk("vol0").unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(err.is_retryable());

        state.finish_acquire_disk("vol0");
        assert!(state.start_acquire_disk("vol0").is_ok());
    }

    #[test]
    fn test_set_user_id() {
        let (mut state, mut db) = two_rack_state();
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        state.set_user_id(&mut db, "vol0", "user").unwrap();
        assert_eq!(state.get_disk_info("vol0").unwrap().user_id, "user");
        assert!(state.set_user_id(&mut db, "nope", "user").unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_broken_disks() {
        let (mut state, mut db) = create_state(StorageConfig::default(), vec![]);
        assert!(
            state
                .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
                .is_err()
        );
        assert!(
            state
                .allocate_disk(&mut db, now(), &disk_params("vol1", 1))
                .is_err()
        );
        assert_eq!(state.get_broken_disks().len(), 2);

        state.delete_broken_disks(&mut db, &["vol0".to_string()]);
        let broken = state.get_broken_disks();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].disk_id, "vol1");
    }

    #[test]
    fn test_publish_counters() {
        let (mut state, mut db) = two_rack_state();
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        state.mark_device_as_dirty(&mut db, "d4");

        let counters = state.publish_counters(now());
        let pool = counters.pools["default"];
        assert_eq!(pool.total_bytes, 4 * DEVICE_BYTES);
        assert_eq!(pool.allocated_devices, 1);
        assert_eq!(pool.dirty_devices, 1);
        assert_eq!(pool.free_bytes, 2 * DEVICE_BYTES);
        assert_eq!(pool.devices_in_online_state, 4);
        assert_eq!(counters.agents_in_online_state, 2);
        assert_eq!(counters.allocated_disks, 1);
        assert_eq!(counters.disks_in_online_state, 1);
    }

    #[test]
    fn test_volume_config_update() {
        let (mut state, mut db) = two_rack_state();
        state
            .create_placement_group(&mut db, "pg", diskreg_common::PlacementStrategy::Spread, 0)
            .unwrap();
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        let update = state.alter_placement_group_membership(
            &mut db,
            "pg",
            0,
            1,
            &["vol0".to_string()],
            &[],
        );
        assert_eq!(update.outcome, Ok(()));

        assert_eq!(state.get_outdated_volume_configs(), vec!["vol0".to_string()]);
        let config = state.get_volume_config_update("vol0").unwrap();
        assert_eq!(config.placement_group_id, "pg");

        state.delete_outdated_volume_config(&mut db, "vol0");
        assert!(state.get_volume_config_update("vol0").is_none());
    }
}
