//! Disk Registry state machine
//!
//! [`DiskRegistryState`] owns the agent and device catalogs, the disks,
//! the placement groups and every auxiliary index, and implements all
//! registry operations on top of them.
//!
//! Every mutating operation takes the persistence journal as
//! `&mut dyn DiskRegistryDatabase` and records each change it makes there.
//! Operations validate their input before touching the state; the caller
//! commits the journal of one operation as a unit, whether it succeeded or
//! not.
//!
//! The state is single-writer. It has no internal locking; hosts serialize
//! access to it.

mod agents;
mod allocation;
mod backup;
mod config;
mod devices;
mod migration;
mod placement;
mod queries;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;

pub use agents::{CmsUpdate, RegisterAgentResult};
pub use allocation::{AllocateDiskParams, AllocateDiskResult};
pub use config::ConfigUpdate;
pub use placement::MembershipUpdate;
pub use queries::{
    AgentStorageInfo, DeviceMigrationInfo, DiskInfo, PoolCounters, RegistryCounters,
    VolumeConfigUpdate,
};

use crate::agent_list::AgentList;
use crate::notification::NotificationSystem;
use crate::pending_cleanup::PendingCleanup;
use crate::replica_table::ReplicaTable;
use diskreg_common::config::KnownAgentConfig;
use diskreg_common::critical::{self, CriticalEvent};
use diskreg_common::{
    AgentConfig, AgentId, AutomaticallyReplacedDeviceInfo, BrokenDiskInfo, DeviceConfig, DeviceId,
    DeviceMigration, DevicePoolConfig, DeviceState, DiskConfig, DiskId, DiskRef,
    DiskRegistryBackup, DiskRegistryConfig, DiskState, FinishedMigration, GroupId, MediaKind,
    PlacementGroupConfig, StorageConfig, Timestamp,
};
use diskreg_placement::DeviceList;
use diskreg_store::DiskRegistryDatabase;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// In-memory form of a virtual disk
#[derive(Clone, Debug, Default)]
pub(crate) struct Disk {
    pub devices: Vec<DeviceId>,
    pub migration_source_to_target: BTreeMap<DeviceId, DeviceId>,
    pub migration_target_to_source: BTreeMap<DeviceId, DeviceId>,
    pub finished_migrations: Vec<FinishedMigration>,
    pub device_replacement_ids: Vec<DeviceId>,
    pub placement_group_id: GroupId,
    pub placement_partition_index: u32,
    pub logical_block_size: u32,
    pub state: DiskState,
    pub state_ts: Timestamp,
    pub cloud_id: String,
    pub folder_id: String,
    pub user_id: String,
    pub master_disk_id: DiskId,
    pub replica_count: u32,
    pub media_kind: MediaKind,
    pub acquire_in_progress: bool,
}

impl Disk {
    fn is_replica(&self) -> bool {
        !self.master_disk_id.is_empty()
    }
}

/// The Disk Registry state machine
#[derive(Debug)]
pub struct DiskRegistryState {
    storage_config: StorageConfig,
    current_config: DiskRegistryConfig,
    known_agents: BTreeMap<AgentId, KnownAgentConfig>,
    device_pools: BTreeMap<String, DevicePoolConfig>,
    device_overrides: HashMap<DiskId, HashMap<DeviceId, u64>>,

    agent_list: AgentList,
    device_list: DeviceList,
    disks: BTreeMap<DiskId, Disk>,
    placement_groups: BTreeMap<GroupId, PlacementGroupConfig>,

    broken_disks: Vec<BrokenDiskInfo>,
    disks_to_cleanup: BTreeSet<DiskId>,

    /// Devices that should start migrating once the budget allows
    migrations: BTreeSet<(DiskId, DeviceId)>,
    device_migrations_in_progress: usize,

    automatically_replaced_devices: VecDeque<AutomaticallyReplacedDeviceInfo>,
    automatically_replaced_device_ids: HashSet<DeviceId>,

    replica_table: ReplicaTable,
    notifications: NotificationSystem,
    pending_cleanup: PendingCleanup,
}

impl DiskRegistryState {
    /// Restore the state from a snapshot
    #[must_use]
    pub fn new(storage_config: StorageConfig, backup: DiskRegistryBackup) -> Self {
        let DiskRegistryBackup {
            config,
            agents,
            disks,
            placement_groups,
            dirty_devices,
            suspended_devices,
            mut broken_disks,
            disks_to_cleanup,
            disks_to_reallocate,
            outdated_volume_configs,
            disk_state_changes,
            user_notifications,
            mut automatically_replaced_devices,
            agent_list_params,
            writable_state,
        } = backup;

        broken_disks.sort_by_key(|d| d.ts_to_destroy);
        automatically_replaced_devices.sort_by_key(|d| d.replacement_ts);

        let mut state = Self {
            agent_list: AgentList::new(
                storage_config.agent_list.clone(),
                agents,
                agent_list_params,
            ),
            device_list: DeviceList::new(
                dirty_devices.iter().map(|d| d.id.clone()).collect(),
                suspended_devices,
            ),
            replica_table: ReplicaTable::new(storage_config.max_replacements_per_mirrored_disk),
            notifications: NotificationSystem::new(
                config.last_disk_state_seq_no,
                config.last_disk_seq_no,
                disks_to_reallocate,
                outdated_volume_configs,
                disk_state_changes,
                user_notifications,
            ),
            current_config: DiskRegistryConfig::default(),
            known_agents: BTreeMap::new(),
            device_pools: BTreeMap::new(),
            device_overrides: HashMap::new(),
            disks: BTreeMap::new(),
            placement_groups: BTreeMap::new(),
            broken_disks,
            disks_to_cleanup: disks_to_cleanup.into_iter().collect(),
            migrations: BTreeSet::new(),
            device_migrations_in_progress: 0,
            automatically_replaced_device_ids: automatically_replaced_devices
                .iter()
                .map(|d| d.device_id.clone())
                .collect(),
            automatically_replaced_devices: automatically_replaced_devices.into(),
            pending_cleanup: PendingCleanup::default(),
            storage_config,
        };

        let mut config = config;
        config.writable_state |= writable_state;
        state.process_config(&config);
        state.current_config = config;

        state.process_disks(disks);
        state.process_placement_groups(placement_groups);
        state.process_agents();

        for dirty in dirty_devices {
            state.pending_cleanup.insert(&dirty.disk_id, &dirty.id);
        }

        state.fill_migrations();

        info!(
            "Disk registry state loaded: {} agents, {} disks, {} placement groups",
            state.agent_list.len(),
            state.disks.len(),
            state.placement_groups.len()
        );

        state
    }

    fn process_disks(&mut self, configs: Vec<DiskConfig>) {
        for config in configs {
            let disk_id = config.disk_id.clone();
            let media_kind = config
                .media_kind
                .unwrap_or_else(|| MediaKind::from_replica_count(config.replica_count));

            let mut disk = Disk {
                devices: config.device_uuids,
                device_replacement_ids: config.device_replacement_uuids,
                logical_block_size: config.block_size,
                state: config.state,
                state_ts: config.state_ts,
                cloud_id: config.cloud_id,
                folder_id: config.folder_id,
                user_id: config.user_id,
                master_disk_id: config.master_disk_id,
                replica_count: config.replica_count,
                media_kind,
                ..Default::default()
            };

            if !disk.is_replica() && media_kind.supports_notifications() {
                self.notifications.allow_notifications(&disk_id);
            }

            for uuid in &disk.devices {
                self.device_list.mark_device_allocated(&disk_id, uuid);
            }

            for m in config.migrations {
                self.device_migrations_in_progress += 1;
                self.device_list
                    .mark_device_allocated(&disk_id, &m.target_device_id);
                disk.migration_target_to_source
                    .insert(m.target_device_id.clone(), m.source_device_id.clone());
                disk.migration_source_to_target
                    .insert(m.source_device_id, m.target_device_id);
            }

            if !config.finished_migrations.is_empty() {
                let notify_id = if disk.is_replica() {
                    disk.master_disk_id.clone()
                } else {
                    disk_id.clone()
                };
                let seq_no = self.notifications.reallocate_seq_no_on_load(&notify_id);

                for uuid in config.finished_migrations {
                    self.device_list.mark_device_allocated(&disk_id, &uuid);
                    disk.finished_migrations.push(FinishedMigration {
                        device_id: uuid,
                        seq_no,
                    });
                }
            }

            self.disks.insert(disk_id, disk);
        }

        let masters: Vec<(DiskId, u32, Vec<DeviceId>)> = self
            .disks
            .iter()
            .filter(|(_, d)| d.replica_count > 0)
            .map(|(id, d)| (id.clone(), d.replica_count, d.device_replacement_ids.clone()))
            .collect();

        for (master_id, replica_count, replacements) in masters {
            for (index, replica_id) in DiskRef::replica_ids(&master_id, replica_count)
                .iter()
                .enumerate()
            {
                let Some(replica) = self.disks.get(replica_id) else {
                    critical::report(
                        CriticalEvent::DiskNotFound,
                        format!("ProcessDisks: replica '{replica_id}' of '{master_id}'"),
                    );
                    continue;
                };
                self.replica_table
                    .add_replica(&master_id, index, &replica.devices, &replacements);
            }
        }
    }

    fn process_placement_groups(&mut self, configs: Vec<PlacementGroupConfig>) {
        for config in configs {
            for member in &config.disks {
                let Some(disk) = self.disks.get_mut(&member.disk_id) else {
                    critical::report(
                        CriticalEvent::DiskNotFound,
                        format!("ProcessPlacementGroups: disk '{}'", member.disk_id),
                    );
                    continue;
                };

                disk.placement_group_id.clone_from(&config.group_id);

                if config.must_have_partitions() {
                    if !config.partition_suits(member.placement_partition_index) {
                        critical::report(
                            CriticalEvent::InvalidPlacementGroupPartition,
                            format!(
                                "ProcessPlacementGroups: disk '{}', group '{}', partition {}",
                                member.disk_id, config.group_id, member.placement_partition_index
                            ),
                        );
                        continue;
                    }
                    disk.placement_partition_index = member.placement_partition_index;
                }
            }

            self.placement_groups
                .insert(config.group_id.clone(), config);
        }
    }

    fn process_agents(&mut self) {
        let agent_ids: Vec<AgentId> = self
            .agent_list
            .agents()
            .map(|a| a.agent_id.clone())
            .collect();

        for agent_id in agent_ids {
            if let Some(agent) = self.agent_list.find_agent(&agent_id) {
                self.device_list.update_devices(agent);
                let tbf = agent.time_between_failures;
                self.agent_list.add_time_between_failures(tbf);
            }
        }
    }

    #[must_use]
    pub fn storage_config(&self) -> &StorageConfig {
        &self.storage_config
    }

    /// Persisted form of a disk
    fn build_disk_config(&self, disk_id: &str, disk: &Disk) -> DiskConfig {
        DiskConfig {
            disk_id: disk_id.to_string(),
            block_size: disk.logical_block_size,
            device_uuids: disk.devices.clone(),
            state: disk.state,
            state_ts: disk.state_ts,
            cloud_id: disk.cloud_id.clone(),
            folder_id: disk.folder_id.clone(),
            user_id: disk.user_id.clone(),
            master_disk_id: disk.master_disk_id.clone(),
            replica_count: disk.replica_count,
            device_replacement_uuids: disk.device_replacement_ids.clone(),
            migrations: disk
                .migration_source_to_target
                .iter()
                .map(|(source, target)| DeviceMigration {
                    source_device_id: source.clone(),
                    target_device_id: target.clone(),
                })
                .collect(),
            finished_migrations: disk
                .finished_migrations
                .iter()
                .map(|m| m.device_id.clone())
                .collect(),
            media_kind: Some(disk.media_kind),
        }
    }

    fn persist_disk(&self, db: &mut dyn DiskRegistryDatabase, disk_id: &str) {
        if let Some(disk) = self.disks.get(disk_id) {
            db.update_disk(&self.build_disk_config(disk_id, disk));
        }
    }

    /// Ask the clients of a disk to re-fetch its layout
    ///
    /// Replicas are redirected to their master.
    pub fn add_reallocate_request(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) -> u64 {
        let target = self
            .disks
            .get(disk_id)
            .filter(|d| d.is_replica())
            .map_or_else(|| disk_id.to_string(), |d| d.master_disk_id.clone());
        self.notifications.add_reallocate_request(db, &target)
    }

    fn update_and_reallocate_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) -> u64 {
        self.persist_disk(db, disk_id);
        self.add_reallocate_request(db, disk_id)
    }

    fn persist_agent(&self, db: &mut dyn DiskRegistryDatabase, agent_id: &str) {
        if let Some(agent) = self.agent_list.find_agent(agent_id) {
            persist_agent(db, agent);
        }
    }

    /// Persist an agent and re-derive its free devices
    fn sync_agent(&mut self, db: &mut dyn DiskRegistryDatabase, agent_id: &str) {
        if let Some(agent) = self.agent_list.find_agent(agent_id) {
            persist_agent(db, agent);
            self.device_list.update_devices(agent);
        }
    }

    fn device_location(&self, device_id: &str) -> Option<(&AgentConfig, &DeviceConfig)> {
        let agent_id = self.device_list.find_agent_id(device_id);
        if agent_id.is_empty() {
            return None;
        }
        let agent = self.agent_list.find_agent(agent_id)?;
        let device = agent.device(device_id)?;
        Some((agent, device))
    }

    /// Mutable agent-side record of a device, with its agent id
    fn device_mut(&mut self, device_id: &str) -> Option<(AgentId, &mut DeviceConfig)> {
        let agent_id = self.device_list.find_agent_id(device_id).to_string();
        if agent_id.is_empty() {
            return None;
        }
        let device = self
            .agent_list
            .find_agent_mut(&agent_id)?
            .device_mut(device_id)?;
        Some((agent_id, device))
    }

    /// Disk a device is allocated to (empty if none)
    #[must_use]
    pub fn find_disk(&self, device_id: &str) -> &str {
        self.device_list.find_disk_id(device_id)
    }

    /// Fold agent and device states of the disk's devices
    fn calculate_disk_state(&self, devices: &[DeviceId]) -> DiskState {
        let mut state = DiskState::Online;

        for uuid in devices {
            let Some(device) = self.device_list.find_device(uuid) else {
                return DiskState::Error;
            };
            let Some(agent) = self.agent_list.find_agent(&device.agent_id) else {
                return DiskState::Error;
            };

            state = state
                .max(DiskState::from(agent.state))
                .max(DiskState::from(device.state));

            if state == DiskState::Error {
                break;
            }
        }

        state
    }

    /// Recompute the state of a disk; returns whether it changed
    fn try_update_disk_state(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        now: Timestamp,
    ) -> bool {
        let Some(disk) = self.disks.get(disk_id) else {
            critical::report(
                CriticalEvent::DiskNotFound,
                format!("TryUpdateDiskState: disk '{disk_id}'"),
            );
            return false;
        };

        let new_state = self.calculate_disk_state(&disk.devices);
        let old_state = disk.state;
        if old_state == new_state {
            return false;
        }

        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.state = new_state;
            disk.state_ts = now;
        }

        info!(
            "Disk '{}' state changed: {} -> {}",
            disk_id, old_state, new_state
        );

        self.update_and_reallocate_disk(db, disk_id);
        self.notifications
            .on_disk_state_changed(db, disk_id, old_state, new_state, "", now);

        true
    }

    /// Shrink the usable size of a device
    fn adjust_device_block_count(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
        new_block_count: u64,
    ) {
        let Some((agent_id, device)) = self.device_mut(device_id) else {
            critical::report(
                CriticalEvent::InvalidDeviceBlockCount,
                format!("AdjustDeviceBlockCount: device '{device_id}' not found"),
            );
            return;
        };

        if new_block_count > device.unadjusted_blocks_count {
            critical::report(
                CriticalEvent::InvalidDeviceBlockCount,
                format!(
                    "AdjustDeviceBlockCount: device '{}', unadjusted {}, requested {}",
                    device_id, device.unadjusted_blocks_count, new_block_count
                ),
            );
            return;
        }

        if new_block_count == device.blocks_count {
            return;
        }

        device.blocks_count = new_block_count;
        self.sync_agent(db, &agent_id);
    }

    fn adjust_device_state(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
        state: DeviceState,
        ts: Timestamp,
        message: &str,
    ) {
        let Some((agent_id, device)) = self.device_mut(device_id) else {
            return;
        };
        device.state = state;
        device.state_ts = ts;
        device.state_message = message.to_string();
        self.sync_agent(db, &agent_id);
    }

    /// Block count of `device` as seen by `disk_id`
    fn device_block_count_with_overrides(&self, disk_id: &str, device: &DeviceConfig) -> u64 {
        self.device_overrides
            .get(disk_id)
            .and_then(|o| o.get(&device.device_uuid))
            .copied()
            .unwrap_or(device.blocks_count)
    }

    /// Allocation unit of a pool in bytes (0 for unknown pools)
    #[must_use]
    pub fn get_allocation_unit(&self, pool_name: &str) -> u64 {
        self.device_pools
            .get(pool_name)
            .map_or(0, |p| p.allocation_unit)
    }

    fn add_to_broken_disks(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        disk_id: &str,
    ) {
        let info = BrokenDiskInfo {
            disk_id: disk_id.to_string(),
            ts_to_destroy: now + self.storage_config.broken_disk_destruction_delay(),
        };
        debug!("Disk '{}' is broken, destroy at {}", disk_id, info.ts_to_destroy);
        db.add_broken_disk(&info);
        self.broken_disks.push(info);
    }
}

/// Persist an agent and its node index entry
fn persist_agent(db: &mut dyn DiskRegistryDatabase, agent: &AgentConfig) {
    if agent.node_id != 0 {
        db.update_old_agent(agent);
    }
    db.update_agent(agent);
}

/// Fit a device into its pool
///
/// Sets the pool kind, and either clamps the usable size to one allocation
/// unit or marks the device broken when it cannot serve the pool.
fn adjust_device_if_needed(
    pools: &BTreeMap<String, DevicePoolConfig>,
    allocated: bool,
    device: &mut DeviceConfig,
    ts: Timestamp,
) {
    if device.unadjusted_blocks_count == 0 {
        device.unadjusted_blocks_count = device.blocks_count;
    }

    let set_error = |device: &mut DeviceConfig, message: String| {
        device.state = DeviceState::Error;
        device.state_ts = ts;
        device.state_message = message;
    };

    let Some(pool) = pools.get(&device.pool_name) else {
        let message = format!("unknown pool: {}", device.pool_name);
        set_error(device, message);
        return;
    };

    device.pool_kind = pool.kind;
    let unit = pool.allocation_unit;
    debug_assert_ne!(unit, 0);

    if device.state == DeviceState::Error || allocated {
        return;
    }

    let size = device.byte_count();
    if size < unit {
        set_error(device, format!("device is too small: {size}"));
        return;
    }

    if device.block_size == 0 || unit % u64::from(device.block_size) != 0 {
        let message = format!("bad block size: {}", device.block_size);
        set_error(device, message);
        return;
    }

    if size > unit {
        device.blocks_count = unit / u64::from(device.block_size);
    }
}
