//! Disk allocation and release
//!
//! Simple disks grow only: allocating an existing disk tops it up to the
//! requested size and reports `Status::Already` when nothing was missing.
//! A mirrored disk is a master record plus `replica_count + 1` simple
//! replica disks kept apart by a dedicated spread placement group.
//!
//! Allocation works on a private copy of the disk record and stores it only
//! once every check passed, so a failed request leaves existing disks as
//! they were. A brand-new disk that could not be backed is queued for
//! destruction.

use super::placement::PlacementInfo;
use super::{DeviceMigrationInfo, Disk, DiskRegistryState};
use diskreg_common::critical::{self, CriticalEvent};
use diskreg_common::{
    DeviceConfig, DeviceId, DevicePoolKind, DiskId, DiskRef, DiskState, Error, MediaKind,
    PlacementStrategy, Result, Status, Timestamp, VolumeIoMode,
};
use diskreg_placement::AllocationQuery;
use diskreg_store::DiskRegistryDatabase;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

const ONLY_MASTERS: &str = "The method only works with master disks";
const FORCE_NOTICE: &str = "(use force flag to bypass this restriction)";

/// Request to allocate (or grow) a disk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocateDiskParams {
    pub disk_id: DiskId,
    pub cloud_id: String,
    pub folder_id: String,
    pub placement_group_id: String,
    pub placement_partition_index: u32,
    /// Logical block size in bytes
    pub block_size: u32,
    pub blocks_count: u64,
    /// Extra copies of a mirrored disk (0 for simple disks)
    pub replica_count: u32,
    /// Master of a replica being provisioned internally
    pub master_disk_id: DiskId,
    /// Restrict allocation to these agents
    pub agent_ids: Vec<String>,
    /// Empty for the default pool
    pub pool_name: String,
    pub media_kind: MediaKind,
}

/// Layout of an allocated disk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocateDiskResult {
    /// `Already` when the disk was big enough before the call
    pub status: Status,
    /// Devices of the disk, or of its first replica
    pub devices: Vec<DeviceConfig>,
    pub migrations: Vec<DeviceMigrationInfo>,
    /// Devices of the other replicas of a mirrored disk
    pub replicas: Vec<Vec<DeviceConfig>>,
    pub device_replacement_ids: Vec<DeviceId>,
    pub io_mode: VolumeIoMode,
    pub io_mode_ts: Timestamp,
    pub mute_io_errors: bool,
}

fn validate_allocate_disk_params(disk: Option<&Disk>, params: &AllocateDiskParams) -> Result<()> {
    let Some(disk) = disk else {
        return Ok(());
    };

    if disk.replica_count != 0 && params.replica_count == 0 {
        return Err(Error::invalid_state(
            "attempt to reallocate mirrored disk as nonrepl",
        ));
    }

    if params.replica_count != 0 && disk.replica_count == 0 && !disk.devices.is_empty() {
        return Err(Error::invalid_state(
            "attempt to reallocate nonrepl disk as mirrored",
        ));
    }

    if disk.logical_block_size != 0 && disk.logical_block_size != params.block_size {
        return Err(Error::argument(format!(
            "attempt to change LogicalBlockSize: {} -> {}",
            disk.logical_block_size, params.block_size
        )));
    }

    Ok(())
}

/// Local disks must stay on the agents they were first allocated on
fn validate_disk_location(devices: &[DeviceConfig], params: &AllocateDiskParams) -> Result<()> {
    if !params.media_kind.is_local() || devices.is_empty() || params.agent_ids.is_empty() {
        return Ok(());
    }

    for device in devices {
        if !params.agent_ids.contains(&device.agent_id) {
            return Err(Error::argument(format!(
                "disk '{}' already allocated at {}",
                params.disk_id, device.agent_id
            )));
        }
    }

    Ok(())
}

/// Group and partition to use for an allocation
///
/// A disk that already has devices keeps its own placement.
fn placement_info(disk: &Disk, params: &AllocateDiskParams) -> PlacementInfo {
    let has_devices = !disk.devices.is_empty();

    PlacementInfo {
        group_id: if has_devices && !disk.placement_group_id.is_empty() {
            disk.placement_group_id.clone()
        } else {
            params.placement_group_id.clone()
        },
        partition_index: if has_devices && disk.placement_partition_index != 0 {
            disk.placement_partition_index
        } else {
            params.placement_partition_index
        },
    }
}

fn byte_count(devices: &[DeviceConfig]) -> u64 {
    devices.iter().map(DeviceConfig::byte_count).sum()
}

impl DiskRegistryState {
    /// Allocate a disk, or grow an existing one
    pub fn allocate_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        params: &AllocateDiskParams,
    ) -> Result<AllocateDiskResult> {
        if params.disk_id.is_empty() {
            return Err(Error::argument("empty disk id"));
        }

        if params.block_size == 0 {
            return Err(Error::argument("zero block size"));
        }

        let existing = self.disks.get(&params.disk_id);
        if let Err(e) = validate_allocate_disk_params(existing, params) {
            if existing.is_none_or(|d| d.devices.is_empty() && d.replica_count == 0) {
                self.disks.remove(&params.disk_id);
                self.add_to_broken_disks(db, now, &params.disk_id);
            }
            return Err(e);
        }

        if params.replica_count != 0 {
            return self.allocate_mirrored_disk(db, now, params);
        }

        self.allocate_simple_disk(db, now, params)
    }

    fn prepare_allocation_query(
        &self,
        blocks_to_allocate: u64,
        info: &PlacementInfo,
        devices: &[DeviceConfig],
        params: &AllocateDiskParams,
    ) -> Result<AllocationQuery> {
        let (forbidden_racks, preferred_racks) = if info.group_id.is_empty() {
            (BTreeSet::new(), self.collect_preferred_racks(&params.disk_id))
        } else {
            self.collect_group_racks(&params.disk_id, info)
        };

        let mut node_ids = BTreeSet::new();
        let mut unknown_agents = Vec::new();

        for agent_id in &params.agent_ids {
            match self.agent_list.find_agent(agent_id) {
                Some(agent) if agent.node_id != 0 => {
                    node_ids.insert(agent.node_id);
                }
                _ => unknown_agents.push(agent_id.as_str()),
            }
        }

        if !unknown_agents.is_empty() {
            return Err(Error::argument(format!(
                "unknown agents: {}",
                unknown_agents.join(", ")
            )));
        }

        let pool_kind = if params.media_kind.is_local() {
            DevicePoolKind::Local
        } else if params.pool_name.is_empty() {
            DevicePoolKind::Default
        } else {
            DevicePoolKind::Global
        };

        if pool_kind == DevicePoolKind::Local {
            if let Some(first) = devices.first() {
                if !node_ids.is_empty() && !node_ids.contains(&first.node_id) {
                    return Err(Error::argument(format!(
                        "disk {} already allocated on {}",
                        params.disk_id, first.agent_id
                    )));
                }
                node_ids = BTreeSet::from([first.node_id]);
            }
        }

        Ok(AllocationQuery {
            forbidden_racks,
            preferred_racks,
            logical_block_size: params.block_size,
            block_count: blocks_to_allocate,
            pool_name: params.pool_name.clone(),
            pool_kind,
            node_ids,
        })
    }

    fn allocate_simple_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        params: &AllocateDiskParams,
    ) -> Result<AllocateDiskResult> {
        debug_assert_eq!(params.replica_count, 0);

        let mut disk = self.disks.get(&params.disk_id).cloned().unwrap_or_default();
        debug_assert_eq!(disk.replica_count, 0);

        let is_new = disk.devices.is_empty();

        match self.try_allocate_simple_disk(db, now, params, &mut disk) {
            Ok(result) => Ok(result),
            Err(e) => {
                if is_new {
                    self.disks.remove(&params.disk_id);
                    if params.master_disk_id.is_empty() {
                        self.add_to_broken_disks(db, now, &params.disk_id);
                    }
                }
                Err(e)
            }
        }
    }

    fn try_allocate_simple_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        params: &AllocateDiskParams,
        disk: &mut Disk,
    ) -> Result<AllocateDiskResult> {
        if disk.state_ts.is_zero() {
            disk.state_ts = now;
        }

        let mut result = AllocateDiskResult {
            io_mode: if disk.state < DiskState::Error {
                VolumeIoMode::Ok
            } else {
                VolumeIoMode::ErrorReadOnly
            },
            io_mode_ts: disk.state_ts,
            mute_io_errors: disk.state >= DiskState::TemporarilyUnavailable,
            ..Default::default()
        };

        let info = placement_info(disk, params);
        if !info.group_id.is_empty() {
            self.check_disk_placement_info(&info)?;
        }

        result.migrations = self.collect_disk_migrations(disk)?;
        result.devices = self.collect_disk_devices(&params.disk_id, disk)?;
        validate_disk_location(&result.devices, params)?;

        let current_size = byte_count(&result.devices);
        let requested_size = u64::from(params.block_size) * params.blocks_count;

        if requested_size <= current_size {
            if disk.cloud_id.is_empty() && !params.cloud_id.is_empty() {
                disk.cloud_id.clone_from(&params.cloud_id);
                disk.folder_id.clone_from(&params.folder_id);
                db.update_disk(&self.build_disk_config(&params.disk_id, disk));
                self.disks.insert(params.disk_id.clone(), disk.clone());
            }

            debug!("Disk '{}' already exists", params.disk_id);
            result.status = Status::Already;
            return Ok(result);
        }

        let blocks_to_allocate =
            (requested_size - current_size).div_ceil(u64::from(params.block_size));

        if result.devices.is_empty() && !info.group_id.is_empty() {
            self.check_placement_group_capacity(&info.group_id)?;
        }

        let query =
            self.prepare_allocation_query(blocks_to_allocate, &info, &result.devices, params)?;

        let allocated = self.device_list.allocate_devices(&params.disk_id, &query);
        if allocated.is_empty() {
            return Err(Error::allocation_failed(format!(
                "can't allocate disk with {} blocks x {} bytes",
                blocks_to_allocate, params.block_size
            )));
        }

        disk.devices
            .extend(allocated.iter().map(|d| d.device_uuid.clone()));
        result.devices.extend(allocated);

        disk.logical_block_size = params.block_size;
        disk.cloud_id.clone_from(&params.cloud_id);
        disk.folder_id.clone_from(&params.folder_id);
        disk.master_disk_id.clone_from(&params.master_disk_id);
        disk.media_kind = params.media_kind;

        db.update_disk(&self.build_disk_config(&params.disk_id, disk));
        self.disks.insert(params.disk_id.clone(), disk.clone());

        self.update_disk_placement_info(db, &params.disk_id, &info);

        if params.master_disk_id.is_empty() && params.media_kind.supports_notifications() {
            self.notifications.allow_notifications(&params.disk_id);
        }

        info!(
            "Disk '{}' allocated: {} devices, {} bytes",
            params.disk_id,
            result.devices.len(),
            byte_count(&result.devices)
        );

        Ok(result)
    }

    fn is_mirrored_disk_already_allocated(&self, params: &AllocateDiskParams) -> bool {
        let replica_id = DiskRef::replica(params.disk_id.as_str(), 0).disk_id();
        let Some(replica) = self.disks.get(&replica_id) else {
            return false;
        };

        let size: u64 = replica
            .devices
            .iter()
            .filter_map(|uuid| self.device_list.find_device(uuid))
            .map(DeviceConfig::byte_count)
            .sum();

        size >= params.blocks_count * u64::from(params.block_size)
    }

    fn allocate_disk_replica(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        params: &AllocateDiskParams,
        index: u32,
    ) -> Result<AllocateDiskResult> {
        let sub_params = AllocateDiskParams {
            disk_id: DiskRef::replica(params.disk_id.as_str(), index).disk_id(),
            placement_group_id: DiskRef::mirrored_group_id(&params.disk_id),
            placement_partition_index: 0,
            master_disk_id: params.disk_id.clone(),
            replica_count: 0,
            ..params.clone()
        };

        self.allocate_simple_disk(db, now, &sub_params)
    }

    fn allocate_mirrored_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        params: &AllocateDiskParams,
    ) -> Result<AllocateDiskResult> {
        let is_new = self
            .disks
            .get(&params.disk_id)
            .is_none_or(|d| d.devices.is_empty() && d.replica_count == 0);

        let status = if self.is_mirrored_disk_already_allocated(params) {
            Status::Already
        } else {
            Status::Ok
        };

        if is_new {
            let group_id = DiskRef::mirrored_group_id(&params.disk_id);
            if let Err(e) =
                self.create_placement_group(db, &group_id, PlacementStrategy::Spread, 0)
            {
                self.cleanup_mirrored_disk(db, now, params);
                return Err(e);
            }
        }

        let mut result = AllocateDiskResult {
            status,
            ..Default::default()
        };

        for index in 0..=params.replica_count {
            match self.allocate_disk_replica(db, now, params, index) {
                Ok(sub) => {
                    if index == 0 {
                        result.devices = sub.devices;
                        result.io_mode = sub.io_mode;
                        result.io_mode_ts = sub.io_mode_ts;
                        result.mute_io_errors = sub.mute_io_errors;
                    } else {
                        result.replicas.push(sub.devices);
                    }
                    result.migrations.extend(sub.migrations);
                }
                Err(e) => {
                    if is_new {
                        self.cleanup_mirrored_disk(db, now, params);
                    } else {
                        critical::report(
                            CriticalEvent::ResizeCleanupFailure,
                            format!("AllocateMirroredDisk: disk '{}'", params.disk_id),
                        );
                    }
                    return Err(e);
                }
            }
        }

        let disk = self.disks.entry(params.disk_id.clone()).or_default();
        disk.cloud_id.clone_from(&params.cloud_id);
        disk.folder_id.clone_from(&params.folder_id);
        disk.logical_block_size = params.block_size;
        disk.state_ts = now;
        disk.replica_count = params.replica_count;
        disk.media_kind = params.media_kind;
        result.device_replacement_ids.clone_from(&disk.device_replacement_ids);

        self.persist_disk(db, &params.disk_id);
        self.update_replica_table(&params.disk_id, &result);

        if is_new {
            info!(
                "Mirrored disk '{}' allocated with {} replicas",
                params.disk_id,
                params.replica_count + 1
            );
        }

        Ok(result)
    }

    /// Tear down a mirrored disk whose first allocation failed
    fn cleanup_mirrored_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        params: &AllocateDiskParams,
    ) {
        self.disks.remove(&params.disk_id);

        for replica_id in DiskRef::replica_ids(&params.disk_id, params.replica_count) {
            if self.disks.contains_key(&replica_id) {
                let released = self.deallocate_simple_disk(db, &replica_id, "CleanupMirroredDisk");
                self.pending_cleanup.insert_all(&replica_id, &released);
            }
        }

        let (_, affected) =
            self.destroy_placement_group(db, &DiskRef::mirrored_group_id(&params.disk_id));
        if !affected.is_empty() {
            critical::report(
                CriticalEvent::DeallocationInconsistency,
                format!(
                    "CleanupMirroredDisk: group of '{}' still had {} members",
                    params.disk_id,
                    affected.len()
                ),
            );
        }

        self.add_to_broken_disks(db, now, &params.disk_id);
        warn!("Mirrored disk '{}' allocation rolled back", params.disk_id);
    }

    fn update_replica_table(&mut self, disk_id: &str, result: &AllocateDiskResult) {
        let ids = |devices: &[DeviceConfig]| -> Vec<DeviceId> {
            devices.iter().map(|d| d.device_uuid.clone()).collect()
        };

        self.replica_table.add_replica(
            disk_id,
            0,
            &ids(&result.devices),
            &result.device_replacement_ids,
        );
        for (i, replica) in result.replicas.iter().enumerate() {
            self.replica_table.add_replica(
                disk_id,
                i + 1,
                &ids(replica),
                &result.device_replacement_ids,
            );
        }
    }

    /// Allow a disk to be deallocated
    pub fn mark_disk_for_cleanup(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) -> Result<()> {
        if !self.disks.contains_key(disk_id) {
            return Err(Error::not_found(format!("disk '{disk_id}' not found")));
        }

        db.add_disk_to_cleanup(disk_id);
        self.disks_to_cleanup.insert(disk_id.to_string());

        Ok(())
    }

    /// Release a disk marked for cleanup
    ///
    /// Released devices become dirty; the disk counts as cleaned once every
    /// one of them is wiped (see [`Self::mark_device_as_clean`]).
    pub fn deallocate_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) -> Result<Status> {
        let Some(disk) = self.disks.get(disk_id) else {
            return Ok(Status::Already);
        };

        if !self.disks_to_cleanup.contains(disk_id) {
            let message = format!("attempting to clean up unmarked disk '{disk_id}'");
            critical::report(CriticalEvent::DeallocationInconsistency, message.clone());
            return Err(Error::invalid_state(message));
        }

        if disk.replica_count != 0 {
            let (_, replicas) =
                self.destroy_placement_group(db, &DiskRef::mirrored_group_id(disk_id));

            for replica_id in replicas {
                debug_assert!(replica_id.starts_with(&format!("{disk_id}/")));
                let released =
                    self.deallocate_simple_disk(db, &replica_id, "DeallocateDisk:Replica");
                self.pending_cleanup.insert_all(disk_id, &released);
            }

            self.delete_disk(db, disk_id);
            self.replica_table.remove_mirrored_disk(disk_id);

            info!("Mirrored disk '{}' deallocated", disk_id);
            return Ok(Status::Ok);
        }

        let released = self.deallocate_simple_disk(db, disk_id, "DeallocateDisk");
        self.pending_cleanup.insert_all(disk_id, &released);

        info!(
            "Disk '{}' deallocated, {} devices to clean",
            disk_id,
            released.len()
        );

        Ok(Status::Ok)
    }

    /// Check whether devices released by `disk_id` still wait for a wipe
    #[must_use]
    pub fn has_pending_cleanup(&self, disk_id: &str) -> bool {
        self.pending_cleanup.contains(disk_id)
    }

    /// Release every device of a simple disk and delete it
    ///
    /// Returns the devices that became dirty.
    pub(super) fn deallocate_simple_disk(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        caller: &str,
    ) -> Vec<DeviceId> {
        let Some(disk) = self.disks.get(disk_id) else {
            critical::report(
                CriticalEvent::DiskNotFound,
                format!("{caller}: disk '{disk_id}'"),
            );
            return Vec::new();
        };
        debug_assert_eq!(disk.replica_count, 0);

        let group_id = disk.placement_group_id.clone();
        let candidates: Vec<DeviceId> = disk
            .devices
            .iter()
            .chain(disk.migration_target_to_source.keys())
            .chain(disk.finished_migrations.iter().map(|m| &m.device_id))
            .cloned()
            .collect();
        let pending_migrations = disk.migration_source_to_target.len();

        let dirty: Vec<DeviceId> = candidates
            .into_iter()
            .filter(|uuid| self.device_list.release_device(uuid))
            .collect();

        if !group_id.is_empty() {
            if let Some(group) = self.placement_groups.get_mut(&group_id) {
                group.disks.retain(|d| d.disk_id != disk_id);
                group.config_version += 1;
                db.update_placement_group(group);
            } else {
                critical::report(
                    CriticalEvent::PlacementGroupNotFound,
                    format!("DeallocateDisk: disk '{disk_id}', group '{group_id}'"),
                );
            }
        }

        for uuid in &dirty {
            db.update_dirty_device(uuid, disk_id);
        }

        self.device_migrations_in_progress = self
            .device_migrations_in_progress
            .saturating_sub(pending_migrations);
        self.migrations.retain(|(id, _)| id != disk_id);
        self.delete_disk(db, disk_id);

        dirty
    }

    fn delete_disk(&mut self, db: &mut dyn DiskRegistryDatabase, disk_id: &str) {
        self.disks.remove(disk_id);
        self.disks_to_cleanup.remove(disk_id);
        self.notifications.delete_disk(db, disk_id);

        db.delete_disk(disk_id);
        db.delete_disk_to_cleanup(disk_id);
    }

    /// Grow or shrink the replica set of a mirrored disk
    pub fn update_disk_replica_count(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        master_id: &str,
        replica_count: u32,
    ) -> Result<Status> {
        if master_id.is_empty() {
            return Err(Error::argument("disk id is required"));
        }

        if replica_count == 0 {
            return Err(Error::argument("unable to turn mirrored disk to a simple one"));
        }

        let Some(master) = self.disks.get(master_id) else {
            return Err(Error::not_found(format!("disk '{master_id}' is not found")));
        };

        if master.is_replica() {
            return Err(Error::argument(format!(
                "disk '{}' is not a master, it's a slave of the master disk '{}'. {}",
                master_id, master.master_disk_id, ONLY_MASTERS
            )));
        }

        if master.replica_count == 0 {
            return Err(Error::argument(format!(
                "disk '{master_id}' is not a master. {ONLY_MASTERS}"
            )));
        }

        let current = master.replica_count;
        if replica_count == current {
            return Ok(Status::False);
        }

        if replica_count > current {
            self.allocate_disk_replicas(db, now, master_id, replica_count - current)?;
        } else {
            self.deallocate_disk_replicas(db, master_id, current - replica_count);
        }

        Ok(Status::Ok)
    }

    fn allocate_disk_replicas(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        master_id: &str,
        count: u32,
    ) -> Result<()> {
        let Some(master) = self.disks.get(master_id) else {
            return Err(Error::not_found(format!("disk '{master_id}' is not found")));
        };

        let current = master.replica_count;
        let new_count = current + count;
        let max = self.storage_config.max_disks_in_placement_group.saturating_sub(1);
        if new_count > max {
            return Err(Error::argument(format!(
                "mirrored disks can have maximum of {max} replicas, and you are asking for {new_count}"
            )));
        }

        let media_kind = master.media_kind;
        let first_id = DiskRef::replica(master_id, 0).disk_id();
        let Some(first) = self.disks.get(&first_id) else {
            critical::report(
                CriticalEvent::DiskNotFound,
                format!("AllocateDiskReplicas: replica '{first_id}'"),
            );
            return Err(Error::fail(format!("replica '{first_id}' not found")));
        };

        let logical_block_size = first.logical_block_size.max(1);
        let blocks_count = first
            .devices
            .iter()
            .filter_map(|uuid| self.device_list.find_device(uuid))
            .map(|d| d.byte_count() / u64::from(logical_block_size))
            .sum();

        let params = AllocateDiskParams {
            disk_id: master_id.to_string(),
            cloud_id: first.cloud_id.clone(),
            folder_id: first.folder_id.clone(),
            block_size: logical_block_size,
            blocks_count,
            media_kind,
            ..Default::default()
        };

        let mut added = Vec::with_capacity(count as usize);
        for index in current + 1..=new_count {
            match self.allocate_disk_replica(db, now, &params, index) {
                Ok(result) => added.push((index, result.devices)),
                Err(e) => {
                    for (index, _) in added {
                        let replica_id = DiskRef::replica(master_id, index).disk_id();
                        let released = self.deallocate_simple_disk(
                            db,
                            &replica_id,
                            "AllocateDiskReplicas:Cleanup",
                        );
                        self.pending_cleanup.insert_all(master_id, &released);
                    }
                    return Err(e);
                }
            }
        }

        for (index, devices) in added {
            let ids: Vec<DeviceId> = devices.into_iter().map(|d| d.device_uuid).collect();
            self.replica_table
                .add_replica(master_id, index as usize, &ids, &[]);
        }

        if let Some(master) = self.disks.get_mut(master_id) {
            master.replica_count = new_count;
        }
        self.update_and_reallocate_disk(db, master_id);

        info!(
            "Mirrored disk '{}' replica count {} -> {}",
            master_id, current, new_count
        );

        Ok(())
    }

    fn deallocate_disk_replicas(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        master_id: &str,
        count: u32,
    ) {
        let Some(current) = self.disks.get(master_id).map(|d| d.replica_count) else {
            return;
        };
        let new_count = current.saturating_sub(count);

        for index in (new_count + 1..=current).rev() {
            let replica_id = DiskRef::replica(master_id, index).disk_id();
            let released = self.deallocate_simple_disk(db, &replica_id, "DeallocateDiskReplicas");
            self.pending_cleanup.insert_all(master_id, &released);
        }

        self.replica_table
            .truncate(master_id, new_count as usize + 1);

        if let Some(master) = self.disks.get_mut(master_id) {
            master.replica_count = new_count;
        }
        self.update_and_reallocate_disk(db, master_id);

        info!(
            "Mirrored disk '{}' replica count {} -> {}",
            master_id, current, new_count
        );
    }

    /// Flag or unflag a device of a mirrored disk as a fresh replacement
    pub fn mark_replacement_device(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        device_id: &str,
        is_replacement: bool,
    ) -> Result<Status> {
        let Some(disk) = self.disks.get_mut(disk_id) else {
            return Err(Error::not_found(format!("Disk {disk_id} not found")));
        };

        let pos = disk
            .device_replacement_ids
            .iter()
            .position(|id| id == device_id);

        match (is_replacement, pos) {
            (true, Some(_)) | (false, None) => return Ok(Status::Already),
            (true, None) => disk.device_replacement_ids.push(device_id.to_string()),
            (false, Some(pos)) => {
                disk.device_replacement_ids.remove(pos);
            }
        }

        self.update_and_reallocate_disk(db, disk_id);
        self.replica_table
            .mark_replacement_device(disk_id, device_id, is_replacement);

        Ok(Status::Ok)
    }

    fn new_block_size_breaks_device(
        &self,
        disk: &Disk,
        disk_id: &str,
        device: &DeviceConfig,
        block_size: u32,
    ) -> bool {
        let size =
            u64::from(device.block_size) * self.device_block_count_with_overrides(disk_id, device);
        let old_size =
            size / u64::from(disk.logical_block_size) * u64::from(disk.logical_block_size);
        let new_size = size / u64::from(block_size) * u64::from(block_size);
        old_size != new_size
    }

    fn validate_update_disk_block_size(
        &self,
        disk_id: &str,
        block_size: u32,
        force: bool,
    ) -> Result<Status> {
        if disk_id.is_empty() {
            return Err(Error::argument("diskId is required"));
        }

        if block_size == 0 {
            return Err(Error::argument("blockSize is required"));
        }

        let Some(disk) = self.disks.get(disk_id) else {
            return Err(Error::not_found(format!("disk '{disk_id}' not found")));
        };

        if block_size == disk.logical_block_size {
            return Ok(Status::False);
        }

        if disk.devices.is_empty() {
            return Err(Error::invalid_state("disk without devices"));
        }

        if force {
            return Ok(Status::Ok);
        }

        let mut devices = Vec::with_capacity(disk.devices.len());
        for uuid in &disk.devices {
            let Some(device) = self.device_list.find_device(uuid) else {
                return Err(Error::invalid_state(format!(
                    "one of the disk devices cannot be found {FORCE_NOTICE}"
                )));
            };

            if device.block_size > block_size {
                return Err(Error::argument(format!(
                    "volume's block size ({}) is less than device's block size ({})",
                    block_size, device.block_size
                )));
            }

            devices.push(device);
        }

        let devices_size: u64 = devices.iter().map(|d| d.byte_count()).sum();
        let pool_name = &devices[0].pool_name;
        let volume_size =
            devices_size / u64::from(disk.logical_block_size.max(1)) * u64::from(block_size);
        let allocation_unit = self.get_allocation_unit(pool_name);

        if allocation_unit == 0 {
            return Err(Error::argument(format!(
                "zero allocation unit for pool: {pool_name}"
            )));
        }

        if volume_size % allocation_unit != 0 {
            return Err(Error::argument(format!(
                "volume size should be divisible by {allocation_unit}"
            )));
        }

        if let Some(device) = devices
            .iter()
            .find(|d| self.new_block_size_breaks_device(disk, disk_id, d, block_size))
        {
            return Err(Error::argument(format!(
                "Device '{}' logical size {} is not equal to new logical size {}, that breaks disk {}",
                device.device_uuid, disk.logical_block_size, block_size, FORCE_NOTICE
            )));
        }

        Ok(Status::Ok)
    }

    /// Change the logical block size of a disk
    ///
    /// Devices whose usable size depends on the block size are trimmed to
    /// keep the old logical size.
    pub fn update_disk_block_size(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        block_size: u32,
        force: bool,
    ) -> Result<Status> {
        let status = self.validate_update_disk_block_size(disk_id, block_size, force)?;
        if status == Status::False {
            return Ok(status);
        }

        let Some(disk) = self.disks.get(disk_id) else {
            return Err(Error::not_found(format!("disk '{disk_id}' not found")));
        };

        let old_block_size = u64::from(disk.logical_block_size.max(1));
        let adjustments: Vec<(DeviceId, u64)> = disk
            .devices
            .iter()
            .filter_map(|uuid| self.device_list.find_device(uuid))
            .filter(|d| self.new_block_size_breaks_device(disk, disk_id, d, block_size))
            .map(|d| {
                let blocks = u64::from(d.block_size)
                    * self.device_block_count_with_overrides(disk_id, d)
                    / old_block_size
                    * old_block_size
                    / u64::from(d.block_size.max(1));
                (d.device_uuid.clone(), blocks)
            })
            .collect();

        for (uuid, blocks) in adjustments {
            self.adjust_device_block_count(db, &uuid, blocks);
        }

        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.logical_block_size = block_size;
        }
        self.update_and_reallocate_disk(db, disk_id);

        info!("Disk '{}' block size changed to {}", disk_id, block_size);

        Ok(Status::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use diskreg_common::{AgentState, StorageConfig};
    use diskreg_store::WriteBatch;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn six_device_state() -> (DiskRegistryState, WriteBatch) {
        create_state(
            StorageConfig::default(),
            vec![
                agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")]),
                agent("a2", 2, &[device("d3", "r2"), device("d4", "r2")]),
                agent("a3", 3, &[device("d5", "r3"), device("d6", "r3")]),
            ],
        )
    }

    #[test]
    fn test_allocate_simple_disk() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent(
                "a1",
                1,
                &[device("d1", "r1"), device("d2", "r1"), device("d3", "r1")],
            )],
        );

        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 2))
            .unwrap();

        assert_eq!(result.status, Status::Ok);
        assert_eq!(result.devices.len(), 2);
        assert_eq!(byte_count(&result.devices), 186 * GIB);
        assert_eq!(result.io_mode, VolumeIoMode::Ok);
        assert!(!result.mute_io_errors);

        let info = state.get_disk_info("vol0").unwrap();
        assert_eq!(info.state, DiskState::Online);
        assert_eq!(info.logical_block_size, 4096);
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let (mut state, mut db) = six_device_state();

        let first = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 2))
            .unwrap();
        let again = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    cloud_id: "cloud".into(),
                    folder_id: "folder".into(),
                    ..disk_params("vol0", 2)
                },
            )
            .unwrap();

        assert_eq!(again.status, Status::Already);
        assert_eq!(again.devices, first.devices);

        // ownership tags are backfilled
        let info = state.get_disk_info("vol0").unwrap();
        assert_eq!(info.cloud_id, "cloud");
        assert_eq!(info.folder_id, "folder");
    }

    #[test]
    fn test_grow_disk() {
        let (mut state, mut db) = six_device_state();

        let first = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        let grown = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 3))
            .unwrap();

        assert_eq!(grown.status, Status::Ok);
        assert_eq!(grown.devices.len(), 3);
        assert_eq!(grown.devices[0], first.devices[0]);
    }

    #[test]
    fn test_allocation_failure_breaks_new_disk() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );

        let err = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 2))
            .unwrap_err();
        assert_eq!(
            err,
            Error::allocation_failed(format!(
                "can't allocate disk with {} blocks x 4096 bytes",
                2 * 93 * GIB / 4096
            ))
        );

        assert!(state.get_disk_info("vol0").unwrap_err().is_not_found());
        assert_eq!(state.get_broken_disks().len(), 1);
        assert_eq!(state.find_disk("d1"), "");
    }

    #[test]
    fn test_block_size_cannot_change_on_reallocation() {
        let (mut state, mut db) = six_device_state();
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        let err = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    block_size: 512,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap_err();
        assert_eq!(err.message(), "attempt to change LogicalBlockSize: 4096 -> 512");

        // the existing disk is untouched
        assert_eq!(state.get_disk_devices("vol0").unwrap().len(), 1);
        assert!(state.get_broken_disks().is_empty());
    }

    #[test]
    fn test_unknown_agents() {
        let (mut state, mut db) = six_device_state();

        let err = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    agent_ids: vec!["a1".into(), "x".into(), "y".into()],
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap_err();
        assert_eq!(err, Error::argument("unknown agents: x, y"));
    }

    #[test]
    fn test_allocate_mirrored_disk() {
        let (mut state, mut db) = six_device_state();

        let result = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 2,
                    media_kind: MediaKind::Mirror3Ssd,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();

        assert_eq!(result.status, Status::Ok);
        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.replicas.len(), 2);

        let group = state.find_placement_group("vol0/g").unwrap();
        assert_eq!(group.placement_strategy, PlacementStrategy::Spread);
        let members: Vec<&str> = group.disks.iter().map(|d| d.disk_id.as_str()).collect();
        assert_eq!(members, vec!["vol0/0", "vol0/1", "vol0/2"]);

        let mut racks = BTreeSet::new();
        for member in &group.disks {
            for rack in &member.device_racks {
                assert!(racks.insert(rack.clone()), "rack {rack} shared");
            }
        }
        assert_eq!(racks.len(), 3);

        for replica in ["vol0/0", "vol0/1", "vol0/2"] {
            let info = state.get_disk_info(replica).unwrap();
            assert_eq!(info.master_disk_id, "vol0");
        }
        assert_eq!(state.get_master_disk_ids(), vec!["vol0".to_string()]);

        let again = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 2,
                    media_kind: MediaKind::Mirror3Ssd,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();
        assert_eq!(again.status, Status::Already);
        assert_eq!(again.devices, result.devices);
        assert_eq!(again.replicas, result.replicas);
    }

    #[test]
    fn test_mirrored_disk_rolls_back() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![
                agent("a1", 1, &[device("d1", "r1")]),
                agent("a2", 2, &[device("d2", "r2")]),
            ],
        );

        let err = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 2,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));

        assert!(state.find_placement_group("vol0/g").is_none());
        assert!(state.get_disk_ids().is_empty());
        assert_eq!(state.find_disk("d1"), "");
        assert_eq!(state.find_disk("d2"), "");
        assert_eq!(state.get_dirty_devices().len(), 2);
        assert_eq!(state.get_broken_disks().len(), 1);
    }

    #[test]
    fn test_reallocate_mirrored_as_simple() {
        let (mut state, mut db) = six_device_state();
        state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 1,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();

        let err = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap_err();
        assert_eq!(
            err,
            Error::invalid_state("attempt to reallocate mirrored disk as nonrepl")
        );

        state
            .allocate_disk(&mut db, now(), &disk_params("vol1", 1))
            .unwrap();
        let err = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 1,
                    ..disk_params("vol1", 1)
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::invalid_state("attempt to reallocate nonrepl disk as mirrored")
        );
    }

    #[test]
    fn test_deallocate_requires_cleanup_mark() {
        let (mut state, mut db) = six_device_state();
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 2))
            .unwrap();

        let err = state.deallocate_disk(&mut db, "vol0").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        state.mark_disk_for_cleanup(&mut db, "vol0").unwrap();
        assert_eq!(state.get_disks_to_cleanup(), vec!["vol0".to_string()]);
        assert_eq!(state.deallocate_disk(&mut db, "vol0").unwrap(), Status::Ok);
        assert_eq!(state.deallocate_disk(&mut db, "vol0").unwrap(), Status::Already);

        assert!(state.get_disks_to_cleanup().is_empty());
        assert!(state.has_pending_cleanup("vol0"));

        let first = &result.devices[0].device_uuid;
        let second = &result.devices[1].device_uuid;
        assert_eq!(state.mark_device_as_clean(&mut db, now(), first), None);
        assert_eq!(
            state.mark_device_as_clean(&mut db, now(), second),
            Some("vol0".to_string())
        );
        assert!(!state.has_pending_cleanup("vol0"));
    }

    #[test]
    fn test_deallocate_mirrored_disk() {
        let (mut state, mut db) = six_device_state();
        state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 1,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();

        state.mark_disk_for_cleanup(&mut db, "vol0").unwrap();
        state.deallocate_disk(&mut db, "vol0").unwrap();

        assert!(state.get_disk_ids().is_empty());
        assert!(state.find_placement_group("vol0/g").is_none());
        assert!(state.get_replica_table_info("vol0").is_none());
        assert_eq!(state.get_dirty_devices().len(), 2);
        assert!(state.has_pending_cleanup("vol0"));
    }

    #[test]
    fn test_update_disk_replica_count() {
        let (mut state, mut db) = six_device_state();
        state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 1,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();

        assert_eq!(
            state.update_disk_replica_count(&mut db, now(), "vol0", 1).unwrap(),
            Status::False
        );
        let err = state
            .update_disk_replica_count(&mut db, now(), "vol0", 0)
            .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        let err = state
            .update_disk_replica_count(&mut db, now(), "vol0/0", 2)
            .unwrap_err();
        assert!(err.message().contains("is not a master"));

        state
            .update_disk_replica_count(&mut db, now(), "vol0", 2)
            .unwrap();
        let info = state.get_disk_info("vol0").unwrap();
        assert_eq!(info.replicas.len(), 2);
        assert_eq!(state.get_replica_table_info("vol0").unwrap().replicas.len(), 3);

        state
            .update_disk_replica_count(&mut db, now(), "vol0", 1)
            .unwrap();
        let info = state.get_disk_info("vol0").unwrap();
        assert_eq!(info.replicas.len(), 1);
        assert!(state.get_disk_info("vol0/2").is_err());
        assert_eq!(state.get_replica_table_info("vol0").unwrap().replicas.len(), 2);
    }

    #[test]
    fn test_mark_replacement_device() {
        let (mut state, mut db) = six_device_state();
        let result = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 1,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();
        let uuid = result.devices[0].device_uuid.clone();

        assert_eq!(
            state.mark_replacement_device(&mut db, "vol0", &uuid, true).unwrap(),
            Status::Ok
        );
        assert_eq!(
            state.mark_replacement_device(&mut db, "vol0", &uuid, true).unwrap(),
            Status::Already
        );
        let info = state.get_replica_table_info("vol0").unwrap();
        assert!(info.replicas[0][0].is_replacement);

        assert_eq!(
            state.mark_replacement_device(&mut db, "vol0", &uuid, false).unwrap(),
            Status::Ok
        );
        assert!(state
            .mark_replacement_device(&mut db, "nope", &uuid, false)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_update_disk_block_size() {
        let (mut state, mut db) = six_device_state();
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        assert_eq!(
            state.update_disk_block_size(&mut db, "vol0", 4096, false).unwrap(),
            Status::False
        );

        let err = state
            .update_disk_block_size(&mut db, "vol0", 512, false)
            .unwrap_err();
        assert!(err.message().starts_with("volume's block size (512)"));

        assert_eq!(
            state.update_disk_block_size(&mut db, "vol0", 8192, false).unwrap(),
            Status::Ok
        );
        assert_eq!(state.get_disk_info("vol0").unwrap().logical_block_size, 8192);

        assert!(state
            .update_disk_block_size(&mut db, "vol1", 8192, false)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_replica_error_triggers_automatic_replacement() {
        let (mut state, mut db) = six_device_state();
        let result = state
            .allocate_disk(
                &mut db,
                now(),
                &AllocateDiskParams {
                    replica_count: 1,
                    ..disk_params("vol0", 1)
                },
            )
            .unwrap();
        let failed = result.devices[0].device_uuid.clone();
        let agent_id = result.devices[0].agent_id.clone();

        state
            .update_agent_state(&mut db, &agent_id, AgentState::Unavailable, now(), "lost")
            .unwrap();

        let devices = state.get_disk_devices("vol0/0").unwrap();
        assert_ne!(devices[0].device_uuid, failed);
        assert!(state.is_automatically_replaced(&failed));
        assert!(state
            .get_disk_info("vol0")
            .unwrap()
            .device_replacement_ids
            .contains(&devices[0].device_uuid));
    }
}
