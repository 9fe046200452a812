//! Placement groups
//!
//! Every member of a group records the racks its devices (and migration
//! targets) occupy. Allocation for a member forbids the racks of the other
//! members, or of the other partitions under the partition strategy, and
//! prefers the racks the member already uses. Group changes are guarded by
//! the group's config version.

use super::{Disk, DiskRegistryState};
use diskreg_common::critical::{self, CriticalEvent};
use diskreg_common::{
    DiskId, Error, GroupId, PlacementGroupConfig, PlacementGroupDisk, PlacementGroupSettings,
    PlacementStrategy, Result, Status, StorageConfig,
};
use diskreg_placement::DeviceList;
use diskreg_store::DiskRegistryDatabase;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Group and partition a disk is placed into
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(super) struct PlacementInfo {
    pub group_id: GroupId,
    pub partition_index: u32,
}

/// Outcome of a membership change
///
/// Additions are all-or-nothing. When some disks cannot join, `outcome` is
/// `PreconditionFailed` and `failed_to_add` lists them so the caller can
/// retry without them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub outcome: Result<()>,
    pub failed_to_add: Vec<DiskId>,
}

impl MembershipUpdate {
    fn failed(error: Error) -> Self {
        Self {
            outcome: Err(error),
            failed_to_add: Vec::new(),
        }
    }
}

/// Member limit of a group
pub(super) fn max_disks_in_group(config: &StorageConfig, group: &PlacementGroupConfig) -> u32 {
    if group.settings.max_disks_in_group != 0 {
        return group.settings.max_disks_in_group;
    }

    match group.placement_strategy {
        PlacementStrategy::Partition => config.max_disks_in_partition_placement_group,
        PlacementStrategy::Spread => config.max_disks_in_placement_group,
    }
}

/// Split the racks of a group into the ones `disk_id` must avoid and the
/// ones it should prefer
///
/// Returns the position of `disk_id` in the group, if it is a member.
fn collect_racks(
    disk_id: &str,
    partition_index: u32,
    group: &PlacementGroupConfig,
    forbidden: &mut BTreeSet<String>,
    preferred: &mut BTreeSet<String>,
) -> Option<usize> {
    let mut this_disk = None;

    for (pos, member) in group.disks.iter().enumerate() {
        let same_partition = member.disk_id == disk_id
            || (group.must_have_partitions()
                && member.placement_partition_index == partition_index);

        if member.disk_id == disk_id {
            if this_disk.is_some() {
                critical::report(
                    CriticalEvent::InvalidPlacementGroupPartition,
                    format!(
                        "CollectRacks: duplicate disk '{}' in group '{}'",
                        disk_id, group.group_id
                    ),
                );
            }
            this_disk = Some(pos);
        }

        let racks = if same_partition {
            &mut *preferred
        } else {
            &mut *forbidden
        };
        racks.extend(member.device_racks.iter().cloned());
    }

    this_disk
}

/// Racks occupied by the devices and migration targets of a disk
fn disk_racks(device_list: &DeviceList, disk: &Disk) -> Vec<String> {
    disk.devices
        .iter()
        .chain(disk.migration_target_to_source.keys())
        .map(|uuid| device_list.find_rack(uuid))
        .filter(|rack| !rack.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl DiskRegistryState {
    /// Create a placement group
    ///
    /// Spread groups take no partition count; partition groups need between
    /// 2 and `max_placement_partition_count` partitions.
    pub fn create_placement_group(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        group_id: &str,
        strategy: PlacementStrategy,
        partition_count: u32,
    ) -> Result<Status> {
        if self.placement_groups.contains_key(group_id) {
            return Ok(Status::Already);
        }

        match strategy {
            PlacementStrategy::Spread if partition_count != 0 => {
                return Err(Error::argument(
                    "Partition count for spread placement group shouldn't be specified",
                ));
            }
            PlacementStrategy::Partition
                if partition_count < 2
                    || partition_count > self.storage_config.max_placement_partition_count =>
            {
                return Err(Error::argument(format!(
                    "Partitions count must be between 2 and {}",
                    self.storage_config.max_placement_partition_count
                )));
            }
            _ => {}
        }

        let group = PlacementGroupConfig {
            group_id: group_id.to_string(),
            config_version: 1,
            placement_strategy: strategy,
            placement_partition_count: partition_count,
            ..Default::default()
        };
        db.update_placement_group(&group);
        self.placement_groups.insert(group_id.to_string(), group);

        info!("Placement group '{}' created ({})", group_id, strategy);

        Ok(Status::Ok)
    }

    /// Destroy a placement group, detaching its members
    ///
    /// Returns the detached disks; their volume configs become outdated.
    pub fn destroy_placement_group(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        group_id: &str,
    ) -> (Status, Vec<DiskId>) {
        let Some(group) = self.placement_groups.remove(group_id) else {
            return (Status::Already, Vec::new());
        };

        let mut affected_disks = Vec::with_capacity(group.disks.len());

        for member in &group.disks {
            let Some(disk) = self.disks.get_mut(&member.disk_id) else {
                critical::report(
                    CriticalEvent::DiskNotFound,
                    format!(
                        "DestroyPlacementGroup: disk '{}', group '{}'",
                        member.disk_id, group_id
                    ),
                );
                continue;
            };

            disk.placement_group_id.clear();
            self.notifications
                .add_outdated_volume_config(db, &member.disk_id);
            affected_disks.push(member.disk_id.clone());
        }

        db.delete_placement_group(group_id);

        info!(
            "Placement group '{}' destroyed, {} disks detached",
            group_id,
            affected_disks.len()
        );

        (Status::Ok, affected_disks)
    }

    /// Check the caller saw the latest version of a group
    pub fn check_placement_group_version(&self, group_id: &str, config_version: u32) -> Result<()> {
        let Some(group) = self.placement_groups.get(group_id) else {
            return Err(Error::not_found(format!("group does not exist: {group_id}")));
        };

        if group.config_version != config_version {
            return Err(Error::aborted(format!(
                "received version != expected version: {} != {}",
                config_version, group.config_version
            )));
        }

        Ok(())
    }

    pub fn update_placement_group_settings(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        group_id: &str,
        config_version: u32,
        settings: PlacementGroupSettings,
    ) -> Result<()> {
        self.check_placement_group_version(group_id, config_version)?;

        if let Some(group) = self.placement_groups.get_mut(group_id) {
            group.config_version = config_version + 1;
            group.settings.max_disks_in_group = settings.max_disks_in_group;
            db.update_placement_group(group);
        }

        Ok(())
    }

    /// Add and remove members of a group in one versioned step
    pub fn alter_placement_group_membership(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        group_id: &str,
        partition_index: u32,
        config_version: u32,
        disks_to_add: &[DiskId],
        disks_to_remove: &[DiskId],
    ) -> MembershipUpdate {
        if let Err(e) = self.check_placement_group_version(group_id, config_version) {
            return MembershipUpdate::failed(e);
        }

        if !disks_to_add.is_empty() {
            let info = PlacementInfo {
                group_id: group_id.to_string(),
                partition_index,
            };
            if let Err(e) = self.check_disk_placement_info(&info) {
                return MembershipUpdate::failed(e);
            }
        }

        let Some(mut group) = self.placement_groups.get(group_id).cloned() else {
            return MembershipUpdate::failed(Error::not_found(format!(
                "group does not exist: {group_id}"
            )));
        };

        group
            .disks
            .retain(|d| !disks_to_remove.contains(&d.disk_id));

        let mut failed_to_add = Vec::new();
        let mut disk_to_racks: BTreeMap<DiskId, BTreeSet<String>> = BTreeMap::new();

        for disk_id in disks_to_add {
            let in_place = group.disks.iter().any(|d| {
                d.disk_id == *disk_id
                    && (!group.must_have_partitions()
                        || d.placement_partition_index == partition_index)
            });
            if in_place {
                continue;
            }

            let Some(disk) = self.disks.get(disk_id) else {
                return MembershipUpdate::failed(Error::argument(format!(
                    "no such nonreplicated disk: {disk_id} - wrong media kind specified during disk creation?"
                )));
            };

            if !disk.placement_group_id.is_empty() {
                failed_to_add.push(disk_id.clone());
                continue;
            }

            let mut forbidden = BTreeSet::new();
            let mut preferred = BTreeSet::new();
            collect_racks(disk_id, partition_index, &group, &mut forbidden, &mut preferred);

            // disks added earlier in this call already claim their racks
            if group.placement_strategy == PlacementStrategy::Spread {
                for racks in disk_to_racks.values() {
                    forbidden.extend(racks.iter().cloned());
                }
            }

            let racks: BTreeSet<String> = disk
                .devices
                .iter()
                .map(|uuid| self.device_list.find_rack(uuid).to_string())
                .collect();

            if racks.iter().any(|rack| forbidden.contains(rack)) {
                failed_to_add.push(disk_id.clone());
                continue;
            }

            disk_to_racks.insert(disk_id.clone(), racks);
        }

        if !failed_to_add.is_empty() {
            return MembershipUpdate {
                outcome: Err(Error::PreconditionFailed("failed to add some disks".into())),
                failed_to_add,
            };
        }

        let max = max_disks_in_group(&self.storage_config, &group);
        if group.disks.len() + disk_to_racks.len() > max as usize {
            return MembershipUpdate::failed(Error::silently_exhausted(format!(
                "max disk count in group exceeded, max: {max}"
            )));
        }

        for (disk_id, racks) in disk_to_racks {
            group.disks.push(PlacementGroupDisk {
                disk_id,
                device_racks: racks.into_iter().collect(),
                placement_partition_index: partition_index,
            });
        }
        group.config_version = config_version + 1;
        db.update_placement_group(&group);
        self.placement_groups.insert(group_id.to_string(), group);

        for disk_id in disks_to_add {
            let Some(disk) = self.disks.get_mut(disk_id) else {
                critical::report(
                    CriticalEvent::DiskNotFound,
                    format!("AlterPlacementGroupMembership: disk '{disk_id}', group '{group_id}'"),
                );
                continue;
            };
            disk.placement_group_id = group_id.to_string();
            disk.placement_partition_index = partition_index;
            self.notifications.add_outdated_volume_config(db, disk_id);
        }

        for disk_id in disks_to_remove {
            if disks_to_add.contains(disk_id) {
                continue;
            }
            if let Some(disk) = self.disks.get_mut(disk_id) {
                disk.placement_group_id.clear();
                disk.placement_partition_index = 0;
                self.notifications.add_outdated_volume_config(db, disk_id);
            }
        }

        info!(
            "Placement group '{}' membership changed: +{} -{}",
            group_id,
            disks_to_add.len(),
            disks_to_remove.len()
        );

        MembershipUpdate {
            outcome: Ok(()),
            failed_to_add: Vec::new(),
        }
    }

    #[must_use]
    pub fn find_placement_group(&self, group_id: &str) -> Option<&PlacementGroupConfig> {
        self.placement_groups.get(group_id)
    }

    #[must_use]
    pub fn get_placement_group_ids(&self) -> Vec<GroupId> {
        self.placement_groups.keys().cloned().collect()
    }

    /// Check a disk may be placed into the given group and partition
    pub(super) fn check_disk_placement_info(&self, info: &PlacementInfo) -> Result<()> {
        let Some(group) = self.placement_groups.get(&info.group_id) else {
            return Err(Error::not_found(format!(
                "placement group {} not found",
                info.group_id
            )));
        };

        if info.partition_index != 0 && !group.must_have_partitions() {
            return Err(Error::argument(format!(
                "placement partition shouldn't be specified for placement group '{}'",
                info.group_id
            )));
        }

        if !group.partition_suits(info.partition_index) {
            return Err(Error::not_found(format!(
                "placement partition index {} not found in placement group '{}'",
                info.partition_index, info.group_id
            )));
        }

        Ok(())
    }

    /// Check a group has room for one more member
    pub(super) fn check_placement_group_capacity(&self, group_id: &str) -> Result<()> {
        let Some(group) = self.placement_groups.get(group_id) else {
            return Err(Error::not_found(format!("placement group {group_id} not found")));
        };

        let max = max_disks_in_group(&self.storage_config, group);
        if group.disks.len() < max as usize {
            return Ok(());
        }

        Err(Error::silently_exhausted(format!(
            "max disk count in group exceeded, max: {max}"
        )))
    }

    /// Join a disk to its group (if any) and record its racks
    pub(super) fn update_disk_placement_info(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        info: &PlacementInfo,
    ) {
        if info.group_id.is_empty() {
            return;
        }

        let Some(disk) = self.disks.get_mut(disk_id) else {
            return;
        };
        disk.placement_group_id.clone_from(&info.group_id);
        disk.placement_partition_index = info.partition_index;

        let racks = disk_racks(&self.device_list, disk);

        let Some(group) = self.placement_groups.get_mut(&info.group_id) else {
            critical::report(
                CriticalEvent::PlacementGroupNotFound,
                format!("UpdateDiskPlacementInfo: disk '{}', group '{}'", disk_id, info.group_id),
            );
            return;
        };

        let pos = match group.disks.iter().position(|d| d.disk_id == disk_id) {
            Some(pos) => pos,
            None => {
                group.disks.push(PlacementGroupDisk {
                    disk_id: disk_id.to_string(),
                    ..Default::default()
                });
                group.disks.len() - 1
            }
        };

        group.disks[pos].device_racks = racks;
        group.disks[pos].placement_partition_index = info.partition_index;
        group.config_version += 1;
        db.update_placement_group(group);
    }

    /// Refresh the racks a disk occupies in its group
    ///
    /// Returns false if the disk is not placed.
    pub(super) fn update_placement_group(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) -> bool {
        let Some(disk) = self.disks.get(disk_id) else {
            return false;
        };

        if disk.placement_group_id.is_empty() {
            return false;
        }

        let racks = disk_racks(&self.device_list, disk);
        let partition_index = disk.placement_partition_index;

        let Some(group) = self.placement_groups.get_mut(&disk.placement_group_id) else {
            critical::report(
                CriticalEvent::PlacementGroupNotFound,
                format!(
                    "UpdatePlacementGroup: disk '{}', group '{}'",
                    disk_id, disk.placement_group_id
                ),
            );
            return false;
        };

        let Some(member) = group.disks.iter_mut().find(|d| d.disk_id == disk_id) else {
            critical::report(
                CriticalEvent::DiskNotFound,
                format!(
                    "UpdatePlacementGroup: disk '{}' is not a member of group '{}'",
                    disk_id, group.group_id
                ),
            );
            return false;
        };

        member.device_racks = racks;
        member.placement_partition_index = partition_index;
        group.config_version += 1;
        db.update_placement_group(group);

        true
    }

    /// Racks a new device of `disk_id` must not use
    ///
    /// Fails if the disk's group or its membership record is missing.
    pub(super) fn collect_forbidden_racks(&self, disk_id: &str) -> Result<BTreeSet<String>> {
        let mut forbidden = BTreeSet::new();

        let Some(disk) = self.disks.get(disk_id) else {
            return Ok(forbidden);
        };

        if disk.placement_group_id.is_empty() {
            return Ok(forbidden);
        }

        let Some(group) = self.placement_groups.get(&disk.placement_group_id) else {
            let message = format!(
                "CollectForbiddenRacks: disk '{}', group '{}'",
                disk_id, disk.placement_group_id
            );
            critical::report(CriticalEvent::PlacementGroupNotFound, message.clone());
            return Err(Error::fail(message));
        };

        let mut preferred = BTreeSet::new();
        if collect_racks(
            disk_id,
            disk.placement_partition_index,
            group,
            &mut forbidden,
            &mut preferred,
        )
        .is_none()
        {
            let message = format!(
                "CollectForbiddenRacks: disk '{}' is not a member of group '{}'",
                disk_id, group.group_id
            );
            critical::report(CriticalEvent::DiskNotFound, message.clone());
            return Err(Error::fail(message));
        }

        Ok(forbidden)
    }

    /// Racks the devices of `disk_id` already occupy
    pub(super) fn collect_preferred_racks(&self, disk_id: &str) -> BTreeSet<String> {
        self.disks.get(disk_id).map_or_else(BTreeSet::new, |disk| {
            disk.devices
                .iter()
                .map(|uuid| self.device_list.find_rack(uuid).to_string())
                .collect()
        })
    }

    /// Forbidden and preferred racks for a disk that is about to join (or
    /// grow inside) a group
    pub(super) fn collect_group_racks(
        &self,
        disk_id: &str,
        info: &PlacementInfo,
    ) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut forbidden = BTreeSet::new();
        let mut preferred = BTreeSet::new();

        if let Some(group) = self.placement_groups.get(&info.group_id) {
            collect_racks(
                disk_id,
                info.partition_index,
                group,
                &mut forbidden,
                &mut preferred,
            );
        }

        (forbidden, preferred)
    }
}
