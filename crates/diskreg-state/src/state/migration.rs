//! Device migrations and device replacement
//!
//! A migration copies a disk's device onto a freshly allocated target while
//! the disk stays online; the copy itself runs outside the registry. Pending
//! migrations wait in a set ordered by `(disk, source)` until the global
//! budget lets them start. A replacement swaps a device out immediately and
//! is what mirrored disks use, since the other replicas hold the data.

use super::DiskRegistryState;
use diskreg_common::critical::{self, CriticalEvent};
use diskreg_common::{
    AgentState, AutomaticallyReplacedDeviceInfo, DeviceConfig, DeviceId, DevicePoolKind,
    DeviceState, DiskId, DiskState, Error, FinishedMigration, Result, Timestamp,
};
use diskreg_placement::AllocationQuery;
use diskreg_store::DiskRegistryDatabase;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl DiskRegistryState {
    /// Queue a device of a disk for migration
    pub(super) fn add_migration(&mut self, disk_id: &str, source_id: &str) {
        let Some(disk) = self.disks.get(disk_id) else {
            return;
        };

        if disk.media_kind.is_local() {
            return;
        }

        let allowed = if disk.is_replica() {
            self.storage_config.mirrored_migration_start_allowed
        } else {
            self.storage_config.non_replicated_migration_start_allowed
        };

        if !allowed {
            debug!(
                "Migration of device '{}' of disk '{}' is not allowed",
                source_id, disk_id
            );
            return;
        }

        self.migrations
            .insert((disk_id.to_string(), source_id.to_string()));
    }

    /// Rebuild the pending migration set after a restore
    pub(super) fn fill_migrations(&mut self) {
        let mut pending = Vec::new();

        for (disk_id, disk) in &self.disks {
            if disk.state == DiskState::Online {
                continue;
            }

            for uuid in &disk.devices {
                if disk.migration_source_to_target.contains_key(uuid) {
                    continue;
                }

                let Some((agent, device)) = self.device_location(uuid) else {
                    critical::report(
                        CriticalEvent::DeviceNotFound,
                        format!("FillMigrations: disk '{disk_id}', device '{uuid}'"),
                    );
                    continue;
                };

                match device.state {
                    DeviceState::Warning => pending.push((disk_id.clone(), uuid.clone())),
                    DeviceState::Error => {}
                    DeviceState::Online => {
                        if agent.state == AgentState::Warning {
                            pending.push((disk_id.clone(), uuid.clone()));
                        }
                    }
                }
            }
        }

        for (disk_id, uuid) in pending {
            self.add_migration(&disk_id, &uuid);
        }
    }

    /// Pending migrations that may start now, as `(disk, source device)`
    #[must_use]
    pub fn build_migration_list(&self) -> Vec<(DiskId, DeviceId)> {
        let max = self
            .storage_config
            .max_non_replicated_device_migrations_in_progress as usize;
        let budget = max.saturating_sub(self.device_migrations_in_progress);
        let limit = budget.min(self.migrations.len());

        self.migrations
            .iter()
            .filter(|(_, uuid)| {
                self.device_location(uuid).is_some_and(|(agent, device)| {
                    agent.state <= AgentState::Warning && device.state <= DeviceState::Warning
                })
            })
            .take(limit)
            .cloned()
            .collect()
    }

    fn validate_start_device_migration(
        &self,
        disk_id: &str,
        source_id: &str,
    ) -> Result<DeviceConfig> {
        let Some(disk) = self.disks.get(disk_id) else {
            return Err(Error::not_found(format!("disk '{disk_id}' not found")));
        };

        if self.find_disk(source_id) != disk_id {
            critical::report(
                CriticalEvent::BadMigrationDevice,
                format!("StartDeviceMigration: disk '{disk_id}', device '{source_id}'"),
            );
            return Err(Error::argument(format!(
                "device '{source_id}' does not belong to '{disk_id}'"
            )));
        }

        if disk.migration_source_to_target.contains_key(source_id) {
            return Err(Error::invalid_state(format!(
                "device '{source_id}' is already migrating"
            )));
        }

        if disk.migration_target_to_source.contains_key(source_id) {
            return Err(Error::invalid_state(format!(
                "device '{source_id}' is a migration target"
            )));
        }

        if !disk.devices.iter().any(|id| id == source_id) {
            return Err(Error::invalid_state(format!(
                "device '{source_id}' is not in use by '{disk_id}'"
            )));
        }

        self.device_list
            .find_device(source_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("device '{source_id}' not found")))
    }

    /// Allocation query for a device able to take over `source`
    fn make_migration_query(
        &self,
        disk_id: &str,
        source: &DeviceConfig,
    ) -> Result<AllocationQuery> {
        let logical_block_size = self
            .disks
            .get(disk_id)
            .map_or(source.block_size, |d| d.logical_block_size);

        let block_count = self.device_block_count_with_overrides(disk_id, source)
            * u64::from(source.block_size)
            / u64::from(logical_block_size.max(1));

        self.make_replacement_query(disk_id, source, logical_block_size, block_count)
    }

    fn make_replacement_query(
        &self,
        disk_id: &str,
        source: &DeviceConfig,
        logical_block_size: u32,
        block_count: u64,
    ) -> Result<AllocationQuery> {
        let pool_kind = self.get_device_pool_kind(&source.pool_name);
        let mut node_ids = BTreeSet::new();
        if pool_kind == DevicePoolKind::Local {
            node_ids.insert(source.node_id);
        }

        Ok(AllocationQuery {
            forbidden_racks: self.collect_forbidden_racks(disk_id)?,
            preferred_racks: self.collect_preferred_racks(disk_id),
            logical_block_size,
            block_count,
            pool_name: source.pool_name.clone(),
            pool_kind,
            node_ids,
        })
    }

    /// Start migrating `source_id` onto a device of the registry's choice
    pub fn start_device_migration(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        source_id: &str,
    ) -> Result<DeviceConfig> {
        let source = self.validate_start_device_migration(disk_id, source_id)?;
        let query = self.make_migration_query(disk_id, &source)?;

        let Some(target) = self.device_list.allocate_device(disk_id, &query) else {
            return Err(Error::allocation_failed(format!(
                "can't allocate target for '{source_id}'"
            )));
        };

        Ok(self.start_device_migration_impl(db, disk_id, source_id, &target, &query))
    }

    /// Start migrating `source_id` onto `target_id`
    pub fn start_device_migration_to(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<DeviceConfig> {
        let source = self.validate_start_device_migration(disk_id, source_id)?;
        let query = self.make_migration_query(disk_id, &source)?;

        let Some(target) = self.device_list.find_device(target_id).cloned() else {
            return Err(Error::not_found(format!(
                "can't find target device '{target_id}'"
            )));
        };

        if !self.device_list.validate_allocation_query(&query, target_id) {
            return Err(Error::allocation_failed(format!(
                "can't migrate from '{source_id}' to '{target_id}'"
            )));
        }

        Ok(self.start_device_migration_impl(db, disk_id, source_id, &target, &query))
    }

    fn start_device_migration_impl(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        source_id: &str,
        target: &DeviceConfig,
        query: &AllocationQuery,
    ) -> DeviceConfig {
        let target_id = target.device_uuid.clone();

        self.adjust_device_block_count(
            db,
            &target_id,
            query.block_count * u64::from(query.logical_block_size)
                / u64::from(target.block_size.max(1)),
        );

        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.migration_target_to_source
                .insert(target_id.clone(), source_id.to_string());
            disk.migration_source_to_target
                .insert(source_id.to_string(), target_id.clone());
        }
        self.device_migrations_in_progress += 1;
        self.migrations
            .remove(&(disk_id.to_string(), source_id.to_string()));

        self.update_placement_group(db, disk_id);
        self.update_and_reallocate_disk(db, disk_id);
        self.device_list.mark_device_allocated(disk_id, &target_id);

        info!(
            "Disk '{}' started migration '{}' -> '{}'",
            disk_id, source_id, target_id
        );

        self.device_list
            .find_device(&target_id)
            .cloned()
            .unwrap_or_else(|| target.clone())
    }

    /// Start over a migration whose target is `target_id`
    ///
    /// Returns false if `target_id` is not a migration target of the disk.
    pub(super) fn restart_device_migration(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        target_id: &str,
    ) -> bool {
        let Some(source_id) = self
            .disks
            .get(disk_id)
            .and_then(|d| d.migration_target_to_source.get(target_id))
            .cloned()
        else {
            return false;
        };

        self.cancel_device_migration(db, disk_id, &source_id);
        self.add_migration(disk_id, &source_id);
        true
    }

    /// Drop a pending or running migration of `source_id`
    ///
    /// The target of a running migration is released once clients
    /// acknowledge the new layout.
    pub(super) fn cancel_device_migration(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        source_id: &str,
    ) {
        self.migrations
            .remove(&(disk_id.to_string(), source_id.to_string()));

        let Some(disk) = self.disks.get_mut(disk_id) else {
            return;
        };
        let Some(target_id) = disk.migration_source_to_target.remove(source_id) else {
            return;
        };
        disk.migration_target_to_source.remove(&target_id);
        self.device_migrations_in_progress = self.device_migrations_in_progress.saturating_sub(1);

        let seq_no = self.add_reallocate_request(db, disk_id);
        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.finished_migrations.push(FinishedMigration {
                device_id: target_id.clone(),
                seq_no,
            });
        }

        self.persist_disk(db, disk_id);
        self.update_placement_group(db, disk_id);

        info!(
            "Disk '{}' cancelled migration '{}' -> '{}'",
            disk_id, source_id, target_id
        );
    }

    /// Commit a completed copy; returns whether the disk state changed
    pub fn finish_device_migration(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        source_id: &str,
        target_id: &str,
        now: Timestamp,
    ) -> Result<bool> {
        let Some(disk) = self.disks.get_mut(disk_id) else {
            return Err(Error::not_found(format!("disk '{disk_id}' not found")));
        };

        if disk
            .migration_target_to_source
            .get(target_id)
            .is_none_or(|s| s != source_id)
        {
            return Err(Error::argument("invalid migration"));
        }

        disk.migration_target_to_source.remove(target_id);
        disk.migration_source_to_target.remove(source_id);
        self.device_migrations_in_progress = self.device_migrations_in_progress.saturating_sub(1);

        let seq_no = self.add_reallocate_request(db, disk_id);

        if let Some(disk) = self.disks.get_mut(disk_id) {
            if let Some(pos) = disk.devices.iter().position(|id| id == source_id) {
                disk.devices[pos] = target_id.to_string();
                disk.finished_migrations.push(FinishedMigration {
                    device_id: source_id.to_string(),
                    seq_no,
                });

                if disk.is_replica() {
                    let replaced =
                        self.replica_table
                            .replace_device(&disk.master_disk_id, source_id, target_id);
                    debug_assert!(replaced);
                }
            }
        }

        let updated = self.try_update_disk_state(db, disk_id, now);
        self.persist_disk(db, disk_id);
        self.update_placement_group(db, disk_id);

        info!(
            "Disk '{}' finished migration '{}' -> '{}'",
            disk_id, source_id, target_id
        );

        Ok(updated)
    }

    /// Release migration sources acknowledged up to `seq_no`
    pub(super) fn remove_finished_migrations(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        seq_no: u64,
    ) {
        let Some(disk) = self.disks.get_mut(disk_id) else {
            return;
        };

        if disk.replica_count > 0 {
            let replica_count = disk.replica_count;
            for replica_id in diskreg_common::DiskRef::replica_ids(disk_id, replica_count) {
                self.remove_finished_migrations(db, &replica_id, seq_no);
            }
            return;
        }

        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut disk.finished_migrations)
            .into_iter()
            .partition(|m| m.seq_no <= seq_no);
        disk.finished_migrations = kept;

        if released.is_empty() {
            return;
        }

        for m in &released {
            self.device_list.release_device(&m.device_id);
            db.update_dirty_device(&m.device_id, disk_id);
            self.pending_cleanup.insert(disk_id, &m.device_id);
        }

        self.persist_disk(db, disk_id);
    }

    fn allocate_replacement_device(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        replacement_id: &str,
        query: &AllocationQuery,
        now: Timestamp,
        message: &str,
    ) -> Result<DeviceConfig> {
        if replacement_id.is_empty() {
            return self
                .device_list
                .allocate_device(disk_id, query)
                .ok_or_else(|| Error::allocation_failed("can't allocate device"));
        }

        let device = self
            .device_list
            .allocate_specific_device(disk_id, replacement_id, query)
            .map_err(|e| {
                Error::allocation_failed(format!(
                    "can't allocate specific device '{replacement_id}' : {}",
                    e.message()
                ))
            })?;

        db.delete_dirty_device(replacement_id);

        if self.is_automatically_replaced(replacement_id) {
            self.delete_automatically_replaced_device(db, replacement_id);
        }

        if device.state != DeviceState::Online {
            self.adjust_device_state(db, replacement_id, DeviceState::Online, now, message);
        }

        Ok(self
            .device_list
            .find_device(replacement_id)
            .cloned()
            .unwrap_or(device))
    }

    /// Swap a device of a disk for a fresh one (or for `replacement_id`)
    ///
    /// Returns whether the disk state changed.
    #[allow(clippy::too_many_arguments)]
    pub fn replace_device(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        device_id: &str,
        replacement_id: &str,
        now: Timestamp,
        message: &str,
        manual: bool,
    ) -> Result<bool> {
        if disk_id.is_empty() {
            return Err(Error::argument("empty disk id"));
        }

        if device_id.is_empty() {
            return Err(Error::argument("empty device id"));
        }

        if self.find_disk(device_id) != disk_id {
            return Err(Error::argument(format!(
                "device does not belong to disk '{disk_id}'"
            )));
        }

        let Some(disk) = self.disks.get(disk_id) else {
            return Err(Error::argument(format!("unknown disk: '{disk_id}'")));
        };

        if !disk.devices.iter().any(|id| id == device_id) {
            critical::report(
                CriticalEvent::DeviceNotFound,
                format!("ReplaceDevice: disk '{disk_id}', device '{device_id}'"),
            );
            return Err(Error::fail(format!(
                "device '{device_id}' not found in disk '{disk_id}'"
            )));
        }

        let logical_block_size = disk.logical_block_size;
        let master_id = disk.master_disk_id.clone();

        let Some((_, source)) = self.device_location(device_id) else {
            return Err(Error::invalid_state("can't find device"));
        };
        let source = source.clone();

        let logical_block_count = u64::from(source.block_size) * source.blocks_count
            / u64::from(logical_block_size.max(1));
        let query =
            self.make_replacement_query(disk_id, &source, logical_block_size, logical_block_count)?;

        let target = match self.allocate_replacement_device(
            db,
            disk_id,
            replacement_id,
            &query,
            now,
            message,
        ) {
            Ok(target) => target,
            Err(e) => {
                self.try_update_disk_state(db, disk_id, now);
                return Err(e);
            }
        };
        let target_id = target.device_uuid.clone();

        self.adjust_device_block_count(
            db,
            &target_id,
            logical_block_count * u64::from(logical_block_size)
                / u64::from(target.block_size.max(1)),
        );

        if !master_id.is_empty() {
            if let Some(master) = self.disks.get_mut(&master_id) {
                match master
                    .device_replacement_ids
                    .iter()
                    .position(|id| id == device_id)
                {
                    Some(pos) => master.device_replacement_ids[pos].clone_from(&target_id),
                    None => master.device_replacement_ids.push(target_id.clone()),
                }
            }
            self.persist_disk(db, &master_id);

            let replaced = self
                .replica_table
                .replace_device(&master_id, device_id, &target_id);
            debug_assert!(replaced);
        }

        if !manual {
            let info = AutomaticallyReplacedDeviceInfo {
                device_id: device_id.to_string(),
                replacement_ts: now,
            };
            db.add_automatically_replaced_device(&info);
            self.automatically_replaced_device_ids
                .insert(device_id.to_string());
            self.automatically_replaced_devices.push_back(info);
        }

        if let Some((agent_id, device)) = self.device_mut(device_id) {
            if manual {
                device.state = DeviceState::Error;
            }
            device.state_message = message.to_string();
            device.state_ts = now;
            self.sync_agent(db, &agent_id);
        }

        self.device_list.release_device(device_id);
        db.update_dirty_device(device_id, disk_id);

        self.cancel_device_migration(db, disk_id, device_id);

        if let Some(disk) = self.disks.get_mut(disk_id) {
            if let Some(pos) = disk.devices.iter().position(|id| id == device_id) {
                disk.devices[pos].clone_from(&target_id);
            }
        }

        let updated = self.try_update_disk_state(db, disk_id, now);

        self.update_placement_group(db, disk_id);
        self.update_and_reallocate_disk(db, disk_id);

        self.pending_cleanup.insert(disk_id, device_id);

        info!(
            "Disk '{}' device '{}' replaced by '{}' ({})",
            disk_id, device_id, target_id, message
        );

        Ok(updated)
    }

    /// Replace a failed device of a mirrored replica
    pub(super) fn replace_device_automatically(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        device_id: &str,
        now: Timestamp,
        reason: &str,
    ) -> Result<bool> {
        let master_id = self
            .disks
            .get(disk_id)
            .map(|d| d.master_disk_id.clone())
            .unwrap_or_default();

        let message = format!("MirroredDiskId={master_id}, ReplacementReason={reason}");
        self.replace_device(db, disk_id, device_id, "", now, &message, false)
    }

    /// Running migrations of a disk as `(source, target)`, sorted by source
    pub fn get_disk_migrations(&self, disk_id: &str) -> Result<Vec<(DeviceId, DeviceId)>> {
        let Some(disk) = self.disks.get(disk_id) else {
            return Err(Error::not_found(format!("disk '{disk_id}' not found")));
        };

        Ok(disk
            .migration_source_to_target
            .iter()
            .map(|(s, t)| (s.clone(), t.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use diskreg_common::{StorageConfig, Status};

    fn migrating_state() -> (DiskRegistryState, diskreg_store::WriteBatch, DeviceId) {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![
                agent("a1", 1, &[device("d1", "r1")]),
                agent("a2", 2, &[device("d2", "r2")]),
            ],
        );
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        let source = result.devices[0].device_uuid.clone();
        let agent_id = result.devices[0].agent_id.clone();

        state
            .update_agent_state(&mut db, &agent_id, AgentState::Warning, now(), "maintenance")
            .unwrap();

        (state, db, source)
    }

    #[test]
    fn test_migration_lifecycle() {
        let (mut state, mut db, source) = migrating_state();
        assert_eq!(
            state.build_migration_list(),
            vec![("vol0".to_string(), source.clone())]
        );

        let target = state
            .start_device_migration(&mut db, "vol0", &source)
            .unwrap();
        assert_ne!(target.device_uuid, source);
        assert!(state.build_migration_list().is_empty());
        assert_eq!(
            state.get_disk_migrations("vol0").unwrap(),
            vec![(source.clone(), target.device_uuid.clone())]
        );

        state
            .finish_device_migration(&mut db, "vol0", &source, &target.device_uuid, now())
            .unwrap();

        let devices = state.get_disk_devices("vol0").unwrap();
        assert_eq!(devices[0].device_uuid, target.device_uuid);
        assert!(state.get_disk_migrations("vol0").unwrap().is_empty());

        // the source is released only after the clients acknowledge
        assert_eq!(state.find_disk(&source), "vol0");
        let err = state
            .start_device_migration(&mut db, "vol0", &source)
            .unwrap_err();
        assert_eq!(
            err,
            Error::invalid_state(format!("device '{source}' is not in use by 'vol0'"))
        );
        assert!(state.build_migration_list().is_empty());
        let (_, seq_no) = state.get_disks_to_reallocate().pop().unwrap();
        state.delete_disk_to_reallocate(&mut db, "vol0", seq_no);
        assert_eq!(state.find_disk(&source), "");
        assert!(state.get_dirty_devices().iter().any(|d| d.device_uuid == source));
    }

    #[test]
    fn test_finish_unknown_migration() {
        let (mut state, mut db, source) = migrating_state();
        let before = state.get_disk_devices("vol0").unwrap();

        let err = state
            .finish_device_migration(&mut db, "vol0", &source, "d9", now())
            .unwrap_err();
        assert_eq!(err, Error::argument("invalid migration"));
        assert_eq!(state.get_disk_devices("vol0").unwrap(), before);
        assert!(state.get_disk_migrations("vol0").unwrap().is_empty());

        let err = state
            .finish_device_migration(&mut db, "nope", &source, "d9", now())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_start_migration_validation() {
        let (mut state, mut db, source) = migrating_state();

        let err = state
            .start_device_migration(&mut db, "vol1", &source)
            .unwrap_err();
        assert!(err.is_not_found());

        let other = if source == "d1" { "d2" } else { "d1" };
        let err = state
            .start_device_migration(&mut db, "vol0", other)
            .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));

        let err = state
            .start_device_migration_to(&mut db, "vol0", &source, "d9")
            .unwrap_err();
        assert_eq!(err.message(), "can't find target device 'd9'");
    }

    #[test]
    fn test_start_migration_twice_is_refused() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![
                agent("a1", 1, &[device("d1", "r1"), device("d4", "r1")]),
                agent("a2", 2, &[device("d2", "r2"), device("d3", "r2")]),
            ],
        );
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        let source = result.devices[0].device_uuid.clone();
        let agent_id = result.devices[0].agent_id.clone();
        state
            .update_agent_state(&mut db, &agent_id, AgentState::Warning, now(), "")
            .unwrap();

        let target = state
            .start_device_migration(&mut db, "vol0", &source)
            .unwrap()
            .device_uuid;

        let err = state
            .start_device_migration(&mut db, "vol0", &source)
            .unwrap_err();
        assert_eq!(
            err,
            Error::invalid_state(format!("device '{source}' is already migrating"))
        );

        let err = state
            .start_device_migration(&mut db, "vol0", &target)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let disk = &state.disks["vol0"];
        assert_eq!(disk.migration_source_to_target.len(), 1);
        assert_eq!(disk.migration_target_to_source.len(), 1);
        assert_eq!(disk.migration_target_to_source[&target], source);
        assert_eq!(state.device_migrations_in_progress, 1);
        assert_eq!(state.device_list.allocated_device_ids().count(), 2);
    }

    #[test]
    fn test_cancel_on_target_failure_restarts() {
        let (mut state, mut db, source) = migrating_state();
        let target = state
            .start_device_migration(&mut db, "vol0", &source)
            .unwrap();

        state
            .update_device_state(&mut db, &target.device_uuid, DeviceState::Error, now(), "")
            .unwrap();

        assert!(state.get_disk_migrations("vol0").unwrap().is_empty());
        assert_eq!(
            state.build_migration_list(),
            vec![("vol0".to_string(), source)]
        );
    }

    #[test]
    fn test_manual_replace_device() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![
                agent("a1", 1, &[device("d1", "r1")]),
                agent("a2", 2, &[device("d2", "r2")]),
            ],
        );
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        assert_eq!(result.status, Status::Ok);
        let source = result.devices[0].device_uuid.clone();

        let err = state
            .replace_device(&mut db, "vol0", "d9", "", now(), "", true)
            .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));

        state
            .replace_device(&mut db, "vol0", &source, "", now(), "broken", true)
            .unwrap();

        let device = state.get_device(&source).unwrap();
        assert_eq!(device.state, DeviceState::Error);
        assert_eq!(device.state_message, "broken");
        assert_eq!(state.find_disk(&source), "");
        assert!(!state.is_automatically_replaced(&source));

        let devices = state.get_disk_devices("vol0").unwrap();
        assert_ne!(devices[0].device_uuid, source);

        let err = state
            .replace_device(&mut db, "vol0", &devices[0].device_uuid, "", now(), "", true)
            .unwrap_err();
        assert!(matches!(err, Error::AllocationFailed(_)));
    }
}
