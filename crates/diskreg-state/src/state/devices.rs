//! Device state transitions, the CMS device protocol and device administration

use super::{AllocateDiskResult, CmsUpdate, Disk, DiskRegistryState};
use diskreg_common::critical::{self, CriticalEvent};
use diskreg_common::{
    DeviceConfig, DeviceId, DeviceState, DiskId, Error, Result, Status,
    SuspendedDevice, Timestamp,
};
use diskreg_store::DiskRegistryDatabase;
use std::time::Duration;
use tracing::{info, warn};

const REPLACEMENT_WINDOW: Duration = Duration::from_secs(3600);

impl DiskRegistryState {
    fn check_device_state_transition(
        &self,
        device_id: &str,
        new_state: DeviceState,
        ts: Timestamp,
    ) -> Result<Status> {
        let Some(device) = self.device_list.find_device(device_id) else {
            return Err(Error::not_found(format!("device '{device_id}' not found")));
        };

        if device.state == new_state {
            return Ok(Status::Already);
        }

        if device.state_ts > ts {
            return Err(Error::invalid_state("out of order"));
        }

        Ok(Status::Ok)
    }

    /// Apply a health report for a device; returns the disk whose state changed
    pub fn update_device_state(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
        new_state: DeviceState,
        now: Timestamp,
        reason: &str,
    ) -> Result<Option<DiskId>> {
        self.check_device_state_transition(device_id, new_state, now)?;

        let Some((agent, _)) = self.device_location(device_id) else {
            critical::report(
                CriticalEvent::DeviceNotFound,
                format!("UpdateDeviceState: device '{device_id}'"),
            );
            return Err(Error::fail(format!("device '{device_id}' not found")));
        };
        let timeout = super::agents::infra_timeout(&self.storage_config, agent.state);

        let Some((_, device)) = self.device_mut(device_id) else {
            return Err(Error::fail(format!("device '{device_id}' not found")));
        };

        let cms_request_active = !device.cms_ts.is_zero() && device.cms_ts + timeout > now;
        if !cms_request_active {
            device.cms_ts = Timestamp::ZERO;
        }

        if new_state >= DeviceState::Warning || !cms_request_active {
            device.state = new_state;
        }
        device.state_ts = now;
        device.state_message = reason.to_string();

        Ok(self.apply_device_state_change(db, device_id, now))
    }

    /// Maintenance request for a single device
    ///
    /// Follows the host protocol: a device backing a live disk is taken away
    /// only once the infra timeout has passed. A broken device cannot be
    /// brought back online this way.
    pub fn update_cms_device_state(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
        new_state: DeviceState,
        now: Timestamp,
        dry_run: bool,
    ) -> Result<CmsUpdate> {
        self.check_device_state_transition(device_id, new_state, now)?;

        let Some((agent, device)) = self.device_location(device_id) else {
            critical::report(
                CriticalEvent::DeviceNotFound,
                format!("UpdateCmsDeviceState: device '{device_id}'"),
            );
            return Err(Error::fail(format!("device '{device_id}' not found")));
        };

        let state = device.state;
        let disk_id = self.find_disk(device_id).to_string();
        let has_dependent_disk =
            !disk_id.is_empty() && state < DeviceState::Error && new_state != DeviceState::Online;

        let mut cms_ts = if device.cms_ts.is_zero() {
            now
        } else {
            device.cms_ts
        };
        let mut timeout = Duration::ZERO;
        if has_dependent_disk {
            timeout = (cms_ts + super::agents::infra_timeout(&self.storage_config, agent.state))
                .saturating_duration_since(now);
        }

        let mut outcome = if timeout.is_zero() {
            cms_ts = Timestamp::ZERO;
            Ok(())
        } else {
            Err(Error::try_again(
                format!("have dependent disk: {disk_id}"),
                timeout,
            ))
        };

        if state == DeviceState::Error && new_state == DeviceState::Online {
            if timeout.is_zero() {
                timeout = self.storage_config.cms_update_state_to_online_timeout();
            }
            outcome = Err(Error::try_again("device is in error state", timeout));
        }

        if dry_run {
            return Ok(CmsUpdate {
                outcome,
                timeout,
                affected_disks: Vec::new(),
            });
        }

        if let Some((_, device)) = self.device_mut(device_id) {
            if device.state != DeviceState::Error {
                device.state = new_state;
                device.state_message = "cms action".to_string();
            }
            device.state_ts = now;
            device.cms_ts = cms_ts;
        }

        let affected_disks = self
            .apply_device_state_change(db, device_id, now)
            .into_iter()
            .collect();

        Ok(CmsUpdate {
            outcome,
            timeout,
            affected_disks,
        })
    }

    fn apply_device_state_change(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
        now: Timestamp,
    ) -> Option<DiskId> {
        let agent_id = self.device_list.find_agent_id(device_id).to_string();
        self.sync_agent(db, &agent_id);

        let disk_id = self.find_disk(device_id).to_string();
        if disk_id.is_empty() {
            return None;
        }

        let Some(disk) = self.disks.get(&disk_id) else {
            critical::report(
                CriticalEvent::DiskNotFound,
                format!("ApplyDeviceStateChange: disk '{disk_id}'"),
            );
            return None;
        };
        let master_id = disk.master_disk_id.clone();

        if self.restart_device_migration(db, &disk_id, device_id) {
            return None;
        }

        let state = self.device_list.get_device_state(device_id);

        if state == DeviceState::Error && !master_id.is_empty() {
            if !self.replica_table.is_replacement_allowed(&master_id, device_id) {
                warn!(
                    "Replacement of device '{}' of mirrored disk '{}' is not allowed",
                    device_id, master_id
                );
            } else if self.automatic_replacement_allowed(now) {
                match self.replace_device_automatically(
                    db,
                    &disk_id,
                    device_id,
                    now,
                    "device failure",
                ) {
                    Ok(updated) => return updated.then_some(disk_id),
                    Err(e) => critical::report(
                        CriticalEvent::AutomaticReplacementFailure,
                        format!("disk '{disk_id}', device '{device_id}': {e}"),
                    ),
                }
            }
        }

        let updated = self.try_update_disk_state(db, &disk_id, now);

        if state != DeviceState::Warning {
            self.cancel_device_migration(db, &disk_id, device_id);
        } else if self.disks.get(&disk_id).is_some_and(|d| {
            d.devices.iter().any(|id| id == device_id)
                && !d.migration_source_to_target.contains_key(device_id)
        }) {
            self.add_migration(&disk_id, device_id);
        }

        updated.then_some(disk_id)
    }

    /// Check whether the hourly budget of automatic replacements has room
    pub(super) fn automatic_replacement_allowed(&self, now: Timestamp) -> bool {
        let limit = self.storage_config.max_automatic_device_replacements_per_hour;
        if limit == 0 {
            return true;
        }

        let since = now - REPLACEMENT_WINDOW;
        let recent = self
            .automatically_replaced_devices
            .iter()
            .filter(|d| d.replacement_ts > since)
            .count();

        if recent >= limit as usize {
            warn!(
                "Automatic replacement refused: {} replacements in the last hour (limit {})",
                recent, limit
            );
            return false;
        }

        true
    }

    /// Withhold a device from allocation
    pub(super) fn suspend(&mut self, db: &mut dyn DiskRegistryDatabase, device_id: &str) {
        self.device_list.suspend_device(device_id);
        db.update_suspended_device(&SuspendedDevice {
            id: device_id.to_string(),
            resume_after_erase: false,
        });
    }

    pub fn suspend_device(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
    ) -> Result<()> {
        if device_id.is_empty() {
            return Err(Error::argument("empty device id"));
        }

        self.suspend(db, device_id);
        info!("Device '{}' suspended", device_id);
        Ok(())
    }

    /// Return suspended devices to the free pool
    ///
    /// Dirty devices are resumed once wiped.
    pub fn resume_devices(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        device_ids: &[DeviceId],
    ) {
        for id in device_ids {
            if self.device_list.resume_device(id) {
                db.delete_suspended_device(id);
                self.try_update_device(db, now, id);
            } else {
                db.update_suspended_device(&SuspendedDevice {
                    id: id.clone(),
                    resume_after_erase: true,
                });
            }
        }
    }

    /// Check whether some known agent lists the device
    #[must_use]
    pub fn is_known_device(&self, device_id: &str) -> bool {
        self.known_agents
            .values()
            .any(|a| a.device_uuids.iter().any(|id| id == device_id))
    }

    /// Flag a device for wiping; returns false for unknown devices
    pub fn mark_device_as_dirty(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
    ) -> bool {
        if !self.is_known_device(device_id) {
            return false;
        }

        self.device_list.mark_device_as_dirty(device_id);
        db.update_dirty_device(device_id, "");
        true
    }

    /// Record a finished wipe
    ///
    /// Returns the disk whose released devices are now all wiped.
    pub fn mark_device_as_clean(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        device_id: &str,
    ) -> Option<DiskId> {
        self.device_list.mark_device_as_clean(device_id);
        db.delete_dirty_device(device_id);

        if !self.device_list.is_suspended_device(device_id) {
            db.delete_suspended_device(device_id);
        }

        self.try_update_device(db, now, device_id);

        let disk_id = self.pending_cleanup.erase_device(device_id);
        if let Some(disk_id) = &disk_id {
            info!("Disk '{}' released all its devices", disk_id);
        }
        disk_id
    }

    /// Re-fit a device into its pool and refresh its free bucket
    fn try_update_device(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        device_id: &str,
    ) {
        let allocated = self.device_list.is_allocated_device(device_id);
        let agent_id = self.device_list.find_agent_id(device_id).to_string();

        let Some(agent) = self.agent_list.find_agent_mut(&agent_id) else {
            return;
        };
        if let Some(device) = agent.device_mut(device_id) {
            super::adjust_device_if_needed(&self.device_pools, allocated, device, now);
        }

        self.sync_agent(db, &agent_id);
    }

    /// Build a disk out of explicitly named devices
    pub fn create_disk_from_devices(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        force: bool,
        disk_id: &str,
        block_size: u32,
        devices: &[DeviceConfig],
    ) -> Result<AllocateDiskResult> {
        if devices.is_empty() {
            return Err(Error::argument("empty device list"));
        }

        let mut device_ids = Vec::with_capacity(devices.len());
        let mut pool_kind = None;

        for query in devices {
            let config = self.find_device(query)?;

            if block_size < config.block_size {
                return Err(Error::argument(format!(
                    "volume's block size is less than device's block size: {} < {}",
                    block_size, config.block_size
                )));
            }

            let uuid = config.device_uuid;

            match pool_kind {
                None => pool_kind = Some(config.pool_kind),
                Some(kind) if kind != config.pool_kind => {
                    return Err(Error::argument(format!(
                        "several device pool kinds for one disk: {} and {}",
                        config.pool_kind, kind
                    )));
                }
                Some(_) => {}
            }

            if !force
                && self.device_list.is_dirty_device(&uuid)
                && !self.device_list.is_suspended_device(&uuid)
            {
                return Err(Error::argument(format!("device '{uuid}' is dirty")));
            }

            let other = self.find_disk(&uuid);
            if !other.is_empty() && other != disk_id {
                return Err(Error::argument(format!(
                    "device '{uuid}' is allocated for disk '{other}'"
                )));
            }

            device_ids.push(uuid);
        }

        if let Some(disk) = self.disks.get(disk_id) {
            if disk.logical_block_size == block_size && disk.devices == device_ids {
                let mut result = AllocateDiskResult {
                    status: Status::Already,
                    ..Default::default()
                };
                for uuid in &disk.devices {
                    let device = self.device_list.find_device(uuid).ok_or_else(|| {
                        Error::invalid_state(format!("device '{uuid}' not found"))
                    })?;
                    result.devices.push(device.clone());
                }
                return Ok(result);
            }

            return Err(Error::argument(format!("disk '{disk_id}' already exists")));
        }

        let state = self.calculate_disk_state(&device_ids);
        self.disks.insert(
            disk_id.to_string(),
            Disk {
                devices: device_ids.clone(),
                logical_block_size: block_size,
                state_ts: now,
                state,
                ..Default::default()
            },
        );

        let mut result = AllocateDiskResult::default();

        for uuid in &device_ids {
            self.device_list.mark_device_allocated(disk_id, uuid);
            self.device_list.mark_device_as_clean(uuid);
            db.delete_dirty_device(uuid);

            self.device_list.resume_device(uuid);
            db.delete_suspended_device(uuid);

            let Some((_, device)) = self.device_location(uuid) else {
                critical::report(
                    CriticalEvent::DeviceNotFound,
                    format!("CreateDiskFromDevices: disk '{disk_id}', device '{uuid}'"),
                );
                continue;
            };
            let unadjusted = device.unadjusted_blocks_count;

            self.adjust_device_block_count(db, uuid, unadjusted);

            if let Some((_, device)) = self.device_location(uuid) {
                result.devices.push(device.clone());
            }
        }

        self.persist_disk(db, disk_id);

        info!(
            "Disk '{}' created from {} devices",
            disk_id,
            device_ids.len()
        );

        Ok(result)
    }

    /// Swap one device of a disk for another without migrating data
    pub fn change_disk_device(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
        disk_id: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<()> {
        let Some(disk) = self.disks.get(disk_id) else {
            return Err(Error::argument(format!("disk '{disk_id}' not found")));
        };

        let Some(pos) = disk.devices.iter().position(|id| id == source_id) else {
            return Err(Error::argument(format!(
                "disk '{disk_id}' didn't contain device '{source_id}'"
            )));
        };

        let Some(source) = self.device_list.find_device(source_id) else {
            return Err(Error::argument(format!(
                "source device '{source_id}' not found"
            )));
        };

        let Some(target) = self.device_list.find_device(target_id) else {
            return Err(Error::argument(format!(
                "target device '{target_id}' not found"
            )));
        };

        let other = self.find_disk(target_id);
        if !other.is_empty() {
            return Err(Error::argument(format!(
                "device '{target_id}' is allocated for disk '{other}'"
            )));
        }

        if source.pool_kind != target.pool_kind {
            return Err(Error::argument("Target and source pool kind not equal"));
        }

        if source.block_size != target.block_size {
            return Err(Error::argument("Target and source block size not equal"));
        }

        if target.unadjusted_blocks_count < source.blocks_count {
            return Err(Error::argument(format!(
                "target device '{}' is smaller than source: {} < {}",
                target_id, target.unadjusted_blocks_count, source.blocks_count
            )));
        }

        if let Some(disk) = self.disks.get_mut(disk_id) {
            disk.devices[pos] = target_id.to_string();
        }

        self.device_list.mark_device_allocated(disk_id, target_id);
        self.device_list.mark_device_as_clean(target_id);
        db.delete_dirty_device(target_id);
        self.device_list.resume_device(target_id);
        db.delete_suspended_device(target_id);

        self.device_list.release_device(source_id);
        db.update_dirty_device(source_id, disk_id);

        self.adjust_device_state(
            db,
            source_id,
            DeviceState::Error,
            now,
            "replaced by private api",
        );

        if !self.try_update_disk_state(db, disk_id, now) {
            self.update_and_reallocate_disk(db, disk_id);
        }

        info!(
            "Disk '{}' device '{}' changed to '{}'",
            disk_id, source_id, target_id
        );

        Ok(())
    }

    /// Forget automatic replacements made at or before `until`
    pub fn delete_automatically_replaced_devices(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        until: Timestamp,
    ) -> usize {
        let mut count = 0;
        while let Some(front) = self.automatically_replaced_devices.front() {
            if front.replacement_ts > until {
                break;
            }
            db.delete_automatically_replaced_device(&front.device_id);
            self.automatically_replaced_device_ids.remove(&front.device_id);
            self.automatically_replaced_devices.pop_front();
            count += 1;
        }
        count
    }

    pub fn delete_automatically_replaced_device(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        device_id: &str,
    ) -> bool {
        if !self.automatically_replaced_device_ids.remove(device_id) {
            return false;
        }

        self.automatically_replaced_devices
            .retain(|d| d.device_id != device_id);
        db.delete_automatically_replaced_device(device_id);
        true
    }

    #[must_use]
    pub fn is_automatically_replaced(&self, device_id: &str) -> bool {
        self.automatically_replaced_device_ids.contains(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use diskreg_common::{DiskState, StorageConfig};

    #[test]
    fn test_device_error_breaks_disk() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")])],
        );
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 2))
            .unwrap();
        let uuid = result.devices[0].device_uuid.clone();

        let affected = state
            .update_device_state(&mut db, &uuid, DeviceState::Error, now(), "io error")
            .unwrap();
        assert_eq!(affected, Some("vol0".to_string()));
        assert_eq!(state.get_disk_info("vol0").unwrap().state, DiskState::Error);

        let already = state
            .update_device_state(&mut db, &uuid, DeviceState::Error, now(), "io error")
            .unwrap();
        assert_eq!(already, None);
    }

    #[test]
    fn test_device_warning_queues_migration() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")])],
        );
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        let uuid = result.devices[0].device_uuid.clone();

        state
            .update_device_state(&mut db, &uuid, DeviceState::Warning, now(), "")
            .unwrap();

        let migrations = state.build_migration_list();
        assert_eq!(migrations, vec![("vol0".to_string(), uuid)]);
    }

    #[test]
    fn test_cms_device_error_cannot_go_online() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        state
            .update_device_state(&mut db, "d1", DeviceState::Error, now(), "broken")
            .unwrap();

        let update = state
            .update_cms_device_state(&mut db, "d1", DeviceState::Online, now(), false)
            .unwrap();
        assert!(matches!(update.outcome, Err(Error::TryAgain { .. })));
        assert_eq!(state.get_device("d1").unwrap().state, DeviceState::Error);
    }

    #[test]
    fn test_cms_device_waits_for_dependent_disk() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        let update = state
            .update_cms_device_state(&mut db, "d1", DeviceState::Warning, now(), false)
            .unwrap();
        assert_eq!(
            update.outcome,
            Err(Error::try_again(
                "have dependent disk: vol0",
                Duration::from_secs(300)
            ))
        );
        assert_eq!(state.get_device("d1").unwrap().state, DeviceState::Warning);
        assert_eq!(update.affected_disks, vec!["vol0".to_string()]);
    }

    #[test]
    fn test_suspend_and_resume() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );

        assert!(state.suspend_device(&mut db, "").is_err());
        state.suspend_device(&mut db, "d1").unwrap();
        assert_eq!(state.get_suspended_devices().len(), 1);
        assert!(
            state
                .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
                .is_err()
        );

        state.resume_devices(&mut db, now(), &["d1".to_string()]);
        assert!(state.get_suspended_devices().is_empty());
        state
            .allocate_disk(&mut db, now(), &disk_params("vol1", 1))
            .unwrap();
    }

    #[test]
    fn test_resume_dirty_device_after_wipe() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        state.suspend_device(&mut db, "d1").unwrap();
        assert!(state.mark_device_as_dirty(&mut db, "d1"));
        assert!(!state.mark_device_as_dirty(&mut db, "unknown"));

        state.resume_devices(&mut db, now(), &["d1".to_string()]);
        let suspended = state.get_suspended_devices();
        assert_eq!(suspended.len(), 1);
        assert!(suspended[0].resume_after_erase);

        assert_eq!(state.mark_device_as_clean(&mut db, now(), "d1"), None);
        assert!(state.get_suspended_devices().is_empty());
        assert!(state.get_dirty_devices().is_empty());
    }

    #[test]
    fn test_create_disk_from_devices() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")])],
        );
        let by_id = |id: &str| DeviceConfig {
            device_uuid: id.to_string(),
            ..Default::default()
        };

        let err = state
            .create_disk_from_devices(&mut db, now(), false, "vol0", 512, &[by_id("d1")])
            .unwrap_err();
        assert!(err.message().starts_with("volume's block size is less"));

        let result = state
            .create_disk_from_devices(&mut db, now(), false, "vol0", 4096, &[by_id("d1")])
            .unwrap();
        assert_eq!(result.status, Status::Ok);
        assert_eq!(state.find_disk("d1"), "vol0");

        let again = state
            .create_disk_from_devices(&mut db, now(), false, "vol0", 4096, &[by_id("d1")])
            .unwrap();
        assert_eq!(again.status, Status::Already);

        let err = state
            .create_disk_from_devices(&mut db, now(), false, "vol1", 4096, &[by_id("d1")])
            .unwrap_err();
        assert_eq!(
            err.message(),
            "device 'd1' is allocated for disk 'vol0'"
        );
    }

    #[test]
    fn test_change_disk_device() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")])],
        );
        let result = state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        let source = result.devices[0].device_uuid.clone();
        let target = if source == "d1" { "d2" } else { "d1" };

        let err = state
            .change_disk_device(&mut db, now(), "vol0", target, &source)
            .unwrap_err();
        assert!(err.message().contains("didn't contain device"));

        state
            .change_disk_device(&mut db, now(), "vol0", &source, target)
            .unwrap();
        assert_eq!(state.find_disk(target), "vol0");
        assert_eq!(state.get_device(&source).unwrap().state, DeviceState::Error);
        assert!(state.get_dirty_devices().iter().any(|d| d.device_uuid == source));
        assert_eq!(state.get_disk_info("vol0").unwrap().state, DiskState::Online);
    }
}
