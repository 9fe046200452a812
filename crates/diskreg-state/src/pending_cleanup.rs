//! Devices released by a disk and still waiting to be wiped
//!
//! A disk counts as cleaned once every device it released has been wiped.

use diskreg_common::{DeviceId, DiskId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct PendingCleanup {
    disk_to_devices: BTreeMap<DiskId, BTreeSet<DeviceId>>,
    device_to_disk: HashMap<DeviceId, DiskId>,
}

impl PendingCleanup {
    pub fn insert(&mut self, disk_id: &str, device_id: &str) {
        if disk_id.is_empty() || device_id.is_empty() {
            return;
        }

        if let Some(prev) = self
            .device_to_disk
            .insert(device_id.to_string(), disk_id.to_string())
        {
            if prev != disk_id {
                self.remove_from_disk(&prev, device_id);
            }
        }

        self.disk_to_devices
            .entry(disk_id.to_string())
            .or_default()
            .insert(device_id.to_string());
    }

    pub fn insert_all(&mut self, disk_id: &str, device_ids: &[DeviceId]) {
        for id in device_ids {
            self.insert(disk_id, id);
        }
    }

    /// Forget a wiped device
    ///
    /// Returns the disk it belonged to if that disk has nothing left to wipe.
    pub fn erase_device(&mut self, device_id: &str) -> Option<DiskId> {
        let disk_id = self.device_to_disk.remove(device_id)?;
        self.remove_from_disk(&disk_id, device_id)
            .then_some(disk_id)
    }

    pub fn erase_disk(&mut self, disk_id: &str) {
        if let Some(devices) = self.disk_to_devices.remove(disk_id) {
            for id in devices {
                self.device_to_disk.remove(&id);
            }
        }
    }

    /// Disk a device was released by (empty if none)
    #[must_use]
    pub fn find_disk_id(&self, device_id: &str) -> &str {
        self.device_to_disk
            .get(device_id)
            .map_or("", String::as_str)
    }

    #[must_use]
    pub fn contains(&self, disk_id: &str) -> bool {
        self.disk_to_devices.contains_key(disk_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.disk_to_devices.is_empty()
    }

    // returns true if the disk has no devices left
    fn remove_from_disk(&mut self, disk_id: &str, device_id: &str) -> bool {
        let Some(devices) = self.disk_to_devices.get_mut(disk_id) else {
            return false;
        };
        devices.remove(device_id);
        if devices.is_empty() {
            self.disk_to_devices.remove(disk_id);
            return true;
        }
        false
    }
}
