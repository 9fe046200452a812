//! Replica table of mirrored disks
//!
//! For every mirrored disk, remembers which device backs which position of
//! which replica and whether that device is still being filled (a
//! replacement). Positions across replicas form a cell; a cell must keep at
//! least one ready device, and only a bounded number of its devices may be
//! replacements at once.

use diskreg_common::{DeviceId, DiskId};
use std::collections::{BTreeMap, HashMap};

/// A device of a replica
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaDevice {
    pub id: DeviceId,
    pub is_replacement: bool,
}

/// Snapshot of one mirrored disk
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirroredDiskInfo {
    pub disk_id: DiskId,
    /// `replicas[r][i]` backs position `i` of replica `r`
    pub replicas: Vec<Vec<ReplicaDevice>>,
}

impl MirroredDiskInfo {
    /// Devices at position `index` across all replicas
    #[must_use]
    pub fn cell(&self, index: usize) -> Vec<&ReplicaDevice> {
        self.replicas.iter().filter_map(|r| r.get(index)).collect()
    }
}

#[derive(Debug)]
pub struct ReplicaTable {
    max_replacements_per_cell: u32,
    disks: BTreeMap<DiskId, Vec<Vec<ReplicaDevice>>>,
    device_to_disk: HashMap<DeviceId, DiskId>,
}

impl ReplicaTable {
    #[must_use]
    pub fn new(max_replacements_per_cell: u32) -> Self {
        Self {
            max_replacements_per_cell: max_replacements_per_cell.max(1),
            disks: BTreeMap::new(),
            device_to_disk: HashMap::new(),
        }
    }

    /// Set the devices of replica `index` of `master`
    pub fn add_replica(
        &mut self,
        master: &str,
        index: usize,
        devices: &[DeviceId],
        replacements: &[DeviceId],
    ) {
        let replicas = self.disks.entry(master.to_string()).or_default();
        if replicas.len() <= index {
            replicas.resize_with(index + 1, Vec::new);
        }

        for old in &replicas[index] {
            self.device_to_disk.remove(&old.id);
        }

        replicas[index] = devices
            .iter()
            .map(|id| ReplicaDevice {
                id: id.clone(),
                is_replacement: replacements.contains(id),
            })
            .collect();

        for id in devices {
            self.device_to_disk.insert(id.clone(), master.to_string());
        }
    }

    /// Forget replicas past `replica_count`
    pub fn truncate(&mut self, master: &str, replica_count: usize) {
        let Some(replicas) = self.disks.get_mut(master) else {
            return;
        };
        if replicas.len() <= replica_count {
            return;
        }
        for device in replicas.drain(replica_count..).flatten() {
            self.device_to_disk.remove(&device.id);
        }
    }

    pub fn remove_mirrored_disk(&mut self, master: &str) {
        if let Some(replicas) = self.disks.remove(master) {
            for device in replicas.into_iter().flatten() {
                self.device_to_disk.remove(&device.id);
            }
        }
    }

    fn locate(&self, master: &str, device_id: &str) -> Option<(usize, usize)> {
        self.disks.get(master)?.iter().enumerate().find_map(|(r, devices)| {
            devices
                .iter()
                .position(|d| d.id == device_id)
                .map(|i| (r, i))
        })
    }

    /// Swap `old` for `new`, which becomes a replacement
    ///
    /// Returns false if `old` is not part of `master`.
    pub fn replace_device(&mut self, master: &str, old: &str, new: &str) -> bool {
        let Some((r, i)) = self.locate(master, old) else {
            return false;
        };
        let Some(replicas) = self.disks.get_mut(master) else {
            return false;
        };
        replicas[r][i] = ReplicaDevice {
            id: new.to_string(),
            is_replacement: true,
        };
        self.device_to_disk.remove(old);
        self.device_to_disk
            .insert(new.to_string(), master.to_string());
        true
    }

    /// Flag or unflag a device as a replacement
    pub fn mark_replacement_device(
        &mut self,
        master: &str,
        device_id: &str,
        is_replacement: bool,
    ) -> bool {
        let Some((r, i)) = self.locate(master, device_id) else {
            return false;
        };
        let Some(replicas) = self.disks.get_mut(master) else {
            return false;
        };
        replicas[r][i].is_replacement = is_replacement;
        true
    }

    /// Check whether `device_id` may be replaced right now
    ///
    /// Some other device of its cell must hold ready data, and the cell must
    /// have room for another replacement.
    #[must_use]
    pub fn is_replacement_allowed(&self, master: &str, device_id: &str) -> bool {
        let Some((r, i)) = self.locate(master, device_id) else {
            return false;
        };
        let Some(replicas) = self.disks.get(master) else {
            return false;
        };

        let mut ready_others = 0;
        let mut replacing = 0;
        for (ri, devices) in replicas.iter().enumerate() {
            let Some(d) = devices.get(i) else {
                continue;
            };
            if d.is_replacement {
                replacing += 1;
            } else if ri != r {
                ready_others += 1;
            }
        }

        ready_others > 0 && replacing < self.max_replacements_per_cell
    }

    /// Mirrored disk owning `device_id`
    #[must_use]
    pub fn find_disk(&self, device_id: &str) -> Option<&str> {
        self.device_to_disk.get(device_id).map(String::as_str)
    }

    #[must_use]
    pub fn disk_info(&self, master: &str) -> Option<MirroredDiskInfo> {
        self.disks.get(master).map(|replicas| MirroredDiskInfo {
            disk_id: master.to_string(),
            replicas: replicas.clone(),
        })
    }

    #[must_use]
    pub fn infos(&self) -> Vec<MirroredDiskInfo> {
        self.disks
            .keys()
            .filter_map(|id| self.disk_info(id))
            .collect()
    }

    /// Number of devices currently flagged as replacements
    #[must_use]
    pub fn replacement_count(&self) -> usize {
        self.disks
            .values()
            .flatten()
            .flatten()
            .filter(|d| d.is_replacement)
            .count()
    }
}
