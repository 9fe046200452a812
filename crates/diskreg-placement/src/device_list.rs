//! Device catalog
//!
//! Tracks every known device and which of them are free, allocated, dirty or
//! suspended. Free devices are bucketed per node and kept sorted by
//! `(pool kind, pool name, block size)` so that capacity queries scan a
//! contiguous range.

use crate::query::AllocationQuery;
use diskreg_common::critical::{self, CriticalEvent};
use diskreg_common::{
    AgentConfig, AgentState, DeviceConfig, DeviceId, DevicePoolKind, DeviceState, DiskId, NodeId,
    SuspendedDevice,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Free devices of one node
#[derive(Debug, Default)]
struct FreeDevices {
    rack: String,
    devices: Vec<DeviceConfig>,
}

/// A run of free devices `[begin, end)` inside one node bucket
#[derive(Clone, Copy, Debug)]
struct DeviceRange {
    node_id: NodeId,
    begin: usize,
    end: usize,
}

#[derive(Debug)]
struct Rack {
    id: String,
    nodes: Vec<NodeId>,
    free_space: u64,
    preferred: bool,
}

fn sort_key(d: &DeviceConfig) -> (DevicePoolKind, &str, u32) {
    (d.pool_kind, d.pool_name.as_str(), d.block_size)
}

/// Index range of devices in `devices` matching the pool and fitting the
/// logical block size of `query`
fn find_device_range(
    query: &AllocationQuery,
    pool_name: &str,
    devices: &[DeviceConfig],
) -> (usize, usize) {
    let begin = devices
        .partition_point(|d| (d.pool_kind, d.pool_name.as_str()) < (query.pool_kind, pool_name));
    let end = begin
        + devices[begin..].partition_point(|d| {
            sort_key(d) <= (query.pool_kind, pool_name, query.logical_block_size)
        });
    (begin, end)
}

/// Device catalog with a rack-aware free-list index
#[derive(Debug, Default)]
pub struct DeviceList {
    all_devices: HashMap<DeviceId, DeviceConfig>,
    free_devices: BTreeMap<NodeId, FreeDevices>,
    allocated_devices: HashMap<DeviceId, DiskId>,
    dirty_devices: HashSet<DeviceId>,
    suspended_devices: HashMap<DeviceId, SuspendedDevice>,
    pool_names: HashMap<DevicePoolKind, Vec<String>>,
}

impl DeviceList {
    /// Create a catalog seeded with persisted dirty and suspended devices
    #[must_use]
    pub fn new(dirty_devices: Vec<DeviceId>, suspended_devices: Vec<SuspendedDevice>) -> Self {
        Self {
            dirty_devices: dirty_devices.into_iter().collect(),
            suspended_devices: suspended_devices
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            ..Default::default()
        }
    }

    /// Re-derive the free bucket of `agent`, dropping the bucket of
    /// `prev_node_id` first
    pub fn update_devices_from(&mut self, agent: &AgentConfig, prev_node_id: NodeId) {
        self.free_devices.remove(&prev_node_id);
        self.update_devices(agent);
    }

    /// Re-derive the free bucket of `agent` from its device list
    pub fn update_devices(&mut self, agent: &AgentConfig) {
        if agent.node_id == 0 {
            for device in &agent.devices {
                debug_assert_eq!(device.node_id, 0);
                self.all_devices
                    .insert(device.device_uuid.clone(), device.clone());
            }
            return;
        }

        let rack = agent
            .devices
            .iter()
            .find(|d| d.state == DeviceState::Online && !d.rack.is_empty())
            .map(|d| d.rack.clone())
            .unwrap_or_default();

        let mut free = Vec::new();
        for device in &agent.devices {
            if device.node_id != agent.node_id {
                critical::report(
                    CriticalEvent::AgentDeviceNodeIdMismatch,
                    format!(
                        "Agent: {}, Device: {}, AgentNodeId: {}, DeviceNodeId: {}",
                        agent.agent_id, device.device_uuid, agent.node_id, device.node_id
                    ),
                );
                continue;
            }

            let uuid = &device.device_uuid;
            self.all_devices.insert(uuid.clone(), device.clone());

            if device.rack != rack {
                continue;
            }

            if agent.state == AgentState::Online
                && device.state == DeviceState::Online
                && !self.allocated_devices.contains_key(uuid)
                && !self.dirty_devices.contains(uuid)
                && !self.suspended_devices.contains_key(uuid)
            {
                free.push(device.clone());
            }

            let names = self.pool_names.entry(device.pool_kind).or_default();
            if !names.contains(&device.pool_name) {
                names.push(device.pool_name.clone());
            }
        }

        free.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        debug!(
            "Node {} ({}) has {} free devices in rack '{}'",
            agent.node_id,
            agent.agent_id,
            free.len(),
            rack
        );

        self.free_devices
            .insert(agent.node_id, FreeDevices { rack, devices: free });
    }

    /// Forget the devices of `agent` and its free bucket
    pub fn remove_devices(&mut self, agent: &AgentConfig) {
        self.free_devices.remove(&agent.node_id);
        for device in &agent.devices {
            self.all_devices.remove(&device.device_uuid);
            self.dirty_devices.remove(&device.device_uuid);
        }
    }

    #[must_use]
    pub fn find_device(&self, id: &str) -> Option<&DeviceConfig> {
        self.all_devices.get(id)
    }

    /// Node of a device (0 if unknown)
    #[must_use]
    pub fn find_node_id(&self, id: &str) -> NodeId {
        self.find_device(id).map_or(0, |d| d.node_id)
    }

    /// Agent of a device (empty if unknown)
    #[must_use]
    pub fn find_agent_id(&self, id: &str) -> &str {
        self.find_device(id).map_or("", |d| d.agent_id.as_str())
    }

    /// Rack of a device (empty if unknown)
    #[must_use]
    pub fn find_rack(&self, id: &str) -> &str {
        self.find_device(id).map_or("", |d| d.rack.as_str())
    }

    /// Disk a device is allocated to (empty if free)
    #[must_use]
    pub fn find_disk_id(&self, id: &str) -> &str {
        self.allocated_devices.get(id).map_or("", String::as_str)
    }

    /// Allocate a single device for `disk_id`
    ///
    /// Returns `None` when nothing matches the query.
    pub fn allocate_device(
        &mut self,
        disk_id: &str,
        query: &AllocationQuery,
    ) -> Option<DeviceConfig> {
        for (&node_id, free) in &mut self.free_devices {
            if !query.allows_node(node_id) {
                continue;
            }

            if free.devices.is_empty() || query.forbidden_racks.contains(&free.rack) {
                continue;
            }

            let rack = &free.rack;
            let pos = free.devices.iter().position(|device| {
                if &device.rack != rack {
                    critical::report(
                        CriticalEvent::PoolDeviceRackMismatch,
                        format!(
                            "NodeId: {}, PoolRack: {}, Device: {}, DeviceRack: {}",
                            node_id, rack, device.device_uuid, device.rack
                        ),
                    );
                    return false;
                }

                let block_count =
                    device.unadjusted_byte_count() / u64::from(query.logical_block_size);
                query.block_count <= block_count && device.pool_name == query.pool_name
            });

            if let Some(pos) = pos {
                let device = free.devices.remove(pos);
                self.allocated_devices
                    .insert(device.device_uuid.clone(), disk_id.to_string());
                return Some(device);
            }
        }

        None
    }

    /// Allocate a device named by the caller
    ///
    /// A dirty device may be reclaimed this way; it stops being dirty.
    pub fn allocate_specific_device(
        &mut self,
        disk_id: &str,
        device_id: &str,
        query: &AllocationQuery,
    ) -> diskreg_common::Result<DeviceConfig> {
        use diskreg_common::Error;

        let Some(config) = self.find_device(device_id) else {
            return Err(Error::not_found(format!("device not found, '{device_id}'")));
        };

        if self.is_suspended_device(device_id) {
            return Err(Error::invalid_state(format!(
                "device is suspended, '{device_id}'"
            )));
        }

        if self.is_allocated_device(device_id) {
            return Err(Error::invalid_state(format!(
                "device is allocated, '{device_id}'"
            )));
        }

        if !query.allows_node(config.node_id) {
            return Err(Error::argument(format!(
                "device node id is not allowed, '{device_id}' NodeId: {}",
                config.node_id
            )));
        }

        if query.forbidden_racks.contains(&config.rack) {
            return Err(Error::argument(format!(
                "device rack is forbidden, '{device_id}' Rack: {}",
                config.rack
            )));
        }

        if query.pool_name != config.pool_name {
            return Err(Error::argument(format!(
                "device pool name is not allowed, '{device_id}' PoolName: {}",
                config.pool_name
            )));
        }

        let block_count = config.unadjusted_byte_count() / u64::from(query.logical_block_size);
        if query.block_count > block_count {
            return Err(Error::argument(format!(
                "device block count is too small, '{device_id}' BlockCount: {block_count}"
            )));
        }

        let config = config.clone();
        self.dirty_devices.remove(device_id);
        self.mark_device_allocated(disk_id, device_id);
        Ok(config)
    }

    /// Check, without allocating, that a free device satisfies `query`
    #[must_use]
    pub fn validate_allocation_query(
        &self,
        query: &AllocationQuery,
        target_device_id: &str,
    ) -> bool {
        let node_id = self.find_node_id(target_device_id);
        if !query.allows_node(node_id) {
            return false;
        }

        let Some(free) = self.free_devices.get(&node_id) else {
            return false;
        };

        if query.forbidden_racks.contains(&free.rack) {
            return false;
        }

        let Some(device) = free
            .devices
            .iter()
            .find(|d| d.device_uuid == target_device_id)
        else {
            return false;
        };

        let free_block_count = device.unadjusted_byte_count() / u64::from(query.logical_block_size);
        query.block_count <= free_block_count && device.pool_name == query.pool_name
    }

    /// Record `id` as allocated to `disk_id` and pull it out of the free list
    pub fn mark_device_allocated(&mut self, disk_id: &str, id: &str) {
        self.remove_device_from_free_list(id);
        self.allocated_devices
            .insert(id.to_string(), disk_id.to_string());
    }

    fn select_racks(&self, query: &AllocationQuery, pool_name: &str) -> Vec<Rack> {
        let mut racks: BTreeMap<String, Rack> = BTreeMap::new();

        let mut append_node = |rack_id: &str, node_id: NodeId| {
            if query.forbidden_racks.contains(rack_id) {
                return;
            }
            let rack = racks.entry(rack_id.to_owned()).or_insert_with(|| Rack {
                id: rack_id.to_string(),
                nodes: Vec::new(),
                free_space: 0,
                preferred: query.preferred_racks.contains(rack_id),
            });
            rack.nodes.push(node_id);
        };

        if query.node_ids.is_empty() {
            for (&node_id, free) in &self.free_devices {
                append_node(&free.rack, node_id);
            }
        } else {
            for &node_id in &query.node_ids {
                if let Some(free) = self.free_devices.get(&node_id) {
                    append_node(&free.rack, node_id);
                }
            }
        }

        let mut result: Vec<Rack> = racks
            .into_values()
            .filter_map(|mut rack| {
                for node_id in &rack.nodes {
                    let Some(free) = self.free_devices.get(node_id) else {
                        continue;
                    };
                    let (begin, end) = find_device_range(query, pool_name, &free.devices);
                    rack.free_space += free.devices[begin..end]
                        .iter()
                        .map(DeviceConfig::byte_count)
                        .sum::<u64>();
                }
                (rack.free_space > 0).then_some(rack)
            })
            .collect();

        result.sort_by(|lhs, rhs| {
            rhs.preferred
                .cmp(&lhs.preferred)
                .then(rhs.free_space.cmp(&lhs.free_space))
                .then_with(|| lhs.id.cmp(&rhs.id))
        });

        result
    }

    fn collect_devices_in_pool(
        &self,
        query: &AllocationQuery,
        pool_name: &str,
    ) -> Vec<DeviceRange> {
        if query.block_count == 0 || query.logical_block_size == 0 {
            return Vec::new();
        }

        let mut ranges = Vec::new();
        let mut total_size = query.total_byte_count();

        for rack in self.select_racks(query, pool_name) {
            for &node_id in &rack.nodes {
                let Some(free) = self.free_devices.get(&node_id) else {
                    continue;
                };

                let (begin, end) = find_device_range(query, pool_name, &free.devices);
                let mut it = begin;
                while it < end {
                    let size = free.devices[it].byte_count();
                    it += 1;
                    if total_size <= size {
                        total_size = 0;
                        break;
                    }
                    total_size -= size;
                }

                if it != begin {
                    ranges.push(DeviceRange {
                        node_id,
                        begin,
                        end: it,
                    });
                }

                if total_size == 0 {
                    return ranges;
                }

                if query.pool_kind == DevicePoolKind::Local {
                    // local disks never span nodes: start over on the next one
                    ranges.clear();
                    total_size = query.total_byte_count();
                }
            }
        }

        Vec::new()
    }

    fn collect_devices(&self, query: &AllocationQuery) -> Vec<DeviceRange> {
        if !query.pool_name.is_empty() {
            return self.collect_devices_in_pool(query, &query.pool_name);
        }

        self.pool_names
            .get(&query.pool_kind)
            .into_iter()
            .flatten()
            .map(|pool_name| self.collect_devices_in_pool(query, pool_name))
            .find(|collected| !collected.is_empty())
            .unwrap_or_default()
    }

    /// Allocate enough devices to cover the whole query, or nothing
    pub fn allocate_devices(
        &mut self,
        disk_id: &str,
        query: &AllocationQuery,
    ) -> Vec<DeviceConfig> {
        let ranges = self.collect_devices(query);
        let mut allocated = Vec::new();

        for range in ranges {
            let Some(free) = self.free_devices.get_mut(&range.node_id) else {
                continue;
            };
            for device in free.devices.drain(range.begin..range.end) {
                debug_assert_eq!(device.state, DeviceState::Online);
                self.allocated_devices
                    .insert(device.device_uuid.clone(), disk_id.to_string());
                allocated.push(device);
            }
        }

        allocated
    }

    /// Check whether `allocate_devices` would succeed
    #[must_use]
    pub fn can_allocate_devices(&self, query: &AllocationQuery) -> bool {
        !self.collect_devices(query).is_empty()
    }

    /// Move a device from allocated to dirty
    ///
    /// Returns false if the device is unknown.
    pub fn release_device(&mut self, id: &str) -> bool {
        self.allocated_devices.remove(id);
        if !self.all_devices.contains_key(id) {
            return false;
        }
        self.dirty_devices.insert(id.to_string());
        true
    }

    /// Clear the dirty flag; returns whether the device was dirty
    pub fn mark_device_as_clean(&mut self, id: &str) -> bool {
        if self
            .suspended_devices
            .get(id)
            .is_some_and(|d| d.resume_after_erase)
        {
            self.suspended_devices.remove(id);
        }
        self.dirty_devices.remove(id)
    }

    pub fn mark_device_as_dirty(&mut self, id: &str) {
        self.dirty_devices.insert(id.to_string());
        self.remove_device_from_free_list(id);
    }

    fn remove_device_from_free_list(&mut self, id: &str) {
        let node_id = self.find_node_id(id);
        if node_id == 0 {
            return;
        }
        if let Some(free) = self.free_devices.get_mut(&node_id) {
            free.devices.retain(|d| d.device_uuid != id);
        }
    }

    /// Devices currently in the Error state
    #[must_use]
    pub fn get_broken_devices(&self) -> Vec<DeviceConfig> {
        let mut devices: Vec<_> = self
            .all_devices
            .values()
            .filter(|d| d.state == DeviceState::Error)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_uuid.cmp(&b.device_uuid));
        devices
    }

    /// Dirty devices eligible for wiping (suspended ones are held back
    /// unless they resume after the wipe)
    #[must_use]
    pub fn get_dirty_devices(&self) -> Vec<DeviceConfig> {
        let mut devices: Vec<_> = self
            .dirty_devices
            .iter()
            .filter(|id| {
                self.suspended_devices
                    .get(*id)
                    .is_none_or(|d| d.resume_after_erase)
            })
            .filter_map(|id| self.find_device(id).cloned())
            .collect();
        devices.sort_by(|a, b| a.device_uuid.cmp(&b.device_uuid));
        devices
    }

    #[must_use]
    pub fn is_dirty_device(&self, id: &str) -> bool {
        self.dirty_devices.contains(id)
    }

    /// Every dirty device id, including unknown and suspended ones, sorted
    #[must_use]
    pub fn dirty_device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.dirty_devices.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Device state; unknown devices count as broken
    #[must_use]
    pub fn get_device_state(&self, id: &str) -> DeviceState {
        self.find_device(id).map_or(DeviceState::Error, |d| d.state)
    }

    pub fn suspend_device(&mut self, id: &str) {
        self.suspended_devices
            .entry(id.to_string())
            .or_insert_with(|| SuspendedDevice {
                id: id.to_string(),
                resume_after_erase: false,
            });
        self.remove_device_from_free_list(id);
    }

    /// Lift a suspension
    ///
    /// A dirty device is only flagged to resume after its wipe; returns
    /// false in that case.
    pub fn resume_device(&mut self, id: &str) -> bool {
        if !self.suspended_devices.contains_key(id) {
            return true;
        }

        if self.is_dirty_device(id) {
            if let Some(device) = self.suspended_devices.get_mut(id) {
                device.resume_after_erase = true;
            }
            return false;
        }

        self.suspended_devices.remove(id);
        true
    }

    #[must_use]
    pub fn is_suspended_device(&self, id: &str) -> bool {
        self.suspended_devices.contains_key(id)
    }

    #[must_use]
    pub fn is_allocated_device(&self, id: &str) -> bool {
        self.allocated_devices.contains_key(id)
    }

    #[must_use]
    pub fn suspended_device(&self, id: &str) -> Option<&SuspendedDevice> {
        self.suspended_devices.get(id)
    }

    #[must_use]
    pub fn get_suspended_devices(&self) -> Vec<SuspendedDevice> {
        let mut devices: Vec<_> = self.suspended_devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Usable bytes of a device (0 if unknown)
    #[must_use]
    pub fn get_device_byte_count(&self, id: &str) -> u64 {
        self.find_device(id).map_or(0, DeviceConfig::byte_count)
    }

    /// Check whether a device sits in the free list of its node
    #[must_use]
    pub fn is_free_device(&self, id: &str) -> bool {
        self.free_devices
            .get(&self.find_node_id(id))
            .is_some_and(|free| free.devices.iter().any(|d| d.device_uuid == id))
    }

    /// Ids of all devices in free buckets
    #[must_use]
    pub fn free_device_ids(&self) -> BTreeSet<DeviceId> {
        self.free_devices
            .values()
            .flat_map(|free| free.devices.iter().map(|d| d.device_uuid.clone()))
            .collect()
    }

    /// Ids of all allocated devices
    pub fn allocated_device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.allocated_devices.keys()
    }

    /// All known devices
    pub fn devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.all_devices.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskreg_common::Timestamp;

    const BLOCK: u32 = 4096;
    const BLOCKS: u64 = 1024;

    fn device(uuid: &str, rack: &str) -> DeviceConfig {
        DeviceConfig {
            device_uuid: uuid.into(),
            device_name: format!("/dev/{uuid}"),
            rack: rack.into(),
            block_size: BLOCK,
            blocks_count: BLOCKS,
            unadjusted_blocks_count: BLOCKS,
            ..Default::default()
        }
    }

    fn agent(agent_id: &str, node_id: NodeId, devices: Vec<DeviceConfig>) -> AgentConfig {
        AgentConfig {
            agent_id: agent_id.into(),
            node_id,
            devices: devices
                .into_iter()
                .map(|mut d| {
                    d.agent_id = agent_id.into();
                    d.node_id = node_id;
                    d
                })
                .collect(),
            state_ts: Timestamp::from_secs(1),
            ..Default::default()
        }
    }

    fn query(block_count: u64) -> AllocationQuery {
        AllocationQuery {
            logical_block_size: BLOCK,
            block_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_allocate_single_device() {
        let mut list = DeviceList::default();
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1"), device("d2", "r1")]));

        let d = list.allocate_device("disk1", &query(BLOCKS)).unwrap();
        assert_eq!(d.device_uuid, "d1");
        assert_eq!(list.find_disk_id("d1"), "disk1");
        assert!(!list.is_free_device("d1"));

        let d = list.allocate_device("disk1", &query(BLOCKS)).unwrap();
        assert_eq!(d.device_uuid, "d2");
        assert!(list.allocate_device("disk1", &query(BLOCKS)).is_none());
    }

    #[test]
    fn test_allocate_respects_forbidden_racks() {
        let mut list = DeviceList::default();
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1")]));
        list.update_devices(&agent("a2", 2, vec![device("d2", "r2")]));

        let mut q = query(BLOCKS);
        q.forbidden_racks.insert("r1".into());
        let d = list.allocate_device("disk", &q).unwrap();
        assert_eq!(d.device_uuid, "d2");
        assert!(list.allocate_device("disk", &q).is_none());
    }

    #[test]
    fn test_allocate_devices_prefers_racks() {
        let mut list = DeviceList::default();
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1"), device("d2", "r1")]));
        list.update_devices(&agent("a2", 2, vec![device("d3", "r2")]));

        let mut q = query(BLOCKS);
        q.preferred_racks.insert("r2".into());
        let devices = list.allocate_devices("disk", &q);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_uuid, "d3");

        // without preference the rack with most free space wins
        let devices = list.allocate_devices("disk2", &query(BLOCKS));
        assert_eq!(devices[0].rack, "r1");
    }

    #[test]
    fn test_allocate_devices_all_or_nothing() {
        let mut list = DeviceList::default();
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1"), device("d2", "r1")]));

        assert!(list.allocate_devices("disk", &query(3 * BLOCKS)).is_empty());
        assert!(list.is_free_device("d1"));

        let devices = list.allocate_devices("disk", &query(2 * BLOCKS));
        assert_eq!(devices.len(), 2);
        assert!(list.free_device_ids().is_empty());
    }

    #[test]
    fn test_local_allocation_stays_on_one_node() {
        let mut list = DeviceList::default();
        let local = |uuid: &str| DeviceConfig {
            pool_name: "local".into(),
            pool_kind: DevicePoolKind::Local,
            ..device(uuid, "r1")
        };
        list.update_devices(&agent("a1", 1, vec![local("d1")]));
        list.update_devices(&agent("a2", 2, vec![local("d2"), local("d3")]));

        let mut q = query(2 * BLOCKS);
        q.pool_kind = DevicePoolKind::Local;
        let devices = list.allocate_devices("disk", &q);
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.node_id == 2));

        assert!(!list.can_allocate_devices(&q));
    }

    #[test]
    fn test_specific_device_errors() {
        let mut list = DeviceList::default();
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1"), device("d2", "r1")]));

        let err = list
            .allocate_specific_device("disk", "nope", &query(BLOCKS))
            .unwrap_err();
        assert!(err.is_not_found());

        list.suspend_device("d2");
        let err = list
            .allocate_specific_device("disk", "d2", &query(BLOCKS))
            .unwrap_err();
        assert_eq!(err.code(), diskreg_common::ErrorCode::InvalidState);

        let err = list
            .allocate_specific_device("disk", "d1", &query(BLOCKS + 1))
            .unwrap_err();
        assert_eq!(err.code(), diskreg_common::ErrorCode::Argument);

        list.mark_device_as_dirty("d1");
        let d = list
            .allocate_specific_device("disk", "d1", &query(BLOCKS))
            .unwrap();
        assert_eq!(d.device_uuid, "d1");
        assert!(!list.is_dirty_device("d1"));
        assert!(list.is_allocated_device("d1"));
    }

    #[test]
    fn test_release_and_clean() {
        let mut list = DeviceList::default();
        let a = agent("a1", 1, vec![device("d1", "r1")]);
        list.update_devices(&a);

        list.allocate_device("disk", &query(BLOCKS)).unwrap();
        assert!(list.release_device("d1"));
        assert!(list.is_dirty_device("d1"));
        assert!(!list.release_device("unknown"));

        list.update_devices(&a);
        assert!(!list.is_free_device("d1"));

        assert!(list.mark_device_as_clean("d1"));
        list.update_devices(&a);
        assert!(list.is_free_device("d1"));
    }

    #[test]
    fn test_resume_dirty_device_defers() {
        let mut list = DeviceList::new(vec!["d1".into()], vec![]);
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1")]));
        list.suspend_device("d1");

        assert!(list.get_dirty_devices().is_empty());
        assert!(!list.resume_device("d1"));
        assert!(list.suspended_device("d1").unwrap().resume_after_erase);
        assert_eq!(list.get_dirty_devices().len(), 1);

        list.mark_device_as_clean("d1");
        assert!(!list.is_suspended_device("d1"));
    }

    #[test]
    fn test_free_bucket_requires_online() {
        let mut list = DeviceList::default();
        let mut a = agent("a1", 1, vec![device("d1", "r1"), device("d2", "r1")]);
        a.devices[1].state = DeviceState::Warning;
        list.update_devices(&a);
        assert_eq!(list.free_device_ids().len(), 1);

        a.state = AgentState::Warning;
        list.update_devices(&a);
        assert!(list.free_device_ids().is_empty());
        assert_eq!(list.get_device_state("d2"), DeviceState::Warning);
        assert_eq!(list.get_device_state("zzz"), DeviceState::Error);
    }

    #[test]
    fn test_node_change_drops_old_bucket() {
        let mut list = DeviceList::default();
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1")]));
        list.update_devices_from(&agent("a1", 7, vec![device("d1", "r1")]), 1);
        assert_eq!(list.find_node_id("d1"), 7);
        assert!(list.is_free_device("d1"));

        let mut q = query(BLOCKS);
        q.node_ids.insert(1);
        assert!(list.allocate_device("disk", &q).is_none());
    }

    #[test]
    fn test_validate_allocation_query() {
        let mut list = DeviceList::default();
        list.update_devices(&agent("a1", 1, vec![device("d1", "r1")]));

        assert!(list.validate_allocation_query(&query(BLOCKS), "d1"));
        assert!(!list.validate_allocation_query(&query(BLOCKS + 1), "d1"));

        let mut q = query(BLOCKS);
        q.forbidden_racks.insert("r1".into());
        assert!(!list.validate_allocation_query(&q, "d1"));
    }
}
