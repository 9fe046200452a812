//! Allocation query

use diskreg_common::{DevicePoolKind, NodeId};
use std::collections::BTreeSet;

/// Constraints of a device allocation request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationQuery {
    /// Racks that must not be used
    pub forbidden_racks: BTreeSet<String>,
    /// Racks to try first
    pub preferred_racks: BTreeSet<String>,
    /// Block size of the disk the devices are allocated for
    pub logical_block_size: u32,
    /// Requested size in logical blocks
    pub block_count: u64,
    /// Empty means any pool of `pool_kind`
    pub pool_name: String,
    pub pool_kind: DevicePoolKind,
    /// Restrict the allocation to these nodes (empty = any node)
    pub node_ids: BTreeSet<NodeId>,
}

impl AllocationQuery {
    /// Requested size in bytes
    #[must_use]
    pub const fn total_byte_count(&self) -> u64 {
        self.block_count * self.logical_block_size as u64
    }

    /// Check whether `node_id` may serve this query
    #[must_use]
    pub fn allows_node(&self, node_id: NodeId) -> bool {
        self.node_ids.is_empty() || self.node_ids.contains(&node_id)
    }
}
