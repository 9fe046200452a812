//! Redb table definitions for the registry state.
//!
//! All values are bincode-encoded.

use diskreg_common::backup::BACKUP_COLLECTIONS;
use redb::TableDefinition;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;

// Key: "config" or "last_disk_state_seq_no"
pub const CONFIG: Table = TableDefinition::new("config");
// Key: "writable_state"
pub const WRITABLE_STATE: Table = TableDefinition::new("writable_state");

// Key: agent id
pub const AGENTS: Table = TableDefinition::new("agents");
// Key: zero-padded node id
pub const OLD_AGENTS: Table = TableDefinition::new("old_agents");
// Key: agent id
pub const AGENT_LIST_PARAMS: Table = TableDefinition::new("agent_list_params");

// Key: disk id
pub const DISKS: Table = TableDefinition::new("disks");
pub const BROKEN_DISKS: Table = TableDefinition::new("broken_disks");
pub const DISKS_TO_CLEANUP: Table = TableDefinition::new("disks_to_cleanup");
pub const DISKS_TO_REALLOCATE: Table = TableDefinition::new("disks_to_reallocate");
pub const OUTDATED_VOLUME_CONFIGS: Table = TableDefinition::new("outdated_volume_configs");

// Key: group id
pub const PLACEMENT_GROUPS: Table = TableDefinition::new("placement_groups");

// Key: device id
pub const DIRTY_DEVICES: Table = TableDefinition::new("dirty_devices");
pub const SUSPENDED_DEVICES: Table = TableDefinition::new("suspended_devices");
pub const AUTOMATICALLY_REPLACED_DEVICES: Table =
    TableDefinition::new("automatically_replaced_devices");

// Key: zero-padded sequence number
pub const DISK_STATE_CHANGES: Table = TableDefinition::new("disk_state_changes");
pub const USER_NOTIFICATIONS: Table = TableDefinition::new("user_notifications");

/// Every table of the store
pub const ALL_TABLES: [Table; 16] = [
    CONFIG,
    WRITABLE_STATE,
    AGENTS,
    OLD_AGENTS,
    AGENT_LIST_PARAMS,
    DISKS,
    BROKEN_DISKS,
    DISKS_TO_CLEANUP,
    DISKS_TO_REALLOCATE,
    OUTDATED_VOLUME_CONFIGS,
    PLACEMENT_GROUPS,
    DIRTY_DEVICES,
    SUSPENDED_DEVICES,
    AUTOMATICALLY_REPLACED_DEVICES,
    DISK_STATE_CHANGES,
    USER_NOTIFICATIONS,
];

// one table per backup collection, plus the old-agent index
const _: () = assert!(ALL_TABLES.len() == BACKUP_COLLECTIONS + 1);

/// Sortable key of a sequence number
#[must_use]
pub fn seq_key(seq_no: u64) -> String {
    format!("{seq_no:020}")
}

/// Sortable key of a node id
#[must_use]
pub fn node_key(node_id: u32) -> String {
    format!("{node_id:010}")
}
