//! Configuration types for the Disk Registry
//!
//! [`StorageConfig`] holds the storage-wide knobs read on every call.
//! [`DiskRegistryConfig`] is the persisted, versioned catalog of known agents,
//! device pools and device overrides.

use crate::types::{AgentId, DeviceId, DevicePoolKind, DiskId, MediaKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Storage-wide registry knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Allocation unit of the default pool (GiB)
    pub allocation_unit_non_replicated_ssd: u64,
    /// Allocation unit used for mirror2 disks (GiB)
    pub allocation_unit_mirror2_ssd: u64,
    /// Allocation unit used for mirror3 disks (GiB)
    pub allocation_unit_mirror3_ssd: u64,
    /// Allocation unit used for HDD-backed disks (GiB)
    pub allocation_unit_non_replicated_hdd: u64,
    /// Allocation unit used for local disks (GiB)
    pub allocation_unit_local_ssd: u64,

    /// Grace window for maintenance requests on an agent (seconds)
    pub non_replicated_infra_timeout_secs: u64,
    /// Grace window before an agent may be taken fully unavailable (seconds)
    pub non_replicated_infra_unavailable_agent_timeout_secs: u64,
    /// Extra retry window when maintenance tries to revive a dead agent or device (seconds)
    pub cms_update_state_to_online_timeout_secs: u64,

    pub non_replicated_migration_start_allowed: bool,
    pub mirrored_migration_start_allowed: bool,
    pub max_non_replicated_device_migrations_in_progress: u32,

    pub max_disks_in_placement_group: u32,
    pub max_disks_in_partition_placement_group: u32,
    pub max_placement_partition_count: u32,

    /// Delay before a disk that could not be backed is destroyed (seconds)
    pub broken_disk_destruction_delay_secs: u64,

    /// Newly seen local devices stay allocatable instead of being suspended
    pub non_replicated_dont_suspend_devices: bool,

    /// Upper bound on automatic replacements over the last hour (0 = unlimited)
    pub max_automatic_device_replacements_per_hour: u32,
    /// Replicas of one device cell that may be mid-replacement at the same time
    pub max_replacements_per_mirrored_disk: u32,

    /// Age after which user notifications are dropped on load (seconds)
    pub user_notification_ttl_secs: u64,

    pub agent_list: AgentListConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            allocation_unit_non_replicated_ssd: 93,
            allocation_unit_mirror2_ssd: 93,
            allocation_unit_mirror3_ssd: 93,
            allocation_unit_non_replicated_hdd: 93,
            allocation_unit_local_ssd: 99,
            non_replicated_infra_timeout_secs: 5 * 60,
            non_replicated_infra_unavailable_agent_timeout_secs: 60 * 60,
            cms_update_state_to_online_timeout_secs: 5 * 60,
            non_replicated_migration_start_allowed: true,
            mirrored_migration_start_allowed: true,
            max_non_replicated_device_migrations_in_progress: 1,
            max_disks_in_placement_group: 5,
            max_disks_in_partition_placement_group: 100,
            max_placement_partition_count: 5,
            broken_disk_destruction_delay_secs: 5,
            non_replicated_dont_suspend_devices: false,
            max_automatic_device_replacements_per_hour: 0,
            max_replacements_per_mirrored_disk: 1,
            user_notification_ttl_secs: 3 * 24 * 60 * 60,
            agent_list: AgentListConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Allocation unit of the default pool in bytes
    #[must_use]
    pub const fn default_allocation_unit(&self) -> u64 {
        self.allocation_unit_non_replicated_ssd * GIB
    }

    /// Allocation unit in bytes for disks of the given media kind
    #[must_use]
    pub const fn allocation_unit(&self, media_kind: MediaKind) -> u64 {
        let gib = match media_kind {
            MediaKind::NonReplicatedSsd => self.allocation_unit_non_replicated_ssd,
            MediaKind::NonReplicatedHdd => self.allocation_unit_non_replicated_hdd,
            MediaKind::Mirror2Ssd => self.allocation_unit_mirror2_ssd,
            MediaKind::Mirror3Ssd => self.allocation_unit_mirror3_ssd,
            MediaKind::LocalSsd => self.allocation_unit_local_ssd,
        };
        gib * GIB
    }

    #[must_use]
    pub const fn non_replicated_infra_timeout(&self) -> Duration {
        Duration::from_secs(self.non_replicated_infra_timeout_secs)
    }

    #[must_use]
    pub const fn non_replicated_infra_unavailable_agent_timeout(&self) -> Duration {
        Duration::from_secs(self.non_replicated_infra_unavailable_agent_timeout_secs)
    }

    #[must_use]
    pub const fn cms_update_state_to_online_timeout(&self) -> Duration {
        Duration::from_secs(self.cms_update_state_to_online_timeout_secs)
    }

    #[must_use]
    pub const fn broken_disk_destruction_delay(&self) -> Duration {
        Duration::from_secs(self.broken_disk_destruction_delay_secs)
    }

    #[must_use]
    pub const fn user_notification_ttl(&self) -> Duration {
        Duration::from_secs(self.user_notification_ttl_secs)
    }
}

/// Backoff of the agent reject timeout after disconnects
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentListConfig {
    /// Quiet period after which the backoff resets (seconds)
    pub disconnect_recovery_interval_secs: u64,
    /// Multiplier applied on each disconnect inside the recovery interval
    pub timeout_growth_factor: f64,
    pub min_reject_agent_timeout_ms: u64,
    pub max_reject_agent_timeout_ms: u64,
}

impl Default for AgentListConfig {
    fn default() -> Self {
        Self {
            disconnect_recovery_interval_secs: 60,
            timeout_growth_factor: 2.0,
            min_reject_agent_timeout_ms: 30_000,
            max_reject_agent_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl AgentListConfig {
    #[must_use]
    pub const fn disconnect_recovery_interval(&self) -> Duration {
        Duration::from_secs(self.disconnect_recovery_interval_secs)
    }

    #[must_use]
    pub const fn min_reject_agent_timeout(&self) -> Duration {
        Duration::from_millis(self.min_reject_agent_timeout_ms)
    }

    #[must_use]
    pub const fn max_reject_agent_timeout(&self) -> Duration {
        Duration::from_millis(self.max_reject_agent_timeout_ms)
    }
}

/// A device pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePoolConfig {
    /// Empty for the default pool
    pub name: String,
    pub kind: DevicePoolKind,
    /// Allocation unit in bytes
    pub allocation_unit: u64,
}

/// Catalog entry of an agent expected to register
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownAgentConfig {
    pub agent_id: AgentId,
    pub device_uuids: Vec<DeviceId>,
}

/// Block count pinned for one device of one disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOverride {
    pub disk_id: DiskId,
    pub device: DeviceId,
    pub blocks_count: u64,
}

/// Persisted registry configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRegistryConfig {
    pub version: u32,
    pub known_agents: Vec<KnownAgentConfig>,
    pub device_pools: Vec<DevicePoolConfig>,
    pub device_overrides: Vec<DeviceOverride>,
    pub last_disk_state_seq_no: u64,
    /// Next free sequence number of reallocate requests and volume configs
    pub last_disk_seq_no: u64,
    /// Set when the registry accepts mutations
    pub writable_state: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.default_allocation_unit(), 93 * GIB);
        assert_eq!(config.non_replicated_infra_timeout(), Duration::from_secs(300));
        assert_eq!(config.max_disks_in_placement_group, 5);
        assert_eq!(config.user_notification_ttl(), Duration::from_secs(259_200));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"max_placement_partition_count": 7}"#).unwrap();
        assert_eq!(config.max_placement_partition_count, 7);
        assert_eq!(config.broken_disk_destruction_delay(), Duration::from_secs(5));
        assert_eq!(config.agent_list.min_reject_agent_timeout(), Duration::from_secs(30));
    }
}
