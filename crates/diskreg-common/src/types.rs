//! Core type definitions for the Disk Registry
//!
//! This module defines identifiers, health states and the persisted records
//! for agents, devices, disks and placement groups.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stable identifier of a storage agent
pub type AgentId = String;

/// Device UUID
pub type DeviceId = String;

/// Identifier of a virtual disk
pub type DiskId = String;

/// Identifier of a placement group
pub type GroupId = String;

/// Ephemeral routing id of the host an agent currently runs on (0 = none)
pub type NodeId = u32;

/// Point in time with microsecond precision, measured from the Unix epoch
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp, used as "unset"
    pub const ZERO: Self = Self(0);

    /// Create from microseconds since epoch
    #[must_use]
    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    /// Create from seconds since epoch
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    /// Current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Self(u64::try_from(d.as_micros()).unwrap_or(u64::MAX)))
            .unwrap_or_default()
    }

    /// Microseconds since epoch
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Whole seconds since epoch
    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Check whether the timestamp is unset
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

fn duration_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(duration_micros(rhs)))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0.saturating_sub(duration_micros(rhs)))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Agent health state
///
/// Ordered from healthy to unhealthy, so comparisons like
/// `state > AgentState::Warning` read naturally.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
pub enum AgentState {
    #[default]
    Online,
    Warning,
    Unavailable,
}

/// Device health state
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
pub enum DeviceState {
    #[default]
    Online,
    Warning,
    Error,
}

/// Derived disk state
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
pub enum DiskState {
    #[default]
    Online,
    Migration,
    TemporarilyUnavailable,
    Error,
}

impl From<AgentState> for DiskState {
    fn from(state: AgentState) -> Self {
        match state {
            AgentState::Online => Self::Online,
            AgentState::Warning => Self::Migration,
            AgentState::Unavailable => Self::TemporarilyUnavailable,
        }
    }
}

impl From<DeviceState> for DiskState {
    fn from(state: DeviceState) -> Self {
        match state {
            DeviceState::Online => Self::Online,
            DeviceState::Warning => Self::Migration,
            DeviceState::Error => Self::Error,
        }
    }
}

/// Kind of a device pool
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
pub enum DevicePoolKind {
    /// The unnamed default pool
    #[default]
    Default,
    /// Host-local devices; a disk never spans nodes
    Local,
    /// Named pool shared across the cluster
    Global,
}

/// Storage media of a virtual disk
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
pub enum MediaKind {
    #[default]
    NonReplicatedSsd,
    NonReplicatedHdd,
    Mirror2Ssd,
    Mirror3Ssd,
    LocalSsd,
}

impl MediaKind {
    /// Media kind implied by a replica count when none was recorded
    #[must_use]
    pub const fn from_replica_count(replica_count: u32) -> Self {
        match replica_count {
            1 => Self::Mirror2Ssd,
            2 => Self::Mirror3Ssd,
            _ => Self::NonReplicatedSsd,
        }
    }

    /// Check if disks of this kind live on host-local devices
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::LocalSsd)
    }

    /// Check if clients get health notifications for disks of this kind
    #[must_use]
    pub const fn supports_notifications(self) -> bool {
        matches!(
            self,
            Self::NonReplicatedSsd | Self::NonReplicatedHdd | Self::LocalSsd
        )
    }
}

/// Placement strategy of a group
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
pub enum PlacementStrategy {
    /// Every member on its own set of racks
    #[default]
    Spread,
    /// Members bucketed into partitions; partitions must not share racks
    Partition,
}

/// IO mode reported to the volume on allocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum VolumeIoMode {
    #[default]
    Ok,
    ErrorReadOnly,
}

/// Reference to a virtual disk
///
/// Mirrored disks are made of replica sub-disks. Their ids, and the id of the
/// placement group that keeps them apart, are derived from the master id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DiskRef {
    /// A standalone disk or the master of a mirrored disk
    Simple(DiskId),
    /// Replica number `index` of a mirrored disk
    Replica { master: DiskId, index: u32 },
}

impl DiskRef {
    /// Reference a replica of a mirrored disk
    #[must_use]
    pub fn replica(master: impl Into<DiskId>, index: u32) -> Self {
        Self::Replica {
            master: master.into(),
            index,
        }
    }

    /// Id of the spread group holding the replicas of `master`
    #[must_use]
    pub fn mirrored_group_id(master: &str) -> GroupId {
        format!("{master}/g")
    }

    /// Ids of all replicas of a master with `replica_count` extra copies
    #[must_use]
    pub fn replica_ids(master: &str, replica_count: u32) -> Vec<DiskId> {
        (0..=replica_count)
            .map(|i| Self::replica(master, i).disk_id())
            .collect()
    }

    /// The master disk id (the disk itself for simple disks)
    #[must_use]
    pub fn master_id(&self) -> &str {
        match self {
            Self::Simple(id) => id,
            Self::Replica { master, .. } => master,
        }
    }

    /// Materialize the disk id
    #[must_use]
    pub fn disk_id(&self) -> DiskId {
        self.to_string()
    }
}

impl fmt::Display for DiskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(id) => write!(f, "{id}"),
            Self::Replica { master, index } => write!(f, "{master}/{index}"),
        }
    }
}

/// A physical storage extent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_uuid: DeviceId,
    /// Path of the device on its host
    pub device_name: String,
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub rack: String,
    pub pool_name: String,
    pub pool_kind: DevicePoolKind,
    pub block_size: u32,
    /// Usable block count, clamped to the pool's allocation unit
    pub blocks_count: u64,
    /// Block count reported by the agent before clamping
    pub unadjusted_blocks_count: u64,
    pub state: DeviceState,
    pub state_ts: Timestamp,
    pub state_message: String,
    /// Start of an active maintenance request (zero if none)
    pub cms_ts: Timestamp,
    pub serial_number: String,
}

impl DeviceConfig {
    /// Usable size in bytes
    #[must_use]
    pub const fn byte_count(&self) -> u64 {
        self.blocks_count * self.block_size as u64
    }

    /// Raw size in bytes as reported by the agent
    #[must_use]
    pub const fn unadjusted_byte_count(&self) -> u64 {
        self.unadjusted_blocks_count * self.block_size as u64
    }
}

/// Mean-time-between-failures accumulator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBetweenFailures {
    /// Accumulated work time in seconds
    pub work_time: u64,
    pub broken_count: u32,
}

impl TimeBetweenFailures {
    /// Record one failure after `work_time` of uptime
    pub fn record_failure(&mut self, work_time: Duration) {
        self.work_time += work_time.as_secs();
        self.broken_count += 1;
    }

    /// Mean time between failures, if any failure was recorded
    #[must_use]
    pub fn mtbf(&self) -> Option<Duration> {
        (self.broken_count > 0)
            .then(|| Duration::from_secs(self.work_time / u64::from(self.broken_count)))
    }
}

/// A storage agent and its devices
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    /// Grows with every agent restart; resolves flapping registrations
    pub seq_number: u64,
    pub devices: Vec<DeviceConfig>,
    pub state: AgentState,
    pub state_ts: Timestamp,
    pub state_message: String,
    pub cms_ts: Timestamp,
    /// Start of the current uptime period (zero while unavailable)
    pub work_ts: Timestamp,
    pub time_between_failures: TimeBetweenFailures,
}

impl AgentConfig {
    /// Find one of the agent's devices
    #[must_use]
    pub fn device(&self, uuid: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_uuid == uuid)
    }

    /// Find one of the agent's devices for modification
    pub fn device_mut(&mut self, uuid: &str) -> Option<&mut DeviceConfig> {
        self.devices.iter_mut().find(|d| d.device_uuid == uuid)
    }
}

/// A migration in flight, as persisted with the disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMigration {
    pub source_device_id: DeviceId,
    pub target_device_id: DeviceId,
}

/// A device vacated by a migration, waiting for the client to catch up
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedMigration {
    pub device_id: DeviceId,
    /// Reallocate notification the client must acknowledge first
    pub seq_no: u64,
}

/// Persisted form of a virtual disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub disk_id: DiskId,
    pub block_size: u32,
    pub device_uuids: Vec<DeviceId>,
    pub state: DiskState,
    pub state_ts: Timestamp,
    pub cloud_id: String,
    pub folder_id: String,
    pub user_id: String,
    /// Non-empty for replicas of a mirrored disk
    pub master_disk_id: DiskId,
    /// Non-zero for the master of a mirrored disk
    pub replica_count: u32,
    pub device_replacement_uuids: Vec<DeviceId>,
    pub migrations: Vec<DeviceMigration>,
    pub finished_migrations: Vec<DeviceId>,
    pub media_kind: Option<MediaKind>,
}

/// Placement info of one member of a placement group
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementGroupDisk {
    pub disk_id: DiskId,
    pub device_racks: Vec<String>,
    pub placement_partition_index: u32,
}

/// Per-group limits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementGroupSettings {
    /// Overrides the storage-wide limit when non-zero
    pub max_disks_in_group: u32,
}

/// A placement group
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementGroupConfig {
    pub group_id: GroupId,
    pub disks: Vec<PlacementGroupDisk>,
    pub config_version: u32,
    pub placement_strategy: PlacementStrategy,
    pub placement_partition_count: u32,
    pub settings: PlacementGroupSettings,
}

impl PlacementGroupConfig {
    /// Check whether members must carry a partition index
    #[must_use]
    pub fn must_have_partitions(&self) -> bool {
        self.placement_strategy == PlacementStrategy::Partition
    }

    /// Check whether `index` is a valid partition index for this group
    #[must_use]
    pub fn partition_suits(&self, index: u32) -> bool {
        if self.must_have_partitions() {
            index > 0 && index <= self.placement_partition_count
        } else {
            index == 0
        }
    }

    /// Find a member
    #[must_use]
    pub fn disk(&self, disk_id: &str) -> Option<&PlacementGroupDisk> {
        self.disks.iter().find(|d| d.disk_id == disk_id)
    }
}

/// Device withheld from allocation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedDevice {
    pub id: DeviceId,
    /// Resume automatically once the device has been wiped
    pub resume_after_erase: bool,
}

/// Device waiting to be wiped, with the disk that released it (may be empty)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyDevice {
    pub id: DeviceId,
    pub disk_id: DiskId,
}

/// Disk that could not be backed by storage and must be destroyed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenDiskInfo {
    pub disk_id: DiskId,
    pub ts_to_destroy: Timestamp,
}

/// Device taken out of a mirrored disk by automatic replacement
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomaticallyReplacedDeviceInfo {
    pub device_id: DeviceId,
    pub replacement_ts: Timestamp,
}

/// Per-agent override of the reject timeouts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentListParams {
    pub new_non_replicated_agent_min_timeout: Duration,
    pub new_non_replicated_agent_max_timeout: Duration,
    pub expiration_ts: Timestamp,
}

/// A recorded disk state transition
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStateUpdate {
    pub disk_id: DiskId,
    pub state: DiskState,
    pub state_message: String,
    pub seq_no: u64,
}

/// Event a user should be told about
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserNotificationEvent {
    DiskError { disk_id: DiskId },
    DiskBackOnline { disk_id: DiskId },
}

impl UserNotificationEvent {
    /// Disk the event is about
    #[must_use]
    pub fn disk_id(&self) -> &str {
        match self {
            Self::DiskError { disk_id } | Self::DiskBackOnline { disk_id } => disk_id,
        }
    }
}

/// A user-visible notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotification {
    pub seq_no: u64,
    pub timestamp: Timestamp,
    pub event: UserNotificationEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_ref_ids() {
        assert_eq!(DiskRef::replica("vol1", 2).to_string(), "vol1/2");
        assert_eq!(DiskRef::Simple("vol1".into()).to_string(), "vol1");
        assert_eq!(DiskRef::mirrored_group_id("vol1"), "vol1/g");
        assert_eq!(DiskRef::replica("vol1", 0).master_id(), "vol1");
        assert_eq!(
            DiskRef::replica_ids("m", 2),
            vec!["m/0".to_string(), "m/1".into(), "m/2".into()]
        );
    }

    #[test]
    fn test_state_ordering() {
        assert!(AgentState::Unavailable > AgentState::Warning);
        assert!(DeviceState::Error > DeviceState::Warning);
        assert_eq!(
            DiskState::from(AgentState::Unavailable).max(DiskState::from(DeviceState::Warning)),
            DiskState::TemporarilyUnavailable
        );
        assert_eq!(DiskState::from(DeviceState::Error), DiskState::Error);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_secs(100);
        let later = ts + Duration::from_secs(5);
        assert_eq!(later.as_secs(), 105);
        assert_eq!(later.saturating_duration_since(ts), Duration::from_secs(5));
        assert_eq!(ts.saturating_duration_since(later), Duration::ZERO);
        assert!(Timestamp::ZERO.is_zero());
    }

    #[test]
    fn test_partition_suits() {
        let mut g = PlacementGroupConfig {
            placement_strategy: PlacementStrategy::Partition,
            placement_partition_count: 3,
            ..Default::default()
        };
        assert!(!g.partition_suits(0));
        assert!(g.partition_suits(3));
        assert!(!g.partition_suits(4));

        g.placement_strategy = PlacementStrategy::Spread;
        assert!(g.partition_suits(0));
        assert!(!g.partition_suits(1));
    }

    #[test]
    fn test_mtbf() {
        let mut tbf = TimeBetweenFailures::default();
        assert_eq!(tbf.mtbf(), None);
        tbf.record_failure(Duration::from_secs(100));
        tbf.record_failure(Duration::from_secs(50));
        assert_eq!(tbf.mtbf(), Some(Duration::from_secs(75)));
    }
}
