//! Disk Registry State - the control-plane state machine
//!
//! This crate keeps the authoritative in-memory picture of storage agents,
//! their devices and the non-replicated and mirrored disks built from them.
//!
//! # Components
//! - [`AgentList`]: registered agents, the node index and reject timeouts
//! - [`ReplicaTable`]: per-cell replica layout of mirrored disks
//! - [`NotificationSystem`]: reallocate requests, outdated volume configs,
//!   disk state changes and user notifications
//! - [`PendingCleanup`]: devices released by deallocated disks awaiting a wipe
//! - [`DiskRegistryState`]: the orchestrator implementing every operation
//!
//! Every mutating operation records its changes through a
//! [`diskreg_store::DiskRegistryDatabase`]; the host commits them per call.

pub mod agent_list;
pub mod notification;
pub mod pending_cleanup;
pub mod replica_table;
pub mod state;

pub use agent_list::AgentList;
pub use notification::NotificationSystem;
pub use pending_cleanup::PendingCleanup;
pub use replica_table::{MirroredDiskInfo, ReplicaDevice, ReplicaTable};
pub use state::{
    AgentStorageInfo, AllocateDiskParams, AllocateDiskResult, CmsUpdate, ConfigUpdate,
    DeviceMigrationInfo, DiskInfo, DiskRegistryState, MembershipUpdate, PoolCounters,
    RegisterAgentResult, RegistryCounters, VolumeConfigUpdate,
};
