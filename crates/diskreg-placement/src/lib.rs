//! Disk Registry Placement - device catalog and allocation
//!
//! This crate owns the free-device index used to place virtual disks on
//! physical devices under rack, pool and node constraints.
//!
//! # Allocation
//! Racks are ranked by preference, then by free bytes, then by id. Devices
//! are taken greedily inside each rack until the requested size is covered.
//! Local pools never span nodes: a node that cannot hold the whole request
//! contributes nothing.

pub mod device_list;
pub mod query;

pub use device_list::DeviceList;
pub use query::AllocationQuery;
