//! Persistent registry store backed by redb.
//!
//! A [`WriteBatch`] recorded by one registry operation is applied in a single
//! write transaction. The in-memory model lives in the registry state; this
//! module only handles persistence and snapshot loading.

use crate::batch::WriteBatch;
use crate::database::WriteOp;
use crate::tables::{self, Table, node_key, seq_key};
use diskreg_common::{
    AgentConfig, AgentListParams, AutomaticallyReplacedDeviceInfo, BrokenDiskInfo, DirtyDevice,
    DiskConfig, DiskRegistryBackup, DiskRegistryConfig, DiskStateUpdate, DiskToReallocate,
    OutdatedVolumeConfig, PlacementGroupConfig, SuspendedDevice, Timestamp, UserNotification,
};
use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

const CONFIG_KEY: &str = "config";
const LAST_SEQ_NO_KEY: &str = "last_disk_state_seq_no";
const LAST_DISK_SEQ_NO_KEY: &str = "last_disk_seq_no";
const WRITABLE_KEY: &str = "writable_state";

/// Error type for registry store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent registry store backed by redb.
pub struct DiskRegistryStore {
    db: Database,
}

impl DiskRegistryStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        for table in tables::ALL_TABLES {
            let _t = write_txn.open_table(table)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Apply every operation of `batch` in one transaction
    pub fn commit(&self, batch: &mut WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let ops = batch.take();
        let write_txn = self.db.begin_write()?;
        for op in &ops {
            apply(&write_txn, op)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read the whole registry state
    ///
    /// Agents only known from the old-agent index are merged in, and user
    /// notifications older than `notification_ttl` are dropped for good.
    pub fn load_snapshot(
        &self,
        now: Timestamp,
        notification_ttl: Duration,
    ) -> StoreResult<DiskRegistryBackup> {
        let read_txn = self.db.begin_read()?;

        let mut config: DiskRegistryConfig =
            load_value(&read_txn, tables::CONFIG, CONFIG_KEY)?.unwrap_or_default();
        config.last_disk_state_seq_no =
            load_value(&read_txn, tables::CONFIG, LAST_SEQ_NO_KEY)?.unwrap_or_default();
        config.last_disk_seq_no =
            load_value(&read_txn, tables::CONFIG, LAST_DISK_SEQ_NO_KEY)?.unwrap_or_default();
        let writable_state: bool =
            load_value(&read_txn, tables::WRITABLE_STATE, WRITABLE_KEY)?.unwrap_or_default();
        config.writable_state = writable_state;

        let mut agents: Vec<AgentConfig> = load_values(&read_txn, tables::AGENTS)?;
        for old in load_values::<AgentConfig>(&read_txn, tables::OLD_AGENTS)? {
            if !agents.iter().any(|a| a.agent_id == old.agent_id) {
                info!("Restoring agent '{}' from the old agent index", old.agent_id);
                agents.push(old);
            }
        }

        let (user_notifications, expired): (Vec<UserNotification>, Vec<UserNotification>) =
            load_values::<UserNotification>(&read_txn, tables::USER_NOTIFICATIONS)?
                .into_iter()
                .partition(|n| n.timestamp + notification_ttl >= now);

        let backup = DiskRegistryBackup {
            config,
            agents,
            disks: load_values::<DiskConfig>(&read_txn, tables::DISKS)?,
            placement_groups: load_values::<PlacementGroupConfig>(
                &read_txn,
                tables::PLACEMENT_GROUPS,
            )?,
            dirty_devices: load_values::<DirtyDevice>(&read_txn, tables::DIRTY_DEVICES)?,
            suspended_devices: load_values::<SuspendedDevice>(
                &read_txn,
                tables::SUSPENDED_DEVICES,
            )?,
            broken_disks: load_values::<BrokenDiskInfo>(&read_txn, tables::BROKEN_DISKS)?,
            disks_to_cleanup: load_keys(&read_txn, tables::DISKS_TO_CLEANUP)?,
            disks_to_reallocate: load_entries::<u64>(&read_txn, tables::DISKS_TO_REALLOCATE)?
                .into_iter()
                .map(|(disk_id, seq_no)| DiskToReallocate { disk_id, seq_no })
                .collect(),
            outdated_volume_configs: load_entries::<u64>(
                &read_txn,
                tables::OUTDATED_VOLUME_CONFIGS,
            )?
            .into_iter()
            .map(|(disk_id, seq_no)| OutdatedVolumeConfig { disk_id, seq_no })
            .collect(),
            disk_state_changes: load_values::<DiskStateUpdate>(
                &read_txn,
                tables::DISK_STATE_CHANGES,
            )?,
            user_notifications,
            automatically_replaced_devices: load_values::<AutomaticallyReplacedDeviceInfo>(
                &read_txn,
                tables::AUTOMATICALLY_REPLACED_DEVICES,
            )?,
            agent_list_params: load_entries::<AgentListParams>(
                &read_txn,
                tables::AGENT_LIST_PARAMS,
            )?,
            writable_state,
        };
        drop(read_txn);

        if !expired.is_empty() {
            warn!("Dropping {} expired user notifications", expired.len());
            let mut batch = WriteBatch::new();
            for n in &expired {
                crate::DiskRegistryDatabase::delete_user_notification(&mut batch, n.seq_no);
            }
            if let Err(e) = self.commit(&mut batch) {
                error!("Failed to delete expired user notifications: {}", e);
            }
        }

        Ok(backup)
    }

    /// Replace the whole store content with `backup`
    pub fn restore(&self, backup: &DiskRegistryBackup) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        for table in tables::ALL_TABLES {
            write_txn.delete_table(table)?;
            let _t = write_txn.open_table(table)?;
        }

        let mut config = backup.config.clone();
        config.writable_state = backup.writable_state;

        let ops = std::iter::once(WriteOp::WriteConfig(config.clone()))
            .chain(std::iter::once(WriteOp::WriteLastDiskStateSeqNo(
                config.last_disk_state_seq_no,
            )))
            .chain(std::iter::once(WriteOp::WriteLastDiskSeqNo(
                config.last_disk_seq_no,
            )))
            .chain(std::iter::once(WriteOp::WriteWritableState(
                backup.writable_state,
            )))
            .chain(backup.agents.iter().cloned().map(WriteOp::UpdateAgent))
            .chain(backup.disks.iter().cloned().map(WriteOp::UpdateDisk))
            .chain(
                backup
                    .placement_groups
                    .iter()
                    .cloned()
                    .map(WriteOp::UpdatePlacementGroup),
            )
            .chain(
                backup
                    .dirty_devices
                    .iter()
                    .cloned()
                    .map(WriteOp::UpdateDirtyDevice),
            )
            .chain(
                backup
                    .suspended_devices
                    .iter()
                    .cloned()
                    .map(WriteOp::UpdateSuspendedDevice),
            )
            .chain(backup.broken_disks.iter().cloned().map(WriteOp::AddBrokenDisk))
            .chain(
                backup
                    .disks_to_cleanup
                    .iter()
                    .cloned()
                    .map(WriteOp::AddDiskToCleanup),
            )
            .chain(
                backup
                    .disks_to_reallocate
                    .iter()
                    .map(|d| WriteOp::AddDiskToReallocate(d.disk_id.clone(), d.seq_no)),
            )
            .chain(
                backup
                    .outdated_volume_configs
                    .iter()
                    .map(|d| WriteOp::AddOutdatedVolumeConfig(d.disk_id.clone(), d.seq_no)),
            )
            .chain(
                backup
                    .disk_state_changes
                    .iter()
                    .cloned()
                    .map(WriteOp::AddDiskStateChange),
            )
            .chain(
                backup
                    .user_notifications
                    .iter()
                    .cloned()
                    .map(WriteOp::AddUserNotification),
            )
            .chain(
                backup
                    .automatically_replaced_devices
                    .iter()
                    .cloned()
                    .map(WriteOp::AddAutomaticallyReplacedDevice),
            )
            .chain(
                backup
                    .agent_list_params
                    .iter()
                    .map(|(id, params)| WriteOp::AddAgentListParams(id.clone(), *params)),
            );

        for op in ops {
            apply(&write_txn, &op)?;
        }
        write_txn.commit()?;

        info!(
            "Restored registry backup: {} agents, {} disks, {} placement groups",
            backup.agents.len(),
            backup.disks.len(),
            backup.placement_groups.len()
        );
        Ok(())
    }
}

// ---- Generic helpers ----

fn apply(txn: &WriteTransaction, op: &WriteOp) -> StoreResult<()> {
    match op {
        WriteOp::UpdateAgent(agent) => put_bincode(txn, tables::AGENTS, &agent.agent_id, agent),
        WriteOp::DeleteAgent(id) => delete_key(txn, tables::AGENTS, id),
        WriteOp::UpdateOldAgent(agent) => {
            put_bincode(txn, tables::OLD_AGENTS, &node_key(agent.node_id), agent)
        }
        WriteOp::DeleteOldAgent(node_id) => {
            delete_key(txn, tables::OLD_AGENTS, &node_key(*node_id))
        }
        WriteOp::UpdateDisk(disk) => put_bincode(txn, tables::DISKS, &disk.disk_id, disk),
        WriteOp::DeleteDisk(id) => delete_key(txn, tables::DISKS, id),
        WriteOp::UpdatePlacementGroup(group) => {
            put_bincode(txn, tables::PLACEMENT_GROUPS, &group.group_id, group)
        }
        WriteOp::DeletePlacementGroup(id) => delete_key(txn, tables::PLACEMENT_GROUPS, id),
        WriteOp::UpdateDirtyDevice(device) => {
            put_bincode(txn, tables::DIRTY_DEVICES, &device.id, device)
        }
        WriteOp::DeleteDirtyDevice(id) => delete_key(txn, tables::DIRTY_DEVICES, id),
        WriteOp::UpdateSuspendedDevice(device) => {
            put_bincode(txn, tables::SUSPENDED_DEVICES, &device.id, device)
        }
        WriteOp::DeleteSuspendedDevice(id) => delete_key(txn, tables::SUSPENDED_DEVICES, id),
        WriteOp::AddBrokenDisk(info) => put_bincode(txn, tables::BROKEN_DISKS, &info.disk_id, info),
        WriteOp::DeleteBrokenDisk(id) => delete_key(txn, tables::BROKEN_DISKS, id),
        WriteOp::AddDiskToCleanup(id) => put_bincode(txn, tables::DISKS_TO_CLEANUP, id, &()),
        WriteOp::DeleteDiskToCleanup(id) => delete_key(txn, tables::DISKS_TO_CLEANUP, id),
        WriteOp::AddAutomaticallyReplacedDevice(info) => put_bincode(
            txn,
            tables::AUTOMATICALLY_REPLACED_DEVICES,
            &info.device_id,
            info,
        ),
        WriteOp::DeleteAutomaticallyReplacedDevice(id) => {
            delete_key(txn, tables::AUTOMATICALLY_REPLACED_DEVICES, id)
        }
        WriteOp::AddAgentListParams(id, params) => {
            put_bincode(txn, tables::AGENT_LIST_PARAMS, id, params)
        }
        WriteOp::DeleteAgentListParams(id) => delete_key(txn, tables::AGENT_LIST_PARAMS, id),
        WriteOp::WriteConfig(config) => put_bincode(txn, tables::CONFIG, CONFIG_KEY, config),
        WriteOp::AddDiskToReallocate(id, seq_no) => {
            put_bincode(txn, tables::DISKS_TO_REALLOCATE, id, seq_no)
        }
        WriteOp::DeleteDiskToReallocate(id) => delete_key(txn, tables::DISKS_TO_REALLOCATE, id),
        WriteOp::AddOutdatedVolumeConfig(id, seq_no) => {
            put_bincode(txn, tables::OUTDATED_VOLUME_CONFIGS, id, seq_no)
        }
        WriteOp::DeleteOutdatedVolumeConfig(id) => {
            delete_key(txn, tables::OUTDATED_VOLUME_CONFIGS, id)
        }
        WriteOp::AddDiskStateChange(update) => put_bincode(
            txn,
            tables::DISK_STATE_CHANGES,
            &seq_key(update.seq_no),
            update,
        ),
        WriteOp::DeleteDiskStateChanges(_, seq_no) => {
            delete_key(txn, tables::DISK_STATE_CHANGES, &seq_key(*seq_no))
        }
        WriteOp::WriteLastDiskStateSeqNo(seq_no) => {
            put_bincode(txn, tables::CONFIG, LAST_SEQ_NO_KEY, seq_no)
        }
        WriteOp::WriteLastDiskSeqNo(seq_no) => {
            put_bincode(txn, tables::CONFIG, LAST_DISK_SEQ_NO_KEY, seq_no)
        }
        WriteOp::AddUserNotification(n) => {
            put_bincode(txn, tables::USER_NOTIFICATIONS, &seq_key(n.seq_no), n)
        }
        WriteOp::DeleteUserNotification(seq_no) => {
            delete_key(txn, tables::USER_NOTIFICATIONS, &seq_key(*seq_no))
        }
        WriteOp::WriteWritableState(writable) => {
            put_bincode(txn, tables::WRITABLE_STATE, WRITABLE_KEY, writable)
        }
    }
}

fn put_bincode<T: Serialize>(
    txn: &WriteTransaction,
    table_def: Table,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    let bytes = bincode::serialize(value)?;
    let mut table = txn.open_table(table_def)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

fn delete_key(txn: &WriteTransaction, table_def: Table, key: &str) -> StoreResult<()> {
    let mut table = txn.open_table(table_def)?;
    table.remove(key)?;
    Ok(())
}

fn load_value<T: DeserializeOwned>(
    txn: &ReadTransaction,
    table_def: Table,
    key: &str,
) -> StoreResult<Option<T>> {
    let table = txn.open_table(table_def)?;
    match table.get(key)? {
        Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
        None => Ok(None),
    }
}

fn load_entries<T: DeserializeOwned>(
    txn: &ReadTransaction,
    table_def: Table,
) -> StoreResult<Vec<(String, T)>> {
    let table = txn.open_table(table_def)?;
    let mut result = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        let key = entry.0.value().to_string();
        match bincode::deserialize::<T>(entry.1.value()) {
            Ok(val) => result.push((key, val)),
            Err(e) => error!("Failed to decode entry '{}': {}", key, e),
        }
    }
    Ok(result)
}

fn load_values<T: DeserializeOwned>(
    txn: &ReadTransaction,
    table_def: Table,
) -> StoreResult<Vec<T>> {
    Ok(load_entries(txn, table_def)?
        .into_iter()
        .map(|(_, v)| v)
        .collect())
}

fn load_keys(txn: &ReadTransaction, table_def: Table) -> StoreResult<Vec<String>> {
    let table = txn.open_table(table_def)?;
    let mut result = Vec::new();
    for entry in table.iter()? {
        result.push(entry?.0.value().to_string());
    }
    Ok(result)
}
