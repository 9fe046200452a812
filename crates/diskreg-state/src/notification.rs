//! Notification system
//!
//! Keeps the notifications external consumers must pick up: reallocate
//! requests and outdated volume configs keyed by disk, a log of disk state
//! changes and user-visible notifications. Every entry carries a sequence
//! number; consumers acknowledge delivery by sequence number.

use diskreg_common::{
    DiskId, DiskState, DiskStateUpdate, DiskToReallocate, OutdatedVolumeConfig, Timestamp,
    UserNotification, UserNotificationEvent,
};
use diskreg_store::DiskRegistryDatabase;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

#[derive(Debug, Default)]
pub struct NotificationSystem {
    disk_seq_no: u64,
    disks_to_reallocate: BTreeMap<DiskId, u64>,
    outdated_volume_configs: BTreeMap<DiskId, u64>,
    supports_notifications: HashSet<DiskId>,
    disk_state_seq_no: u64,
    disk_state_changes: Vec<DiskStateUpdate>,
    user_notifications: BTreeMap<u64, UserNotification>,
}

impl NotificationSystem {
    /// Restore from persisted entries
    #[must_use]
    pub fn new(
        last_disk_state_seq_no: u64,
        last_disk_seq_no: u64,
        disks_to_reallocate: Vec<DiskToReallocate>,
        outdated_volume_configs: Vec<OutdatedVolumeConfig>,
        mut disk_state_changes: Vec<DiskStateUpdate>,
        user_notifications: Vec<UserNotification>,
    ) -> Self {
        disk_state_changes.sort_by_key(|u| u.seq_no);

        let disk_seq_no = disks_to_reallocate
            .iter()
            .map(|d| d.seq_no)
            .chain(outdated_volume_configs.iter().map(|d| d.seq_no))
            .map(|seq_no| seq_no + 1)
            .fold(last_disk_seq_no.max(1), u64::max);

        let disk_state_seq_no = disk_state_changes
            .iter()
            .map(|u| u.seq_no + 1)
            .chain(user_notifications.iter().map(|n| n.seq_no + 1))
            .fold(last_disk_state_seq_no, u64::max);

        Self {
            disk_seq_no,
            disks_to_reallocate: disks_to_reallocate
                .into_iter()
                .map(|d| (d.disk_id, d.seq_no))
                .collect(),
            outdated_volume_configs: outdated_volume_configs
                .into_iter()
                .map(|d| (d.disk_id, d.seq_no))
                .collect(),
            supports_notifications: HashSet::new(),
            disk_state_seq_no,
            disk_state_changes,
            user_notifications: user_notifications
                .into_iter()
                .map(|n| (n.seq_no, n))
                .collect(),
        }
    }

    fn next_disk_seq_no(&mut self, db: &mut dyn DiskRegistryDatabase) -> u64 {
        let seq_no = self.disk_seq_no;
        self.disk_seq_no += 1;
        db.write_last_disk_seq_no(self.disk_seq_no);
        seq_no
    }

    /// Next free disk sequence number
    #[must_use]
    pub fn last_disk_seq_no(&self) -> u64 {
        self.disk_seq_no
    }

    /// Let clients be told about state changes of `disk_id`
    pub fn allow_notifications(&mut self, disk_id: &str) {
        self.supports_notifications.insert(disk_id.to_string());
    }

    /// Drop everything pending for a destroyed disk
    pub fn delete_disk(&mut self, db: &mut dyn DiskRegistryDatabase, disk_id: &str) {
        self.supports_notifications.remove(disk_id);
        if self.disks_to_reallocate.remove(disk_id).is_some() {
            db.delete_disk_to_reallocate(disk_id);
        }
        if self.outdated_volume_configs.remove(disk_id).is_some() {
            db.delete_outdated_volume_config(disk_id);
        }
    }

    /// Ask clients of `disk_id` to re-fetch the device layout
    pub fn add_reallocate_request(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) -> u64 {
        let seq_no = self.next_disk_seq_no(db);
        self.disks_to_reallocate.insert(disk_id.to_string(), seq_no);
        db.add_disk_to_reallocate(disk_id, seq_no);
        debug!("Reallocate request for disk '{}' #{}", disk_id, seq_no);
        seq_no
    }

    /// Sequence number of the pending reallocate request of `disk_id`, or a
    /// fresh in-memory one when nothing is pending
    ///
    /// Used on load for finished migrations whose request was lost.
    pub fn reallocate_seq_no_on_load(&mut self, disk_id: &str) -> u64 {
        if let Some(&seq_no) = self.disks_to_reallocate.get(disk_id) {
            return seq_no;
        }
        let seq_no = self.disk_seq_no;
        self.disk_seq_no += 1;
        self.disks_to_reallocate.insert(disk_id.to_string(), seq_no);
        seq_no
    }

    #[must_use]
    pub fn disks_to_reallocate(&self) -> &BTreeMap<DiskId, u64> {
        &self.disks_to_reallocate
    }

    /// Acknowledge reallocate requests of `disk_id` up to `seq_no`
    pub fn delete_disk_to_reallocate(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        seq_no: u64,
    ) -> bool {
        match self.disks_to_reallocate.get(disk_id) {
            Some(&pending) if pending <= seq_no => {
                self.disks_to_reallocate.remove(disk_id);
                db.delete_disk_to_reallocate(disk_id);
                true
            }
            _ => false,
        }
    }

    /// Mark the volume config of `disk_id` as stale
    pub fn add_outdated_volume_config(&mut self, db: &mut dyn DiskRegistryDatabase, disk_id: &str) {
        let seq_no = self.next_disk_seq_no(db);
        self.outdated_volume_configs
            .insert(disk_id.to_string(), seq_no);
        db.add_outdated_volume_config(disk_id, seq_no);
    }

    #[must_use]
    pub fn outdated_volume_configs(&self) -> Vec<DiskId> {
        self.outdated_volume_configs.keys().cloned().collect()
    }

    #[must_use]
    pub fn outdated_volume_config_seq_no(&self, disk_id: &str) -> Option<u64> {
        self.outdated_volume_configs.get(disk_id).copied()
    }

    pub fn delete_outdated_volume_config(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
    ) {
        if self.outdated_volume_configs.remove(disk_id).is_some() {
            db.delete_outdated_volume_config(disk_id);
        }
    }

    /// Record a disk state transition
    pub fn on_disk_state_changed(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        old_state: DiskState,
        new_state: DiskState,
        message: &str,
        ts: Timestamp,
    ) {
        let seq_no = self.disk_state_seq_no;
        self.disk_state_seq_no += 1;

        let update = DiskStateUpdate {
            disk_id: disk_id.to_string(),
            state: new_state,
            state_message: message.to_string(),
            seq_no,
        };
        db.add_disk_state_change(&update);
        self.disk_state_changes.push(update);

        if self.supports_notifications.contains(disk_id) {
            let event = if new_state == DiskState::Error {
                Some(UserNotificationEvent::DiskError {
                    disk_id: disk_id.to_string(),
                })
            } else if old_state == DiskState::Error
                && new_state < DiskState::TemporarilyUnavailable
            {
                Some(UserNotificationEvent::DiskBackOnline {
                    disk_id: disk_id.to_string(),
                })
            } else {
                None
            };

            if let Some(event) = event {
                self.add_user_notification(db, event, ts);
            }
        }

        db.write_last_disk_state_seq_no(self.disk_state_seq_no);
    }

    #[must_use]
    pub fn disk_state_changes(&self) -> &[DiskStateUpdate] {
        &self.disk_state_changes
    }

    /// Acknowledge state changes of `disk_id` up to `seq_no`
    pub fn delete_disk_state_changes(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        disk_id: &str,
        seq_no: u64,
    ) {
        self.disk_state_changes.retain(|u| {
            if u.disk_id == disk_id && u.seq_no <= seq_no {
                db.delete_disk_state_changes(disk_id, u.seq_no);
                false
            } else {
                true
            }
        });
    }

    #[must_use]
    pub fn last_disk_state_seq_no(&self) -> u64 {
        self.disk_state_seq_no
    }

    fn add_user_notification(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        event: UserNotificationEvent,
        ts: Timestamp,
    ) {
        let seq_no = self.disk_state_seq_no;
        self.disk_state_seq_no += 1;

        let notification = UserNotification {
            seq_no,
            timestamp: ts,
            event,
        };
        db.add_user_notification(&notification);
        self.user_notifications.insert(seq_no, notification);
    }

    #[must_use]
    pub fn user_notifications(&self) -> Vec<UserNotification> {
        self.user_notifications.values().cloned().collect()
    }

    pub fn delete_user_notification(&mut self, db: &mut dyn DiskRegistryDatabase, seq_no: u64) {
        if self.user_notifications.remove(&seq_no).is_some() {
            db.delete_user_notification(seq_no);
        }
    }

    #[must_use]
    pub fn disks_to_reallocate_backup(&self) -> Vec<DiskToReallocate> {
        self.disks_to_reallocate
            .iter()
            .map(|(disk_id, &seq_no)| DiskToReallocate {
                disk_id: disk_id.clone(),
                seq_no,
            })
            .collect()
    }

    #[must_use]
    pub fn outdated_volume_configs_backup(&self) -> Vec<OutdatedVolumeConfig> {
        self.outdated_volume_configs
            .iter()
            .map(|(disk_id, &seq_no)| OutdatedVolumeConfig {
                disk_id: disk_id.clone(),
                seq_no,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskreg_store::{WriteBatch, WriteOp};

    #[test]
    fn test_reallocate_seq_no_monotonic() {
        let mut ns = NotificationSystem::default();
        let mut db = WriteBatch::new();

        let s1 = ns.add_reallocate_request(&mut db, "vol0");
        let s2 = ns.add_reallocate_request(&mut db, "vol0");
        let s3 = ns.add_reallocate_request(&mut db, "vol1");
        assert!(s1 < s2 && s2 < s3);

        assert!(!ns.delete_disk_to_reallocate(&mut db, "vol0", s1));
        assert!(ns.delete_disk_to_reallocate(&mut db, "vol0", s2));
        assert_eq!(ns.disks_to_reallocate().len(), 1);
    }

    #[test]
    fn test_restore_continues_sequences() {
        let ns = NotificationSystem::new(
            10,
            0,
            vec![DiskToReallocate {
                disk_id: "vol0".into(),
                seq_no: 41,
            }],
            vec![],
            vec![],
            vec![],
        );
        let mut ns = ns;
        let mut db = WriteBatch::new();
        assert_eq!(ns.add_reallocate_request(&mut db, "vol1"), 42);
        assert_eq!(ns.last_disk_state_seq_no(), 10);
    }

    #[test]
    fn test_acknowledged_seq_no_is_not_reused() {
        let mut ns = NotificationSystem::default();
        let mut db = WriteBatch::new();

        let s1 = ns.add_reallocate_request(&mut db, "vol0");
        let s2 = ns.add_reallocate_request(&mut db, "vol1");
        assert!(ns.delete_disk_to_reallocate(&mut db, "vol0", s1));
        assert!(ns.delete_disk_to_reallocate(&mut db, "vol1", s2));
        assert!(db.ops().contains(&WriteOp::WriteLastDiskSeqNo(s2 + 1)));

        // nothing pending survives a restart, only the persisted counter
        let mut ns =
            NotificationSystem::new(0, ns.last_disk_seq_no(), vec![], vec![], vec![], vec![]);
        assert_eq!(ns.add_reallocate_request(&mut db, "vol2"), s2 + 1);
    }

    #[test]
    fn test_user_notifications_follow_disk_state() {
        let mut ns = NotificationSystem::default();
        let mut db = WriteBatch::new();
        let ts = Timestamp::from_secs(1);

        // no notifications for disks that did not opt in
        ns.on_disk_state_changed(&mut db, "vol0", DiskState::Online, DiskState::Error, "", ts);
        assert!(ns.user_notifications().is_empty());

        ns.allow_notifications("vol0");
        ns.on_disk_state_changed(&mut db, "vol0", DiskState::Online, DiskState::Error, "", ts);
        ns.on_disk_state_changed(&mut db, "vol0", DiskState::Error, DiskState::Online, "", ts);
        let notifications = ns.user_notifications();
        assert_eq!(notifications.len(), 2);
        assert!(matches!(
            notifications[1].event,
            UserNotificationEvent::DiskBackOnline { .. }
        ));

        assert_eq!(ns.disk_state_changes().len(), 3);
        let last = ns.disk_state_changes()[2].seq_no;
        ns.delete_disk_state_changes(&mut db, "vol0", last);
        assert!(ns.disk_state_changes().is_empty());

        let seq = notifications[0].seq_no;
        ns.delete_user_notification(&mut db, seq);
        assert_eq!(ns.user_notifications().len(), 1);
        assert!(db.ops().contains(&WriteOp::DeleteUserNotification(seq)));
    }

    #[test]
    fn test_delete_disk_drops_pending() {
        let mut ns = NotificationSystem::default();
        let mut db = WriteBatch::new();
        ns.add_reallocate_request(&mut db, "vol0");
        ns.add_outdated_volume_config(&mut db, "vol0");
        assert!(ns.outdated_volume_config_seq_no("vol0").is_some());

        ns.delete_disk(&mut db, "vol0");
        assert!(ns.disks_to_reallocate().is_empty());
        assert!(ns.outdated_volume_configs().is_empty());
    }
}
