//! Agent registration, agent state transitions and the CMS host protocol

use super::DiskRegistryState;
use diskreg_common::critical::{self, CriticalEvent};
use diskreg_common::{
    AgentConfig, AgentId, AgentListParams, AgentState, DevicePoolKind, DeviceState, DiskId, Error,
    NodeId, Result, Status, StorageConfig, Timestamp,
};
use diskreg_store::DiskRegistryDatabase;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Disks touched by an agent registration
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterAgentResult {
    /// Disks whose derived state changed
    pub affected_disks: Vec<DiskId>,
    /// Disks whose clients must re-fetch device routing
    pub disks_to_reallocate: Vec<DiskId>,
}

/// Outcome of a maintenance request
///
/// A request that must wait still applies its state change; `outcome`
/// carries the `TryAgain` advice separately from hard failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmsUpdate {
    pub outcome: Result<()>,
    /// Advised wait before polling again (zero when granted)
    pub timeout: Duration,
    pub affected_disks: Vec<DiskId>,
}

/// Grace window of a maintenance request for an agent in `state`
pub(super) fn infra_timeout(config: &StorageConfig, state: AgentState) -> Duration {
    if state == AgentState::Unavailable {
        config.non_replicated_infra_unavailable_agent_timeout()
    } else {
        config.non_replicated_infra_timeout()
    }
}

impl DiskRegistryState {
    fn validate_agent(&self, config: &AgentConfig) -> Result<()> {
        let agent_id = &config.agent_id;

        if agent_id.is_empty() {
            return Err(Error::argument("empty agent id"));
        }

        if config.node_id == 0 {
            return Err(Error::argument("empty node id"));
        }

        if let Some(buddy) = self.agent_list.find_agent_by_node(config.node_id) {
            if &buddy.agent_id != agent_id && buddy.state != AgentState::Unavailable {
                return Err(Error::invalid_state(format!(
                    "Agent '{}' already registered at node #{}",
                    buddy.agent_id, config.node_id
                )));
            }
        }

        if let Some(buddy) = self.agent_list.find_agent(agent_id) {
            if buddy.seq_number > config.seq_number && buddy.state != AgentState::Unavailable {
                return Err(Error::invalid_state(format!(
                    "Agent '{}' already registered with a greater SeqNo ({} > {})",
                    buddy.agent_id, buddy.seq_number, config.seq_number
                )));
            }
        }

        if !self.known_agents.contains_key(agent_id) {
            return Ok(());
        }

        let rack = config.devices.first().map_or("", |d| d.rack.as_str());
        if let Some(device) = config.devices.iter().find(|d| d.rack != rack) {
            return Err(Error::argument(format!(
                "all agent devices should come from the same rack, mismatch: {} != {}",
                rack, device.rack
            )));
        }

        Ok(())
    }

    /// Register (or re-register) an agent with its current device list
    pub fn register_agent(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        config: AgentConfig,
        now: Timestamp,
    ) -> Result<RegisterAgentResult> {
        self.validate_agent(&config)?;

        let mut result = RegisterAgentResult::default();

        let buddy_id = self
            .agent_list
            .find_agent_by_node(config.node_id)
            .filter(|b| b.agent_id != config.agent_id)
            .map(|b| b.agent_id.clone());

        if let Some(buddy_id) = buddy_id {
            info!(
                "Agent '{}' occupies node #{} wanted by '{}', kicking it out",
                buddy_id, config.node_id, config.agent_id
            );
            self.remove_agent_from_node(db, &buddy_id, now, &mut result);
        }

        let agent_id = config.agent_id.clone();
        let node_id = config.node_id;
        let known_agent = self.known_agents.get(&agent_id).cloned();
        let prev_node_id = self.agent_list.find_node_id(&agent_id);

        let new_devices = self
            .agent_list
            .register_agent(config, now, known_agent.as_ref());

        let mut to_suspend = Vec::new();
        if let Some(agent) = self.agent_list.find_agent_mut(&agent_id) {
            for device in &mut agent.devices {
                let allocated = !self.device_list.find_disk_id(&device.device_uuid).is_empty();
                super::adjust_device_if_needed(&self.device_pools, allocated, device, now);

                if !self.storage_config.non_replicated_dont_suspend_devices
                    && device.pool_kind == DevicePoolKind::Local
                    && new_devices.contains(&device.device_uuid)
                {
                    to_suspend.push(device.device_uuid.clone());
                }
            }
        }

        for uuid in &to_suspend {
            self.suspend(db, uuid);
        }

        if let Some(agent) = self.agent_list.find_agent(&agent_id) {
            self.device_list.update_devices_from(agent, prev_node_id);
        }

        for uuid in &new_devices {
            if self.device_list.find_disk_id(uuid).is_empty() {
                self.device_list.mark_device_as_dirty(uuid);
                db.update_dirty_device(uuid, "");
            }
        }

        let devices: Vec<(String, DeviceState)> = self
            .agent_list
            .find_agent(&agent_id)
            .map(|a| {
                a.devices
                    .iter()
                    .map(|d| (d.device_uuid.clone(), d.state))
                    .collect()
            })
            .unwrap_or_default();

        let mut disk_ids = BTreeSet::new();
        for (uuid, state) in devices {
            let disk_id = self.find_disk(&uuid).to_string();
            if disk_id.is_empty() {
                continue;
            }

            if state == DeviceState::Error && !self.restart_device_migration(db, &disk_id, &uuid) {
                self.cancel_device_migration(db, &disk_id, &uuid);
            }

            disk_ids.insert(disk_id);
        }

        for disk_id in &disk_ids {
            if self.try_update_disk_state(db, disk_id, now) {
                result.affected_disks.push(disk_id.clone());
            }
        }

        if prev_node_id != node_id {
            if prev_node_id != 0 {
                db.delete_old_agent(prev_node_id);
            }

            for disk_id in disk_ids {
                self.add_reallocate_request(db, &disk_id);
                result.disks_to_reallocate.push(disk_id);
            }
        }

        let back_from_unavailable = self
            .agent_list
            .find_agent(&agent_id)
            .is_some_and(|a| a.state == AgentState::Unavailable);

        if back_from_unavailable {
            if let Some(agent) = self.agent_list.find_agent_mut(&agent_id) {
                agent.cms_ts = Timestamp::ZERO;
            }
            self.change_agent_state(&agent_id, AgentState::Warning, now, "back from unavailable");
            self.apply_agent_state_change(db, &agent_id, now, &mut result.affected_disks);
        }

        self.persist_agent(db, &agent_id);

        info!(
            "Registered agent '{}' on node #{} ({} new devices)",
            agent_id,
            node_id,
            new_devices.len()
        );

        Ok(result)
    }

    /// Detach a competing agent from its node
    fn remove_agent_from_node(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        agent_id: &str,
        now: Timestamp,
        result: &mut RegisterAgentResult,
    ) {
        debug_assert!(
            self.agent_list
                .find_agent(agent_id)
                .is_some_and(|a| a.state == AgentState::Unavailable)
        );

        let node_id = self.agent_list.remove_agent_from_node(agent_id);
        self.change_agent_state(agent_id, AgentState::Unavailable, now, "lost");

        let Some(agent) = self.agent_list.find_agent(agent_id) else {
            return;
        };

        let disk_ids: BTreeSet<DiskId> = agent
            .devices
            .iter()
            .map(|d| self.find_disk(&d.device_uuid))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();

        self.device_list.update_devices_from(agent, node_id);
        db.update_agent(agent);
        db.delete_old_agent(node_id);

        for disk_id in disk_ids {
            self.add_reallocate_request(db, &disk_id);
            result.disks_to_reallocate.push(disk_id);
        }

        self.apply_agent_state_change(db, agent_id, now, &mut result.affected_disks);
    }

    /// Forget the agent registered at `node_id`
    pub fn unregister_agent(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        node_id: NodeId,
    ) -> Result<Status> {
        let Some(agent_id) = self
            .agent_list
            .find_agent_by_node(node_id)
            .map(|a| a.agent_id.clone())
        else {
            debug!("No agent at node #{} to unregister", node_id);
            return Ok(Status::Already);
        };

        self.forget_agent(db, &agent_id);
        Ok(Status::Ok)
    }

    /// Decommission an agent that no disk depends on
    pub fn remove_agent(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        agent_id: &str,
    ) -> Result<()> {
        let Some(agent) = self.agent_list.find_agent(agent_id) else {
            return Err(Error::not_found(format!("agent '{agent_id}' not found")));
        };

        if let Some(device) = agent
            .devices
            .iter()
            .find(|d| !self.find_disk(&d.device_uuid).is_empty())
        {
            return Err(Error::invalid_state(format!(
                "agent '{}' has dependent disk '{}'",
                agent_id,
                self.find_disk(&device.device_uuid)
            )));
        }

        self.forget_agent(db, agent_id);
        Ok(())
    }

    fn forget_agent(&mut self, db: &mut dyn DiskRegistryDatabase, agent_id: &str) {
        let Some(agent) = self.agent_list.find_agent(agent_id) else {
            return;
        };
        self.device_list.remove_devices(agent);

        let Some(agent) = self.agent_list.remove_agent(agent_id) else {
            return;
        };

        if agent.node_id != 0 {
            db.delete_old_agent(agent.node_id);
        }
        db.delete_agent(agent_id);
        db.delete_agent_list_params(agent_id);

        info!("Agent '{}' removed", agent_id);
    }

    /// Move an agent to `new_state`, accounting uptime for MTBF
    ///
    /// A drop to Unavailable counts as a failure unless the agent was
    /// already draining with nothing left on it.
    fn change_agent_state(
        &mut self,
        agent_id: &str,
        new_state: AgentState,
        now: Timestamp,
        message: &str,
    ) {
        let Some(agent) = self.agent_list.find_agent(agent_id) else {
            return;
        };

        let old_state = agent.state;
        let mut work_ts = agent.work_ts;

        if new_state != old_state {
            if new_state == AgentState::Unavailable {
                if old_state != AgentState::Warning || self.has_dependent_disks(agent) {
                    let since = if agent.work_ts.is_zero() {
                        agent.state_ts
                    } else {
                        agent.work_ts
                    };
                    let work_time = now.saturating_duration_since(since);
                    self.agent_list.record_failure(agent_id, work_time);
                }
                work_ts = Timestamp::ZERO;
            } else if old_state == AgentState::Unavailable {
                work_ts = now;
            }

            info!(
                "Agent '{}' state changed: {} -> {} ({})",
                agent_id, old_state, new_state, message
            );
        }

        if let Some(agent) = self.agent_list.find_agent_mut(agent_id) {
            agent.state = new_state;
            agent.state_ts = now;
            agent.state_message = message.to_string();
            agent.work_ts = work_ts;
        }
    }

    fn check_agent_state_transition(
        &self,
        agent_id: &str,
        new_state: AgentState,
        ts: Timestamp,
    ) -> Result<Status> {
        let Some(agent) = self.agent_list.find_agent(agent_id) else {
            return Err(Error::not_found("agent not found"));
        };

        if agent.state == new_state {
            return Ok(Status::Already);
        }

        if agent.state_ts > ts {
            return Err(Error::invalid_state("out of order"));
        }

        Ok(Status::Ok)
    }

    /// Apply a health report for an agent; returns the disks whose state changed
    pub fn update_agent_state(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        agent_id: &str,
        new_state: AgentState,
        now: Timestamp,
        reason: &str,
    ) -> Result<Vec<DiskId>> {
        self.check_agent_state_transition(agent_id, new_state, now)?;

        let Some(agent) = self.agent_list.find_agent_mut(agent_id) else {
            critical::report(
                CriticalEvent::AgentNotFound,
                format!("UpdateAgentState: agent '{agent_id}'"),
            );
            return Err(Error::fail(agent_id));
        };

        let old_state = agent.state;
        let deadline = agent.cms_ts + infra_timeout(&self.storage_config, old_state);
        let cms_request_active = !agent.cms_ts.is_zero() && deadline > now;

        if !cms_request_active {
            agent.cms_ts = Timestamp::ZERO;
        }

        // the agent is being drained by maintenance: don't bring it back yet
        let new_state = if new_state < AgentState::Warning && cms_request_active {
            old_state
        } else {
            new_state
        };

        self.change_agent_state(agent_id, new_state, now, reason);

        let mut affected = Vec::new();
        self.apply_agent_state_change(db, agent_id, now, &mut affected);
        Ok(affected)
    }

    /// Propagate the current agent state to its devices, migrations and disks
    pub(super) fn apply_agent_state_change(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        agent_id: &str,
        now: Timestamp,
        affected_disks: &mut Vec<DiskId>,
    ) {
        self.sync_agent(db, agent_id);

        let Some(agent) = self.agent_list.find_agent(agent_id) else {
            return;
        };
        let agent_state = agent.state;
        let device_ids: Vec<String> = agent.devices.iter().map(|d| d.device_uuid.clone()).collect();

        let mut disk_ids = BTreeSet::new();

        for device_id in device_ids {
            let disk_id = self.find_disk(&device_id).to_string();
            if disk_id.is_empty() {
                continue;
            }

            let Some(disk) = self.disks.get(&disk_id) else {
                critical::report(
                    CriticalEvent::DiskNotFound,
                    format!("ApplyAgentStateChange: disk '{disk_id}'"),
                );
                continue;
            };
            let master_id = disk.master_disk_id.clone();

            if self.restart_device_migration(db, &disk_id, &device_id) {
                continue;
            }

            let mut is_affected = true;

            if agent_state == AgentState::Warning {
                let Some(disk) = self.disks.get(&disk_id) else {
                    continue;
                };

                if disk.migration_source_to_target.contains_key(&device_id) {
                    continue;
                }

                // allocated to the disk but not among its live devices
                if !disk.devices.contains(&device_id) {
                    continue;
                }

                self.add_migration(&disk_id, &device_id);
            } else {
                if agent_state == AgentState::Unavailable && !master_id.is_empty() {
                    if !self
                        .replica_table
                        .is_replacement_allowed(&master_id, &device_id)
                    {
                        warn!(
                            "Replacement of device '{}' of mirrored disk '{}' is not allowed",
                            device_id, master_id
                        );
                    } else if self.automatic_replacement_allowed(now) {
                        match self.replace_device_automatically(
                            db,
                            &disk_id,
                            &device_id,
                            now,
                            "agent unavailable",
                        ) {
                            Ok(updated) => is_affected = updated,
                            Err(e) => critical::report(
                                CriticalEvent::AutomaticReplacementFailure,
                                format!("disk '{disk_id}', device '{device_id}': {e}"),
                            ),
                        }
                    }
                }

                self.cancel_device_migration(db, &disk_id, &device_id);
            }

            if is_affected {
                disk_ids.insert(disk_id);
            }
        }

        for disk_id in disk_ids {
            if self.try_update_disk_state(db, &disk_id, now) {
                affected_disks.push(disk_id);
            }
        }
    }

    /// Check whether any live device of the agent backs a disk
    pub(super) fn has_dependent_disks(&self, agent: &AgentConfig) -> bool {
        for device in &agent.devices {
            if device.state >= DeviceState::Error {
                continue;
            }

            let disk_id = self.find_disk(&device.device_uuid);
            if disk_id.is_empty() {
                continue;
            }

            if !self.disks.contains_key(disk_id) {
                critical::report(
                    CriticalEvent::DiskNotFound,
                    format!("HasDependentDisks: disk '{disk_id}'"),
                );
                continue;
            }

            return true;
        }

        false
    }

    /// Maintenance request for a whole host
    ///
    /// Taking a host away from live disks is granted only after the infra
    /// timeout; until then the caller gets `TryAgain` with the remaining
    /// wait. An unavailable agent cannot be brought back online this way.
    pub fn update_cms_host_state(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        agent_id: &str,
        new_state: AgentState,
        now: Timestamp,
        dry_run: bool,
    ) -> Result<CmsUpdate> {
        self.check_agent_state_transition(agent_id, new_state, now)?;

        let Some(agent) = self.agent_list.find_agent(agent_id) else {
            critical::report(
                CriticalEvent::AgentNotFound,
                format!("UpdateCmsHostState: agent '{agent_id}'"),
            );
            return Err(Error::fail(agent_id));
        };

        let state = agent.state;
        let mut cms_ts = if agent.cms_ts.is_zero() { now } else { agent.cms_ts };
        let mut timeout =
            (cms_ts + infra_timeout(&self.storage_config, state)).saturating_duration_since(now);

        if !self.has_dependent_disks(agent) {
            timeout = Duration::ZERO;
        }

        if new_state == AgentState::Online && state < AgentState::Unavailable {
            timeout = Duration::ZERO;
        }

        let mut outcome = if timeout.is_zero() {
            cms_ts = Timestamp::ZERO;
            Ok(())
        } else {
            Err(Error::try_again(format!("time remaining: {timeout:?}"), timeout))
        };

        // only a reconnect brings an unavailable agent back
        if state == AgentState::Unavailable && new_state == AgentState::Online {
            if timeout.is_zero() {
                timeout = self.storage_config.cms_update_state_to_online_timeout();
            }
            outcome = Err(Error::try_again("agent currently unavailable", timeout));
        }

        if dry_run {
            return Ok(CmsUpdate {
                outcome,
                timeout,
                affected_disks: Vec::new(),
            });
        }

        if state != AgentState::Unavailable {
            self.change_agent_state(agent_id, new_state, now, "cms action");
        }

        if let Some(agent) = self.agent_list.find_agent_mut(agent_id) {
            agent.cms_ts = cms_ts;
        }

        let mut affected_disks = Vec::new();
        self.apply_agent_state_change(db, agent_id, now, &mut affected_disks);

        if new_state != AgentState::Online {
            self.suspend_local_devices(db, agent_id);
        }

        Ok(CmsUpdate {
            outcome,
            timeout,
            affected_disks,
        })
    }

    fn suspend_local_devices(&mut self, db: &mut dyn DiskRegistryDatabase, agent_id: &str) {
        let local: Vec<String> = self
            .agent_list
            .find_agent(agent_id)
            .map(|a| {
                a.devices
                    .iter()
                    .filter(|d| d.pool_kind == DevicePoolKind::Local)
                    .map(|d| d.device_uuid.clone())
                    .collect()
            })
            .unwrap_or_default();

        for uuid in local {
            self.suspend(db, &uuid);
        }
    }

    pub fn set_agent_list_params(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        agent_id: &str,
        params: AgentListParams,
    ) {
        self.agent_list.set_params(agent_id, params);
        db.add_agent_list_params(agent_id, &params);
    }

    /// Drop expired per-agent timeout overrides; returns the affected agents
    pub fn cleanup_expired_agent_list_params(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        now: Timestamp,
    ) -> Vec<AgentId> {
        let expired = self.agent_list.cleanup_expired_params(now);
        for agent_id in &expired {
            db.delete_agent_list_params(agent_id);
        }
        expired
    }

    pub fn on_agent_disconnected(&mut self, now: Timestamp) {
        self.agent_list.on_agent_disconnected(now);
    }

    /// How long a disconnected agent is waited for before it is rejected
    #[must_use]
    pub fn get_reject_agent_timeout(&self, now: Timestamp, agent_id: &str) -> Duration {
        self.agent_list.get_reject_agent_timeout(now, agent_id)
    }

    #[must_use]
    pub fn get_agent_state(&self, agent_id: &str) -> Option<AgentState> {
        self.agent_list.find_agent(agent_id).map(|a| a.state)
    }

    #[must_use]
    pub fn get_agent_cms_ts(&self, agent_id: &str) -> Option<Timestamp> {
        self.agent_list.find_agent(agent_id).map(|a| a.cms_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use diskreg_store::WriteBatch;

    #[test]
    fn test_register_validation() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );

        let err = state
            .register_agent(&mut db, agent("", 5, &[]), now())
            .unwrap_err();
        assert_eq!(err.message(), "empty agent id");

        let err = state
            .register_agent(&mut db, agent("a2", 0, &[]), now())
            .unwrap_err();
        assert_eq!(err.message(), "empty node id");

        let err = state
            .register_agent(&mut db, agent("a2", 1, &[device("d9", "r1")]), now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(err.message().contains("already registered at node #1"));

        let mut stale = agent("a1", 1, &[device("d1", "r1")]);
        stale.seq_number = 0;
        let mut fresh = stale.clone();
        fresh.seq_number = 5;
        state.register_agent(&mut db, fresh, now()).unwrap();
        let err = state.register_agent(&mut db, stale, now()).unwrap_err();
        assert!(err.message().contains("greater SeqNo (5 > 0)"));
    }

    #[test]
    fn test_known_agent_single_rack() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")])],
        );

        let err = state
            .register_agent(
                &mut db,
                agent("a1", 1, &[device("d1", "r1"), device("d2", "r2")]),
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(err.message().contains("r1 != r2"));
    }

    #[test]
    fn test_kick_out_unavailable_agent() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        state
            .update_agent_state(&mut db, "a1", AgentState::Unavailable, now(), "lost")
            .unwrap();

        let mut db = WriteBatch::new();
        let result = state
            .register_agent(&mut db, agent("a2", 1, &[device("d2", "r2")]), now())
            .unwrap();

        assert_eq!(state.find_agent("a1").unwrap().node_id, 0);
        assert_eq!(state.find_agent("a2").unwrap().node_id, 1);
        assert_eq!(result.disks_to_reallocate, vec!["vol0".to_string()]);
        assert_eq!(state.find_disk("d1"), "vol0");
        assert!(!db.is_empty());
    }

    #[test]
    fn test_back_from_unavailable_goes_to_warning() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );

        state
            .update_agent_state(&mut db, "a1", AgentState::Unavailable, now(), "lost")
            .unwrap();
        assert_eq!(state.get_agent_state("a1"), Some(AgentState::Unavailable));

        state
            .register_agent(&mut db, agent("a1", 1, &[device("d1", "r1")]), now())
            .unwrap();
        assert_eq!(state.get_agent_state("a1"), Some(AgentState::Warning));
    }

    #[test]
    fn test_agent_state_out_of_order() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        let t = now() + Duration::from_secs(10);
        state
            .update_agent_state(&mut db, "a1", AgentState::Warning, t, "")
            .unwrap();

        let err = state
            .update_agent_state(&mut db, "a1", AgentState::Online, now(), "")
            .unwrap_err();
        assert_eq!(err, Error::invalid_state("out of order"));

        let err = state
            .update_agent_state(&mut db, "nope", AgentState::Online, t, "")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_mtbf_counts_failures_with_disks() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        let later = now() + Duration::from_secs(3600);
        state
            .update_agent_state(&mut db, "a1", AgentState::Unavailable, later, "")
            .unwrap();

        let tbf = state.find_agent("a1").unwrap().time_between_failures;
        assert_eq!(tbf.broken_count, 1);
        assert!(tbf.work_time >= 3600);
        assert!(state.find_agent("a1").unwrap().work_ts.is_zero());
    }

    #[test]
    fn test_cms_host_maintenance_window() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();

        let t0 = now() + Duration::from_secs(1);
        let first = state
            .update_cms_host_state(&mut db, "a1", AgentState::Warning, t0, false)
            .unwrap();
        assert!(matches!(first.outcome, Err(Error::TryAgain { .. })));
        assert_eq!(first.timeout, Duration::from_secs(300));
        assert_eq!(first.affected_disks, vec!["vol0".to_string()]);

        let dry = state
            .update_cms_host_state(
                &mut db,
                "a1",
                AgentState::Warning,
                t0 + Duration::from_secs(60),
                true,
            )
            .unwrap();
        assert_eq!(dry.timeout, Duration::from_secs(240));

        let t1 = t0 + Duration::from_secs(301);
        let second = state
            .update_cms_host_state(&mut db, "a1", AgentState::Warning, t1, false)
            .unwrap();
        assert_eq!(second.outcome, Ok(()));
        assert_eq!(second.timeout, Duration::ZERO);
        assert_eq!(state.get_agent_state("a1"), Some(AgentState::Warning));
        assert_eq!(state.get_agent_cms_ts("a1"), Some(Timestamp::ZERO));
    }

    #[test]
    fn test_cms_cannot_revive_unavailable_agent() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![agent("a1", 1, &[device("d1", "r1")])],
        );
        state
            .update_agent_state(&mut db, "a1", AgentState::Unavailable, now(), "")
            .unwrap();

        let update = state
            .update_cms_host_state(&mut db, "a1", AgentState::Online, now(), false)
            .unwrap();
        assert_eq!(
            update.outcome,
            Err(Error::try_again("agent currently unavailable", Duration::from_secs(300)))
        );
        assert_eq!(state.get_agent_state("a1"), Some(AgentState::Unavailable));
    }

    #[test]
    fn test_unregister_and_remove_agent() {
        let (mut state, mut db) = create_state(
            StorageConfig::default(),
            vec![
                agent("a1", 1, &[device("d1", "r1")]),
                agent("a2", 2, &[device("d2", "r2")]),
            ],
        );
        assert_eq!(state.unregister_agent(&mut db, 42).unwrap(), Status::Already);
        assert_eq!(state.unregister_agent(&mut db, 1).unwrap(), Status::Ok);
        assert!(state.find_agent("a1").is_none());
        assert!(state.get_device("d1").is_none());

        state
            .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
            .unwrap();
        let err = state.remove_agent(&mut db, "a2").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_agent_list_params_expire() {
        let (mut state, mut db) = create_state(StorageConfig::default(), vec![]);
        let params = AgentListParams {
            new_non_replicated_agent_min_timeout: Duration::from_secs(1),
            new_non_replicated_agent_max_timeout: Duration::from_secs(2),
            expiration_ts: now() + Duration::from_secs(10),
        };
        state.set_agent_list_params(&mut db, "a1", params);
        assert_eq!(
            state.get_reject_agent_timeout(now(), "a1"),
            Duration::from_secs(1)
        );

        let expired =
            state.cleanup_expired_agent_list_params(&mut db, now() + Duration::from_secs(11));
        assert_eq!(expired, vec!["a1".to_string()]);
    }
}
