//! Registry configuration: known agents, device pools and overrides

use super::DiskRegistryState;
use diskreg_common::config::KnownAgentConfig;
use diskreg_common::{
    AgentId, DevicePoolConfig, DevicePoolKind, DiskId, DiskRegistryConfig, Error, Result,
};
use diskreg_store::DiskRegistryDatabase;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{info, warn};

/// Outcome of a configuration update
///
/// A destructive update is refused with `InvalidState`; `affected_disks`
/// then lists the disks that still use devices the update would remove.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub outcome: Result<()>,
    pub affected_disks: Vec<DiskId>,
}

impl ConfigUpdate {
    fn failed(error: Error) -> Self {
        Self {
            outcome: Err(error),
            affected_disks: Vec::new(),
        }
    }
}

fn validate_pools(pools: &[DevicePoolConfig]) -> Result<()> {
    let mut names = HashSet::new();

    for pool in pools {
        if pool.name.is_empty() && pool.kind != DevicePoolKind::Default {
            return Err(Error::argument("non default pool with empty name"));
        }

        if !pool.name.is_empty() && pool.kind == DevicePoolKind::Default {
            return Err(Error::argument("default pool with non empty name"));
        }

        if !names.insert(pool.name.as_str()) {
            return Err(Error::argument("bad config"));
        }
    }

    Ok(())
}

/// Index known agents by id, rejecting duplicated agents or devices
fn collect_known_agents(
    agents: &[KnownAgentConfig],
) -> Result<(BTreeMap<AgentId, KnownAgentConfig>, HashSet<&str>)> {
    let mut known = BTreeMap::new();
    let mut devices = HashSet::new();

    for agent in agents {
        if known.insert(agent.agent_id.clone(), agent.clone()).is_some() {
            return Err(Error::argument("bad config"));
        }

        for uuid in &agent.device_uuids {
            if !devices.insert(uuid.as_str()) {
                return Err(Error::argument("bad config"));
            }
        }
    }

    Ok((known, devices))
}

impl DiskRegistryState {
    /// Derive the lookup tables of `config`
    pub(super) fn process_config(&mut self, config: &DiskRegistryConfig) {
        self.known_agents = config
            .known_agents
            .iter()
            .map(|a| (a.agent_id.clone(), a.clone()))
            .collect();

        let mut overrides: HashMap<DiskId, HashMap<_, _>> = HashMap::new();
        for o in &config.device_overrides {
            overrides
                .entry(o.disk_id.clone())
                .or_default()
                .insert(o.device.clone(), o.blocks_count);
        }
        self.device_overrides = overrides;

        let mut pools = BTreeMap::new();
        pools.insert(
            String::new(),
            DevicePoolConfig {
                name: String::new(),
                kind: DevicePoolKind::Default,
                allocation_unit: self.storage_config.default_allocation_unit(),
            },
        );
        for pool in &config.device_pools {
            pools.insert(pool.name.clone(), pool.clone());
        }
        self.device_pools = pools;
    }

    #[must_use]
    pub fn get_config(&self) -> &DiskRegistryConfig {
        &self.current_config
    }

    #[must_use]
    pub fn get_config_version(&self) -> u32 {
        self.current_config.version
    }

    #[must_use]
    pub fn is_writable_state(&self) -> bool {
        self.current_config.writable_state
    }

    /// Toggle whether the registry accepts mutating requests
    pub fn set_writable_state(&mut self, db: &mut dyn DiskRegistryDatabase, writable: bool) {
        if self.current_config.writable_state == writable {
            return;
        }

        self.current_config.writable_state = writable;
        db.write_writable_state(writable);
        info!("Writable state set to {}", writable);
    }

    /// Replace the registry configuration
    ///
    /// `new_config.version` must match the current version unless
    /// `ignore_version` is set. Agents whose device set changed are
    /// re-registered against the new catalog.
    pub fn update_config(
        &mut self,
        db: &mut dyn DiskRegistryDatabase,
        mut new_config: DiskRegistryConfig,
        ignore_version: bool,
    ) -> ConfigUpdate {
        if !ignore_version && new_config.version != self.current_config.version {
            return ConfigUpdate::failed(Error::aborted("Wrong config version"));
        }

        if let Err(e) = validate_pools(&new_config.device_pools) {
            return ConfigUpdate::failed(e);
        }

        let (new_known_agents, all_devices) = match collect_known_agents(&new_config.known_agents) {
            Ok(v) => v,
            Err(e) => return ConfigUpdate::failed(e),
        };

        let mut removed_devices = Vec::new();
        let mut updated_agents = BTreeSet::new();

        for (agent_id, known) in &self.known_agents {
            for uuid in &known.device_uuids {
                if !all_devices.contains(uuid.as_str()) {
                    removed_devices.push(uuid.clone());
                    updated_agents.insert(agent_id.clone());
                }
            }

            if !new_known_agents.contains_key(agent_id) {
                updated_agents.insert(agent_id.clone());
            }
        }

        let affected_disks: BTreeSet<DiskId> = removed_devices
            .iter()
            .map(|uuid| self.device_list.find_disk_id(uuid))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();

        if !affected_disks.is_empty() {
            warn!(
                "Config update refused: {} disks use removed devices",
                affected_disks.len()
            );
            return ConfigUpdate {
                outcome: Err(Error::invalid_state("Destructive configuration change")),
                affected_disks: affected_disks.into_iter().collect(),
            };
        }

        new_config.version = self.current_config.version + 1;
        new_config.last_disk_state_seq_no = self.current_config.last_disk_state_seq_no;
        new_config.last_disk_seq_no = self.current_config.last_disk_seq_no;
        new_config.writable_state = self.current_config.writable_state;
        self.process_config(&new_config);

        let mut affected_disks = Vec::new();
        for agent_id in &updated_agents {
            let Some(agent) = self.agent_list.find_agent(agent_id) else {
                continue;
            };
            let ts = agent.state_ts;
            let config = agent.clone();

            match self.register_agent(db, config, ts) {
                Ok(result) => affected_disks.extend(result.affected_disks),
                Err(e) => warn!("Agent '{}' update failed: {}", agent_id, e),
            }
        }

        db.write_config(&new_config);
        self.current_config = new_config;

        info!(
            "Config updated to version {}: {} known agents, {} pools",
            self.current_config.version,
            self.known_agents.len(),
            self.device_pools.len()
        );

        ConfigUpdate {
            outcome: Ok(()),
            affected_disks,
        }
    }
}
