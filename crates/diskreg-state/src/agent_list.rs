//! Agent catalog
//!
//! Owns the registered agents and their device lists, the node-id routing
//! index, mean-time-between-failures statistics and the backoff used to
//! decide how long a disconnected agent is waited for.

use diskreg_common::config::{AgentListConfig, KnownAgentConfig};
use diskreg_common::{
    AgentConfig, AgentId, AgentListParams, AgentState, DeviceConfig, DeviceId, DeviceState, NodeId,
    TimeBetweenFailures, Timestamp,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

/// Registered agents keyed by agent id
#[derive(Debug)]
pub struct AgentList {
    config: AgentListConfig,
    agents: BTreeMap<AgentId, AgentConfig>,
    node_to_agent: HashMap<NodeId, AgentId>,
    params: BTreeMap<AgentId, AgentListParams>,
    time_between_failures: TimeBetweenFailures,
    reject_timeout_multiplier: f64,
    last_disconnect_ts: Timestamp,
}

impl AgentList {
    #[must_use]
    pub fn new(
        config: AgentListConfig,
        agents: Vec<AgentConfig>,
        params: Vec<(AgentId, AgentListParams)>,
    ) -> Self {
        let mut list = Self {
            config,
            agents: BTreeMap::new(),
            node_to_agent: HashMap::new(),
            params: params.into_iter().collect(),
            time_between_failures: TimeBetweenFailures::default(),
            reject_timeout_multiplier: 1.0,
            last_disconnect_ts: Timestamp::ZERO,
        };

        for agent in agents {
            if agent.node_id != 0 {
                list.node_to_agent
                    .insert(agent.node_id, agent.agent_id.clone());
            }
            list.agents.insert(agent.agent_id.clone(), agent);
        }

        list
    }

    #[must_use]
    pub fn find_agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_id)
    }

    pub fn find_agent_mut(&mut self, agent_id: &str) -> Option<&mut AgentConfig> {
        self.agents.get_mut(agent_id)
    }

    #[must_use]
    pub fn find_agent_by_node(&self, node_id: NodeId) -> Option<&AgentConfig> {
        self.node_to_agent
            .get(&node_id)
            .and_then(|id| self.agents.get(id))
    }

    /// Current node of an agent (0 if unknown or detached)
    #[must_use]
    pub fn find_node_id(&self, agent_id: &str) -> NodeId {
        self.find_agent(agent_id).map_or(0, |a| a.node_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Register (or re-register) an agent
    ///
    /// Known devices keep their state and timestamps across registrations.
    /// Devices absent from the known-agent catalog are marked broken, and
    /// devices the agent stopped reporting are kept but marked lost. Returns
    /// the ids of devices this agent did not report before.
    pub fn register_agent(
        &mut self,
        config: AgentConfig,
        ts: Timestamp,
        known_agent: Option<&KnownAgentConfig>,
    ) -> BTreeSet<DeviceId> {
        let known_devices: HashSet<&str> = known_agent
            .map(|k| k.device_uuids.iter().map(String::as_str).collect())
            .unwrap_or_default();

        let agent_id = config.agent_id.clone();
        let agent = self.agents.entry(agent_id.clone()).or_insert_with(|| {
            info!("New agent '{}' on node {}", agent_id, config.node_id);
            AgentConfig {
                agent_id: agent_id.clone(),
                state: AgentState::Online,
                state_ts: ts,
                work_ts: ts,
                ..Default::default()
            }
        });

        if agent.node_id != 0 && agent.node_id != config.node_id {
            self.node_to_agent.remove(&agent.node_id);
        }
        agent.node_id = config.node_id;
        agent.seq_number = config.seq_number;

        let mut old_devices: HashMap<DeviceId, DeviceConfig> = std::mem::take(&mut agent.devices)
            .into_iter()
            .map(|d| (d.device_uuid.clone(), d))
            .collect();

        let mut new_devices = BTreeSet::new();
        let mut devices = Vec::with_capacity(config.devices.len());

        for mut device in config.devices {
            device.agent_id.clone_from(&agent_id);
            device.node_id = config.node_id;
            let reported_blocks = device.blocks_count;

            if let Some(old) = old_devices.remove(&device.device_uuid) {
                device.state = old.state;
                device.state_ts = old.state_ts;
                device.state_message = old.state_message;
                device.cms_ts = old.cms_ts;
                if old.unadjusted_blocks_count == reported_blocks
                    && old.block_size == device.block_size
                {
                    device.blocks_count = old.blocks_count;
                }
            } else {
                new_devices.insert(device.device_uuid.clone());
                device.state_ts = ts;
            }

            if !known_devices.contains(device.device_uuid.as_str())
                && device.state != DeviceState::Error
            {
                device.state = DeviceState::Error;
                device.state_ts = ts;
                device.state_message = "unknown device".to_string();
            }
            device.unadjusted_blocks_count = reported_blocks;

            devices.push(device);
        }

        let mut lost: Vec<_> = old_devices.into_values().collect();
        lost.sort_by(|a, b| a.device_uuid.cmp(&b.device_uuid));
        for mut device in lost {
            debug!(
                "Device '{}' is no longer reported by agent '{}'",
                device.device_uuid, agent_id
            );
            device.node_id = config.node_id;
            if device.state != DeviceState::Error {
                device.state = DeviceState::Error;
                device.state_ts = ts;
                device.state_message = "lost".to_string();
            }
            devices.push(device);
        }

        agent.devices = devices;

        if config.node_id != 0 {
            self.node_to_agent.insert(config.node_id, agent_id);
        }

        new_devices
    }

    /// Detach an agent from its node; returns the node it was on
    pub fn remove_agent_from_node(&mut self, agent_id: &str) -> NodeId {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return 0;
        };

        let node_id = agent.node_id;
        agent.node_id = 0;
        for device in &mut agent.devices {
            device.node_id = 0;
        }

        if self
            .node_to_agent
            .get(&node_id)
            .is_some_and(|id| id == agent_id)
        {
            self.node_to_agent.remove(&node_id);
        }

        node_id
    }

    /// Forget an agent entirely
    pub fn remove_agent(&mut self, agent_id: &str) -> Option<AgentConfig> {
        let agent = self.agents.remove(agent_id)?;
        if self
            .node_to_agent
            .get(&agent.node_id)
            .is_some_and(|id| id == agent_id)
        {
            self.node_to_agent.remove(&agent.node_id);
        }
        self.params.remove(agent_id);
        Some(agent)
    }

    /// Account one failure of `agent_id` after `work_time` of uptime
    pub fn record_failure(&mut self, agent_id: &str, work_time: Duration) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.time_between_failures.record_failure(work_time);
        }
        self.time_between_failures.record_failure(work_time);
    }

    /// Fold persisted per-agent statistics into the cluster-wide total
    pub fn add_time_between_failures(&mut self, tbf: TimeBetweenFailures) {
        self.time_between_failures.work_time += tbf.work_time;
        self.time_between_failures.broken_count += tbf.broken_count;
    }

    /// Cluster-wide mean time between failures
    #[must_use]
    pub fn mean_time_between_failures(&self) -> Option<Duration> {
        self.time_between_failures.mtbf()
    }

    /// Track a disconnect for the reject timeout backoff
    pub fn on_agent_disconnected(&mut self, now: Timestamp) {
        if now.saturating_duration_since(self.last_disconnect_ts)
            > self.config.disconnect_recovery_interval()
        {
            self.reject_timeout_multiplier = 1.0;
        } else {
            self.reject_timeout_multiplier *= self.config.timeout_growth_factor;
        }
        self.last_disconnect_ts = now;
    }

    /// How long to wait for a disconnected agent before giving up on it
    #[must_use]
    pub fn get_reject_agent_timeout(&self, now: Timestamp, agent_id: &str) -> Duration {
        let (min, max) = match self.params.get(agent_id) {
            Some(p) if p.expiration_ts > now => (
                p.new_non_replicated_agent_min_timeout,
                p.new_non_replicated_agent_max_timeout,
            ),
            _ => (
                self.config.min_reject_agent_timeout(),
                self.config.max_reject_agent_timeout(),
            ),
        };

        if now.saturating_duration_since(self.last_disconnect_ts)
            > self.config.disconnect_recovery_interval()
        {
            return min;
        }

        min.mul_f64(self.reject_timeout_multiplier).clamp(min, max.max(min))
    }

    pub fn set_params(&mut self, agent_id: &str, params: AgentListParams) {
        self.params.insert(agent_id.to_string(), params);
    }

    /// Drop parameters that expired by `now`; returns the affected agents
    pub fn cleanup_expired_params(&mut self, now: Timestamp) -> Vec<AgentId> {
        let expired: Vec<AgentId> = self
            .params
            .iter()
            .filter(|(_, p)| p.expiration_ts <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.params.remove(id);
        }
        expired
    }

    #[must_use]
    pub fn params(&self) -> Vec<(AgentId, AgentListParams)> {
        self.params
            .iter()
            .map(|(id, p)| (id.clone(), *p))
            .collect()
    }
}
