//! Fixtures shared by the state tests

use super::{AllocateDiskParams, DiskRegistryState};
use diskreg_common::config::KnownAgentConfig;
use diskreg_common::{
    AgentConfig, DeviceConfig, DiskRegistryBackup, DiskRegistryConfig, NodeId, StorageConfig,
    Timestamp,
};
use diskreg_store::WriteBatch;

pub const BLOCK_SIZE: u32 = 4096;
pub const DEVICE_BYTES: u64 = 93 * 1024 * 1024 * 1024;

/// A 93 GiB device of the default pool
pub fn device(uuid: &str, rack: &str) -> DeviceConfig {
    DeviceConfig {
        device_uuid: uuid.into(),
        device_name: format!("/dev/{uuid}"),
        rack: rack.into(),
        block_size: BLOCK_SIZE,
        blocks_count: DEVICE_BYTES / u64::from(BLOCK_SIZE),
        ..Default::default()
    }
}

pub fn agent(agent_id: &str, node_id: NodeId, devices: &[DeviceConfig]) -> AgentConfig {
    AgentConfig {
        agent_id: agent_id.into(),
        node_id,
        seq_number: 1,
        devices: devices.to_vec(),
        ..Default::default()
    }
}

pub fn now() -> Timestamp {
    Timestamp::from_secs(1_700_000_000)
}

/// Parameters of a simple disk spanning `device_count` whole devices
pub fn disk_params(disk_id: &str, device_count: u64) -> AllocateDiskParams {
    AllocateDiskParams {
        disk_id: disk_id.into(),
        block_size: BLOCK_SIZE,
        blocks_count: device_count * DEVICE_BYTES / u64::from(BLOCK_SIZE),
        ..Default::default()
    }
}

/// A registry whose catalog knows `agents`, with all of them registered
/// and their devices wiped
pub fn create_state(
    storage_config: StorageConfig,
    agents: Vec<AgentConfig>,
) -> (DiskRegistryState, WriteBatch) {
    let config = DiskRegistryConfig {
        known_agents: agents
            .iter()
            .map(|a| KnownAgentConfig {
                agent_id: a.agent_id.clone(),
                device_uuids: a.devices.iter().map(|d| d.device_uuid.clone()).collect(),
            })
            .collect(),
        ..Default::default()
    };

    let mut state = DiskRegistryState::new(
        storage_config,
        DiskRegistryBackup {
            config,
            ..Default::default()
        },
    );
    let mut db = WriteBatch::new();

    for agent in agents {
        state.register_agent(&mut db, agent, now()).unwrap();
    }

    for device in state.get_dirty_devices() {
        state.mark_device_as_clean(&mut db, now(), &device.device_uuid);
    }

    (state, db)
}
