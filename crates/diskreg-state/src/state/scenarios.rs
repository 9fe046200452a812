//! End-to-end flows and randomized invariant checks

use super::testing::*;
use super::{AllocateDiskParams, DiskRegistryState};
use diskreg_common::{
    AgentState, DeviceId, DeviceState, DiskState, Error, MediaKind, PlacementStrategy, Status,
    StorageConfig,
};
use diskreg_store::WriteBatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

fn check_invariants(state: &DiskRegistryState) {
    let free = state.device_list.free_device_ids();
    for id in state.device_list.allocated_device_ids() {
        assert!(!free.contains(id), "device {id} is both free and allocated");
    }

    let mut owners: HashMap<&DeviceId, &str> = HashMap::new();
    for (disk_id, disk) in &state.disks {
        for uuid in disk.devices.iter().chain(disk.migration_target_to_source.keys()) {
            if let Some(other) = owners.insert(uuid, disk_id) {
                panic!("device {uuid} used by {other} and {disk_id}");
            }
        }

        for (target, source) in &disk.migration_target_to_source {
            assert_eq!(disk.migration_source_to_target.get(source), Some(target));
            assert!(disk.devices.contains(source), "source {source} left {disk_id}");
        }
        for (source, target) in &disk.migration_source_to_target {
            assert_eq!(disk.migration_target_to_source.get(target), Some(source));
        }

        for uuid in disk.devices.iter().chain(disk.migration_target_to_source.keys()) {
            assert_eq!(state.find_disk(uuid), disk_id, "device {uuid} not allocated");
        }

        assert_eq!(
            state.calculate_disk_state(&disk.devices),
            state.calculate_disk_state(&disk.devices)
        );
    }

    let migrating: usize = state
        .disks
        .values()
        .map(|d| d.migration_source_to_target.len())
        .sum();
    assert_eq!(state.device_migrations_in_progress, migrating);

    for group in state.placement_groups.values() {
        if group.placement_strategy != PlacementStrategy::Spread {
            continue;
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for member in &group.disks {
            let Some(disk) = state.disks.get(&member.disk_id) else {
                continue;
            };
            let racks: BTreeSet<String> = disk
                .devices
                .iter()
                .map(|uuid| state.device_list.find_rack(uuid).to_string())
                .collect();
            for rack in racks {
                if let Some(other) = seen.insert(rack.clone(), &member.disk_id) {
                    panic!("rack {rack} shared by {other} and {}", member.disk_id);
                }
            }
        }
    }
}

fn four_rack_state() -> (DiskRegistryState, WriteBatch) {
    create_state(
        StorageConfig::default(),
        (1..=4)
            .map(|i| {
                let rack = format!("r{i}");
                agent(
                    &format!("a{i}"),
                    i,
                    &[
                        device(&format!("d{i}-1"), &rack),
                        device(&format!("d{i}-2"), &rack),
                        device(&format!("d{i}-3"), &rack),
                    ],
                )
            })
            .collect(),
    )
}

#[test]
fn test_allocate_two_device_disk() {
    let (mut state, mut db) = create_state(
        StorageConfig::default(),
        vec![agent(
            "a1",
            1,
            &[device("d1", "r1"), device("d2", "r1"), device("d3", "r1")],
        )],
    );

    let result = state
        .allocate_disk(&mut db, now(), &disk_params("vol0", 2))
        .unwrap();

    assert_eq!(result.status, Status::Ok);
    assert_eq!(result.devices.len(), 2);
    assert_eq!(
        result.devices.iter().map(|d| d.byte_count()).sum::<u64>(),
        2 * DEVICE_BYTES
    );
    assert_eq!(state.get_disk_info("vol0").unwrap().state, DiskState::Online);
}

#[test]
fn test_warning_agent_moves_disk_to_migration() {
    let (mut state, mut db) = create_state(
        StorageConfig::default(),
        vec![
            agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")]),
            agent("a2", 2, &[device("d3", "r2"), device("d4", "r2")]),
        ],
    );
    let result = state
        .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
        .unwrap();
    let used = result.devices[0].clone();

    let affected = state
        .update_agent_state(&mut db, &used.agent_id, AgentState::Warning, now(), "maintenance")
        .unwrap();

    assert_eq!(affected, vec!["vol0".to_string()]);
    assert_eq!(state.get_disk_info("vol0").unwrap().state, DiskState::Migration);
    assert!(
        state
            .build_migration_list()
            .contains(&("vol0".to_string(), used.device_uuid))
    );
}

#[test]
fn test_finish_migration_that_never_started() {
    let (mut state, mut db) = create_state(
        StorageConfig::default(),
        vec![agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")])],
    );
    state
        .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
        .unwrap();
    let before = state.get_disk_info("vol0").unwrap();
    let source = before.devices[0].device_uuid.clone();
    let target = if source == "d1" { "d2" } else { "d1" };

    let err = state
        .finish_device_migration(&mut db, "vol0", &source, target, now())
        .unwrap_err();

    assert!(matches!(err, Error::Argument(_)));
    let after = state.get_disk_info("vol0").unwrap();
    assert_eq!(after.devices, before.devices);
    assert!(after.migrations.is_empty());
    assert!(state.get_disk_migrations("vol0").unwrap().is_empty());
}

#[test]
fn test_mirrored_disk_spreads_replicas() {
    let (mut state, mut db) = four_rack_state();

    state
        .allocate_disk(
            &mut db,
            now(),
            &AllocateDiskParams {
                replica_count: 2,
                media_kind: MediaKind::Mirror3Ssd,
                ..disk_params("vol0", 1)
            },
        )
        .unwrap();

    let group = state.find_placement_group("vol0/g").unwrap();
    assert_eq!(group.placement_strategy, PlacementStrategy::Spread);

    let mut racks = BTreeSet::new();
    for replica in ["vol0/0", "vol0/1", "vol0/2"] {
        for device in state.get_disk_devices(replica).unwrap() {
            assert!(racks.insert(device.rack), "replica {replica} shares a rack");
        }
    }
    assert_eq!(racks.len(), 3);
    check_invariants(&state);
}

#[test]
fn test_cms_request_granted_after_infra_timeout() {
    let (mut state, mut db) = create_state(
        StorageConfig::default(),
        vec![agent("a1", 1, &[device("d1", "r1"), device("d2", "r1")])],
    );
    state
        .allocate_disk(&mut db, now(), &disk_params("vol0", 1))
        .unwrap();

    let first = state
        .update_cms_host_state(&mut db, "a1", AgentState::Warning, now(), false)
        .unwrap();
    assert!(matches!(first.outcome, Err(Error::TryAgain { .. })));
    assert_eq!(first.timeout, Duration::from_secs(5 * 60));

    let later = now() + Duration::from_secs(5 * 60 + 1);
    let second = state
        .update_cms_host_state(&mut db, "a1", AgentState::Warning, later, false)
        .unwrap();
    assert_eq!(second.outcome, Ok(()));
    assert_eq!(second.timeout, Duration::ZERO);
    assert_eq!(state.get_agent_state("a1"), Some(AgentState::Warning));
}

/// Running migrations as `(disk, source, target)`
fn running_migrations(state: &DiskRegistryState) -> Vec<(String, DeviceId, DeviceId)> {
    state
        .disks
        .iter()
        .flat_map(|(disk_id, disk)| {
            disk.migration_source_to_target
                .iter()
                .map(move |(s, t)| (disk_id.clone(), s.clone(), t.clone()))
        })
        .collect()
}

fn pick<T: Clone>(rng: &mut StdRng, items: &[T]) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    Some(items[rng.gen_range(0..items.len())].clone())
}

#[test]
fn test_random_operations_keep_invariants() {
    let (mut state, mut db) = four_rack_state();
    state
        .create_placement_group(&mut db, "pg", PlacementStrategy::Spread, 0)
        .unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut ts = now();
    let agent_states = [AgentState::Online, AgentState::Warning, AgentState::Unavailable];
    let device_states = [DeviceState::Online, DeviceState::Warning, DeviceState::Error];

    for _ in 0..1000 {
        ts = ts + Duration::from_secs(1);
        let index = rng.gen_range(0..6);
        let disk_id = format!("vol{index}");

        match rng.gen_range(0..12) {
            0 | 1 => {
                let params = AllocateDiskParams {
                    placement_group_id: if index % 2 == 0 { "pg".into() } else { String::new() },
                    ..disk_params(&disk_id, rng.gen_range(1..=2))
                };
                let _ = state.allocate_disk(&mut db, ts, &params);
            }
            2 => {
                if state.mark_disk_for_cleanup(&mut db, &disk_id).is_ok() {
                    assert!(state.deallocate_disk(&mut db, &disk_id).is_ok());
                }
                for device in state.get_dirty_devices() {
                    state.mark_device_as_clean(&mut db, ts, &device.device_uuid);
                }
            }
            3 => {
                let agent_id = format!("a{}", rng.gen_range(1..=4));
                let new_state = agent_states[rng.gen_range(0..agent_states.len())];
                let _ = state.update_agent_state(&mut db, &agent_id, new_state, ts, "random");
            }
            4 => {
                let uuid = format!("d{}-{}", rng.gen_range(1..=4), rng.gen_range(1..=3));
                let new_state = device_states[rng.gen_range(0..device_states.len())];
                let _ = state.update_device_state(&mut db, &uuid, new_state, ts, "random");
            }
            5 => {
                if let Some((disk_id, source)) = state.build_migration_list().into_iter().next() {
                    let _ = state.start_device_migration(&mut db, &disk_id, &source);
                }

                // a second start of a running migration changes nothing
                let running = running_migrations(&state);
                if let Some((disk_id, source, target)) = pick(&mut rng, &running) {
                    let err = state
                        .start_device_migration(&mut db, &disk_id, &source)
                        .unwrap_err();
                    assert!(matches!(err, Error::InvalidState(_)));
                    assert!(
                        state
                            .start_device_migration(&mut db, &disk_id, &target)
                            .is_err()
                    );
                }
            }
            6 => {
                let running = running_migrations(&state);
                if let Some((disk_id, source, target)) = pick(&mut rng, &running) {
                    state
                        .finish_device_migration(&mut db, &disk_id, &source, &target, ts)
                        .unwrap();
                }
            }
            7 => {
                let running = running_migrations(&state);
                if let Some((disk_id, source, _)) = pick(&mut rng, &running) {
                    state.cancel_device_migration(&mut db, &disk_id, &source);
                }
            }
            8 => {
                if let Ok(devices) = state.get_disk_devices(&disk_id) {
                    if let Some(device) = pick(&mut rng, &devices) {
                        let _ = state.replace_device(
                            &mut db,
                            &disk_id,
                            &device.device_uuid,
                            "",
                            ts,
                            "random",
                            true,
                        );
                    }
                }
            }
            9 => {
                let version = state
                    .find_placement_group("pg")
                    .map_or(0, |g| g.config_version);
                let disks = [disk_id];
                let _ = if rng.gen_bool(0.5) {
                    state.alter_placement_group_membership(&mut db, "pg", 0, version, &disks, &[])
                } else {
                    state.alter_placement_group_membership(&mut db, "pg", 0, version, &[], &disks)
                };
            }
            10 => {
                let agent_id = format!("a{}", rng.gen_range(1..=4));
                if let Some(mut config) = state.find_agent(&agent_id).cloned() {
                    config.seq_number += 1;
                    let _ = state.register_agent(&mut db, config, ts);
                }
            }
            _ => {
                for (disk_id, seq_no) in state.get_disks_to_reallocate() {
                    state.delete_disk_to_reallocate(&mut db, &disk_id, seq_no);
                }
                for device in state.get_dirty_devices() {
                    state.mark_device_as_clean(&mut db, ts, &device.device_uuid);
                }
            }
        }

        check_invariants(&state);
    }

    let backup = state.backup_state();
    let restored = DiskRegistryState::new(StorageConfig::default(), backup.clone());
    check_invariants(&restored);
    assert_eq!(restored.backup_state(), backup);
}
