//! Disk Registry Admin CLI
//!
//! Operates directly on a registry database file.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use diskreg_admin::{AdminSettings, DiskRegistryService};
use diskreg_common::{
    AgentConfig, AgentState, DiskRegistryBackup, DiskRegistryConfig, MediaKind, PlacementStrategy,
    Timestamp,
};
use diskreg_state::AllocateDiskParams;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "diskreg-admin")]
#[command(about = "Disk Registry admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "DISKREG_CONFIG")]
    config: Option<PathBuf>,

    /// Registry database path (overrides the config file)
    #[arg(long, env = "DISKREG_DATA_PATH")]
    data_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Registry configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Agent operations
    Agent {
        #[command(subcommand)]
        action: AgentCommands,
    },
    /// Disk operations
    Disk {
        #[command(subcommand)]
        action: DiskCommands,
    },
    /// Placement group operations
    Group {
        #[command(subcommand)]
        action: GroupCommands,
    },
    /// Print registry counters
    Counters,
    /// Dump the whole registry as JSON
    Backup,
    /// Load a JSON dump into an empty registry
    Restore {
        /// Backup file
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the current configuration
    Show,
    /// Replace the configuration with a JSON file
    Update {
        file: PathBuf,
        /// Apply even if the version does not match
        #[arg(long)]
        ignore_version: bool,
    },
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// List registered agents
    List,
    /// Register an agent described by a JSON file
    Register { file: PathBuf },
    /// Change the state of an agent
    State {
        agent_id: String,
        /// online, warning or unavailable
        #[arg(value_parser = parse_agent_state)]
        state: AgentState,
        #[arg(long, default_value = "admin")]
        reason: String,
    },
    /// Remove an agent without dependent disks
    Remove { agent_id: String },
}

#[derive(Subcommand, Debug)]
enum DiskCommands {
    /// List disk ids
    List,
    /// Show disk details
    Show { disk_id: String },
    /// Allocate or grow a disk
    Allocate {
        disk_id: String,
        #[arg(long, default_value = "4096")]
        block_size: u32,
        #[arg(long)]
        blocks_count: u64,
        #[arg(long, default_value = "0")]
        replicas: u32,
        #[arg(long, default_value = "")]
        group: String,
        #[arg(long, default_value = "0")]
        partition: u32,
        #[arg(long, default_value = "")]
        pool: String,
    },
    /// Mark a disk for cleanup and deallocate it
    Deallocate { disk_id: String },
}

#[derive(Subcommand, Debug)]
enum GroupCommands {
    /// List placement groups
    List,
    /// Create a placement group
    Create {
        group_id: String,
        /// Partition count; creates a partition group when non-zero
        #[arg(long, default_value = "0")]
        partitions: u32,
    },
    /// Destroy a placement group
    Destroy { group_id: String },
}

fn parse_agent_state(s: &str) -> Result<AgentState, String> {
    match s.to_ascii_lowercase().as_str() {
        "online" => Ok(AgentState::Online),
        "warning" => Ok(AgentState::Warning),
        "unavailable" => Ok(AgentState::Unavailable),
        _ => Err(format!("unknown agent state: {s}")),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = AdminSettings::load(args.config.as_deref())?;
    if let Some(path) = args.data_path {
        settings.data_path = path;
    }

    let now = Timestamp::now();

    if let Commands::Restore { file } = &args.command {
        let backup: DiskRegistryBackup = read_json(file)?;
        DiskRegistryService::restore(&settings, &backup, now)?;
        info!("Restored registry from {}", file.display());
        return Ok(());
    }

    let service = DiskRegistryService::open(&settings, now)?;

    match args.command {
        Commands::Config { action } => run_config(&service, action)?,
        Commands::Agent { action } => run_agent(&service, action, now)?,
        Commands::Disk { action } => run_disk(&service, action, now)?,
        Commands::Group { action } => run_group(&service, action)?,
        Commands::Counters => {
            let counters = service.read(|state| state.publish_counters(now));
            println!("{counters:#?}");
        }
        Commands::Backup => {
            println!("{}", serde_json::to_string_pretty(&service.backup())?);
        }
        // handled before the service is opened
        Commands::Restore { .. } => {}
    }

    Ok(())
}

fn run_config(service: &DiskRegistryService, action: ConfigCommands) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let config = service.read(|state| state.get_config().clone());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Update {
            file,
            ignore_version,
        } => {
            let config: DiskRegistryConfig = read_json(&file)?;
            let update =
                service.execute(|state, db| state.update_config(db, config, ignore_version))?;
            if let Err(e) = update.outcome {
                bail!("{e}; affected disks: {:?}", update.affected_disks);
            }
            for disk_id in update.affected_disks {
                println!("affected: {disk_id}");
            }
        }
    }
    Ok(())
}

fn run_agent(service: &DiskRegistryService, action: AgentCommands, now: Timestamp) -> Result<()> {
    match action {
        AgentCommands::List => {
            for agent in service.read(diskreg_state::DiskRegistryState::get_agents) {
                println!(
                    "{}\tnode {}\t{}\t{} devices",
                    agent.agent_id,
                    agent.node_id,
                    agent.state,
                    agent.devices.len()
                );
            }
        }
        AgentCommands::Register { file } => {
            let config: AgentConfig = read_json(&file)?;
            let result = service.execute(|state, db| state.register_agent(db, config, now))??;
            println!("{result:#?}");
        }
        AgentCommands::State {
            agent_id,
            state: new_state,
            reason,
        } => {
            let affected = service.execute(|state, db| {
                state.update_agent_state(db, &agent_id, new_state, now, &reason)
            })??;
            for disk_id in affected {
                println!("affected: {disk_id}");
            }
        }
        AgentCommands::Remove { agent_id } => {
            service.execute(|state, db| state.remove_agent(db, &agent_id))??;
        }
    }
    Ok(())
}

fn run_disk(service: &DiskRegistryService, action: DiskCommands, now: Timestamp) -> Result<()> {
    match action {
        DiskCommands::List => {
            for disk_id in service.read(diskreg_state::DiskRegistryState::get_master_disk_ids) {
                println!("{disk_id}");
            }
        }
        DiskCommands::Show { disk_id } => {
            let info = service.read(|state| state.get_disk_info(&disk_id))?;
            println!("{info:#?}");
        }
        DiskCommands::Allocate {
            disk_id,
            block_size,
            blocks_count,
            replicas,
            group,
            partition,
            pool,
        } => {
            let params = AllocateDiskParams {
                disk_id,
                block_size,
                blocks_count,
                replica_count: replicas,
                media_kind: MediaKind::from_replica_count(replicas),
                placement_group_id: group,
                placement_partition_index: partition,
                pool_name: pool,
                ..Default::default()
            };
            let result = service.execute(|state, db| state.allocate_disk(db, now, &params))??;
            println!("{result:#?}");
        }
        DiskCommands::Deallocate { disk_id } => {
            let status = service.execute(|state, db| {
                state.mark_disk_for_cleanup(db, &disk_id)?;
                state.deallocate_disk(db, &disk_id)
            })??;
            println!("{status}");
        }
    }
    Ok(())
}

fn run_group(service: &DiskRegistryService, action: GroupCommands) -> Result<()> {
    match action {
        GroupCommands::List => {
            let group_ids = service.read(diskreg_state::DiskRegistryState::get_placement_group_ids);
            for group_id in group_ids {
                println!("{group_id}");
            }
        }
        GroupCommands::Create {
            group_id,
            partitions,
        } => {
            let strategy = if partitions == 0 {
                PlacementStrategy::Spread
            } else {
                PlacementStrategy::Partition
            };
            let status = service.execute(|state, db| {
                state.create_placement_group(db, &group_id, strategy, partitions)
            })??;
            println!("{status}");
        }
        GroupCommands::Destroy { group_id } => {
            let (status, affected) =
                service.execute(|state, db| state.destroy_placement_group(db, &group_id))?;
            println!("{status}");
            for disk_id in affected {
                println!("affected: {disk_id}");
            }
        }
    }
    Ok(())
}
