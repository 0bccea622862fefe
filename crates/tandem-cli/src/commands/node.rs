//! Node command - runs a replication participant over the roster application.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tandem_app::Roster;
use tandem_config::{TandemConfig, TimingSection};
use tandem_node::{Node, NodeConfig, Timing, WorkerConfig};
use tandem_types::ParticipantId;
use tracing::info;

use super::signals;

/// Command-line values that take precedence over the loaded config.
pub struct Overrides {
    pub name: Option<String>,
    pub listen: Option<SocketAddr>,
    pub advertise: Option<SocketAddr>,
    pub view_service: Option<SocketAddr>,
}

pub fn run(config: &TandemConfig, overrides: Overrides) -> Result<()> {
    let node_config = node_config(config, overrides)?;

    println!();
    println!("tandem node {}", node_config.name);
    println!();
    println!("  Listen address: {}", node_config.listen_address);
    println!("  View service:   {}", node_config.view_service_address);
    println!("  Workers:        {}", node_config.workers.worker_count);
    println!();

    let mut node: Node<Roster> = Node::new(node_config).context("Failed to start node")?;
    let handle = node.handle();
    signals::on_shutdown(move || handle.shutdown())?;

    node.run().context("Node failed")?;
    info!("node stopped");
    Ok(())
}

fn node_config(config: &TandemConfig, overrides: Overrides) -> Result<NodeConfig> {
    let name = overrides
        .name
        .or_else(|| config.node.name.clone())
        .ok_or_else(|| anyhow!("No participant name; pass --name or set node.name"))?;
    let name = ParticipantId::new(name).context("Invalid participant name")?;

    let listen = match overrides.listen {
        Some(addr) => addr,
        None => config.listen_address()?,
    };
    let view_service = match overrides.view_service {
        Some(addr) => addr,
        None => config.view_service_address()?,
    };
    let advertise = match overrides.advertise {
        Some(addr) => Some(addr),
        None => config.advertise_address()?,
    };

    let defaults = WorkerConfig::default();
    let workers = WorkerConfig {
        worker_count: config.workers.worker_count.unwrap_or(defaults.worker_count),
        queue_capacity: config.workers.queue_capacity,
    };

    let mut node_config = NodeConfig::new(name, listen, view_service)
        .with_timing(timing(&config.timing))
        .with_workers(workers)
        .with_eviction(config.replication.evict_silent_participants);
    if let Some(addr) = advertise {
        node_config = node_config.with_advertise_address(addr);
    }
    Ok(node_config)
}

fn timing(section: &TimingSection) -> Timing {
    let ms = Duration::from_millis;
    Timing {
        heartbeat_interval: ms(section.heartbeat_interval_ms),
        missed_heartbeat_limit: section.missed_heartbeat_limit,
        check_interval: ms(section.check_interval_ms),
        check_grace: ms(section.check_grace_ms),
        backup_change_guard: ms(section.backup_change_guard_ms),
        primary_change_guard: ms(section.primary_change_guard_ms),
        connect_attempts: section.connect_attempts,
        connect_backoff: ms(section.connect_backoff_ms),
        connect_timeout: ms(section.connect_timeout_ms),
        init_backup_timeout: ms(section.init_backup_timeout_ms),
        sync_timeout: ms(section.sync_timeout_ms),
        view_poll_interval: ms(section.view_poll_interval_ms),
        view_request_timeout: ms(section.view_request_timeout_ms),
        view_request_attempts: section.view_request_attempts,
    }
}
