//! Configuration management commands.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tandem_config::{Paths, TandemConfig};

/// Print the merged configuration as TOML.
pub fn show_toml(config: &TandemConfig) -> Result<()> {
    let rendered = config.to_toml().context("Failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}

/// Print the merged configuration as a summary.
pub fn show_text(config: &TandemConfig) {
    println!("tandem Configuration");
    println!("====================\n");

    println!("Node:");
    println!(
        "  Name: {}",
        config.node.name.as_deref().unwrap_or("(not set)")
    );
    println!("  Listen address: {}", config.node.listen_address);
    println!(
        "  Advertise address: {}",
        config
            .node
            .advertise_address
            .as_deref()
            .unwrap_or("(listen address)")
    );
    println!("  View service: {}", config.node.view_service_address);
    println!();

    println!("View service:");
    println!("  Bind address: {}", config.view_service.bind_address);
    println!("  n: {}", config.view_service.n);
    println!("  k: {}", config.view_service.k);
    println!();

    let timing = &config.timing;
    println!("Timing (ms):");
    println!("  Heartbeat interval: {}", timing.heartbeat_interval_ms);
    println!("  Missed heartbeat limit: {}", timing.missed_heartbeat_limit);
    println!("  Check interval: {}", timing.check_interval_ms);
    println!("  Check grace: {}", timing.check_grace_ms);
    println!("  Backup change guard: {}", timing.backup_change_guard_ms);
    println!("  Primary change guard: {}", timing.primary_change_guard_ms);
    println!("  Sync timeout: {}", timing.sync_timeout_ms);
    println!();

    println!("Workers:");
    println!(
        "  Count: {}",
        config
            .workers
            .worker_count
            .map_or("auto".to_string(), |n| n.to_string())
    );
    println!("  Queue capacity: {}", config.workers.queue_capacity);
    println!();

    println!("Replication:");
    println!(
        "  Evict silent participants: {}",
        config.replication.evict_silent_participants
    );
}

/// Write a default tandem.toml into `project_dir`.
pub fn init(project_dir: &Path, force: bool) -> Result<()> {
    let path = Paths::project_config_file(project_dir);
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it.",
            path.display()
        );
    }

    TandemConfig::default()
        .write_to(&path)
        .context("Failed to write configuration")?;
    println!("Wrote {}", path.display());
    Ok(())
}
