//! View-service command.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tandem_config::TandemConfig;
use tandem_types::ReplicationParams;
use tandem_viewservice::ViewServiceServer;
use tracing::info;

use super::signals;

pub fn run(
    config: &TandemConfig,
    bind: Option<SocketAddr>,
    n: Option<u32>,
    k: Option<u32>,
) -> Result<()> {
    let bind = match bind {
        Some(addr) => addr,
        None => config.view_service_bind_address()?,
    };
    let params = ReplicationParams {
        n: n.unwrap_or(config.view_service.n),
        k: k.unwrap_or(config.view_service.k),
    };

    let mut server = ViewServiceServer::bind(bind, params)
        .with_context(|| format!("Failed to start view service on {bind}"))?;
    let local = server.local_addr()?;

    println!();
    println!("tandem view service");
    println!();
    println!("  Bind address: {local}");
    println!("  Parameters:   n={} k={}", params.n, params.k);
    println!();

    let shutdown = server.shutdown_handle();
    signals::on_shutdown(move || shutdown.shutdown())?;

    server.run().context("View service failed")?;
    info!("view service stopped");
    Ok(())
}
