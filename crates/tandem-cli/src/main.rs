//! tandem CLI.
//!
//! Primary-backup replication with a view service.
//!
//! # Quick Start
//!
//! ```bash
//! # Start the view service
//! tandem view-service --bind 127.0.0.1:7300
//!
//! # Start participants (one terminal each)
//! tandem node --name a --listen 127.0.0.1:7401
//! tandem node --name b --listen 127.0.0.1:7402
//! tandem node --name c --listen 127.0.0.1:7403
//! ```

mod commands;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

/// tandem - view-based primary-backup replication.
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Extra config file layered over tandem.toml and tandem.local.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory searched for tandem.toml (default: current directory).
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Run the view service.
    ViewService {
        /// UDP address to bind.
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Replication parameter `n` handed out with every view.
        #[arg(long)]
        n: Option<u32>,

        /// Replication parameter `k` handed out with every view.
        #[arg(long)]
        k: Option<u32>,
    },

    /// Run a replication participant.
    Node {
        /// Participant name.
        #[arg(long)]
        name: Option<String>,

        /// TCP address to listen on while primary.
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Address advertised to other participants.
        #[arg(long)]
        advertise: Option<SocketAddr>,

        /// View service address.
        #[arg(long)]
        view_service: Option<SocketAddr>,
    },

    /// Configuration management commands.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the merged configuration.
    Show {
        /// Output format.
        #[arg(short, long, value_enum, default_value_t = ShowFormat::Toml)]
        format: ShowFormat,
    },

    /// Write a tandem.toml with default values.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ShowFormat {
    Toml,
    Text,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let sources = commands::ConfigSources {
        file: cli.config,
        project_dir: cli.project_dir,
    };

    match cli.command {
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
        Commands::ViewService { bind, n, k } => {
            let config = sources.load()?;
            commands::view_service::run(&config, bind, n, k)
        }
        Commands::Node {
            name,
            listen,
            advertise,
            view_service,
        } => {
            let config = sources.load()?;
            commands::node::run(
                &config,
                commands::node::Overrides {
                    name,
                    listen,
                    advertise,
                    view_service,
                },
            )
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show { format } => {
                let config = sources.load()?;
                match format {
                    ShowFormat::Toml => commands::config::show_toml(&config),
                    ShowFormat::Text => {
                        commands::config::show_text(&config);
                        Ok(())
                    }
                }
            }
            ConfigCommands::Init { force } => commands::config::init(&sources.dir()?, force),
        },
    }
}
