//! Volume server binary

use anyhow::Result;
use clap::{Parser, Subcommand};
use miniweed::common::Config;
use miniweed::volume::VolumeServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "miniweed-volume")]
#[command(about = "miniweed volume server: append-only needle storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a volume server
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// URL clients reach this server at
        #[arg(long)]
        public_url: Option<String>,

        /// Data directories (comma-separated)
        #[arg(long, value_delimiter = ',')]
        dir: Vec<PathBuf>,

        /// Master addresses (comma-separated)
        #[arg(long, value_delimiter = ',')]
        masters: Vec<String>,

        /// Maximum number of volumes
        #[arg(long)]
        max_volumes: Option<u32>,

        #[arg(long)]
        data_center: Option<String>,

        #[arg(long)]
        rack: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            public_url,
            dir,
            masters,
            max_volumes,
            data_center,
            rack,
        } => {
            let volume = &mut config.volume;
            if let Some(bind) = bind {
                volume.bind_addr = bind.parse()?;
            }
            if public_url.is_some() {
                volume.public_url = public_url;
            }
            if !dir.is_empty() {
                volume.data_dirs = dir;
            }
            if !masters.is_empty() {
                volume.masters = masters;
            }
            if let Some(max) = max_volumes {
                volume.max_volumes = max;
            }
            if let Some(dc) = data_center {
                volume.data_center = dc;
            }
            if let Some(rack) = rack {
                volume.rack = rack;
            }
            VolumeServer::new(config.volume).serve().await?;
        }
    }

    Ok(())
}
