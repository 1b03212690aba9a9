//! Master binary

use clap::{Parser, Subcommand};
use miniweed::common::Config;
use miniweed::master::MasterServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "miniweed-master")]
#[command(about = "miniweed master: volume directory replicated with Raft")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a master
    Serve {
        /// Node ID, unique within the Raft group
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// URL other nodes reach this master at
        #[arg(long)]
        advertise: Option<String>,

        /// Raft log and snapshot directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Other masters as id=host:port (comma-separated)
        #[arg(long, value_delimiter = ',')]
        peers: Vec<String>,

        /// Default replication, e.g. 001
        #[arg(long)]
        replication: Option<String>,

        /// Volume size limit in MB
        #[arg(long)]
        volume_size_limit_mb: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Load config from file and environment, then override with CLI arguments
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
            id,
            bind,
            advertise,
            data_dir,
            peers,
            replication,
            volume_size_limit_mb,
        } => {
            let master = &mut config.master;
            if let Some(bind) = bind {
                master.bind_addr = bind.parse()?;
            }
            if advertise.is_some() {
                master.advertise_url = advertise;
            }
            if let Some(dir) = data_dir {
                master.data_dir = dir;
            }
            if !peers.is_empty() {
                master.peers = peers;
            }
            if let Some(replication) = replication {
                master.default_replication = replication;
            }
            if let Some(limit) = volume_size_limit_mb {
                master.volume_size_limit_mb = limit;
            }

            let node_id = id
                .or_else(|| Some(config.node_id.clone()).filter(|id| !id.is_empty()))
                .unwrap_or_else(|| format!("master-{}", config.master.bind_addr.port()));
            MasterServer::new(node_id, config.master).serve().await?;
        }
    }

    Ok(())
}
