//! Filer binary

use anyhow::Result;
use clap::{Parser, Subcommand};
use miniweed::common::Config;
use miniweed::filer::FilerServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "miniweed-filer")]
#[command(about = "miniweed filer: file paths over volume-stored chunks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a filer
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Metadata directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Master addresses (comma-separated)
        #[arg(long, value_delimiter = ',')]
        masters: Vec<String>,

        /// Chunk size in MB
        #[arg(long)]
        chunk_size_mb: Option<u64>,

        /// Replication for new chunks
        #[arg(long)]
        replication: Option<String>,
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
            data_dir,
            masters,
            chunk_size_mb,
            replication,
        } => {
            let filer = &mut config.filer;
            if let Some(bind) = bind {
                filer.bind_addr = bind.parse()?;
            }
            if let Some(dir) = data_dir {
                filer.data_dir = dir;
            }
            if !masters.is_empty() {
                filer.masters = masters;
            }
            if let Some(size) = chunk_size_mb {
                filer.chunk_size_mb = size;
            }
            if replication.is_some() {
                filer.replication = replication;
            }
            FilerServer::new(config.filer).serve().await?;
        }
    }

    Ok(())
}
