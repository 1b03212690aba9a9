//! CLI for the blob data path and cluster operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use miniweed::client::{BlobClient, MasterClient, VolumeClient};
use miniweed::common::FileId;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "miniweed")]
#[command(about = "miniweed blob store CLI")]
#[command(version)]
struct Cli {
    /// Master URLs (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "http://localhost:9333")]
    masters: Vec<String>,

    /// Request timeout in seconds; EC jobs and repairs can take minutes
    #[arg(long, default_value = "600")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file as one blob and print its file id
    Upload {
        file: PathBuf,

        /// Replication, e.g. 001
        #[arg(long)]
        replication: Option<String>,
    },

    /// Download a blob
    Download {
        fid: String,

        /// Output file (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete a blob
    Delete { fid: String },

    /// Show Raft and server status of every master
    Status,

    /// Allocate new volumes
    Grow {
        #[arg(long, default_value = "1")]
        count: usize,

        #[arg(long)]
        replication: Option<String>,
    },

    /// Erasure coding
    Ec {
        #[command(subcommand)]
        command: EcCommands,
    },

    /// Verify every volume and report unhealthy ones
    Verify,

    /// Restore replica counts and rebuild lost EC shards
    Repair {
        /// Only report what would be done
        #[arg(long)]
        dry_run: bool,
    },

    /// Compact volumes with too much deleted data
    Vacuum {
        /// Garbage ratio above which a volume is compacted
        #[arg(long)]
        threshold: Option<f64>,
    },
}

#[derive(Subcommand)]
enum EcCommands {
    /// Convert a volume into EC shards
    Encode { volume_id: u32 },
    /// Rebuild missing shards of an EC volume
    Rebuild { volume_id: u32 },
    /// Cancel a running conversion
    Cancel { volume_id: u32 },
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn count(value: &Value, field: &str) -> usize {
    value[field].as_array().map_or(0, Vec::len)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);
    let master = Arc::new(MasterClient::new(&cli.masters, timeout)?);

    match cli.command {
        Commands::Upload { file, replication } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;
            let blobs = BlobClient::new(master, VolumeClient::new(timeout)?);
            let result = blobs.put(data, replication.as_deref()).await?;
            println!("{}", result.fid);
            eprintln!("  size: {} bytes, etag: {}", result.size, result.etag);
        }

        Commands::Download { fid, output } => {
            let fid: FileId = fid.parse()?;
            let blobs = BlobClient::new(master, VolumeClient::new(timeout)?);
            let data = blobs.get(&fid).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &data)
                        .await
                        .with_context(|| format!("cannot write {}", path.display()))?;
                    eprintln!("Wrote {} bytes to {}", data.len(), path.display());
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
        }

        Commands::Delete { fid } => {
            let fid: FileId = fid.parse()?;
            let blobs = BlobClient::new(master, VolumeClient::new(timeout)?);
            blobs.delete(&fid).await?;
            println!("Deleted {}", fid);
        }

        Commands::Status => {
            for url in master.masters() {
                match master.master_status(url).await {
                    Ok(status) => {
                        println!("{}:", url);
                        print_json(&status)?;
                    }
                    Err(e) => println!("{}: unreachable ({})", url, e),
                }
            }
        }

        Commands::Grow { count, replication } => {
            let grown = master.grow(count, replication.as_deref()).await?;
            println!("Allocated volumes: {:?}", grown);
        }

        Commands::Ec { command } => {
            let path = match command {
                EcCommands::Encode { volume_id } => format!("/ec/encode/{}", volume_id),
                EcCommands::Rebuild { volume_id } => format!("/ec/rebuild/{}", volume_id),
                EcCommands::Cancel { volume_id } => format!("/ec/cancel/{}", volume_id),
            };
            print_json(&master.post_json(&path).await?)?;
        }

        Commands::Verify => {
            let report = master.post_json("/ops/verify").await?;
            println!("Verification report:");
            println!("  Servers checked: {}", report["servers_checked"]);
            println!("  Needles checked: {}", report["needles_checked"]);
            println!("  Healthy volumes: {}", count(&report, "healthy"));
            println!("  Corrupt volumes: {}", count(&report, "corrupt"));
            println!("  Under-replicated: {}", count(&report, "under_replicated"));
            println!("  EC volumes missing shards: {}", count(&report, "missing_shards"));
            println!("  Unreachable servers: {}", count(&report, "unreachable_servers"));
            let problems = count(&report, "corrupt")
                + count(&report, "under_replicated")
                + count(&report, "missing_shards")
                + count(&report, "unreachable_servers");
            if problems > 0 {
                print_json(&report)?;
                std::process::exit(1);
            }
        }

        Commands::Repair { dry_run } => {
            let report = master
                .post_json(&format!("/ops/repair?dry_run={}", dry_run))
                .await?;
            println!("Repair report{}:", if dry_run { " (dry run)" } else { "" });
            println!("  Volumes checked: {}", report["volumes_checked"]);
            println!("  Replicas copied: {}", count(&report, "replicated"));
            println!("  EC volumes rebuilt: {}", count(&report, "rebuilt"));
            println!("  Failures: {}", count(&report, "failed"));
            if count(&report, "failed") > 0 {
                print_json(&report["failed"])?;
            }
        }

        Commands::Vacuum { threshold } => {
            let path = match threshold {
                Some(t) => format!("/vol/vacuum?threshold={}", t),
                None => "/vol/vacuum".to_string(),
            };
            let report = master.post_json(&path).await?;
            println!("Vacuum report:");
            println!("  Threshold: {}", report["threshold"]);
            println!("  Volumes vacuumed: {}", count(&report, "vacuumed"));
            println!("  Failures: {}", count(&report, "failed"));
        }
    }

    Ok(())
}
