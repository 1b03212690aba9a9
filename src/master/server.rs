//! Master server

use crate::client::VolumeClient;
use crate::common::{MasterConfig, Result};
use crate::ec::scanner::run_scanner;
use crate::master::cluster::Master;
use crate::master::directory::Directory;
use crate::master::health::HealthMonitor;
use crate::master::http::{create_router, MasterState};
use crate::master::raft_node::{RaftConfig, RaftNode};
use crate::master::raft_transport::HttpRaftTransport;
use std::sync::Arc;
use std::time::Duration;

/// Timeout for admin calls to volume servers; volume copies can be slow.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(300);

pub struct MasterServer {
    node_id: String,
    config: MasterConfig,
}

impl MasterServer {
    pub fn new(node_id: impl Into<String>, config: MasterConfig) -> Self {
        Self {
            node_id: node_id.into(),
            config,
        }
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;
        let raft_config = RaftConfig::from_master(&self.node_id, &self.config)?;
        tracing::info!("Starting master: {}", self.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Advertised as: {}", raft_config.url);
        tracing::info!("  Data dir: {}", self.config.data_dir.display());
        tracing::info!("  Raft peers: {}", raft_config.peers.len());
        tracing::info!(
            "  Default replication: {}, volume size limit: {} MB",
            self.config.default_replication,
            self.config.volume_size_limit_mb
        );

        let directory = Arc::new(Directory::default());
        let transport = Arc::new(HttpRaftTransport::new(raft_config.election_timeout)?);
        let raft = RaftNode::new(
            raft_config,
            directory.clone(),
            transport,
            Some(&self.config.data_dir.join("raft")),
        )?;
        let raft_task = raft.start();

        let admin = Arc::new(VolumeClient::new(ADMIN_TIMEOUT)?);
        let master = Arc::new(Master::new(
            self.config.clone(),
            raft.clone(),
            directory.clone(),
            admin,
        ));
        let health = HealthMonitor::new(master.clone()).start();
        let scanner = tokio::spawn(run_scanner(
            raft.clone(),
            directory,
            master.topology().clone(),
            master.ec_jobs().clone(),
        ));

        let router = create_router(MasterState {
            master: master.clone(),
        });
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Master ready");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(crate::common::shutdown_signal())
            .await;

        scanner.abort();
        health.abort();
        raft.stop();
        raft_task.abort();
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Master stopped");
        Ok(())
    }
}
