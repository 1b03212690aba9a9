//! Volume server

use crate::client::{MasterClient, VolumeClient};
use crate::common::{Result, VolumeConfig};
use crate::volume::heartbeat::{start_checkpoints, HeartbeatLoop};
use crate::volume::http::{create_router, VolumeState};
use crate::volume::remote::RemoteShardReader;
use crate::volume::store::Store;
use std::sync::Arc;
use std::time::Duration;

/// Size limit used until the first heartbeat response arrives
const INITIAL_VOLUME_SIZE_LIMIT: u64 = 1024 * 1024 * 1024;

pub struct VolumeServer {
    config: VolumeConfig,
}

impl VolumeServer {
    pub fn new(config: VolumeConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;
        let url = self.config.url();
        tracing::info!("Starting volume server: {}", url);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Masters: {}", self.config.masters.join(", "));
        tracing::info!(
            "  Location: {} / {}",
            self.config.data_center,
            self.config.rack
        );
        for dir in &self.config.data_dirs {
            tracing::info!("  Data dir: {}", dir.display());
        }

        let config = self.config.clone();
        let store = tokio::task::spawn_blocking(move || {
            Store::open(&config, INITIAL_VOLUME_SIZE_LIMIT)
        })
        .await
        .map_err(|e| crate::Error::Internal(e.to_string()))??;
        let store = Arc::new(store);
        tracing::info!(
            "  Loaded {} volumes, max {}",
            store.volume_ids().len(),
            store.max_volumes()
        );

        let timeout = Duration::from_secs(30);
        let master = Arc::new(MasterClient::new(&self.config.masters, timeout)?);
        let client = VolumeClient::new(timeout)?;
        let shard_reader = Arc::new(RemoteShardReader::new(
            master.clone(),
            client.clone(),
            url.clone(),
        ));

        let heartbeat = HeartbeatLoop::new(
            store.clone(),
            master.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
        )
        .start();
        let checkpoints = start_checkpoints(
            store.clone(),
            Duration::from_secs(self.config.index_checkpoint_secs.max(1)),
        );

        let state = VolumeState {
            store: store.clone(),
            client,
            master: Some(master),
            shard_reader,
        };
        // Room for the needle plus request framing
        let body_limit_mb = self.config.max_needle_mb as usize + 1;
        let router = create_router(state, body_limit_mb);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Volume server ready");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(crate::common::shutdown_signal())
            .await;

        heartbeat.abort();
        checkpoints.abort();
        if let Err(e) = store.checkpoint_all() {
            tracing::warn!("Final index checkpoint failed: {}", e);
        }
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Volume server stopped");
        Ok(())
    }
}
