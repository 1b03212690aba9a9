//! Filer server

use crate::client::{BlobClient, MasterClient, VolumeClient};
use crate::common::{FilerConfig, Result};
use crate::filer::filer::Filer;
use crate::filer::http::{create_router, FilerState};
use crate::filer::store::{FilerStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

pub struct FilerServer {
    config: FilerConfig,
}

impl FilerServer {
    pub fn new(config: FilerConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting filer");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Masters: {}", self.config.masters.join(", "));
        tracing::info!("  Data dir: {}", self.config.data_dir.display());
        tracing::info!("  Chunk size: {} MB", self.config.chunk_size_mb);

        let dir = self.config.data_dir.clone();
        let store = tokio::task::spawn_blocking(move || MemoryStore::open(&dir))
            .await
            .map_err(|e| crate::Error::Internal(e.to_string()))??;
        let store = Arc::new(store);
        tracing::info!("  Loaded {} entries", store.len());

        let timeout = Duration::from_secs(60);
        let master = Arc::new(MasterClient::new(&self.config.masters, timeout)?);
        let blobs = Arc::new(BlobClient::new(master, VolumeClient::new(timeout)?));
        let chunk_size = (self.config.chunk_size_mb.max(1) * 1024 * 1024) as usize;
        let filer = Arc::new(Filer::new(
            store.clone(),
            blobs,
            chunk_size,
            self.config.replication.clone(),
        ));
        let gc = filer.start_gc(Duration::from_secs(self.config.gc_interval_secs.max(1)));

        // Request bodies are buffered whole; cap them at 64 chunks
        let body_limit_mb = (self.config.chunk_size_mb.max(1) * 64) as usize;
        let router = create_router(FilerState { filer: filer.clone() }, body_limit_mb);
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("✓ Filer ready");

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(crate::common::shutdown_signal())
            .await;

        gc.abort();
        if filer.gc_pending() > 0 {
            let report = filer.collect_garbage().await;
            if report.failed > 0 {
                tracing::warn!("{} chunks left undeleted at shutdown", report.failed);
            }
        }
        if let Err(e) = store.flush() {
            tracing::warn!("Final metadata flush failed: {}", e);
        }
        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Filer stopped");
        Ok(())
    }
}
