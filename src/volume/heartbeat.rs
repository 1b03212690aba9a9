//! Background tasks of a volume server: heartbeats and index checkpoints

use crate::client::MasterClient;
use crate::volume::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct HeartbeatLoop {
    store: Arc<Store>,
    master: Arc<MasterClient>,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(store: Arc<Store>, master: Arc<MasterClient>, interval: Duration) -> Self {
        Self {
            store,
            master,
            interval,
        }
    }

    /// Push a full status to the leader every interval. Failures are
    /// logged once per outage and retried on the next tick.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut leader: Option<String> = None;
            let mut failing = false;
            loop {
                ticker.tick().await;
                let hb = self.store.heartbeat();
                match self.master.heartbeat(&hb).await {
                    Ok(resp) => {
                        self.store.set_volume_size_limit(resp.volume_size_limit);
                        if leader.as_deref() != Some(resp.leader.as_str()) {
                            tracing::info!(
                                "Heartbeating to leader {} (term {})",
                                resp.leader,
                                resp.term
                            );
                            leader = Some(resp.leader);
                        }
                        failing = false;
                    }
                    Err(e) => {
                        if !failing {
                            tracing::warn!("Heartbeat failed: {}", e);
                        }
                        failing = true;
                    }
                }
            }
        })
    }
}

/// Periodically persist needle maps so restarts replay only the tail.
pub fn start_checkpoints(store: Arc<Store>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.checkpoint_all()).await {
                Ok(Ok(())) => tracing::debug!("Index checkpoint written"),
                Ok(Err(e)) => tracing::warn!("Index checkpoint failed: {}", e),
                Err(e) => tracing::warn!("Index checkpoint task failed: {}", e),
            }
        }
    })
}
