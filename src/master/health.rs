//! Liveness monitoring of volume servers
//!
//! Servers go `Suspect` after `suspect_after_missed` heartbeat intervals and
//! are removed after `dead_after_missed`. Removing a server starts a repair
//! pass, but only once this leader has been in office long enough for every
//! live server to have reported.

use crate::master::cluster::Master;
use crate::ops::repair_cluster;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

pub struct HealthMonitor {
    master: Arc<Master>,
    repairing: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(master: Arc<Master>) -> Self {
        Self {
            master,
            repairing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let config = self.master.config().clone();
        let interval = config.heartbeat_interval();
        let settle = interval * config.dead_after_missed;
        let mut leader_rx = self.master.raft().subscribe();
        let mut leader_since: Option<Instant> =
            leader_rx.borrow_and_update().is_self.then(Instant::now);
        let mut repair_pending = false;
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let info = leader_rx.borrow_and_update().clone();
                    if info.is_self && leader_since.is_none() {
                        tracing::info!("Leader for term {}, waiting for heartbeats", info.term);
                        self.master.reset_soft_state();
                        leader_since = Some(Instant::now());
                    } else if !info.is_self && leader_since.is_some() {
                        tracing::info!("No longer leader (term {})", info.term);
                        self.master.reset_soft_state();
                        leader_since = None;
                        repair_pending = false;
                    }
                }
                _ = ticker.tick() => {
                    let Some(since) = leader_since else { continue };
                    let changes = self.master.topology().check_liveness(
                        Instant::now(),
                        interval,
                        config.suspect_after_missed,
                        config.dead_after_missed,
                    );
                    repair_pending |= !changes.dead.is_empty();
                    if repair_pending && since.elapsed() >= settle {
                        self.spawn_repair();
                        repair_pending = false;
                    }
                }
            }
        }
    }

    fn spawn_repair(&self) {
        if self.repairing.swap(true, Ordering::SeqCst) {
            return;
        }
        let master = self.master.clone();
        let repairing = self.repairing.clone();
        tokio::spawn(async move {
            match repair_cluster(&master, false).await {
                Ok(report) if report.failed.is_empty() => {}
                Ok(report) => tracing::warn!(
                    "Repair after server loss left {} volumes unrepaired",
                    report.failed.len()
                ),
                Err(e) => tracing::error!("Repair after server loss failed: {}", e),
            }
            repairing.store(false, Ordering::SeqCst);
        });
    }
}
