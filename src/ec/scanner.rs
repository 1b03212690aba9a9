//! Background selection of volumes to convert to EC

use crate::common::{timestamp_now, EcConfig, VolumeId};
use crate::ec::job::{EcJobRunner, Reconciled};
use crate::master::directory::{Directory, VolumeLifecycle};
use crate::master::raft_node::RaftNode;
use crate::master::topology::Topology;
use std::sync::Arc;
use std::time::Duration;

/// Volumes that are read-only or nearly full on every replica and have
/// seen no write for the quiet period.
pub fn select_candidates(
    directory: &Directory,
    topology: &Topology,
    config: &EcConfig,
    now_secs: u64,
) -> Vec<VolumeId> {
    let limit = topology.volume_size_limit() as f64;
    let reported = topology.reported_volumes();
    directory
        .volumes()
        .into_iter()
        .filter(|rec| matches!(rec.state, VolumeLifecycle::Writable | VolumeLifecycle::ReadOnly))
        .filter(|rec| {
            let Some(replicas) = reported.get(&rec.id) else {
                return false;
            };
            replicas.iter().all(|v| {
                let full = v.read_only || v.size as f64 >= limit * config.full_ratio;
                let quiet = now_secs.saturating_sub(v.modified_at) >= config.quiet_period_secs;
                full && quiet
            })
        })
        .map(|rec| rec.id)
        .collect()
}

/// Volumes a conversion left unsettled: pending or encoded without a
/// recorded retirement, or retired but still reported with a `.dat` replica.
pub fn select_unsettled(directory: &Directory, topology: &Topology) -> Vec<VolumeId> {
    let reported = topology.reported_volumes();
    directory
        .volumes()
        .into_iter()
        .filter(|rec| match rec.state {
            VolumeLifecycle::EcPending | VolumeLifecycle::EcEncoded => true,
            VolumeLifecycle::SourceDeleted => reported.contains_key(&rec.id),
            _ => false,
        })
        .map(|rec| rec.id)
        .collect()
}

/// Run until the task is dropped; only the leader converts.
pub async fn run_scanner(
    raft: Arc<RaftNode>,
    directory: Arc<Directory>,
    topology: Arc<Topology>,
    runner: Arc<EcJobRunner>,
) {
    let secs = runner.config().scan_interval_secs;
    if secs == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
    ticker.tick().await;
    tracing::info!("EC scanner running every {}s", secs);
    loop {
        ticker.tick().await;
        if !raft.is_ready_leader() {
            continue;
        }
        for vid in select_unsettled(&directory, &topology) {
            match runner.reconcile(vid).await {
                Ok(Reconciled::Untouched) => {}
                Ok(outcome) => tracing::info!("EC scanner reconciled volume {}: {:?}", vid, outcome),
                Err(e) => tracing::debug!("EC scanner skipped reconciling volume {}: {}", vid, e),
            }
        }
        let candidates = select_candidates(&directory, &topology, runner.config(), timestamp_now());
        for vid in candidates {
            match runner.encode_volume(vid).await {
                Ok(report) => tracing::info!(
                    "EC scanner converted volume {} ({} bytes)",
                    vid,
                    report.dat_size
                ),
                Err(e) => tracing::warn!("EC scanner could not convert volume {}: {}", vid, e),
            }
        }
    }
}
