//! Verify cluster integrity

use crate::common::{NeedleKey, Result, ShardId, VolumeId};
use crate::master::cluster::Master;
use crate::master::directory::VolumeLifecycle;
use crate::master::placement::ReplicaPlacement;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptVolume {
    pub volume_id: VolumeId,
    pub server: String,
    pub keys: Vec<NeedleKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderReplicated {
    pub volume_id: VolumeId,
    pub replication: String,
    pub expected: usize,
    /// Servers currently holding a readable replica
    pub holders: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingShards {
    pub volume_id: VolumeId,
    pub shard_ids: Vec<ShardId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub servers_checked: usize,
    pub unreachable_servers: Vec<String>,
    pub needles_checked: u64,
    pub healthy: Vec<VolumeId>,
    pub corrupt: Vec<CorruptVolume>,
    pub under_replicated: Vec<UnderReplicated>,
    pub missing_shards: Vec<MissingShards>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.unreachable_servers.is_empty()
            && self.corrupt.is_empty()
            && self.under_replicated.is_empty()
            && self.missing_shards.is_empty()
    }
}

/// Volumes with a live source whose holder count is below their policy
pub fn find_under_replicated(master: &Master) -> Vec<UnderReplicated> {
    master
        .directory()
        .volumes()
        .into_iter()
        .filter(|rec| {
            matches!(
                rec.state,
                VolumeLifecycle::Writable | VolumeLifecycle::ReadOnly
            )
        })
        .filter_map(|rec| {
            let expected = ReplicaPlacement::parse(&rec.replication)
                .map(|rp| rp.copy_count())
                .unwrap_or(1);
            let holders: Vec<String> = master
                .topology()
                .volume_locations(rec.id)
                .into_iter()
                .map(|l| l.url)
                .collect();
            (holders.len() < expected).then(|| UnderReplicated {
                volume_id: rec.id,
                replication: rec.replication.clone(),
                expected,
                holders,
            })
        })
        .collect()
}

/// Encoded volumes with shards that no live server reports
pub fn find_missing_shards(master: &Master) -> Vec<MissingShards> {
    master
        .directory()
        .volumes()
        .into_iter()
        .filter(|rec| rec.state.is_ec() && rec.state != VolumeLifecycle::EcPending)
        .filter_map(|rec| {
            let shard_ids = master.rebuilder().missing_shards(rec.id).ok()?;
            (!shard_ids.is_empty()).then_some(MissingShards {
                volume_id: rec.id,
                shard_ids,
            })
        })
        .collect()
}

/// Have every volume server scan its needles, then check replica counts
/// and EC shard coverage against the directory.
pub async fn verify_cluster(master: &Master, concurrency: usize) -> Result<VerifyReport> {
    master.ensure_leader()?;
    tracing::info!("Starting cluster verification");

    let servers: Vec<String> = master
        .topology()
        .nodes()
        .into_iter()
        .filter(|n| n.state.can_read())
        .map(|n| n.url)
        .collect();
    let admin = master.admin().clone();
    let results: Vec<_> = stream::iter(servers.clone())
        .map(|server| {
            let admin = admin.clone();
            async move {
                let res = admin.verify(&server).await;
                (server, res)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = VerifyReport {
        servers_checked: servers.len(),
        ..Default::default()
    };
    let mut seen: BTreeSet<VolumeId> = BTreeSet::new();
    let mut bad: BTreeSet<VolumeId> = BTreeSet::new();
    for (server, res) in results {
        match res {
            Ok(volumes) => {
                for v in volumes {
                    report.needles_checked += v.needles;
                    seen.insert(v.volume_id);
                    if !v.corrupt_keys.is_empty() {
                        tracing::warn!(
                            "Volume {} on {} has {} corrupt needles",
                            v.volume_id,
                            server,
                            v.corrupt_keys.len()
                        );
                        bad.insert(v.volume_id);
                        report.corrupt.push(CorruptVolume {
                            volume_id: v.volume_id,
                            server: server.clone(),
                            keys: v.corrupt_keys,
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Cannot verify {}: {}", server, e);
                report.unreachable_servers.push(server);
            }
        }
    }

    report.under_replicated = find_under_replicated(master);
    report.missing_shards = find_missing_shards(master);
    bad.extend(report.under_replicated.iter().map(|u| u.volume_id));
    report.healthy = seen.difference(&bad).copied().collect();
    report.corrupt.sort_by(|a, b| (a.volume_id, &a.server).cmp(&(b.volume_id, &b.server)));
    report.unreachable_servers.sort();

    tracing::info!(
        "Verification done: {} healthy, {} corrupt, {} under-replicated, {} EC volumes missing shards",
        report.healthy.len(),
        report.corrupt.len(),
        report.under_replicated.len(),
        report.missing_shards.len()
    );
    Ok(report)
}
