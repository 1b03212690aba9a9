//! Repair under-replicated volumes and EC volumes with lost shards

use crate::common::{timestamp_now, Error, NodeState, Result, VolumeId, VolumeSummary};
use crate::ec::RebuildReport;
use crate::master::cluster::Master;
use crate::master::directory::VolumeLifecycle;
use crate::master::placement::{select_repair_targets, NodeCandidate};
use crate::ops::verify::{find_missing_shards, find_under_replicated, UnderReplicated};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCopy {
    pub volume_id: VolumeId,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairFailure {
    pub volume_id: VolumeId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub volumes_checked: usize,
    pub replicated: Vec<ReplicaCopy>,
    pub rebuilt: Vec<RebuildReport>,
    pub failed: Vec<RepairFailure>,
    pub dry_run: bool,
}

/// Bring every volume back to its replica count by copying from a survivor,
/// and rebuild lost EC shards. With `dry_run` only the plan is reported.
pub async fn repair_cluster(master: &Master, dry_run: bool) -> Result<RepairReport> {
    master.ensure_leader()?;
    tracing::info!("Starting cluster repair{}", if dry_run { " (dry run)" } else { "" });

    let under = find_under_replicated(master);
    let missing = find_missing_shards(master);
    let mut report = RepairReport {
        volumes_checked: master.directory().volumes().len(),
        dry_run,
        ..Default::default()
    };

    for volume in under {
        match repair_volume(master, &volume, dry_run).await {
            Ok(copies) => report.replicated.extend(copies),
            Err(e) => {
                tracing::error!("Repair of volume {} failed: {}", volume.volume_id, e);
                report.failed.push(RepairFailure {
                    volume_id: volume.volume_id,
                    error: e.to_string(),
                });
            }
        }
    }

    for shards in missing {
        if dry_run {
            tracing::info!(
                "Would rebuild shards {:?} of volume {}",
                shards.shard_ids,
                shards.volume_id
            );
            continue;
        }
        match master.rebuilder().rebuild_volume(shards.volume_id).await {
            Ok(rebuilt) => report.rebuilt.push(rebuilt),
            Err(e) => {
                tracing::error!("Rebuild of volume {} failed: {}", shards.volume_id, e);
                report.failed.push(RepairFailure {
                    volume_id: shards.volume_id,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        "Repair done: {} replicas copied, {} EC volumes rebuilt, {} failures",
        report.replicated.len(),
        report.rebuilt.len(),
        report.failed.len()
    );
    Ok(report)
}

async fn repair_volume(
    master: &Master,
    volume: &UnderReplicated,
    dry_run: bool,
) -> Result<Vec<ReplicaCopy>> {
    let vid = volume.volume_id;
    let topology = master.topology();
    let replicas = topology.volume_replicas(vid);
    let (source_node, source_summary) = replicas
        .iter()
        .find(|(node, _)| node.state == NodeState::Alive)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("no live replica of volume {}", vid)))?;

    let holders: Vec<NodeCandidate> = replicas.iter().map(|(n, _)| n.candidate()).collect();
    let needed = volume.expected.saturating_sub(holders.len());
    let targets = select_repair_targets(
        &topology.candidates(),
        &holders,
        needed,
        &format!("volume-{}", vid),
    )?;

    let copies: Vec<ReplicaCopy> = targets
        .iter()
        .map(|t| ReplicaCopy {
            volume_id: vid,
            source: source_node.url.clone(),
            target: t.url.clone(),
        })
        .collect();
    if dry_run {
        for copy in &copies {
            tracing::info!("Would copy volume {} from {} to {}", vid, copy.source, copy.target);
        }
        return Ok(copies);
    }

    // Writes stop while the copy is taken so the replicas stay identical
    let writable = master.directory().lifecycle(vid) == Some(VolumeLifecycle::Writable);
    let admin = master.admin();
    if writable {
        for (node, _) in &replicas {
            admin.mark_readonly(&node.url, vid).await?;
        }
    }

    let mut result = Ok(());
    for copy in &copies {
        tracing::info!("Copying volume {} from {} to {}", vid, copy.source, copy.target);
        if let Err(e) = admin.copy_volume(&copy.target, vid, &copy.source).await {
            result = Err(e);
            break;
        }
        topology.note_volume(
            &copy.target,
            VolumeSummary {
                read_only: true,
                modified_at: timestamp_now(),
                ..source_summary.clone()
            },
        );
    }

    if writable {
        let reopen = replicas
            .iter()
            .map(|(n, _)| n.url.clone())
            .chain(copies.iter().map(|c| c.target.clone()));
        for url in reopen {
            if let Err(e) = admin.mark_writable(&url, vid).await {
                tracing::warn!("Cannot reopen volume {} on {}: {}", vid, url, e);
            }
        }
    }
    result.map(|_| copies)
}
