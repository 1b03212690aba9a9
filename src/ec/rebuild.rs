//! Regenerating EC shards whose holders are gone

use crate::common::{EcConfig, EcCopyRequest, EcRebuildRequest, Error, Result, ShardId, VolumeId};
use crate::master::directory::{Command, Directory, ShardPlacement};
use crate::master::placement::{plan_ec_replacements, NodeCandidate};
use crate::master::raft_node::RaftNode;
use crate::master::topology::Topology;
use crate::master::volume_admin::VolumeAdmin;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub volume_id: VolumeId,
    pub rebuilder: Option<String>,
    /// Rebuilt shard → new holder
    pub rebuilt: BTreeMap<ShardId, String>,
}

pub struct EcRebuilder {
    raft: Arc<RaftNode>,
    directory: Arc<Directory>,
    topology: Arc<Topology>,
    admin: Arc<dyn VolumeAdmin>,
    config: EcConfig,
}

impl EcRebuilder {
    pub fn new(
        raft: Arc<RaftNode>,
        directory: Arc<Directory>,
        topology: Arc<Topology>,
        admin: Arc<dyn VolumeAdmin>,
        config: EcConfig,
    ) -> Self {
        Self {
            raft,
            directory,
            topology,
            admin,
            config,
        }
    }

    /// Shards of an encoded volume that no readable server reports
    pub fn missing_shards(&self, vid: VolumeId) -> Result<Vec<ShardId>> {
        let record = self
            .directory
            .get(vid)
            .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))?;
        let ec = match (&record.ec, record.state.is_ec()) {
            (Some(ec), true) => ec,
            _ => {
                return Err(Error::InvalidState(format!(
                    "volume {} is {}, not erasure coded",
                    vid, record.state
                )))
            }
        };
        let present = self.topology.ec_shard_locations(vid);
        Ok((0..ec.total_shards() as ShardId)
            .filter(|sid| !present.contains_key(sid))
            .collect())
    }

    pub async fn rebuild_volume(&self, vid: VolumeId) -> Result<RebuildReport> {
        let missing = self.missing_shards(vid)?;
        let mut report = RebuildReport {
            volume_id: vid,
            rebuilder: None,
            rebuilt: BTreeMap::new(),
        };
        if missing.is_empty() {
            return Ok(report);
        }

        let record = self
            .directory
            .get(vid)
            .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))?;
        let data_shards = record.ec.as_ref().map(|e| e.data_shards).unwrap_or_default();

        let present = self.topology.ec_shard_locations(vid);
        if present.len() < data_shards {
            return Err(Error::InsufficientShards {
                needed: data_shards,
                available: present.len(),
            });
        }

        let occupied: Vec<(ShardId, NodeCandidate)> = present
            .iter()
            .flat_map(|(sid, locations)| {
                locations.iter().filter_map(|loc| {
                    self.topology.node(&loc.url).map(|n| (*sid, n.candidate()))
                })
            })
            .collect();
        let plan = plan_ec_replacements(
            &self.topology.candidates(),
            self.config.fault_domain,
            vid,
            &occupied,
            &missing,
        )?;
        let rebuilder = plan
            .first()
            .map(|(_, n)| n.url.clone())
            .ok_or_else(|| Error::Internal("empty rebuild plan".into()))?;

        let sources: Vec<(ShardId, String)> = present
            .iter()
            .filter_map(|(sid, locs)| locs.first().map(|l| (*sid, l.url.clone())))
            .collect();
        tracing::info!(
            "Rebuilding shards {:?} of volume {} on {}",
            missing,
            vid,
            rebuilder
        );

        let result = self
            .rebuild_and_place(vid, &rebuilder, sources, &missing, &plan)
            .await;
        if let Err(e) = self.admin.drop_ec_staging(&rebuilder, vid).await {
            tracing::warn!("Failed to drop rebuild staging on {}: {}", rebuilder, e);
        }
        let placed = result?;

        let placement: ShardPlacement = placed
            .iter()
            .map(|(sid, url)| (*sid, vec![url.clone()]))
            .collect();
        Command::UpdateEcPlacement {
            volume_id: vid,
            placement,
        }
        .propose(&self.raft)
        .await?;

        report.rebuilder = Some(rebuilder);
        report.rebuilt = placed;
        Ok(report)
    }

    async fn rebuild_and_place(
        &self,
        vid: VolumeId,
        rebuilder: &str,
        sources: Vec<(ShardId, String)>,
        missing: &[ShardId],
        plan: &[(ShardId, NodeCandidate)],
    ) -> Result<BTreeMap<ShardId, String>> {
        let acks = self
            .admin
            .rebuild_ec_shards(
                rebuilder,
                vid,
                EcRebuildRequest {
                    sources,
                    missing: missing.to_vec(),
                },
            )
            .await?;
        let checksums: BTreeMap<ShardId, String> =
            acks.into_iter().map(|a| (a.shard_id, a.checksum)).collect();

        let mut by_target: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
        for (sid, node) in plan {
            by_target.entry(node.url.clone()).or_default().push(*sid);
        }

        let mut placed = BTreeMap::new();
        for (target, shard_ids) in by_target {
            let acks = self
                .admin
                .copy_ec_shards(
                    &target,
                    vid,
                    EcCopyRequest {
                        source: rebuilder.to_string(),
                        shard_ids: shard_ids.clone(),
                        include_index: true,
                    },
                )
                .await?;
            for sid in shard_ids {
                let matches = acks
                    .iter()
                    .any(|a| a.shard_id == sid && checksums.get(&sid) == Some(&a.checksum));
                if !matches {
                    return Err(Error::Corrupt(format!(
                        "rebuilt shard {} of volume {} differs on {}",
                        sid, vid, target
                    )));
                }
                placed.insert(sid, target.clone());
            }
        }
        Ok(placed)
    }
}
