//! Conversion of a replicated volume into placed EC shards
//!
//! Driven by the master leader. The directory lifecycle moves
//! `Writable|ReadOnly → EcPending → EcEncoded → SourceDeleted`; any failure
//! before `EcEncoded` deletes every shard written, drops staging files and
//! restores the previous lifecycle and writability.
//!
//! A shard map commit whose outcome is unknown (timeout, lost leadership)
//! is never rolled back by the job itself. `reconcile` settles such volumes
//! later from the replicated state: `EcEncoded` finishes retirement,
//! `EcPending` without a running job is rolled back.

use crate::common::{
    retry_with_backoff, EcConfig, EcCopyRequest, EcVolumeInfo, Error, NodeState, Result,
    ShardAck, ShardId, VolumeId,
};
use crate::master::directory::{Command, Directory, ShardPlacement, VolumeLifecycle};
use crate::master::placement::plan_ec_shards;
use crate::master::raft_node::RaftNode;
use crate::master::topology::Topology;
use crate::master::volume_admin::VolumeAdmin;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct EcJobReport {
    pub job_id: String,
    pub volume_id: VolumeId,
    pub source: String,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub dat_size: u64,
    pub shard_size: u64,
    /// Shard id → destination server
    pub placement: BTreeMap<ShardId, String>,
    pub source_deleted: bool,
    pub elapsed_ms: u64,
}

/// What `reconcile` did to a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciled {
    Untouched,
    Retired,
    RetirePending,
    RolledBack,
}

/// Removes the in-flight marker of a job when it ends
struct JobGuard {
    jobs: Arc<Mutex<HashMap<VolumeId, Arc<AtomicBool>>>>,
    volume_id: VolumeId,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.volume_id);
    }
}

/// What a failed job has to undo
struct Rollback {
    volume_id: VolumeId,
    staging: Vec<String>,
    replicas: Vec<String>,
    previous: VolumeLifecycle,
    began: bool,
    committing: bool,
    destinations: BTreeMap<String, Vec<ShardId>>,
}

/// Errors after which a proposal may or may not have been committed
fn outcome_unknown(err: &Error) -> bool {
    matches!(
        err,
        Error::ConsensusTimeout | Error::LeaderUnavailable | Error::NotLeader(_)
    )
}

pub struct EcJobRunner {
    raft: Arc<RaftNode>,
    directory: Arc<Directory>,
    topology: Arc<Topology>,
    admin: Arc<dyn VolumeAdmin>,
    config: EcConfig,
    jobs: Arc<Mutex<HashMap<VolumeId, Arc<AtomicBool>>>>,
}

impl EcJobRunner {
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
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &EcConfig {
        &self.config
    }

    pub fn running_jobs(&self) -> Vec<VolumeId> {
        let mut vids: Vec<VolumeId> = self.jobs.lock().keys().copied().collect();
        vids.sort_unstable();
        vids
    }

    /// Request cancellation of the job converting `vid`. The job stops at
    /// its next step boundary and rolls back.
    pub fn cancel(&self, vid: VolumeId) -> bool {
        match self.jobs.lock().get(&vid) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                tracing::info!("Cancellation requested for EC job of volume {}", vid);
                true
            }
            None => false,
        }
    }

    fn register(&self, vid: VolumeId) -> Result<(JobGuard, Arc<AtomicBool>)> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&vid) {
            return Err(Error::InvalidState(format!(
                "volume {} already has an EC job in flight",
                vid
            )));
        }
        let flag = Arc::new(AtomicBool::new(false));
        jobs.insert(vid, flag.clone());
        Ok((
            JobGuard {
                jobs: self.jobs.clone(),
                volume_id: vid,
            },
            flag,
        ))
    }

    fn check_cancelled(flag: &AtomicBool, vid: VolumeId) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::Cancelled(format!("EC job of volume {}", vid)));
        }
        Ok(())
    }

    /// Convert volume `vid` into `N+M` shards spread over the cluster.
    pub async fn encode_volume(&self, vid: VolumeId) -> Result<EcJobReport> {
        let started = Instant::now();
        let job_id = uuid::Uuid::new_v4().to_string();
        let (_guard, cancelled) = self.register(vid)?;

        // 1. lifecycle and a live source
        let record = self
            .directory
            .get(vid)
            .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))?;
        match record.state {
            VolumeLifecycle::Writable | VolumeLifecycle::ReadOnly => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "volume {} is {}, cannot convert",
                    vid, other
                )))
            }
        }
        // every reported holder gets quiesced; only a live one can encode
        let mut replicas = self.topology.volume_replicas(vid);
        if let Some((node, _)) = replicas
            .iter()
            .find(|(node, _)| !matches!(node.state, NodeState::Alive | NodeState::Suspect))
        {
            return Err(Error::InvalidState(format!(
                "replica of volume {} on {} is {:?}",
                vid, node.url, node.state
            )));
        }
        replicas.sort_by(|a, b| b.1.size.cmp(&a.1.size).then_with(|| a.0.url.cmp(&b.0.url)));
        let source = replicas
            .iter()
            .find(|(node, _)| node.state == NodeState::Alive)
            .map(|(node, _)| node.url.clone())
            .ok_or_else(|| Error::NotFound(format!("no live replica of volume {}", vid)))?;
        let replica_urls: Vec<String> = replicas.iter().map(|(n, _)| n.url.clone()).collect();

        // 2. placement, before any state change
        let (d, p) = (self.config.data_shards, self.config.parity_shards);
        let plan = plan_ec_shards(
            &self.topology.candidates(),
            d + p,
            self.config.fault_domain,
            vid,
        )?;
        let placement: BTreeMap<ShardId, String> = plan
            .iter()
            .enumerate()
            .map(|(i, node)| (i as ShardId, node.url.clone()))
            .collect();
        let mut destinations: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
        for (sid, url) in &placement {
            destinations.entry(url.clone()).or_default().push(*sid);
        }

        tracing::info!(
            "EC job {} converting volume {} ({}+{}) from {} onto {} servers",
            job_id,
            vid,
            d,
            p,
            source,
            destinations.len()
        );

        let mut rollback = Rollback {
            volume_id: vid,
            staging: vec![source.clone()],
            replicas: replica_urls.clone(),
            previous: record.state,
            began: false,
            committing: false,
            destinations: BTreeMap::new(),
        };

        match self
            .convert(vid, &source, &replica_urls, &placement, &destinations, &cancelled, &mut rollback)
            .await
        {
            Ok(info) => {
                let source_deleted = self
                    .retire_replicas(vid, std::slice::from_ref(&source), &replica_urls, true)
                    .await;
                let report = EcJobReport {
                    job_id,
                    volume_id: vid,
                    source,
                    data_shards: d,
                    parity_shards: p,
                    dat_size: info.dat_size,
                    shard_size: info.shard_size,
                    placement,
                    source_deleted,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                tracing::info!(
                    "EC job {} finished volume {} in {} ms",
                    report.job_id,
                    vid,
                    report.elapsed_ms
                );
                Ok(report)
            }
            Err(e) if rollback.committing && outcome_unknown(&e) => {
                tracing::error!(
                    "EC job {} for volume {}: shard map commit outcome unknown ({}), leaving it to reconciliation",
                    job_id,
                    vid,
                    e
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!("EC job {} for volume {} failed: {}", job_id, vid, e);
                self.rollback(&rollback).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn convert(
        &self,
        vid: VolumeId,
        source: &str,
        replicas: &[String],
        placement: &BTreeMap<ShardId, String>,
        destinations: &BTreeMap<String, Vec<ShardId>>,
        cancelled: &AtomicBool,
        rollback: &mut Rollback,
    ) -> Result<EcVolumeInfo> {
        // 3. leave the assignable set, then quiesce every replica
        let planned: ShardPlacement = placement
            .iter()
            .map(|(sid, url)| (*sid, vec![url.clone()]))
            .collect();
        Command::BeginEc {
            volume_id: vid,
            data_shards: self.config.data_shards,
            parity_shards: self.config.parity_shards,
            placement: planned.clone(),
        }
        .propose(&self.raft)
        .await?;
        rollback.began = true;

        for replica in replicas {
            let size = self.admin.mark_readonly(replica, vid).await?;
            tracing::debug!("Volume {} quiesced on {} at {} bytes", vid, replica, size);
        }
        Self::check_cancelled(cancelled, vid)?;

        // 4. encode on the source
        let info = self
            .admin
            .generate_ec_shards(source, vid, self.config.data_shards, self.config.parity_shards)
            .await?;
        if info.shard_checksums.len() != info.total_shards() {
            return Err(Error::Corrupt(format!(
                "source reported {} checksums for {} shards",
                info.shard_checksums.len(),
                info.total_shards()
            )));
        }
        Self::check_cancelled(cancelled, vid)?;

        // 5. distribute with bounded concurrency
        rollback.destinations = destinations.clone();
        let attempts = self.config.shard_retry_attempts;
        let backoff = self.config.retry_backoff();
        let copies: Vec<_> = destinations
            .iter()
            .map(|(dest, shards)| {
                let admin = self.admin.clone();
                let req = EcCopyRequest {
                    source: source.to_string(),
                    shard_ids: shards.clone(),
                    include_index: true,
                };
                let dest = dest.clone();
                let shards = shards.clone();
                async move {
                    let result = retry_with_backoff(
                        || admin.copy_ec_shards(&dest, vid, req.clone()),
                        attempts,
                        backoff,
                    )
                    .await;
                    (dest, shards, result)
                }
            })
            .collect();
        let results: Vec<(String, Vec<ShardId>, Result<Vec<ShardAck>>)> = stream::iter(copies)
            .buffer_unordered(self.config.copy_concurrency.max(1))
            .collect()
            .await;

        let mut failed: Vec<ShardId> = Vec::new();
        let mut reasons: Vec<String> = Vec::new();
        for (dest, shards, result) in results {
            match result.and_then(|acks| verify_acks(&info, &shards, &acks)) {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!("Shards {:?} of volume {} to {} failed: {}", shards, vid, dest, e);
                    failed.extend(shards);
                    reasons.push(format!("{}: {}", dest, e));
                }
            }
        }
        if !failed.is_empty() {
            failed.sort_unstable();
            return Err(Error::PartialShardFailure {
                volume_id: vid,
                failed,
                reason: reasons.join("; "),
            });
        }
        Self::check_cancelled(cancelled, vid)?;

        // 6. commit the shard map
        rollback.committing = true;
        Command::CommitEc {
            volume_id: vid,
            info: info.clone(),
            placement: planned,
        }
        .propose(&self.raft)
        .await?;
        Ok(info)
    }

    /// Settle a volume a job left behind: finish retirement of an encoded
    /// volume, delete `.dat` replicas reported after retirement, or roll back
    /// a pending conversion no job is driving.
    pub async fn reconcile(&self, vid: VolumeId) -> Result<Reconciled> {
        let (_guard, _) = self.register(vid)?;
        let record = self
            .directory
            .get(vid)
            .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))?;
        let holders: Vec<String> = self
            .topology
            .volume_replicas(vid)
            .into_iter()
            .map(|(node, _)| node.url)
            .collect();

        match record.state {
            VolumeLifecycle::EcEncoded => {
                tracing::info!("Retiring {} source replicas of volume {}", holders.len(), vid);
                Ok(if self.retire_replicas(vid, &holders, &holders, true).await {
                    Reconciled::Retired
                } else {
                    Reconciled::RetirePending
                })
            }
            VolumeLifecycle::SourceDeleted if !holders.is_empty() => {
                tracing::info!("Volume {} reported again by {:?} after retirement", vid, holders);
                Ok(if self.retire_replicas(vid, &[], &holders, false).await {
                    Reconciled::Retired
                } else {
                    Reconciled::RetirePending
                })
            }
            VolumeLifecycle::EcPending => {
                let previous = record.state_before_ec.unwrap_or(VolumeLifecycle::ReadOnly);
                if holders.is_empty() && previous == VolumeLifecycle::Writable {
                    // wait for heartbeats to name the replicas to reopen
                    return Ok(Reconciled::Untouched);
                }
                let mut destinations: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
                if let Some(ec) = &record.ec {
                    for (sid, urls) in &ec.placement {
                        for url in urls {
                            destinations.entry(url.clone()).or_default().push(*sid);
                        }
                    }
                }
                let rollback = Rollback {
                    volume_id: vid,
                    staging: holders.clone(),
                    replicas: holders,
                    previous,
                    began: true,
                    committing: false,
                    destinations,
                };
                self.rollback(&rollback).await;
                Ok(match self.directory.lifecycle(vid) {
                    Some(VolumeLifecycle::EcPending) => Reconciled::Untouched,
                    _ => Reconciled::RolledBack,
                })
            }
            _ => Ok(Reconciled::Untouched),
        }
    }

    /// Delete the `.dat` replicas of a volume whose shards are committed.
    /// `record` moves the directory to `SourceDeleted` once all are gone.
    async fn retire_replicas(
        &self,
        vid: VolumeId,
        staging: &[String],
        replicas: &[String],
        record: bool,
    ) -> bool {
        for server in staging {
            if let Err(e) = self.admin.drop_ec_staging(server, vid).await {
                tracing::warn!("Failed to drop EC staging of volume {} on {}: {}", vid, server, e);
            }
        }
        let mut all_deleted = true;
        for replica in replicas {
            match self.admin.delete_volume(replica, vid).await {
                Ok(()) => self.topology.forget_volume(replica, vid),
                Err(e) => {
                    tracing::warn!("Failed to delete source of volume {} on {}: {}", vid, replica, e);
                    all_deleted = false;
                }
            }
        }
        if !all_deleted {
            return false;
        }
        if !record {
            return true;
        }
        match (Command::SourceDeleted { volume_id: vid })
            .propose(&self.raft)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Failed to record source deletion of volume {}: {}", vid, e);
                false
            }
        }
    }

    async fn rollback(&self, rb: &Rollback) {
        let vid = rb.volume_id;
        for (dest, shards) in &rb.destinations {
            if let Err(e) = self.admin.delete_ec_shards(dest, vid, shards).await {
                tracing::warn!("Rollback: deleting shards of volume {} on {} failed: {}", vid, dest, e);
            }
        }
        for server in &rb.staging {
            if let Err(e) = self.admin.drop_ec_staging(server, vid).await {
                tracing::warn!("Rollback: dropping staging of volume {} on {} failed: {}", vid, server, e);
            }
        }
        if !rb.began {
            return;
        }
        // replicas stay read-only until the directory agrees
        if let Err(e) = (Command::AbortEc { volume_id: vid }).propose(&self.raft).await {
            tracing::error!("Rollback: aborting conversion of volume {} failed: {}", vid, e);
            return;
        }
        if rb.previous == VolumeLifecycle::Writable {
            for replica in &rb.replicas {
                if let Err(e) = self.admin.mark_writable(replica, vid).await {
                    tracing::warn!("Rollback: volume {} stays read-only on {}: {}", vid, replica, e);
                }
            }
        }
        tracing::info!("Rolled back EC conversion of volume {}", vid);
    }
}

/// Every requested shard must be acknowledged with the source's checksum.
fn verify_acks(info: &EcVolumeInfo, requested: &[ShardId], acks: &[ShardAck]) -> Result<()> {
    for sid in requested {
        let ack = acks
            .iter()
            .find(|a| a.shard_id == *sid)
            .ok_or_else(|| Error::Corrupt(format!("shard {} not acknowledged", sid)))?;
        let expected = info
            .shard_checksums
            .get(*sid as usize)
            .ok_or_else(|| Error::Corrupt(format!("no checksum for shard {}", sid)))?;
        if &ack.checksum != expected || ack.size != info.shard_size {
            return Err(Error::Corrupt(format!(
                "shard {} checksum mismatch: got {} ({} bytes), want {} ({} bytes)",
                sid, ack.checksum, ack.size, expected, info.shard_size
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> EcVolumeInfo {
        EcVolumeInfo {
            volume_id: 1,
            data_shards: 2,
            parity_shards: 1,
            dat_size: 100,
            shard_size: 50,
            shard_checksums: vec!["a".into(), "b".into(), "c".into()],
            needle_count: 1,
            replication: "000".into(),
        }
    }

    fn ack(shard_id: ShardId, checksum: &str) -> ShardAck {
        ShardAck {
            shard_id,
            checksum: checksum.into(),
            size: 50,
        }
    }

    #[test]
    fn test_verify_acks() {
        let info = info();
        assert!(verify_acks(&info, &[0, 2], &[ack(0, "a"), ack(2, "c")]).is_ok());
        assert!(matches!(
            verify_acks(&info, &[0, 2], &[ack(0, "a")]),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(
            verify_acks(&info, &[1], &[ack(1, "x")]),
            Err(Error::Corrupt(_))
        ));
    }
}
