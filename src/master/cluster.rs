//! The master's view of the cluster: assignments, lookups and growth
//!
//! Mutations of the directory go through Raft and therefore only happen on
//! the leader. The topology is rebuilt from heartbeats after every
//! leadership change.

use crate::common::{
    timestamp_now, AssignRequest, Assignment, EcShardLocation, Error, FileId, Heartbeat,
    HeartbeatResponse, Location, LookupResponse, MasterConfig, Result, ServerStatus, VolumeId,
    VolumeSummary,
};
use crate::ec::{EcJobRunner, EcRebuilder};
use crate::master::directory::{Command, Directory, DirectoryState, VolumeLifecycle};
use crate::master::placement::{select_volume_servers, ReplicaPlacement};
use crate::master::raft_node::{RaftNode, RaftStatus};
use crate::master::topology::Topology;
use crate::master::volume_admin::VolumeAdmin;
use crate::volume::volume::SUPER_BLOCK_SIZE;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;

/// Needle keys reserved through Raft per round trip
const KEY_BATCH: u64 = 10_000;

/// Keys reserved by this leader and not handed out yet
#[derive(Debug, Default)]
struct KeyBatch {
    next: u64,
    end: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub raft: RaftStatus,
    pub volume_size_limit: u64,
    pub servers: Vec<ServerStatus>,
    pub ec_jobs: Vec<VolumeId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryStatus {
    pub directory: DirectoryState,
    pub is_leader: bool,
}

pub struct Master {
    config: MasterConfig,
    raft: Arc<RaftNode>,
    directory: Arc<Directory>,
    topology: Arc<Topology>,
    admin: Arc<dyn VolumeAdmin>,
    ec_jobs: Arc<EcJobRunner>,
    rebuilder: Arc<EcRebuilder>,
    keys: Mutex<KeyBatch>,
    grow_lock: tokio::sync::Mutex<()>,
}

impl Master {
    pub fn new(
        config: MasterConfig,
        raft: Arc<RaftNode>,
        directory: Arc<Directory>,
        admin: Arc<dyn VolumeAdmin>,
    ) -> Self {
        let topology = Arc::new(Topology::new(config.volume_size_limit()));
        let ec_jobs = Arc::new(EcJobRunner::new(
            raft.clone(),
            directory.clone(),
            topology.clone(),
            admin.clone(),
            config.ec.clone(),
        ));
        let rebuilder = Arc::new(EcRebuilder::new(
            raft.clone(),
            directory.clone(),
            topology.clone(),
            admin.clone(),
            config.ec.clone(),
        ));
        Self {
            config,
            raft,
            directory,
            topology,
            admin,
            ec_jobs,
            rebuilder,
            keys: Mutex::new(KeyBatch::default()),
            grow_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn admin(&self) -> &Arc<dyn VolumeAdmin> {
        &self.admin
    }

    pub fn ec_jobs(&self) -> &Arc<EcJobRunner> {
        &self.ec_jobs
    }

    pub fn rebuilder(&self) -> &Arc<EcRebuilder> {
        &self.rebuilder
    }

    /// Leader whose no-op has been applied, so the directory is current
    pub fn ensure_leader(&self) -> Result<()> {
        if self.raft.is_ready_leader() {
            Ok(())
        } else if self.raft.is_leader() {
            Err(Error::LeaderUnavailable)
        } else {
            Err(self.raft.not_leader_error())
        }
    }

    /// Forget soft state gathered under a previous leadership.
    pub fn reset_soft_state(&self) {
        self.topology.clear();
        *self.keys.lock() = KeyBatch::default();
    }

    // === Heartbeats ===

    pub async fn ingest_heartbeat(&self, hb: &Heartbeat) -> Result<HeartbeatResponse> {
        if !self.raft.is_leader() {
            return Err(self.raft.not_leader_error());
        }
        let outcome = self.topology.ingest_heartbeat(hb);
        let response = HeartbeatResponse {
            leader: self.raft.url().to_string(),
            term: self.raft.term(),
            volume_size_limit: self.topology.volume_size_limit(),
        };
        if outcome.stale || !self.raft.is_ready_leader() {
            return Ok(response);
        }

        for summary in &hb.volumes {
            if self.directory.get(summary.id).is_none() {
                let cmd = Command::RegisterVolume {
                    volume_id: summary.id,
                    replication: summary.replication.clone(),
                    read_only: summary.read_only,
                };
                match cmd.propose(&self.raft).await {
                    Ok(_) => tracing::info!(
                        "Registered volume {} reported by {}",
                        summary.id,
                        hb.url
                    ),
                    Err(e) => tracing::warn!("Cannot register volume {}: {}", summary.id, e),
                }
            }
        }
        for vid in outcome.full_volumes {
            if self.directory.lifecycle(vid) == Some(VolumeLifecycle::Writable) {
                let cmd = Command::SetReadOnly {
                    volume_id: vid,
                    read_only: true,
                };
                match cmd.propose(&self.raft).await {
                    Ok(_) => tracing::info!("Volume {} is full, now read-only", vid),
                    Err(e) => tracing::warn!("Cannot mark volume {} read-only: {}", vid, e),
                }
            }
        }
        Ok(response)
    }

    // === Assignment ===

    fn replication_for(&self, requested: Option<&str>) -> Result<ReplicaPlacement> {
        match requested {
            Some(r) if !r.trim().is_empty() => ReplicaPlacement::parse(r),
            _ => ReplicaPlacement::parse(&self.config.default_replication),
        }
    }

    fn pick_writable(
        &self,
        replication: &ReplicaPlacement,
        req: &AssignRequest,
    ) -> Option<(VolumeId, Vec<Location>)> {
        let mut candidates: Vec<(VolumeId, Vec<Location>)> = self
            .topology
            .writable_volumes(&replication.to_string(), replication.copy_count(), req.size)
            .into_iter()
            .filter(|(vid, _)| self.directory.is_assignable(*vid))
            .filter(|(_, locations)| match req.data_center.as_deref() {
                Some(dc) => locations.iter().any(|l| l.data_center == dc),
                None => true,
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..candidates.len());
        let (vid, mut locations) = candidates.swap_remove(i);
        if let Some(dc) = req.data_center.as_deref() {
            locations.sort_by_key(|l| l.data_center != dc);
        }
        Some((vid, locations))
    }

    /// Hand out `count` consecutive keys on a writable volume, growing the
    /// cluster when no volume has room.
    pub async fn assign(&self, req: &AssignRequest) -> Result<Assignment> {
        self.ensure_leader()?;
        let replication = self.replication_for(req.replication.as_deref())?;
        if req.size > self.topology.volume_size_limit() {
            return Err(Error::InvalidArgument(format!(
                "{} bytes exceed the volume size limit",
                req.size
            )));
        }

        let picked = match self.pick_writable(&replication, req) {
            Some(picked) => picked,
            None => {
                let _grow = self.grow_lock.lock().await;
                match self.pick_writable(&replication, req) {
                    Some(picked) => picked,
                    None => {
                        self.grow_volumes(1, replication, req.data_center.as_deref())
                            .await?;
                        self.pick_writable(&replication, req)
                            .ok_or(Error::NoWritableVolumes)?
                    }
                }
            }
        };
        let (volume_id, replicas) = picked;
        let primary = replicas.first().cloned().ok_or(Error::NoWritableVolumes)?;

        let count = req.count.max(1);
        let key = self.reserve_keys(count).await?;
        let fid = FileId::new(volume_id, key, rand::thread_rng().gen());
        tracing::debug!("Assigned {} on {} ({} keys)", fid, primary.url, count);
        Ok(Assignment {
            fid: fid.to_string(),
            volume_id,
            url: primary.url,
            public_url: primary.public_url,
            replicas,
            count,
            term: self.raft.term(),
        })
    }

    /// First of `count` consecutive unused needle keys
    pub async fn reserve_keys(&self, count: u64) -> Result<u64> {
        let floor = self.topology.max_reported_key();
        {
            let mut batch = self.keys.lock();
            if batch.next > floor && batch.next.saturating_add(count) <= batch.end {
                let start = batch.next;
                batch.next += count;
                return Ok(start);
            }
        }

        let reserve = count.max(KEY_BATCH);
        let bytes = Command::ReserveKeys {
            count: reserve,
            floor,
        }
        .propose(&self.raft)
        .await?;
        let start: u64 = bincode::deserialize(&bytes)?;

        let mut batch = self.keys.lock();
        batch.next = start + count;
        batch.end = start + reserve;
        Ok(start)
    }

    // === Growth ===

    pub async fn grow(&self, count: usize, replication: Option<&str>) -> Result<Vec<VolumeId>> {
        self.ensure_leader()?;
        let replication = self.replication_for(replication)?;
        let _grow = self.grow_lock.lock().await;
        self.grow_volumes(count, replication, None).await
    }

    async fn grow_volumes(
        &self,
        count: usize,
        replication: ReplicaPlacement,
        data_center: Option<&str>,
    ) -> Result<Vec<VolumeId>> {
        let rp = replication.to_string();
        let mut grown = Vec::with_capacity(count);
        for _ in 0..count {
            let candidates = self.topology.candidates();
            let key = format!("volume-{}", self.directory.max_volume_id() + 1);
            let servers = select_volume_servers(&replication, &candidates, &key, data_center)?;

            let bytes = Command::AllocateVolume {
                replication: rp.clone(),
            }
            .propose(&self.raft)
            .await?;
            let vid: VolumeId = bincode::deserialize(&bytes)?;

            let results = join_all(
                servers
                    .iter()
                    .map(|s| self.admin.allocate_volume(&s.url, vid, &rp)),
            )
            .await;
            if let Some(e) = results.into_iter().find_map(|r| r.err()) {
                tracing::warn!("Allocating volume {} failed: {}", vid, e);
                for server in &servers {
                    if let Err(err) = self.admin.delete_volume(&server.url, vid).await {
                        tracing::debug!("Cleanup of volume {} on {}: {}", vid, server.url, err);
                    }
                }
                if let Err(err) = (Command::RemoveVolume { volume_id: vid })
                    .propose(&self.raft)
                    .await
                {
                    tracing::warn!("Cannot drop volume {} from the directory: {}", vid, err);
                }
                return Err(e);
            }

            for server in &servers {
                self.topology.note_volume(
                    &server.url,
                    VolumeSummary {
                        id: vid,
                        size: SUPER_BLOCK_SIZE,
                        file_count: 0,
                        delete_count: 0,
                        deleted_bytes: 0,
                        read_only: false,
                        replication: rp.clone(),
                        compaction_revision: 0,
                        max_needle_key: 0,
                        modified_at: timestamp_now(),
                    },
                );
            }
            tracing::info!(
                "Grew volume {} ({}) on {}",
                vid,
                rp,
                servers
                    .iter()
                    .map(|s| s.url.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            grown.push(vid);
        }
        Ok(grown)
    }

    // === Lookup ===

    /// Replica locations of a volume, or shard holders once it is encoded.
    pub fn lookup(&self, vid: VolumeId) -> Result<LookupResponse> {
        if !self.raft.is_leader() {
            return Err(self.raft.not_leader_error());
        }
        let record = self.directory.get(vid);
        let locations = self.topology.volume_locations(vid);
        let mut response = LookupResponse {
            volume_id: vid,
            locations,
            ec_shards: Vec::new(),
            data_shards: 0,
            parity_shards: 0,
        };

        let encoded = matches!(
            record.as_ref().map(|r| r.state),
            Some(VolumeLifecycle::EcEncoded | VolumeLifecycle::SourceDeleted)
        );
        if let (true, Some(ec)) = (encoded, record.as_ref().and_then(|r| r.ec.as_ref())) {
            response.data_shards = ec.data_shards;
            response.parity_shards = ec.parity_shards;
            response.ec_shards = self
                .topology
                .ec_shard_locations(vid)
                .into_iter()
                .map(|(shard_id, locations)| EcShardLocation {
                    shard_id,
                    locations,
                })
                .collect();
        }

        if response.locations.is_empty() && response.ec_shards.is_empty() {
            return Err(Error::NotFound(format!("volume {} has no reachable holder", vid)));
        }
        Ok(response)
    }

    // === Status ===

    pub fn cluster_status(&self) -> ClusterStatus {
        ClusterStatus {
            raft: self.raft.status(),
            volume_size_limit: self.topology.volume_size_limit(),
            servers: self.topology.server_status(),
            ec_jobs: self.ec_jobs.running_jobs(),
        }
    }

    /// Replicated state; followers serve it too, possibly stale.
    pub fn directory_status(&self) -> DirectoryStatus {
        DirectoryStatus {
            directory: self.directory.export(),
            is_leader: self.raft.is_leader(),
        }
    }
}
