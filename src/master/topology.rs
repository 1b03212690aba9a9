//! Live cluster topology built from volume server heartbeats
//!
//! Soft state owned by the leader: data center → rack → server with the
//! volumes and EC shards each server reports. Every server sits behind its
//! own mutex so heartbeats from distinct servers merge in parallel while
//! the server map only takes a read lock.

use crate::common::{
    EcShardSummary, Heartbeat, Location, NodeState, ServerStatus, ShardId, VolumeId,
    VolumeSummary,
};
use crate::master::placement::NodeCandidate;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct DataNode {
    pub url: String,
    pub public_url: String,
    pub data_center: String,
    pub rack: String,
    pub max_volumes: u32,
    pub volumes: BTreeMap<VolumeId, VolumeSummary>,
    pub ec_shards: BTreeMap<VolumeId, Vec<ShardId>>,
    pub state: NodeState,
    pub last_seen: Instant,
    pub last_sequence: u64,
    pub missed: u32,
}

impl DataNode {
    fn from_heartbeat(hb: &Heartbeat, now: Instant) -> Self {
        let mut node = Self {
            url: hb.url.clone(),
            public_url: hb.public_url.clone(),
            data_center: hb.data_center.clone(),
            rack: hb.rack.clone(),
            max_volumes: hb.max_volumes,
            volumes: BTreeMap::new(),
            ec_shards: BTreeMap::new(),
            state: NodeState::Alive,
            last_seen: now,
            last_sequence: hb.sequence,
            missed: 0,
        };
        node.replace_content(hb);
        node
    }

    fn replace_content(&mut self, hb: &Heartbeat) {
        self.public_url = hb.public_url.clone();
        self.data_center = hb.data_center.clone();
        self.rack = hb.rack.clone();
        self.max_volumes = hb.max_volumes;
        self.volumes = hb.volumes.iter().map(|v| (v.id, v.clone())).collect();
        self.ec_shards = hb
            .ec_shards
            .iter()
            .map(|s| {
                let mut ids = s.shard_ids.clone();
                ids.sort_unstable();
                (s.volume_id, ids)
            })
            .collect();
        self.last_sequence = hb.sequence;
    }

    pub fn location(&self) -> Location {
        Location {
            url: self.url.clone(),
            public_url: self.public_url.clone(),
            data_center: self.data_center.clone(),
            rack: self.rack.clone(),
        }
    }

    pub fn free_slots(&self) -> i64 {
        self.max_volumes as i64 - self.volumes.len() as i64
    }

    pub fn candidate(&self) -> NodeCandidate {
        NodeCandidate {
            url: self.url.clone(),
            data_center: self.data_center.clone(),
            rack: self.rack.clone(),
            free_slots: self.free_slots(),
        }
    }
}

/// What a heartbeat changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeartbeatOutcome {
    pub new_node: bool,
    /// Older than what is already known; nothing was applied
    pub stale: bool,
    /// Was suspect or dead and is alive again
    pub revived: bool,
    /// Writable volumes at or above the size limit
    pub full_volumes: Vec<VolumeId>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LivenessChanges {
    pub suspect: Vec<String>,
    pub dead: Vec<String>,
}

pub struct Topology {
    nodes: RwLock<HashMap<String, Arc<Mutex<DataNode>>>>,
    volume_size_limit: AtomicU64,
    /// Highest needle key any server reported
    max_reported_key: AtomicU64,
}

impl Topology {
    pub fn new(volume_size_limit: u64) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            volume_size_limit: AtomicU64::new(volume_size_limit),
            max_reported_key: AtomicU64::new(0),
        }
    }

    pub fn volume_size_limit(&self) -> u64 {
        self.volume_size_limit.load(Ordering::Relaxed)
    }

    pub fn max_reported_key(&self) -> u64 {
        self.max_reported_key.load(Ordering::Relaxed)
    }

    pub fn ingest_heartbeat(&self, hb: &Heartbeat) -> HeartbeatOutcome {
        self.ingest_heartbeat_at(hb, Instant::now())
    }

    /// Merge one heartbeat. A heartbeat replaces the server's previous
    /// report, so replaying it changes nothing.
    pub fn ingest_heartbeat_at(&self, hb: &Heartbeat, now: Instant) -> HeartbeatOutcome {
        let mut outcome = HeartbeatOutcome::default();

        let existing = self.nodes.read().get(&hb.url).cloned();
        let node = match existing {
            Some(node) => node,
            None => {
                let mut nodes = self.nodes.write();
                nodes
                    .entry(hb.url.clone())
                    .or_insert_with(|| {
                        outcome.new_node = true;
                        Arc::new(Mutex::new(DataNode::from_heartbeat(hb, now)))
                    })
                    .clone()
            }
        };

        {
            let mut node = node.lock();
            if !outcome.new_node {
                if hb.sequence < node.last_sequence {
                    tracing::debug!(
                        "Ignoring stale heartbeat {} from {} (have {})",
                        hb.sequence,
                        hb.url,
                        node.last_sequence
                    );
                    outcome.stale = true;
                    return outcome;
                }
                node.replace_content(hb);
            }
            if node.state != NodeState::Alive {
                tracing::info!("Volume server {} is alive again", hb.url);
                outcome.revived = true;
            }
            node.state = NodeState::Alive;
            node.missed = 0;
            node.last_seen = now;
        }

        if outcome.new_node {
            tracing::info!(
                "Volume server {} joined ({}/{}, {} volumes)",
                hb.url,
                hb.data_center,
                hb.rack,
                hb.volumes.len()
            );
        }

        let limit = self.volume_size_limit();
        outcome.full_volumes = hb
            .volumes
            .iter()
            .filter(|v| !v.read_only && v.size >= limit)
            .map(|v| v.id)
            .collect();
        if let Some(max_key) = hb.volumes.iter().map(|v| v.max_needle_key).max() {
            self.max_reported_key.fetch_max(max_key, Ordering::Relaxed);
        }
        outcome
    }

    /// Advance liveness of every server. Servers reach `Suspect` after
    /// `suspect_after` missed intervals and are removed once `dead_after`
    /// are missed.
    pub fn check_liveness(
        &self,
        now: Instant,
        interval: Duration,
        suspect_after: u32,
        dead_after: u32,
    ) -> LivenessChanges {
        let mut changes = LivenessChanges::default();
        let interval = interval.max(Duration::from_millis(1));
        {
            let nodes = self.nodes.read();
            for node in nodes.values() {
                let mut node = node.lock();
                let elapsed = now.saturating_duration_since(node.last_seen);
                node.missed = (elapsed.as_millis() / interval.as_millis()) as u32;
                if node.missed >= dead_after {
                    if node.state != NodeState::Dead {
                        node.state = NodeState::Dead;
                        changes.dead.push(node.url.clone());
                    }
                } else if node.missed >= suspect_after && node.state == NodeState::Alive {
                    node.state = NodeState::Suspect;
                    changes.suspect.push(node.url.clone());
                }
            }
        }

        for url in &changes.suspect {
            tracing::warn!("Volume server {} is suspect", url);
        }
        if !changes.dead.is_empty() {
            let mut nodes = self.nodes.write();
            for url in &changes.dead {
                tracing::warn!("Volume server {} is dead, removing it", url);
                nodes.remove(url);
            }
        }
        changes
    }

    pub fn remove_node(&self, url: &str) -> bool {
        self.nodes.write().remove(url).is_some()
    }

    /// Record a volume the master just placed on `url`, ahead of the
    /// server's next heartbeat.
    pub fn note_volume(&self, url: &str, summary: VolumeSummary) -> bool {
        match self.nodes.read().get(url) {
            Some(node) => {
                node.lock().volumes.insert(summary.id, summary);
                true
            }
            None => false,
        }
    }

    pub fn forget_volume(&self, url: &str, vid: VolumeId) {
        if let Some(node) = self.nodes.read().get(url) {
            node.lock().volumes.remove(&vid);
        }
    }

    pub fn forget_ec_shards(&self, url: &str, vid: VolumeId, shard_ids: &[ShardId]) {
        if let Some(node) = self.nodes.read().get(url) {
            let mut node = node.lock();
            if let Some(ids) = node.ec_shards.get_mut(&vid) {
                ids.retain(|id| !shard_ids.contains(id));
                if ids.is_empty() {
                    node.ec_shards.remove(&vid);
                }
            }
        }
    }

    pub fn clear(&self) {
        self.nodes.write().clear();
    }

    pub fn node(&self, url: &str) -> Option<DataNode> {
        self.nodes.read().get(url).map(|n| n.lock().clone())
    }

    pub fn nodes(&self) -> Vec<DataNode> {
        let mut nodes: Vec<DataNode> = self.nodes.read().values().map(|n| n.lock().clone()).collect();
        nodes.sort_by(|a, b| a.url.cmp(&b.url));
        nodes
    }

    pub fn node_state(&self, url: &str) -> Option<NodeState> {
        self.nodes.read().get(url).map(|n| n.lock().state)
    }

    /// Alive servers as placement candidates
    pub fn candidates(&self) -> Vec<NodeCandidate> {
        self.nodes()
            .iter()
            .filter(|n| n.state == NodeState::Alive)
            .map(DataNode::candidate)
            .collect()
    }

    /// Readable replicas of a volume; suspect servers are listed last.
    pub fn volume_locations(&self, vid: VolumeId) -> Vec<Location> {
        let mut holders: Vec<DataNode> = self
            .nodes()
            .into_iter()
            .filter(|n| n.volumes.contains_key(&vid) && n.state.can_read())
            .collect();
        holders.sort_by_key(|n| n.state != NodeState::Alive);
        holders.iter().map(DataNode::location).collect()
    }

    /// Replica reports of a volume, one per holding server
    pub fn volume_replicas(&self, vid: VolumeId) -> Vec<(DataNode, VolumeSummary)> {
        self.nodes()
            .into_iter()
            .filter_map(|n| {
                let summary = n.volumes.get(&vid).cloned()?;
                Some((n, summary))
            })
            .collect()
    }

    pub fn ec_shard_locations(&self, vid: VolumeId) -> BTreeMap<ShardId, Vec<Location>> {
        let mut shards: BTreeMap<ShardId, Vec<Location>> = BTreeMap::new();
        for node in self.nodes() {
            if !node.state.can_read() {
                continue;
            }
            if let Some(ids) = node.ec_shards.get(&vid) {
                for id in ids {
                    shards.entry(*id).or_default().push(node.location());
                }
            }
        }
        shards
    }

    /// Every volume id reported by a server, with its replica summaries
    pub fn reported_volumes(&self) -> BTreeMap<VolumeId, Vec<VolumeSummary>> {
        let mut volumes: BTreeMap<VolumeId, Vec<VolumeSummary>> = BTreeMap::new();
        for node in self.nodes() {
            for (vid, summary) in node.volumes {
                volumes.entry(vid).or_default().push(summary);
            }
        }
        volumes
    }

    pub fn reported_ec_volumes(&self) -> Vec<VolumeId> {
        let mut vids: Vec<VolumeId> = self
            .nodes()
            .iter()
            .flat_map(|n| n.ec_shards.keys().copied().collect::<Vec<_>>())
            .collect();
        vids.sort_unstable();
        vids.dedup();
        vids
    }

    /// Volumes that can take `size` more bytes on every replica, with the
    /// replica set; all replicas must be alive and writable.
    pub fn writable_volumes(&self, replication: &str, copies: usize, size: u64) -> Vec<(VolumeId, Vec<Location>)> {
        let limit = self.volume_size_limit();
        let mut by_volume: BTreeMap<VolumeId, Vec<(DataNode, VolumeSummary)>> = BTreeMap::new();
        for node in self.nodes() {
            for summary in node.volumes.values() {
                by_volume
                    .entry(summary.id)
                    .or_default()
                    .push((node.clone(), summary.clone()));
            }
        }

        by_volume
            .into_iter()
            .filter(|(_, replicas)| {
                replicas.len() == copies
                    && replicas.iter().all(|(node, v)| {
                        node.state == NodeState::Alive
                            && !v.read_only
                            && v.replication == replication
                            && v.size.saturating_add(size) < limit
                    })
            })
            .map(|(vid, replicas)| (vid, replicas.iter().map(|(n, _)| n.location()).collect()))
            .collect()
    }

    pub fn server_status(&self) -> Vec<ServerStatus> {
        self.nodes()
            .iter()
            .map(|n| ServerStatus {
                url: n.url.clone(),
                data_center: n.data_center.clone(),
                rack: n.rack.clone(),
                state: n.state,
                volumes: n.volumes.keys().copied().collect(),
                ec_shards: n
                    .ec_shards
                    .iter()
                    .map(|(vid, ids)| EcShardSummary {
                        volume_id: *vid,
                        shard_ids: ids.clone(),
                    })
                    .collect(),
                free_slots: n.free_slots(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: VolumeId, size: u64) -> VolumeSummary {
        VolumeSummary {
            id,
            size,
            file_count: 1,
            delete_count: 0,
            deleted_bytes: 0,
            read_only: false,
            replication: "000".into(),
            compaction_revision: 0,
            max_needle_key: id as u64 * 10,
            modified_at: 0,
        }
    }

    fn heartbeat(url: &str, seq: u64, volumes: Vec<VolumeSummary>) -> Heartbeat {
        Heartbeat {
            url: url.into(),
            public_url: url.into(),
            data_center: "dc1".into(),
            rack: "r1".into(),
            max_volumes: 8,
            sequence: seq,
            volumes,
            ec_shards: vec![],
        }
    }

    #[test]
    fn test_heartbeat_replay_is_idempotent() {
        let topo = Topology::new(1000);
        let hb = heartbeat("http://a", 5, vec![summary(1, 10), summary(2, 20)]);
        let now = Instant::now();
        assert!(topo.ingest_heartbeat_at(&hb, now).new_node);
        let before = topo.node("http://a").unwrap();

        let outcome = topo.ingest_heartbeat_at(&hb, now);
        assert!(!outcome.new_node && !outcome.stale);
        let after = topo.node("http://a").unwrap();
        assert_eq!(before.volumes, after.volumes);
        assert_eq!(before.last_sequence, after.last_sequence);
    }

    #[test]
    fn test_stale_heartbeat_ignored() {
        let topo = Topology::new(1000);
        topo.ingest_heartbeat(&heartbeat("http://a", 5, vec![summary(1, 10)]));
        let outcome = topo.ingest_heartbeat(&heartbeat("http://a", 4, vec![]));
        assert!(outcome.stale);
        assert_eq!(topo.volume_locations(1).len(), 1);
    }

    #[test]
    fn test_full_volume_detection_and_key_floor() {
        let topo = Topology::new(100);
        let outcome = topo.ingest_heartbeat(&heartbeat("http://a", 1, vec![summary(1, 100), summary(2, 5)]));
        assert_eq!(outcome.full_volumes, vec![1]);
        assert_eq!(topo.max_reported_key(), 20);
        assert_eq!(topo.writable_volumes("000", 1, 10).len(), 1);
    }

    #[test]
    fn test_liveness_hysteresis() {
        let topo = Topology::new(1000);
        let start = Instant::now();
        topo.ingest_heartbeat_at(&heartbeat("http://a", 1, vec![summary(1, 0)]), start);
        let interval = Duration::from_secs(1);

        let changes = topo.check_liveness(start + Duration::from_millis(2500), interval, 3, 10);
        assert!(changes.suspect.is_empty());

        let changes = topo.check_liveness(start + Duration::from_secs(3), interval, 3, 10);
        assert_eq!(changes.suspect, vec!["http://a".to_string()]);
        assert_eq!(topo.node_state("http://a"), Some(NodeState::Suspect));
        assert!(topo.candidates().is_empty());

        // A heartbeat restores it immediately
        let outcome = topo.ingest_heartbeat_at(
            &heartbeat("http://a", 2, vec![summary(1, 0)]),
            start + Duration::from_secs(4),
        );
        assert!(outcome.revived);
        assert_eq!(topo.node_state("http://a"), Some(NodeState::Alive));

        let changes = topo.check_liveness(start + Duration::from_secs(14), interval, 3, 10);
        assert_eq!(changes.dead, vec!["http://a".to_string()]);
        assert!(topo.node("http://a").is_none());
        assert!(topo.volume_locations(1).is_empty());
    }
}
