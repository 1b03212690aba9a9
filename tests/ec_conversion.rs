//! EC conversion job against in-process volume servers: placement, shard
//! distribution, commit and rollback

use async_trait::async_trait;
use miniweed::common::{
    EcConfig, EcCopyRequest, EcRebuildRequest, EcVolumeInfo, Error, FaultDomain, Heartbeat,
    NodeState, PeerConfig, Result, ShardAck, ShardId, VolumeId, VolumeSummary,
    VolumeVerifyReport,
};
use miniweed::ec::job::{EcJobRunner, Reconciled};
use miniweed::master::directory::{Command, Directory, VolumeLifecycle};
use miniweed::master::raft_node::{RaftConfig, RaftNode};
use miniweed::master::raft_transport::MemoryNetwork;
use miniweed::master::topology::Topology;
use miniweed::master::volume_admin::VolumeAdmin;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const SHARD_SIZE: u64 = 4096;

#[derive(Default)]
struct FakeAdmin {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeAdmin {
    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn called(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Make every `call` against `server` fail until `heal` is called.
    fn fail(&self, call: &str, server: &str) {
        self.failing.lock().insert(format!("{} {}", call, server));
    }

    fn heal(&self, call: &str, server: &str) {
        self.failing.lock().remove(&format!("{} {}", call, server));
    }

    fn check(&self, call: &str, server: &str) -> Result<()> {
        if self.failing.lock().contains(&format!("{} {}", call, server)) {
            return Err(Error::ConnectionFailed(format!("{} refused {}", server, call)));
        }
        Ok(())
    }

    fn fail_copies_to(&self, url: &str) {
        self.fail("copy_shards", url);
    }
}

fn checksum(sid: ShardId) -> String {
    format!("checksum-{}", sid)
}

#[async_trait]
impl VolumeAdmin for FakeAdmin {
    async fn allocate_volume(&self, server: &str, vid: VolumeId, _replication: &str) -> Result<()> {
        self.record(format!("allocate {} {}", server, vid));
        Ok(())
    }

    async fn mark_readonly(&self, server: &str, vid: VolumeId) -> Result<u64> {
        self.record(format!("readonly {} {}", server, vid));
        self.check("readonly", server)?;
        Ok(40_000)
    }

    async fn mark_writable(&self, server: &str, vid: VolumeId) -> Result<()> {
        self.record(format!("writable {} {}", server, vid));
        Ok(())
    }

    async fn delete_volume(&self, server: &str, vid: VolumeId) -> Result<()> {
        self.record(format!("delete_volume {} {}", server, vid));
        self.check("delete_volume", server)
    }

    async fn copy_volume(&self, target: &str, vid: VolumeId, source: &str) -> Result<()> {
        self.record(format!("copy_volume {} {} {}", target, vid, source));
        Ok(())
    }

    async fn vacuum_volume(&self, server: &str, vid: VolumeId) -> Result<u64> {
        self.record(format!("vacuum {} {}", server, vid));
        Ok(0)
    }

    async fn verify(&self, _server: &str) -> Result<Vec<VolumeVerifyReport>> {
        Ok(Vec::new())
    }

    async fn generate_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<EcVolumeInfo> {
        self.record(format!("generate {} {}", server, vid));
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let total = data_shards + parity_shards;
        Ok(EcVolumeInfo {
            volume_id: vid,
            data_shards,
            parity_shards,
            dat_size: SHARD_SIZE * data_shards as u64,
            shard_size: SHARD_SIZE,
            shard_checksums: (0..total).map(|i| checksum(i as ShardId)).collect(),
            needle_count: 12,
            replication: "000".to_string(),
        })
    }

    async fn copy_ec_shards(
        &self,
        target: &str,
        vid: VolumeId,
        req: EcCopyRequest,
    ) -> Result<Vec<ShardAck>> {
        self.record(format!("copy_shards {} {} {:?}", target, vid, req.shard_ids));
        self.check("copy_shards", target)?;
        Ok(req
            .shard_ids
            .iter()
            .map(|sid| ShardAck {
                shard_id: *sid,
                checksum: checksum(*sid),
                size: SHARD_SIZE,
            })
            .collect())
    }

    async fn delete_ec_shards(&self, server: &str, vid: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        self.record(format!("delete_shards {} {} {:?}", server, vid, shard_ids));
        Ok(())
    }

    async fn drop_ec_staging(&self, server: &str, vid: VolumeId) -> Result<()> {
        self.record(format!("drop_staging {} {}", server, vid));
        Ok(())
    }

    async fn rebuild_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        req: EcRebuildRequest,
    ) -> Result<Vec<ShardAck>> {
        self.record(format!("rebuild {} {} {:?}", server, vid, req));
        Ok(Vec::new())
    }
}

struct Harness {
    raft: Arc<RaftNode>,
    directory: Arc<Directory>,
    topology: Arc<Topology>,
    admin: Arc<FakeAdmin>,
}

fn server_url(i: usize) -> String {
    format!("http://vs{}:8080", i)
}

fn summary(vid: VolumeId) -> VolumeSummary {
    VolumeSummary {
        id: vid,
        size: 40_000,
        file_count: 12,
        delete_count: 0,
        deleted_bytes: 0,
        read_only: false,
        replication: "000".to_string(),
        compaction_revision: 0,
        max_needle_key: 12,
        modified_at: 0,
    }
}

fn heartbeat(i: usize, racks: usize, sequence: u64, volumes: Vec<VolumeSummary>) -> Heartbeat {
    Heartbeat {
        url: server_url(i),
        public_url: server_url(i),
        data_center: "dc1".into(),
        rack: format!("rack{}", i % racks),
        max_volumes: 8,
        sequence,
        volumes,
        ec_shards: Vec::new(),
    }
}

fn report_servers(topology: &Topology, vid: VolumeId, servers: usize, racks: usize) {
    for i in 0..servers {
        let volumes = if i == 0 { vec![summary(vid)] } else { Vec::new() };
        topology.ingest_heartbeat(&heartbeat(i, racks, 1, volumes));
    }
}

/// One master, one volume on `vs0`, `servers` volume servers spread over
/// `racks` racks.
async fn harness(servers: usize, racks: usize) -> (Harness, VolumeId) {
    let net = MemoryNetwork::new();
    let directory = Arc::new(Directory::new());
    let config = RaftConfig {
        id: "m1".into(),
        url: "http://m1".into(),
        peers: Vec::new(),
        election_timeout: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(20),
        propose_timeout: Duration::from_secs(1),
        snapshot_threshold: 0,
    };
    let raft = RaftNode::new(config, directory.clone(), net.transport("m1"), None).unwrap();
    net.register(&raft);
    raft.start();
    for _ in 0..200 {
        if raft.is_ready_leader() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(raft.is_ready_leader(), "single master never became leader");

    let applied = Command::AllocateVolume {
        replication: "000".into(),
    }
    .propose(&raft)
    .await
    .unwrap();
    let vid: VolumeId = bincode::deserialize(&applied).unwrap();

    let topology = Arc::new(Topology::new(1 << 30));
    report_servers(&topology, vid, servers, racks);

    let harness = Harness {
        raft,
        directory,
        topology,
        admin: Arc::new(FakeAdmin::default()),
    };
    (harness, vid)
}

fn runner(h: &Harness, fault_domain: FaultDomain) -> EcJobRunner {
    runner_on(h.raft.clone(), h.directory.clone(), h, fault_domain)
}

fn runner_on(
    raft: Arc<RaftNode>,
    directory: Arc<Directory>,
    h: &Harness,
    fault_domain: FaultDomain,
) -> EcJobRunner {
    EcJobRunner::new(
        raft,
        directory,
        h.topology.clone(),
        h.admin.clone(),
        EcConfig {
            fault_domain,
            shard_retry_attempts: 2,
            retry_backoff_ms: 1,
            ..EcConfig::default()
        },
    )
}

#[tokio::test]
async fn conversion_places_every_shard_on_its_own_rack() {
    let (h, vid) = harness(14, 14).await;
    let report = runner(&h, FaultDomain::Rack).encode_volume(vid).await.unwrap();

    assert_eq!(report.source, server_url(0));
    assert_eq!(report.placement.len(), 14);
    assert!(report.source_deleted);
    let distinct: BTreeSet<&String> = report.placement.values().collect();
    assert_eq!(distinct.len(), 14);

    let record = h.directory.get(vid).unwrap();
    assert_eq!(record.state, VolumeLifecycle::SourceDeleted);
    let ec = record.ec.unwrap();
    assert_eq!(ec.total_shards(), 14);
    assert_eq!(ec.placement.len(), 14);
    assert_eq!(ec.info.unwrap().shard_size, SHARD_SIZE);
    assert!(!h.directory.is_assignable(vid));

    assert_eq!(h.admin.called("readonly").len(), 1);
    assert_eq!(h.admin.called("generate").len(), 1);
    assert_eq!(
        h.admin.called("delete_volume"),
        vec![format!("delete_volume {} {}", server_url(0), vid)]
    );
    assert!(h.admin.called("delete_shards").is_empty());
    assert!(h.admin.called("writable").is_empty());
}

#[tokio::test]
async fn failed_copy_rolls_back() {
    let (h, vid) = harness(14, 14).await;
    h.admin.fail_copies_to(&server_url(5));

    let err = runner(&h, FaultDomain::Rack)
        .encode_volume(vid)
        .await
        .unwrap_err();
    match err {
        Error::PartialShardFailure { volume_id, failed, .. } => {
            assert_eq!(volume_id, vid);
            assert_eq!(failed.len(), 1);
        }
        other => panic!("unexpected error: {}", other),
    }

    // retried before giving up
    let attempts = h
        .admin
        .called(&format!("copy_shards {}", server_url(5)))
        .len();
    assert_eq!(attempts, 2);

    // every destination cleaned up, source back to writable
    assert_eq!(h.admin.called("delete_shards").len(), 14);
    assert_eq!(h.admin.called("drop_staging").len(), 1);
    assert_eq!(
        h.admin.called("writable"),
        vec![format!("writable {} {}", server_url(0), vid)]
    );
    assert!(h.admin.called("delete_volume").is_empty());

    let record = h.directory.get(vid).unwrap();
    assert_eq!(record.state, VolumeLifecycle::Writable);
    assert!(record.ec.is_none());
    assert!(h.directory.is_assignable(vid));
}

#[tokio::test]
async fn too_few_racks_is_rejected_before_any_change() {
    let (h, vid) = harness(6, 6).await;
    let before = h.directory.get(vid).unwrap();

    let err = runner(&h, FaultDomain::Rack)
        .encode_volume(vid)
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::PlacementInfeasible { needed: 14, available: 6 }),
        "unexpected error: {}",
        err
    );
    assert_eq!(h.directory.get(vid).unwrap(), before);
    assert!(h.admin.called("readonly").is_empty());
    assert!(h.admin.called("generate").is_empty());
}

#[tokio::test]
async fn any_domain_co_locates_on_few_racks() {
    let (h, vid) = harness(6, 6).await;
    let report = runner(&h, FaultDomain::Any).encode_volume(vid).await.unwrap();

    assert_eq!(report.placement.len(), 14);
    let mut per_server = std::collections::BTreeMap::new();
    for url in report.placement.values() {
        *per_server.entry(url.clone()).or_insert(0usize) += 1;
    }
    assert_eq!(per_server.len(), 6);
    assert!(per_server.values().all(|n| (2..=3).contains(n)));
    assert_eq!(
        h.directory.lifecycle(vid),
        Some(VolumeLifecycle::SourceDeleted)
    );
}

#[tokio::test]
async fn second_job_for_same_volume_is_refused() {
    let (h, vid) = harness(14, 14).await;
    let gate = Arc::new(Notify::new());
    *h.admin.gate.lock() = Some(gate.clone());
    let runner = Arc::new(runner(&h, FaultDomain::Rack));

    let job = tokio::spawn({
        let runner = runner.clone();
        async move { runner.encode_volume(vid).await }
    });
    wait_for_call(&h.admin, "generate").await;

    assert_eq!(runner.running_jobs(), vec![vid]);
    let err = runner.encode_volume(vid).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)), "unexpected error: {}", err);

    gate.notify_one();
    job.await.unwrap().unwrap();
    assert!(runner.running_jobs().is_empty());
}

#[tokio::test]
async fn cancelled_job_rolls_back() {
    let (h, vid) = harness(14, 14).await;
    let gate = Arc::new(Notify::new());
    *h.admin.gate.lock() = Some(gate.clone());
    let runner = Arc::new(runner(&h, FaultDomain::Rack));

    let job = tokio::spawn({
        let runner = runner.clone();
        async move { runner.encode_volume(vid).await }
    });
    wait_for_call(&h.admin, "generate").await;

    assert!(runner.cancel(vid));
    gate.notify_one();
    let err = job.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "unexpected error: {}", err);

    assert!(h.admin.called("copy_shards").is_empty());
    assert_eq!(h.admin.called("drop_staging").len(), 1);
    assert_eq!(h.admin.called("writable").len(), 1);
    assert_eq!(h.directory.lifecycle(vid), Some(VolumeLifecycle::Writable));
    assert!(!runner.cancel(vid));
}

#[tokio::test]
async fn failed_retirement_keeps_shards_and_is_retried() {
    let (h, vid) = harness(14, 14).await;
    let source = server_url(0);
    h.admin.fail("delete_volume", &source);
    let runner = runner(&h, FaultDomain::Rack);

    let report = runner.encode_volume(vid).await.unwrap();
    assert!(!report.source_deleted);
    assert_eq!(h.directory.lifecycle(vid), Some(VolumeLifecycle::EcEncoded));
    assert!(h.admin.called("delete_shards").is_empty());
    assert!(h.admin.called("writable").is_empty());

    // still unreachable: nothing recorded
    assert_eq!(runner.reconcile(vid).await.unwrap(), Reconciled::RetirePending);
    assert_eq!(h.directory.lifecycle(vid), Some(VolumeLifecycle::EcEncoded));

    h.admin.heal("delete_volume", &source);
    assert_eq!(runner.reconcile(vid).await.unwrap(), Reconciled::Retired);
    assert_eq!(h.directory.lifecycle(vid), Some(VolumeLifecycle::SourceDeleted));
    assert_eq!(h.admin.called("delete_volume").len(), 3);
    assert!(h.topology.volume_replicas(vid).is_empty());
    assert!(h.admin.called("delete_shards").is_empty());

    // the old holder comes back with its copy
    h.topology.ingest_heartbeat(&heartbeat(0, 14, 2, vec![summary(vid)]));
    assert_eq!(runner.reconcile(vid).await.unwrap(), Reconciled::Retired);
    assert_eq!(h.admin.called("delete_volume").len(), 4);
    assert_eq!(h.directory.lifecycle(vid), Some(VolumeLifecycle::SourceDeleted));
    assert_eq!(runner.reconcile(vid).await.unwrap(), Reconciled::Untouched);
}

/// `vs0` alive and `vs1` suspect, both holding the volume, over 15 racks.
async fn suspect_replica_harness() -> (Harness, VolumeId) {
    let (h, vid) = harness(15, 15).await;
    h.topology
        .ingest_heartbeat(&heartbeat(1, 15, 2, vec![summary(vid)]));
    h.topology.check_liveness(
        Instant::now() + Duration::from_secs(5),
        Duration::from_secs(1),
        2,
        1_000,
    );
    for i in (0..15).filter(|i| *i != 1) {
        let volumes = if i == 0 { vec![summary(vid)] } else { Vec::new() };
        h.topology.ingest_heartbeat(&heartbeat(i, 15, 3, volumes));
    }
    assert_eq!(h.topology.node_state(&server_url(1)), Some(NodeState::Suspect));
    (h, vid)
}

#[tokio::test]
async fn suspect_replica_is_quiesced_and_retired() {
    let (h, vid) = suspect_replica_harness().await;
    let report = runner(&h, FaultDomain::Rack).encode_volume(vid).await.unwrap();

    assert_eq!(report.source, server_url(0));
    assert!(report.source_deleted);
    assert!(!report.placement.values().any(|url| *url == server_url(1)));
    let quiesced: BTreeSet<String> = h.admin.called("readonly").into_iter().collect();
    assert_eq!(
        quiesced,
        BTreeSet::from([
            format!("readonly {} {}", server_url(0), vid),
            format!("readonly {} {}", server_url(1), vid),
        ])
    );
    assert_eq!(h.admin.called("delete_volume").len(), 2);
}

#[tokio::test]
async fn unreachable_replica_aborts_before_encoding() {
    let (h, vid) = suspect_replica_harness().await;
    h.admin.fail("readonly", &server_url(1));

    let err = runner(&h, FaultDomain::Rack)
        .encode_volume(vid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed(_)), "unexpected error: {}", err);
    assert!(h.admin.called("generate").is_empty());
    assert!(h.admin.called("copy_shards").is_empty());
    assert_eq!(h.admin.called("writable").len(), 2);
    assert_eq!(h.directory.lifecycle(vid), Some(VolumeLifecycle::Writable));
    assert!(h.directory.is_assignable(vid));
}

const MASTERS: [&str; 3] = ["m1", "m2", "m3"];

fn master_config(id: &str) -> RaftConfig {
    RaftConfig {
        id: id.into(),
        url: format!("http://{}", id),
        peers: MASTERS
            .iter()
            .filter(|p| **p != id)
            .map(|p| PeerConfig {
                id: p.to_string(),
                url: format!("http://{}", p),
            })
            .collect(),
        election_timeout: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(30),
        propose_timeout: Duration::from_millis(500),
        snapshot_threshold: 0,
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn unknown_commit_outcome_is_reconciled_not_rolled_back() {
    let net = MemoryNetwork::new();
    let mut nodes = Vec::new();
    let mut directories = Vec::new();
    for id in MASTERS {
        let directory = Arc::new(Directory::new());
        let node = RaftNode::new(master_config(id), directory.clone(), net.transport(id), None).unwrap();
        net.register(&node);
        node.start();
        nodes.push(node);
        directories.push(directory);
    }
    let mut leader = 0;
    wait_until("a ready leader", || {
        match nodes.iter().position(|n| n.is_ready_leader()) {
            Some(i) => {
                leader = i;
                true
            }
            None => false,
        }
    })
    .await;

    let applied = Command::AllocateVolume {
        replication: "000".into(),
    }
    .propose(&nodes[leader])
    .await
    .unwrap();
    let vid: VolumeId = bincode::deserialize(&applied).unwrap();
    let topology = Arc::new(Topology::new(1 << 30));
    report_servers(&topology, vid, 14, 14);
    let h = Harness {
        raft: nodes[leader].clone(),
        directory: directories[leader].clone(),
        topology,
        admin: Arc::new(FakeAdmin::default()),
    };

    let gate = Arc::new(Notify::new());
    *h.admin.gate.lock() = Some(gate.clone());
    let runner = Arc::new(runner(&h, FaultDomain::Rack));
    let job = tokio::spawn({
        let runner = runner.clone();
        async move { runner.encode_volume(vid).await }
    });
    wait_for_call(&h.admin, "generate").await;

    // the shard map cannot reach a quorum
    net.isolate(MASTERS[leader]);
    gate.notify_one();
    let err = job.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            Error::ConsensusTimeout | Error::LeaderUnavailable | Error::NotLeader(_)
        ),
        "unexpected error: {}",
        err
    );
    assert_eq!(h.admin.called("copy_shards").len(), 14);
    assert!(h.admin.called("delete_shards").is_empty());
    assert!(h.admin.called("drop_staging").is_empty());
    assert!(h.admin.called("writable").is_empty());
    assert!(h.admin.called("delete_volume").is_empty());

    net.heal(MASTERS[leader]);
    let mut next = 0;
    wait_until("a new leader", || {
        if nodes[leader].is_leader() {
            return false;
        }
        match nodes.iter().position(|n| n.is_ready_leader()) {
            Some(i) => {
                next = i;
                true
            }
            None => false,
        }
    })
    .await;

    let settler = runner_on(
        nodes[next].clone(),
        directories[next].clone(),
        &h,
        FaultDomain::Rack,
    );
    match settler.reconcile(vid).await.unwrap() {
        Reconciled::RolledBack => {
            assert_eq!(directories[next].lifecycle(vid), Some(VolumeLifecycle::Writable));
            assert_eq!(h.admin.called("delete_shards").len(), 14);
            assert_eq!(h.admin.called("writable").len(), 1);
            assert!(h.admin.called("delete_volume").is_empty());
        }
        Reconciled::Retired => {
            assert_eq!(
                directories[next].lifecycle(vid),
                Some(VolumeLifecycle::SourceDeleted)
            );
            assert!(h.admin.called("delete_shards").is_empty());
            assert!(h.admin.called("writable").is_empty());
        }
        other => panic!("unexpected reconciliation: {:?}", other),
    }

    for node in &nodes {
        node.stop();
    }
}

async fn wait_for_call(admin: &FakeAdmin, prefix: &str) {
    for _ in 0..200 {
        if !admin.called(prefix).is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} was never called", prefix);
}
