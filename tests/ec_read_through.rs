//! Degraded reads of an EC volume spread over six servers

use async_trait::async_trait;
use miniweed::common::{Error, Result, ShardId, SyncPolicy, VolumeId};
use miniweed::ec::layout::{ecx_file_name, encode_volume, shard_file_name, vif_file_name};
use miniweed::ec::{ReedSolomon, ShardReader};
use miniweed::master::placement::ReplicaPlacement;
use miniweed::volume::ec_volume::EcVolume;
use miniweed::volume::needle::Needle;
use miniweed::volume::volume::Volume;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use parking_lot::RwLock;
use tempfile::TempDir;

const VID: VolumeId = 9;
const COOKIE: u32 = 0x0bad_cafe;

/// Shards per server; losing any two servers costs at most four shards
/// unless one of them is server 0 or 1.
const LAYOUT: [&[ShardId]; 6] = [&[0, 1, 2], &[3, 4, 5], &[6, 7], &[8, 9], &[10, 11], &[12, 13]];

struct Cluster {
    servers: Vec<Arc<EcVolume>>,
    down: RwLock<HashSet<usize>>,
}

#[async_trait]
impl ShardReader for Cluster {
    async fn read_shard(
        &self,
        volume_id: VolumeId,
        shard_id: ShardId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        let down = self.down.read().clone();
        for (i, server) in self.servers.iter().enumerate() {
            if down.contains(&i) || server.id() != volume_id {
                continue;
            }
            if let Some(bytes) = server.read_local(shard_id, offset, size)? {
                return Ok(bytes);
            }
        }
        Err(Error::ConnectionFailed(format!("no live holder of shard {}", shard_id)))
    }
}

fn build_cluster(root: &Path) -> (Arc<Cluster>, Vec<(u64, Vec<u8>)>) {
    let source = root.join("source");
    let volume = Volume::create(&source, VID, ReplicaPlacement::default(), 64 << 20, SyncPolicy::Never).unwrap();
    let mut written = Vec::new();
    for key in 1..=120u64 {
        let data: Vec<u8> = (0..(key as usize * 211) % 9000 + 10)
            .map(|i| (i as u64 * 7 + key) as u8)
            .collect();
        volume.write(&Needle::new(key, COOKIE, data.clone())).unwrap();
        written.push((key, data));
    }
    volume.mark_readonly().unwrap();
    let rs = ReedSolomon::new(10, 4).unwrap();
    encode_volume(&volume.dat_path(), &source, VID, "000", &volume.ecx_entries(), &rs).unwrap();

    let mut servers = Vec::new();
    for (i, shards) in LAYOUT.iter().enumerate() {
        let dir = root.join(format!("server{}", i));
        fs::create_dir_all(&dir).unwrap();
        for name in [ecx_file_name(VID), vif_file_name(VID)] {
            fs::copy(source.join(&name), dir.join(&name)).unwrap();
        }
        for &shard in shards.iter() {
            let name = shard_file_name(VID, shard);
            fs::copy(source.join(&name), dir.join(&name)).unwrap();
        }
        let ec = EcVolume::open(&dir, VID).unwrap();
        assert_eq!(ec.shard_ids(), shards.to_vec());
        servers.push(Arc::new(ec));
    }
    let cluster = Cluster {
        servers,
        down: RwLock::new(HashSet::new()),
    };
    (Arc::new(cluster), written)
}

#[tokio::test]
async fn reads_survive_two_servers_down() {
    let root = TempDir::new().unwrap();
    let (cluster, written) = build_cluster(root.path());
    // Server 4 only holds parity, so every read goes remote
    let reader = cluster.servers[4].clone();

    for (key, data) in &written {
        let needle = reader.read_needle(*key, COOKIE, cluster.as_ref()).await.unwrap();
        assert_eq!(&needle.data, data);
    }

    cluster.down.write().extend([2, 3]);
    for (key, data) in &written {
        let needle = reader.read_needle(*key, COOKIE, cluster.as_ref()).await.unwrap();
        assert_eq!(&needle.data, data, "needle {} after losing shards 6..=9", key);
    }
}

#[tokio::test]
async fn reads_fail_past_parity_budget() {
    let root = TempDir::new().unwrap();
    let (cluster, written) = build_cluster(root.path());
    let reader = cluster.servers[5].clone();

    // Six shards gone: anything not on the survivors is unrecoverable
    cluster.down.write().extend([0, 1]);
    let mut failures = 0;
    for (key, _) in &written {
        match reader.read_needle(*key, COOKIE, cluster.as_ref()).await {
            Ok(_) => {}
            Err(Error::InsufficientShards { .. }) => failures += 1,
            Err(e) => panic!("unexpected error for needle {}: {}", key, e),
        }
    }
    assert!(failures > 0);
}

#[tokio::test]
async fn wrong_cookie_is_not_found() {
    let root = TempDir::new().unwrap();
    let (cluster, written) = build_cluster(root.path());
    let reader = cluster.servers[0].clone();
    let key = written[0].0;
    assert!(matches!(
        reader.read_needle(key, COOKIE ^ 1, cluster.as_ref()).await,
        Err(Error::NotFound(_))
    ));
}
