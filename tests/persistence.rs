//! State that must survive a process restart: volumes, EC shards and filer
//! metadata

use async_trait::async_trait;
use miniweed::common::{Error, FileId, Result, ShardId, VolumeConfig, VolumeId};
use miniweed::ec::ShardReader;
use miniweed::filer::{Filer, FilerStore, MemoryBlobs, MemoryStore, WriteMode};
use miniweed::master::placement::ReplicaPlacement;
use miniweed::volume::Store;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const LIMIT: u64 = 8 << 20;

fn config(dir: &Path) -> VolumeConfig {
    VolumeConfig {
        data_dirs: vec![dir.to_path_buf()],
        max_volumes: 4,
        ..Default::default()
    }
}

struct NoRemote;

#[async_trait]
impl ShardReader for NoRemote {
    async fn read_shard(&self, volume_id: VolumeId, shard_id: ShardId, _: u64, _: u64) -> Result<Vec<u8>> {
        Err(Error::NotFound(format!("shard {} of volume {}", shard_id, volume_id)))
    }
}

#[test]
fn volume_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let fids: Vec<FileId> = (1..=20u64).map(|key| FileId::new(4, key, 0xfeed)).collect();
    {
        let store = Store::open(&config(dir.path()), LIMIT).unwrap();
        store.allocate_volume(4, ReplicaPlacement::default()).unwrap();
        for (i, fid) in fids.iter().enumerate() {
            store.write_needle(fid, vec![i as u8; 500]).unwrap();
        }
        store.checkpoint_all().unwrap();
        // after the checkpoint: recovered by scanning the tail
        store.delete_needle(&fids[0]).unwrap();
        store.write_needle(&FileId::new(4, 99, 0xfeed), b"tail".to_vec()).unwrap();
        store.mark_readonly(4).unwrap();
    }

    let store = Store::open(&config(dir.path()), LIMIT).unwrap();
    assert_eq!(store.volume_ids(), vec![4]);
    let volume = store.get_volume(4).unwrap();
    assert!(volume.is_read_only());
    assert_eq!(volume.file_count(), 20);
    assert!(matches!(store.read_needle(&fids[0]), Err(Error::NotFound(_))));
    assert_eq!(store.read_needle(&fids[7]).unwrap().data, vec![7u8; 500]);
    assert_eq!(
        store.read_needle(&FileId::new(4, 99, 0xfeed)).unwrap().data,
        b"tail"
    );
    assert!(store.verify_volume(4).unwrap().corrupt_keys.is_empty());
    assert!(store.heartbeat().volumes[0].read_only);
}

#[test]
fn vacuumed_volume_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(&config(dir.path()), LIMIT).unwrap();
        store.allocate_volume(2, ReplicaPlacement::default()).unwrap();
        for key in 1..=10u64 {
            store.write_needle(&FileId::new(2, key, 1), vec![key as u8; 1000]).unwrap();
        }
        for key in 1..=5u64 {
            store.delete_needle(&FileId::new(2, key, 1)).unwrap();
        }
        let reclaimed = store.compact_volume(2).unwrap();
        assert!(reclaimed >= 5000);
    }

    let store = Store::open(&config(dir.path()), LIMIT).unwrap();
    let volume = store.get_volume(2).unwrap();
    assert_eq!(volume.compaction_revision(), 1);
    assert_eq!(volume.file_count(), 5);
    assert_eq!(volume.garbage_ratio(), 0.0);
    for key in 6..=10u64 {
        assert_eq!(
            store.read_needle(&FileId::new(2, key, 1)).unwrap().data,
            vec![key as u8; 1000]
        );
    }
}

#[tokio::test]
async fn ec_shards_are_remounted_with_their_delete_journal() {
    let dir = TempDir::new().unwrap();
    let source = Store::open(&config(&dir.path().join("src")), LIMIT).unwrap();
    source.allocate_volume(9, ReplicaPlacement::default()).unwrap();
    for key in 1..=30u64 {
        source
            .write_needle(&FileId::new(9, key, 7), vec![key as u8; 777])
            .unwrap();
    }
    source.mark_readonly(9).unwrap();
    let info = source.generate_ec_shards(9, 4, 2).unwrap();

    let target_dir = dir.path().join("dst");
    {
        let target = Store::open(&config(&target_dir), LIMIT).unwrap();
        let mut files = vec![
            ("9.ecx".to_string(), Vec::new()),
            ("9.vif".to_string(), Vec::new()),
        ];
        for sid in 0..info.total_shards() {
            files.push((format!("9.ec{:02}", sid), Vec::new()));
        }
        for (name, bytes) in files.iter_mut() {
            *bytes = fs::read(source.ec_file_path(9, name).unwrap()).unwrap();
        }
        let acks = target.install_ec_files(9, files).unwrap();
        assert_eq!(acks.len(), 6);

        target.delete_needle(&FileId::new(9, 3, 7)).unwrap();
    }

    let target = Store::open(&config(&target_dir), LIMIT).unwrap();
    let ec = target.ec_volume(9).expect("EC volume remounted");
    assert_eq!(ec.shard_ids(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(ec.live_needles(), 29);
    assert!(matches!(
        ec.read_needle(3, 7, &NoRemote).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(
        ec.read_needle(17, 7, &NoRemote).await.unwrap().data,
        vec![17u8; 777]
    );
    assert_eq!(target.heartbeat().ec_shards[0].shard_ids.len(), 6);
}

#[tokio::test]
async fn filer_namespace_survives_restart() {
    let dir = TempDir::new().unwrap();
    let blobs = Arc::new(MemoryBlobs::new());
    {
        let store = Arc::new(MemoryStore::open(dir.path()).unwrap());
        let filer = Filer::new(store.clone(), blobs.clone(), 8, None);
        filer
            .write_file("/reports/2024/q1.csv", b"a,b,c\n1,2,3\n".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();
        filer
            .write_file("/reports/2024/q1.csv", b"4,5,6\n".to_vec(), WriteMode::Append, None)
            .await
            .unwrap();
        filer.mkdir("/empty").unwrap();
        filer.rename("/reports/2024", "/reports/archive").unwrap();
        store.flush().unwrap();
    }

    let store = Arc::new(MemoryStore::open(dir.path()).unwrap());
    let filer = Filer::new(store, blobs, 8, None);
    assert!(filer.find_entry("/reports/2024").is_err());
    assert!(filer.find_entry("/empty").unwrap().is_directory);
    let entry = filer.find_entry("/reports/archive/q1.csv").unwrap();
    assert_eq!(entry.size(), 18);
    assert_eq!(
        filer
            .read_file("/reports/archive/q1.csv", 0, None)
            .await
            .unwrap(),
        b"a,b,c\n1,2,3\n4,5,6\n"
    );
}
