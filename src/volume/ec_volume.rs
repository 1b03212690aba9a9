//! Erasure-coded volume as mounted on a volume server
//!
//! A server holds some of a volume's shards plus the `.ecx` index, `.vif`
//! info and `.ecj` delete journal. Needle reads map the record onto shard
//! intervals, serve what is local, fetch the rest from other holders and
//! reconstruct any interval whose shard cannot be reached.

use crate::common::{
    Cookie, EcVolumeInfo, Error, NeedleKey, Result, ShardId, VolumeId,
};
use crate::ec::layout::{
    ecj_file_name, ecx_file_name, parse_shard_file_name, read_ecx, read_vif, shard_file_name,
    vif_file_name, EcLayout, EcxEntry, Interval,
};
use crate::ec::{ReedSolomon, ShardReader};
use crate::volume::needle::{record_len, Needle};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct EcVolume {
    info: EcVolumeInfo,
    dir: PathBuf,
    layout: EcLayout,
    codec: ReedSolomon,
    index: HashMap<NeedleKey, EcxEntry>,
    shards: RwLock<BTreeMap<ShardId, Arc<File>>>,
    deleted: RwLock<HashSet<NeedleKey>>,
    journal: Mutex<File>,
}

impl EcVolume {
    /// Mount whatever shards of `volume_id` exist in `dir`.
    pub fn open(dir: &Path, volume_id: VolumeId) -> Result<Self> {
        let info = read_vif(&dir.join(vif_file_name(volume_id)))?;
        let codec = ReedSolomon::new(info.data_shards, info.parity_shards)?;
        let index = read_ecx(&dir.join(ecx_file_name(volume_id)))?
            .into_iter()
            .map(|e| (e.key, e))
            .collect();

        let journal_path = dir.join(ecj_file_name(volume_id));
        let mut deleted = HashSet::new();
        if journal_path.exists() {
            let mut bytes = Vec::new();
            File::open(&journal_path)?.read_to_end(&mut bytes)?;
            for chunk in bytes.chunks_exact(8) {
                let mut key = [0u8; 8];
                key.copy_from_slice(chunk);
                deleted.insert(u64::from_le_bytes(key));
            }
        }
        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        let mut shards = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((vid, shard_id)) = name.to_str().and_then(parse_shard_file_name) {
                if vid == volume_id && (shard_id as usize) < info.total_shards() {
                    shards.insert(shard_id, Arc::new(File::open(entry.path())?));
                }
            }
        }

        tracing::info!(
            "Mounted EC volume {} with shards {:?}",
            volume_id,
            shards.keys().collect::<Vec<_>>()
        );
        Ok(Self {
            layout: EcLayout::new(&info),
            info,
            dir: dir.to_path_buf(),
            codec,
            index,
            shards: RwLock::new(shards),
            deleted: RwLock::new(deleted),
            journal: Mutex::new(journal),
        })
    }

    pub fn id(&self) -> VolumeId {
        self.info.volume_id
    }

    pub fn info(&self) -> &EcVolumeInfo {
        &self.info
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.read().keys().copied().collect()
    }

    pub fn has_shard(&self, shard_id: ShardId) -> bool {
        self.shards.read().contains_key(&shard_id)
    }

    pub fn mount_shard(&self, shard_id: ShardId) -> Result<()> {
        if shard_id as usize >= self.info.total_shards() {
            return Err(Error::InvalidArgument(format!(
                "volume {} has no shard {}",
                self.id(),
                shard_id
            )));
        }
        let file = File::open(self.dir.join(shard_file_name(self.id(), shard_id)))?;
        self.shards.write().insert(shard_id, Arc::new(file));
        Ok(())
    }

    /// Unmount and delete a shard file. Returns the shards still mounted.
    pub fn remove_shard(&self, shard_id: ShardId) -> Result<usize> {
        let mut shards = self.shards.write();
        if shards.remove(&shard_id).is_some() {
            match fs::remove_file(self.dir.join(shard_file_name(self.id(), shard_id))) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(shards.len())
    }

    /// Remove index, info and journal once no shard is left.
    pub fn destroy(&self) -> Result<()> {
        let ids = self.shard_ids();
        for id in ids {
            self.remove_shard(id)?;
        }
        for name in [
            ecx_file_name(self.id()),
            vif_file_name(self.id()),
            ecj_file_name(self.id()),
        ] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("Removed EC volume {} from {:?}", self.id(), self.dir);
        Ok(())
    }

    /// Range of a locally mounted shard, `None` when the shard is not here.
    pub fn read_local(&self, shard_id: ShardId, offset: u64, size: u64) -> Result<Option<Vec<u8>>> {
        let file = match self.shards.read().get(&shard_id) {
            Some(file) => file.clone(),
            None => return Ok(None),
        };
        if offset.saturating_add(size) > self.info.shard_size {
            return Err(Error::InvalidArgument(format!(
                "range {}+{} outside shard of {} bytes",
                offset, size, self.info.shard_size
            )));
        }
        let mut buf = vec![0u8; size as usize];
        file.read_exact_at(&mut buf, offset).map_err(|e| {
            Error::Corrupt(format!(
                "shard {} of volume {} unreadable at {}: {}",
                shard_id,
                self.id(),
                offset,
                e
            ))
        })?;
        Ok(Some(buf))
    }

    /// Where a live needle sits in the shards
    pub fn locate_needle(&self, key: NeedleKey) -> Result<(EcxEntry, Vec<Interval>)> {
        let entry = self
            .index
            .get(&key)
            .copied()
            .filter(|_| !self.deleted.read().contains(&key))
            .ok_or_else(|| Error::NotFound(format!("needle {:x} in EC volume {}", key, self.id())))?;
        let intervals = self.layout.locate(entry.offset, record_len(entry.size))?;
        Ok((entry, intervals))
    }

    pub fn contains(&self, key: NeedleKey) -> bool {
        self.locate_needle(key).is_ok()
    }

    /// Journal a delete. Encoded shards are immutable, so the needle is
    /// only hidden.
    pub fn mark_deleted(&self, key: NeedleKey) -> Result<()> {
        if !self.index.contains_key(&key) {
            return Err(Error::NotFound(format!("needle {:x} in EC volume {}", key, self.id())));
        }
        let mut journal = self.journal.lock();
        if self.deleted.read().contains(&key) {
            return Ok(());
        }
        journal.write_all(&key.to_le_bytes())?;
        journal.sync_data()?;
        self.deleted.write().insert(key);
        Ok(())
    }

    pub fn live_needles(&self) -> usize {
        let deleted = self.deleted.read();
        self.index.keys().filter(|k| !deleted.contains(k)).count()
    }

    pub async fn read_needle(
        &self,
        key: NeedleKey,
        cookie: Cookie,
        remote: &dyn ShardReader,
    ) -> Result<Needle> {
        let (entry, intervals) = self.locate_needle(key)?;
        let mut record = Vec::with_capacity(record_len(entry.size) as usize);
        for interval in intervals {
            record.extend(self.read_interval(interval, remote).await?);
        }
        let needle = Needle::parse_expected(&record, key, entry.size)?;
        if needle.cookie != cookie {
            return Err(Error::NotFound(format!(
                "needle {:x} in EC volume {}: cookie mismatch",
                key,
                self.id()
            )));
        }
        Ok(needle)
    }

    async fn read_interval(&self, interval: Interval, remote: &dyn ShardReader) -> Result<Vec<u8>> {
        if let Some(bytes) = self.read_local(interval.shard_id, interval.offset, interval.size)? {
            return Ok(bytes);
        }
        match remote
            .read_shard(self.id(), interval.shard_id, interval.offset, interval.size)
            .await
        {
            Ok(bytes) if bytes.len() as u64 == interval.size => return Ok(bytes),
            Ok(bytes) => tracing::warn!(
                "Shard {} of volume {} returned {} bytes, wanted {}",
                interval.shard_id,
                self.id(),
                bytes.len(),
                interval.size
            ),
            Err(e) => tracing::warn!(
                "Shard {} of volume {} unreachable, reconstructing: {}",
                interval.shard_id,
                self.id(),
                e
            ),
        }
        self.recover_interval(interval, remote).await
    }

    /// Rebuild one interval from the same range of any N other shards.
    pub async fn recover_interval(
        &self,
        interval: Interval,
        remote: &dyn ShardReader,
    ) -> Result<Vec<u8>> {
        let needed = self.info.data_shards;
        let mut available: Vec<(usize, Vec<u8>)> = Vec::with_capacity(needed);

        let local = self.shard_ids();
        for &shard_id in &local {
            if available.len() == needed {
                break;
            }
            if shard_id == interval.shard_id {
                continue;
            }
            if let Some(bytes) = self.read_local(shard_id, interval.offset, interval.size)? {
                available.push((shard_id as usize, bytes));
            }
        }

        for shard_id in 0..self.info.total_shards() as ShardId {
            if available.len() == needed {
                break;
            }
            if shard_id == interval.shard_id || local.contains(&shard_id) {
                continue;
            }
            match remote
                .read_shard(self.id(), shard_id, interval.offset, interval.size)
                .await
            {
                Ok(bytes) if bytes.len() as u64 == interval.size => {
                    available.push((shard_id as usize, bytes));
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(
                    "Shard {} of volume {} unavailable for recovery: {}",
                    shard_id,
                    self.id(),
                    e
                ),
            }
        }

        if available.len() < needed {
            return Err(Error::InsufficientShards {
                needed,
                available: available.len(),
            });
        }
        let refs: Vec<(usize, &[u8])> = available
            .iter()
            .map(|(id, bytes)| (*id, bytes.as_slice()))
            .collect();
        self.codec.recover_shard(&refs, interval.shard_id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::layout::encode_volume;
    use crate::master::placement::ReplicaPlacement;
    use crate::common::SyncPolicy;
    use crate::volume::volume::Volume;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct NoRemote;

    #[async_trait]
    impl ShardReader for NoRemote {
        async fn read_shard(&self, _: VolumeId, shard_id: ShardId, _: u64, _: u64) -> Result<Vec<u8>> {
            Err(Error::NotFound(format!("shard {}", shard_id)))
        }
    }

    fn encoded_volume(dir: &Path) -> Vec<(NeedleKey, Vec<u8>)> {
        let volume = Volume::create(dir, 5, ReplicaPlacement::default(), 1 << 20, SyncPolicy::Never).unwrap();
        let mut written = Vec::new();
        for key in 1..40u64 {
            let data: Vec<u8> = (0..(key * 37) as usize).map(|i| (i as u64 ^ key) as u8).collect();
            volume.write(&Needle::new(key, 0x1234, data.clone())).unwrap();
            written.push((key, data));
        }
        volume.mark_readonly().unwrap();
        let rs = ReedSolomon::new(4, 2).unwrap();
        encode_volume(&volume.dat_path(), dir, 5, "000", &volume.ecx_entries(), &rs).unwrap();
        volume.destroy().unwrap();
        written
    }

    #[tokio::test]
    async fn test_read_with_all_shards_local() {
        let dir = tempdir().unwrap();
        let written = encoded_volume(dir.path());
        let ec = EcVolume::open(dir.path(), 5).unwrap();
        assert_eq!(ec.shard_ids().len(), 6);
        for (key, data) in &written {
            let needle = ec.read_needle(*key, 0x1234, &NoRemote).await.unwrap();
            assert_eq!(&needle.data, data);
        }
    }

    #[tokio::test]
    async fn test_read_reconstructs_missing_shards() {
        let dir = tempdir().unwrap();
        let written = encoded_volume(dir.path());
        let ec = EcVolume::open(dir.path(), 5).unwrap();
        ec.remove_shard(0).unwrap();
        ec.remove_shard(2).unwrap();
        for (key, data) in &written {
            let needle = ec.read_needle(*key, 0x1234, &NoRemote).await.unwrap();
            assert_eq!(&needle.data, data);
        }

        ec.remove_shard(3).unwrap();
        let (_, intervals) = ec.locate_needle(written[0].0).unwrap();
        if intervals.iter().any(|i| [0, 2, 3].contains(&i.shard_id)) {
            assert!(matches!(
                ec.read_needle(written[0].0, 0x1234, &NoRemote).await,
                Err(Error::InsufficientShards { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_delete_journal_survives_remount() {
        let dir = tempdir().unwrap();
        let written = encoded_volume(dir.path());
        {
            let ec = EcVolume::open(dir.path(), 5).unwrap();
            ec.mark_deleted(written[3].0).unwrap();
            assert!(ec.read_needle(written[3].0, 0x1234, &NoRemote).await.is_err());
        }
        let ec = EcVolume::open(dir.path(), 5).unwrap();
        assert!(!ec.contains(written[3].0));
        assert_eq!(ec.live_needles(), written.len() - 1);
        assert!(matches!(
            ec.read_needle(written[4].0, 0x9999, &NoRemote).await,
            Err(Error::NotFound(_))
        ));
    }
}
