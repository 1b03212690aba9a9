//! Volumes and EC shards of one volume server across its disk directories

use crate::common::{
    blake3_hash, timestamp_now_millis, EcShardSummary, EcVolumeInfo, Error, FileId, Heartbeat,
    Result, ShardAck, ShardId, SyncPolicy, UploadResult, VolumeConfig, VolumeId,
    VolumeVerifyReport,
};
use crate::ec::layout::{
    ecx_file_name, encode_volume, parse_shard_file_name, read_vif, rebuild_shards,
    vif_file_name,
};
use crate::ec::ReedSolomon;
use crate::master::placement::ReplicaPlacement;
use crate::volume::ec_volume::EcVolume;
use crate::volume::needle::Needle;
use crate::volume::volume::{dat_file_name, Volume};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const STAGING_DIR: &str = "ec_staging";

/// One disk directory
#[derive(Debug, Clone)]
pub struct DiskLocation {
    pub dir: PathBuf,
    pub max_volumes: u32,
}

pub struct Store {
    url: String,
    public_url: String,
    data_center: String,
    rack: String,
    locations: Vec<DiskLocation>,
    volumes: RwLock<HashMap<VolumeId, Arc<Volume>>>,
    ec_volumes: RwLock<HashMap<VolumeId, Arc<EcVolume>>>,
    volume_size_limit: AtomicU64,
    max_needle_size: u64,
    sync: SyncPolicy,
    sequence: AtomicU64,
}

impl Store {
    /// Open every volume and EC shard set found in the configured dirs.
    pub fn open(config: &VolumeConfig, volume_size_limit: u64) -> Result<Self> {
        let locations: Vec<DiskLocation> = config
            .data_dirs
            .iter()
            .map(|dir| DiskLocation {
                dir: dir.clone(),
                max_volumes: config.max_volumes,
            })
            .collect();

        let mut volumes = HashMap::new();
        let mut ec_volumes = HashMap::new();
        for location in &locations {
            fs::create_dir_all(&location.dir)?;
            for entry in fs::read_dir(&location.dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(vid) = name.strip_suffix(".dat").and_then(|s| s.parse::<VolumeId>().ok()) {
                    match Volume::open(&location.dir, vid, volume_size_limit, config.sync) {
                        Ok(volume) => {
                            volumes.insert(vid, Arc::new(volume));
                        }
                        Err(e) => tracing::error!("Failed to open volume {}: {}", vid, e),
                    }
                } else if let Some(vid) =
                    name.strip_suffix(".vif").and_then(|s| s.parse::<VolumeId>().ok())
                {
                    match EcVolume::open(&location.dir, vid) {
                        Ok(ec) => {
                            ec_volumes.insert(vid, Arc::new(ec));
                        }
                        Err(e) => tracing::error!("Failed to mount EC volume {}: {}", vid, e),
                    }
                }
            }
        }

        tracing::info!(
            "Store opened: {} volumes, {} EC volumes in {} dirs",
            volumes.len(),
            ec_volumes.len(),
            locations.len()
        );

        Ok(Self {
            url: config.url(),
            public_url: config.public_url(),
            data_center: config.data_center.clone(),
            rack: config.rack.clone(),
            locations,
            volumes: RwLock::new(volumes),
            ec_volumes: RwLock::new(ec_volumes),
            volume_size_limit: AtomicU64::new(volume_size_limit),
            max_needle_size: config.max_needle_mb * 1024 * 1024,
            sync: config.sync,
            // Starts from the clock so a restarted server outranks its old
            // heartbeats
            sequence: AtomicU64::new(timestamp_now_millis()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn max_volumes(&self) -> u32 {
        self.locations.iter().map(|l| l.max_volumes).sum()
    }

    pub fn volume_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<_> = self.volumes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get_volume(&self, vid: VolumeId) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(&vid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))
    }

    pub fn has_volume(&self, vid: VolumeId) -> bool {
        self.volumes.read().contains_key(&vid)
    }

    pub fn ec_volume(&self, vid: VolumeId) -> Option<Arc<EcVolume>> {
        self.ec_volumes.read().get(&vid).cloned()
    }

    pub fn set_volume_size_limit(&self, limit: u64) {
        if self.volume_size_limit.swap(limit, Ordering::Relaxed) != limit {
            for volume in self.volumes.read().values() {
                volume.set_size_limit(limit);
            }
        }
    }

    fn location_for_new_volume(&self) -> Result<&DiskLocation> {
        let volumes = self.volumes.read();
        self.locations
            .iter()
            .map(|l| {
                let used = volumes.values().filter(|v| v.dir() == l.dir).count() as u32;
                (l, used)
            })
            .filter(|(l, used)| *used < l.max_volumes)
            .min_by_key(|(_, used)| *used)
            .map(|(l, _)| l)
            .ok_or_else(|| Error::InvalidState(format!("{} has no free volume slot", self.url)))
    }

    /// Create a volume. Allocating an id that already exists is a no-op.
    pub fn allocate_volume(&self, vid: VolumeId, replication: ReplicaPlacement) -> Result<()> {
        if self.has_volume(vid) {
            return Ok(());
        }
        let location = self.location_for_new_volume()?;
        let volume = Volume::create(
            &location.dir,
            vid,
            replication,
            self.volume_size_limit.load(Ordering::Relaxed),
            self.sync,
        )?;
        self.volumes.write().entry(vid).or_insert_with(|| Arc::new(volume));
        Ok(())
    }

    pub fn write_needle(&self, fid: &FileId, data: Vec<u8>) -> Result<UploadResult> {
        if data.len() as u64 > self.max_needle_size {
            return Err(Error::InvalidArgument(format!(
                "needle of {} bytes exceeds the {} byte limit",
                data.len(),
                self.max_needle_size
            )));
        }
        let volume = self.get_volume(fid.volume_id)?;
        let needle = Needle::new(fid.key, fid.cookie, data);
        volume.write(&needle)?;
        Ok(UploadResult {
            fid: fid.to_string(),
            size: needle.size() as u64,
            etag: needle.etag(),
        })
    }

    pub fn read_needle(&self, fid: &FileId) -> Result<Needle> {
        self.get_volume(fid.volume_id)?.read(fid.key, fid.cookie)
    }

    /// Delete from a normal volume, or journal the delete on an EC volume.
    pub fn delete_needle(&self, fid: &FileId) -> Result<u32> {
        if let Ok(volume) = self.get_volume(fid.volume_id) {
            return volume.delete(fid.key, fid.cookie);
        }
        match self.ec_volume(fid.volume_id) {
            Some(ec) => {
                ec.mark_deleted(fid.key)?;
                Ok(0)
            }
            None => Err(Error::NotFound(format!("volume {}", fid.volume_id))),
        }
    }

    pub fn mark_readonly(&self, vid: VolumeId) -> Result<u64> {
        self.get_volume(vid)?.mark_readonly()
    }

    pub fn mark_writable(&self, vid: VolumeId) -> Result<()> {
        self.get_volume(vid)?.mark_writable()
    }

    pub fn delete_volume(&self, vid: VolumeId) -> Result<()> {
        let volume = self.volumes.write().remove(&vid);
        match volume {
            Some(volume) => volume.destroy(),
            None => Ok(()),
        }
    }

    pub fn compact_volume(&self, vid: VolumeId) -> Result<u64> {
        self.get_volume(vid)?.compact()
    }

    pub fn verify_volume(&self, vid: VolumeId) -> Result<VolumeVerifyReport> {
        let volume = self.get_volume(vid)?;
        let corrupt_keys = volume.verify()?;
        Ok(VolumeVerifyReport {
            volume_id: vid,
            needles: volume.file_count() as u64,
            corrupt_keys,
        })
    }

    pub fn verify_all(&self) -> Result<Vec<VolumeVerifyReport>> {
        self.volume_ids()
            .into_iter()
            .map(|vid| self.verify_volume(vid))
            .collect()
    }

    pub fn checkpoint_all(&self) -> Result<()> {
        let volumes: Vec<Arc<Volume>> = self.volumes.read().values().cloned().collect();
        for volume in volumes {
            volume.checkpoint()?;
        }
        Ok(())
    }

    /// Next heartbeat to send; every call bumps the sequence.
    pub fn heartbeat(&self) -> Heartbeat {
        self.describe(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Current contents without consuming a sequence number
    pub fn status(&self) -> Heartbeat {
        self.describe(self.sequence.load(Ordering::SeqCst))
    }

    fn describe(&self, sequence: u64) -> Heartbeat {
        let mut volumes: Vec<_> = self.volumes.read().values().map(|v| v.summary()).collect();
        volumes.sort_by_key(|v| v.id);
        let mut ec_shards: Vec<_> = self
            .ec_volumes
            .read()
            .values()
            .map(|ec| EcShardSummary {
                volume_id: ec.id(),
                shard_ids: ec.shard_ids(),
            })
            .filter(|s| !s.shard_ids.is_empty())
            .collect();
        ec_shards.sort_by_key(|s| s.volume_id);

        Heartbeat {
            url: self.url.clone(),
            public_url: self.public_url.clone(),
            data_center: self.data_center.clone(),
            rack: self.rack.clone(),
            max_volumes: self.max_volumes(),
            sequence,
            volumes,
            ec_shards,
        }
    }

    // === Erasure coding ===

    /// Working directory for shards produced or fetched for a volume
    pub fn staging_dir(&self, vid: VolumeId) -> PathBuf {
        let base = self
            .volumes
            .read()
            .get(&vid)
            .map(|v| v.dir().to_path_buf())
            .or_else(|| self.locations.first().map(|l| l.dir.clone()))
            .unwrap_or_default();
        base.join(STAGING_DIR).join(vid.to_string())
    }

    /// Encode a read-only volume into the staging directory.
    pub fn generate_ec_shards(
        &self,
        vid: VolumeId,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<EcVolumeInfo> {
        let volume = self.get_volume(vid)?;
        if !volume.is_read_only() {
            return Err(Error::InvalidState(format!(
                "volume {} must be read-only before encoding",
                vid
            )));
        }
        let rs = ReedSolomon::new(data_shards, parity_shards)?;
        let staging = self.staging_dir(vid);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        encode_volume(
            &volume.dat_path(),
            &staging,
            vid,
            &volume.replication().to_string(),
            &volume.ecx_entries(),
            &rs,
        )
    }

    fn check_ec_file_name(vid: VolumeId, name: &str) -> Result<()> {
        let valid = name == ecx_file_name(vid)
            || name == vif_file_name(vid)
            || matches!(parse_shard_file_name(name), Some((v, _)) if v == vid);
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{} is not an EC file of volume {}",
                name, vid
            )))
        }
    }

    /// Path of an EC file of `vid`: staged copies first, then mounted ones.
    pub fn ec_file_path(&self, vid: VolumeId, name: &str) -> Result<PathBuf> {
        Self::check_ec_file_name(vid, name)?;
        let staged = self.staging_dir(vid).join(name);
        if staged.exists() {
            return Ok(staged);
        }
        if let Some(ec) = self.ec_volume(vid) {
            let mounted = ec.dir().join(name);
            if mounted.exists() {
                return Ok(mounted);
            }
        }
        for location in &self.locations {
            let path = location.dir.join(name);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(Error::NotFound(format!("{} on {}", name, self.url)))
    }

    fn ec_location(&self, vid: VolumeId) -> Result<PathBuf> {
        if let Some(ec) = self.ec_volume(vid) {
            return Ok(ec.dir().to_path_buf());
        }
        let volumes = self.volumes.read();
        self.locations
            .iter()
            .min_by_key(|l| volumes.values().filter(|v| v.dir() == l.dir).count())
            .map(|l| l.dir.clone())
            .ok_or_else(|| Error::InvalidState("store has no data dir".into()))
    }

    /// Write received EC files and mount the shards among them. Returns an
    /// ack with the blake3 of every shard written.
    pub fn install_ec_files(
        &self,
        vid: VolumeId,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<ShardAck>> {
        let dir = self.ec_location(vid)?;
        let mut acks = Vec::new();
        let mut shard_ids = Vec::new();
        for (name, bytes) in &files {
            Self::check_ec_file_name(vid, name)?;
            let path = dir.join(name);
            let tmp = dir.join(format!("{}.tmp", name));
            fs::write(&tmp, bytes)?;
            fs::File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, &path)?;
            if let Some((_, shard_id)) = parse_shard_file_name(name) {
                shard_ids.push(shard_id);
                acks.push(ShardAck {
                    shard_id,
                    checksum: blake3_hash(bytes),
                    size: bytes.len() as u64,
                });
            }
        }

        let existing = self.ec_volume(vid);
        match existing {
            Some(ec) => {
                for shard_id in shard_ids {
                    ec.mount_shard(shard_id)?;
                }
            }
            None => {
                let ec = EcVolume::open(&dir, vid)?;
                self.ec_volumes.write().insert(vid, Arc::new(ec));
            }
        }
        Ok(acks)
    }

    /// Unmount and delete shards; the EC volume goes away with its last one.
    pub fn delete_ec_shards(&self, vid: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        let ec = match self.ec_volume(vid) {
            Some(ec) => ec,
            None => return Ok(()),
        };
        let mut remaining = ec.shard_ids().len();
        for &shard_id in shard_ids {
            remaining = ec.remove_shard(shard_id)?;
        }
        if remaining == 0 {
            ec.destroy()?;
            self.ec_volumes.write().remove(&vid);
        }
        Ok(())
    }

    pub fn drop_ec_staging(&self, vid: VolumeId) -> Result<()> {
        let staging = self.staging_dir(vid);
        match fs::remove_dir_all(&staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write fetched files into the staging directory.
    pub fn stage_ec_files(&self, vid: VolumeId, files: Vec<(String, Vec<u8>)>) -> Result<PathBuf> {
        let staging = self.staging_dir(vid);
        fs::create_dir_all(&staging)?;
        for (name, bytes) in files {
            Self::check_ec_file_name(vid, &name)?;
            fs::write(staging.join(&name), bytes)?;
        }
        Ok(staging)
    }

    /// Recompute `missing` shards from the shards staged for `vid`. The
    /// rebuilt files stay staged for their destinations to fetch.
    pub fn rebuild_staged_shards(&self, vid: VolumeId, missing: &[ShardId]) -> Result<Vec<ShardAck>> {
        let staging = self.staging_dir(vid);
        let info = read_vif(&staging.join(vif_file_name(vid)))?;
        let rs = ReedSolomon::new(info.data_shards, info.parity_shards)?;
        rebuild_shards(&staging, &info, &rs, missing)
    }

    /// Install a volume copied from a peer. It comes up read-only.
    pub fn install_volume(&self, vid: VolumeId, dat: &[u8]) -> Result<()> {
        if self.has_volume(vid) {
            return Err(Error::InvalidState(format!("volume {} already on {}", vid, self.url)));
        }
        let location = self.location_for_new_volume()?;
        let path = location.dir.join(dat_file_name(vid));
        let tmp = location.dir.join(format!("{}.dat.tmp", vid));
        fs::write(&tmp, dat)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &path)?;

        let volume = Volume::open(
            &location.dir,
            vid,
            self.volume_size_limit.load(Ordering::Relaxed),
            self.sync,
        )?;
        volume.mark_readonly()?;
        volume.checkpoint()?;
        self.volumes.write().insert(vid, Arc::new(volume));
        tracing::info!("Installed copy of volume {} ({} bytes)", vid, dat.len());
        Ok(())
    }

    /// Committed bytes of a volume's `.dat`, for copying to a peer
    pub fn read_volume_file(&self, vid: VolumeId) -> Result<Vec<u8>> {
        let volume = self.get_volume(vid)?;
        let (file, len) = volume.snapshot_reader();
        let mut bytes = vec![0u8; len as usize];
        file.read_exact_at(&mut bytes, 0)?;
        Ok(bytes)
    }

    pub fn read_ec_file(&self, vid: VolumeId, name: &str) -> Result<Vec<u8>> {
        let path = self.ec_file_path(vid, name)?;
        Ok(fs::read(path)?)
    }

    pub fn read_shard_range(
        &self,
        vid: VolumeId,
        shard_id: ShardId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        let ec = self
            .ec_volume(vid)
            .ok_or_else(|| Error::NotFound(format!("EC volume {} on {}", vid, self.url)))?;
        ec.read_local(shard_id, offset, size)?.ok_or_else(|| {
            Error::NotFound(format!("shard {} of volume {} on {}", shard_id, vid, self.url))
        })
    }

    pub fn location_dirs(&self) -> Vec<&Path> {
        self.locations.iter().map(|l| l.dir.as_path()).collect()
    }
}
