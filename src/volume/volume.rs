//! Append-only volume
//!
//! A volume is one `.dat` file: an 8-byte super block followed by needle
//! records. Appends are serialized by the writer mutex and become visible
//! only once the index points at them; readers use positional reads on a
//! shared handle and never take the writer lock.

use crate::common::{
    timestamp_now, Cookie, Error, NeedleKey, Result, SyncPolicy, VolumeId, VolumeSummary,
};
use crate::ec::layout::EcxEntry;
use crate::master::placement::ReplicaPlacement;
use crate::volume::index::{NeedleMap, NeedleValue};
use crate::volume::needle::{record_len, Needle, NeedleHeader, HEADER_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const SUPER_BLOCK_SIZE: u64 = 8;
const SUPER_BLOCK_MAGIC: &[u8; 4] = b"MWVL";
const FORMAT_VERSION: u8 = 1;

/// `[MAGIC:4][VERSION:1][REPLICATION:1][COMPACTION_REVISION:2]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u8,
    pub replication: ReplicaPlacement,
    pub compaction_revision: u16,
}

impl SuperBlock {
    pub fn new(replication: ReplicaPlacement) -> Self {
        Self {
            version: FORMAT_VERSION,
            replication,
            compaction_revision: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; SUPER_BLOCK_SIZE as usize] {
        let mut buf = [0u8; SUPER_BLOCK_SIZE as usize];
        buf[..4].copy_from_slice(SUPER_BLOCK_MAGIC);
        buf[4] = self.version;
        buf[5] = self.replication.to_byte().unwrap_or_default();
        buf[6..8].copy_from_slice(&self.compaction_revision.to_le_bytes());
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPER_BLOCK_SIZE as usize || &buf[..4] != SUPER_BLOCK_MAGIC {
            return Err(Error::Corrupt("bad volume super block".into()));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(Error::Corrupt(format!("unsupported volume version {}", buf[4])));
        }
        Ok(Self {
            version: buf[4],
            replication: ReplicaPlacement::from_byte(buf[5]),
            compaction_revision: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

pub fn dat_file_name(id: VolumeId) -> String {
    format!("{}.dat", id)
}

pub fn idx_file_name(id: VolumeId) -> String {
    format!("{}.idx", id)
}

/// Present while a volume is read-only, so the flag survives restarts
pub fn readonly_marker_name(id: VolumeId) -> String {
    format!("{}.ro", id)
}

struct Writer {
    file: File,
    end: u64,
}

pub struct Volume {
    id: VolumeId,
    dir: PathBuf,
    super_block: RwLock<SuperBlock>,
    writer: Mutex<Writer>,
    reader: RwLock<Arc<File>>,
    index: RwLock<NeedleMap>,
    read_only: AtomicBool,
    /// Committed `.dat` size, mirrors `writer.end`
    size: AtomicU64,
    size_limit: AtomicU64,
    modified_at: AtomicU64,
    sync: SyncPolicy,
}

impl Volume {
    /// Create a new, empty volume. Fails if one already exists.
    pub fn create(
        dir: &Path,
        id: VolumeId,
        replication: ReplicaPlacement,
        size_limit: u64,
        sync: SyncPolicy,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(dat_file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let super_block = SuperBlock::new(replication);
        file.write_all_at(&super_block.to_bytes(), 0)?;
        file.sync_all()?;

        tracing::info!("Created volume {} ({}) in {:?}", id, replication, dir);
        Self::from_parts(dir, id, file, super_block, NeedleMap::new(), SUPER_BLOCK_SIZE, size_limit, sync)
    }

    /// Open an existing volume: load the index checkpoint if it is valid,
    /// then replay records appended after it.
    pub fn open(dir: &Path, id: VolumeId, size_limit: u64, sync: SyncPolicy) -> Result<Self> {
        let path = dir.join(dat_file_name(id));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut sb = [0u8; SUPER_BLOCK_SIZE as usize];
        file.read_exact_at(&mut sb, 0)
            .map_err(|_| Error::Corrupt(format!("volume {} has no super block", id)))?;
        let super_block = SuperBlock::parse(&sb)?;
        let file_len = file.metadata()?.len();

        let idx_path = dir.join(idx_file_name(id));
        let (mut index, covered) = match NeedleMap::load_checkpoint(&idx_path) {
            Ok((index, covered)) if covered >= SUPER_BLOCK_SIZE && covered <= file_len => {
                (index, covered)
            }
            Ok(_) => {
                tracing::warn!("Index checkpoint of volume {} is ahead of its data, rebuilding", id);
                (NeedleMap::new(), SUPER_BLOCK_SIZE)
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                (NeedleMap::new(), SUPER_BLOCK_SIZE)
            }
            Err(e) => {
                tracing::warn!("Ignoring index checkpoint of volume {}: {}", id, e);
                (NeedleMap::new(), SUPER_BLOCK_SIZE)
            }
        };

        let end = replay(&file, &mut index, covered, file_len)?;
        if end < file_len {
            tracing::warn!(
                "Volume {} has a torn tail, truncating {} bytes at offset {}",
                id,
                file_len - end,
                end
            );
            file.set_len(end)?;
            file.sync_all()?;
        }

        tracing::info!(
            "Opened volume {}: {} needles, {} bytes (replayed from {})",
            id,
            index.len(),
            end,
            covered
        );
        let volume = Self::from_parts(dir, id, file, super_block, index, end, size_limit, sync)?;
        if dir.join(readonly_marker_name(id)).exists() {
            volume.read_only.store(true, Ordering::Release);
        }
        Ok(volume)
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        dir: &Path,
        id: VolumeId,
        file: File,
        super_block: SuperBlock,
        index: NeedleMap,
        end: u64,
        size_limit: u64,
        sync: SyncPolicy,
    ) -> Result<Self> {
        let reader = file.try_clone()?;
        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            super_block: RwLock::new(super_block),
            writer: Mutex::new(Writer { file, end }),
            reader: RwLock::new(Arc::new(reader)),
            index: RwLock::new(index),
            read_only: AtomicBool::new(false),
            size: AtomicU64::new(end),
            size_limit: AtomicU64::new(size_limit),
            modified_at: AtomicU64::new(timestamp_now()),
            sync,
        })
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dat_path(&self) -> PathBuf {
        self.dir.join(dat_file_name(self.id))
    }

    pub fn idx_path(&self) -> PathBuf {
        self.dir.join(idx_file_name(self.id))
    }

    pub fn replication(&self) -> ReplicaPlacement {
        self.super_block.read().replication
    }

    pub fn compaction_revision(&self) -> u16 {
        self.super_block.read().compaction_revision
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size_limit(&self, limit: u64) {
        self.size_limit.store(limit, Ordering::Relaxed);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.size_limit.load(Ordering::Relaxed)
    }

    pub fn file_count(&self) -> usize {
        self.index.read().len()
    }

    /// Append a needle, returning its offset.
    pub fn write(&self, needle: &Needle) -> Result<u64> {
        let bytes = needle.to_bytes()?;
        let mut writer = self.writer.lock();
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.id));
        }
        if writer.end + bytes.len() as u64 > self.size_limit.load(Ordering::Relaxed) {
            return Err(Error::Full(self.id));
        }

        let offset = writer.end;
        writer.file.write_all_at(&bytes, offset)?;
        if self.sync == SyncPolicy::Always {
            writer.file.sync_data()?;
        }
        writer.end += bytes.len() as u64;

        self.index.write().put(
            needle.key,
            NeedleValue {
                offset,
                size: needle.size(),
            },
        );
        self.size.store(writer.end, Ordering::Release);
        self.modified_at.store(timestamp_now(), Ordering::Relaxed);
        Ok(offset)
    }

    /// Read a needle, verifying its checksum and cookie.
    pub fn read(&self, key: NeedleKey, cookie: Cookie) -> Result<Needle> {
        let needle = self.read_unchecked_cookie(key)?;
        if needle.cookie != cookie {
            return Err(Error::NotFound(format!(
                "needle {:x} in volume {}: cookie mismatch",
                key, self.id
            )));
        }
        Ok(needle)
    }

    fn read_unchecked_cookie(&self, key: NeedleKey) -> Result<Needle> {
        let value = self
            .index
            .read()
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("needle {:x} in volume {}", key, self.id)))?;
        let file = self.reader.read().clone();
        self.read_record(&file, key, value)
    }

    fn read_record(&self, file: &File, key: NeedleKey, value: NeedleValue) -> Result<Needle> {
        let mut buf = vec![0u8; record_len(value.size) as usize];
        file.read_exact_at(&mut buf, value.offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Corrupt(format!("needle {:x} truncated in volume {}", key, self.id))
            } else {
                Error::Io(e)
            }
        })?;
        Needle::parse_expected(&buf, key, value.size)
    }

    /// Append a tombstone. Allowed on full volumes, not on read-only ones.
    pub fn delete(&self, key: NeedleKey, cookie: Cookie) -> Result<u32> {
        let existing = self.read(key, cookie)?;
        let tombstone = Needle::tombstone(key, cookie);
        let bytes = tombstone.to_bytes()?;

        let mut writer = self.writer.lock();
        if self.is_read_only() {
            return Err(Error::ReadOnly(self.id));
        }
        let offset = writer.end;
        writer.file.write_all_at(&bytes, offset)?;
        if self.sync == SyncPolicy::Always {
            writer.file.sync_data()?;
        }
        writer.end += bytes.len() as u64;
        self.index.write().delete(key, bytes.len() as u64);
        self.size.store(writer.end, Ordering::Release);
        self.modified_at.store(timestamp_now(), Ordering::Relaxed);
        Ok(existing.size())
    }

    /// Quiescence barrier: once this returns no append is in flight, none
    /// will start, and the returned size is durable.
    pub fn mark_readonly(&self) -> Result<u64> {
        let writer = self.writer.lock();
        self.read_only.store(true, Ordering::Release);
        writer.file.sync_all()?;
        File::create(self.dir.join(readonly_marker_name(self.id)))?;
        Ok(writer.end)
    }

    pub fn mark_writable(&self) -> Result<()> {
        let _writer = self.writer.lock();
        match fs::remove_file(self.dir.join(readonly_marker_name(self.id))) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.read_only.store(false, Ordering::Release);
        Ok(())
    }

    /// Persist the index together with the data it covers.
    pub fn checkpoint(&self) -> Result<()> {
        let writer = self.writer.lock();
        writer.file.sync_data()?;
        self.index.read().save_checkpoint(&self.idx_path(), writer.end)?;
        tracing::debug!("Checkpointed volume {} at {}", self.id, writer.end);
        Ok(())
    }

    pub fn summary(&self) -> VolumeSummary {
        let index = self.index.read();
        VolumeSummary {
            id: self.id,
            size: self.size(),
            file_count: index.len() as u64,
            delete_count: index.deleted_count(),
            deleted_bytes: index.deleted_bytes(),
            read_only: self.is_read_only(),
            replication: self.replication().to_string(),
            compaction_revision: self.compaction_revision(),
            max_needle_key: index.max_key(),
            modified_at: self.modified_at.load(Ordering::Relaxed),
        }
    }

    /// Live needles as `.ecx` entries
    pub fn ecx_entries(&self) -> Vec<EcxEntry> {
        self.index
            .read()
            .entries_by_offset()
            .into_iter()
            .map(|(key, value)| EcxEntry {
                key,
                offset: value.offset,
                size: value.size,
            })
            .collect()
    }

    pub fn garbage_ratio(&self) -> f64 {
        let size = self.size();
        if size <= SUPER_BLOCK_SIZE {
            return 0.0;
        }
        self.index.read().deleted_bytes() as f64 / (size - SUPER_BLOCK_SIZE) as f64
    }

    /// Check every live needle; returns the keys that fail.
    pub fn verify(&self) -> Result<Vec<NeedleKey>> {
        let entries = self.index.read().entries_by_offset();
        let file = self.reader.read().clone();
        let mut corrupt = Vec::new();
        for (key, value) in entries {
            if let Err(e) = self.read_record(&file, key, value) {
                match e {
                    Error::Corrupt(msg) => {
                        tracing::warn!("Volume {}: {}", self.id, msg);
                        corrupt.push(key);
                    }
                    other => return Err(other),
                }
            }
        }
        Ok(corrupt)
    }

    /// Rewrite live needles into a fresh file and swap it in. Returns the
    /// bytes reclaimed.
    pub fn compact(&self) -> Result<u64> {
        let mut writer = self.writer.lock();
        let old_size = writer.end;
        let entries = self.index.read().entries_by_offset();
        let mut super_block = *self.super_block.read();
        super_block.compaction_revision = super_block.compaction_revision.wrapping_add(1);

        let tmp_path = self.dir.join(format!("{}.cpd", self.id));
        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        new_file.write_all_at(&super_block.to_bytes(), 0)?;

        let mut new_index = NeedleMap::new();
        let mut end = SUPER_BLOCK_SIZE;
        for (key, value) in entries {
            let mut buf = vec![0u8; record_len(value.size) as usize];
            writer.file.read_exact_at(&mut buf, value.offset)?;
            // Refuse to launder a damaged record into a fresh checksum
            Needle::parse_expected(&buf, key, value.size)?;
            new_file.write_all_at(&buf, end)?;
            new_index.put(
                key,
                NeedleValue {
                    offset: end,
                    size: value.size,
                },
            );
            end += buf.len() as u64;
        }
        new_file.sync_all()?;
        fs::rename(&tmp_path, self.dat_path())?;

        let reader = new_file.try_clone()?;
        writer.file = new_file;
        writer.end = end;
        *self.reader.write() = Arc::new(reader);
        *self.index.write() = new_index;
        *self.super_block.write() = super_block;
        self.size.store(end, Ordering::Release);
        self.index.read().save_checkpoint(&self.idx_path(), end)?;

        let reclaimed = old_size.saturating_sub(end);
        tracing::info!(
            "Compacted volume {} to revision {}: reclaimed {} bytes",
            self.id,
            super_block.compaction_revision,
            reclaimed
        );
        Ok(reclaimed)
    }

    /// Remove the volume's files. The volume refuses writes afterwards.
    pub fn destroy(&self) -> Result<()> {
        let _writer = self.writer.lock();
        self.read_only.store(true, Ordering::Release);
        for path in [
            self.dat_path(),
            self.idx_path(),
            self.dir.join(readonly_marker_name(self.id)),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!("Destroyed volume {}", self.id);
        Ok(())
    }

    /// Handle for streaming the `.dat` out, with the size committed at the
    /// time of the call.
    pub fn snapshot_reader(&self) -> (Arc<File>, u64) {
        let file = self.reader.read().clone();
        (file, self.size())
    }
}

/// Apply records in `[from, file_len)` to the index. Returns the end of the
/// last intact record.
fn replay(file: &File, index: &mut NeedleMap, from: u64, file_len: u64) -> Result<u64> {
    let mut pos = from;
    let mut header = [0u8; HEADER_SIZE];
    while pos + HEADER_SIZE as u64 <= file_len {
        file.read_exact_at(&mut header, pos)?;
        let parsed = NeedleHeader::parse(&header)?;
        let len = parsed.record_len();
        if pos + len > file_len {
            break;
        }
        let mut record = vec![0u8; len as usize];
        file.read_exact_at(&mut record, pos)?;
        let needle = match Needle::parse(&record) {
            Ok(needle) => needle,
            Err(_) => break,
        };
        if needle.is_tombstone() {
            index.delete(needle.key, len);
        } else {
            index.put(
                needle.key,
                NeedleValue {
                    offset: pos,
                    size: needle.size(),
                },
            );
        }
        pos += len;
    }
    Ok(pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LIMIT: u64 = 1024 * 1024;

    fn create(dir: &Path) -> Volume {
        Volume::create(dir, 1, ReplicaPlacement::default(), LIMIT, SyncPolicy::Never).unwrap()
    }

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let volume = create(dir.path());

        let offset = volume.write(&Needle::new(1, 0xabc, b"hello".to_vec())).unwrap();
        assert_eq!(offset, SUPER_BLOCK_SIZE);
        volume.write(&Needle::new(2, 0xdef, b"world".to_vec())).unwrap();

        assert_eq!(volume.read(1, 0xabc).unwrap().data, b"hello");
        assert!(matches!(volume.read(1, 0xdef), Err(Error::NotFound(_))));

        assert_eq!(volume.delete(1, 0xabc).unwrap(), 5);
        assert!(matches!(volume.read(1, 0xabc), Err(Error::NotFound(_))));
        assert_eq!(volume.summary().file_count, 1);
        assert_eq!(volume.summary().delete_count, 1);
    }

    #[test]
    fn test_full_and_read_only() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path(), 2, ReplicaPlacement::default(), 100, SyncPolicy::Never).unwrap();

        volume.write(&Needle::new(1, 1, vec![0u8; 40])).unwrap();
        assert!(matches!(
            volume.write(&Needle::new(2, 1, vec![0u8; 40])),
            Err(Error::Full(2))
        ));

        let size = volume.mark_readonly().unwrap();
        assert_eq!(size, volume.size());
        assert!(matches!(
            volume.write(&Needle::new(3, 1, vec![1])),
            Err(Error::ReadOnly(2))
        ));
        assert!(matches!(volume.delete(1, 1), Err(Error::ReadOnly(2))));
        // Reads still work
        assert_eq!(volume.read(1, 1).unwrap().data.len(), 40);

        volume.mark_writable().unwrap();
        volume.delete(1, 1).unwrap();
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let dir = tempdir().unwrap();
        let volume = create(dir.path());
        let needle = Needle::new(7, 99, b"precious bytes".to_vec());
        let offset = volume.write(&needle).unwrap();
        let len = needle.record_len();

        for i in 0..len {
            let file = OpenOptions::new().read(true).write(true).open(volume.dat_path()).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact_at(&mut byte, offset + i).unwrap();
            file.write_all_at(&[byte[0] ^ 0x80], offset + i).unwrap();
            assert!(
                matches!(volume.read(7, 99), Err(Error::Corrupt(_))),
                "flip at record byte {} not detected",
                i
            );
            file.write_all_at(&byte, offset + i).unwrap();
        }
        assert_eq!(volume.read(7, 99).unwrap().data, b"precious bytes");
        assert!(volume.verify().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_with_checkpoint_and_tail() {
        let dir = tempdir().unwrap();
        {
            let volume = create(dir.path());
            for key in 0..10u64 {
                volume.write(&Needle::new(key, 1, vec![key as u8; 16])).unwrap();
            }
            volume.checkpoint().unwrap();
            for key in 10..15u64 {
                volume.write(&Needle::new(key, 1, vec![key as u8; 16])).unwrap();
            }
            volume.delete(3, 1).unwrap();
        }

        let volume = Volume::open(dir.path(), 1, LIMIT, SyncPolicy::Never).unwrap();
        assert_eq!(volume.file_count(), 14);
        assert_eq!(volume.read(12, 1).unwrap().data, vec![12u8; 16]);
        assert!(volume.read(3, 1).is_err());
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempdir().unwrap();
        let good_end;
        {
            let volume = create(dir.path());
            volume.write(&Needle::new(1, 1, b"complete".to_vec())).unwrap();
            good_end = volume.size();
        }
        // Half a record at the end
        let partial = Needle::new(2, 1, b"never finished".to_vec()).to_bytes().unwrap();
        let file = OpenOptions::new().write(true).open(dir.path().join("1.dat")).unwrap();
        file.write_all_at(&partial[..partial.len() / 2], good_end).unwrap();
        drop(file);

        let volume = Volume::open(dir.path(), 1, LIMIT, SyncPolicy::Never).unwrap();
        assert_eq!(volume.size(), good_end);
        assert!(!volume.is_read_only());
        assert_eq!(volume.read(1, 1).unwrap().data, b"complete");
        volume.write(&Needle::new(2, 1, b"retry".to_vec())).unwrap();
        assert_eq!(volume.read(2, 1).unwrap().data, b"retry");
    }

    #[test]
    fn test_compact() {
        let dir = tempdir().unwrap();
        let volume = create(dir.path());
        for key in 0..20u64 {
            volume.write(&Needle::new(key, 5, vec![7u8; 100])).unwrap();
        }
        for key in 0..15u64 {
            volume.delete(key, 5).unwrap();
        }
        assert!(volume.garbage_ratio() > 0.5);

        let reclaimed = volume.compact().unwrap();
        assert!(reclaimed > 0);
        assert_eq!(volume.compaction_revision(), 1);
        assert_eq!(volume.file_count(), 5);
        assert_eq!(volume.read(17, 5).unwrap().data, vec![7u8; 100]);
        assert_eq!(volume.garbage_ratio(), 0.0);

        drop(volume);
        let volume = Volume::open(dir.path(), 1, LIMIT, SyncPolicy::Never).unwrap();
        assert_eq!(volume.file_count(), 5);
        assert_eq!(volume.compaction_revision(), 1);
    }
}
