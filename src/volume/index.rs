//! In-memory needle index
//!
//! Each live needle key maps to the offset and size of its record in the
//! volume's `.dat`. The map is checkpointed to `.idx` together with the
//! `.dat` offset it covers, so a restart only replays records appended
//! after the checkpoint.

use crate::common::{crc32, Error, NeedleKey, Result};
use crate::volume::needle::record_len;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

const CHECKPOINT_MAGIC: &[u8; 8] = b"MWIDX001";

/// Location of a needle record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleValue {
    pub offset: u64,
    pub size: u32,
}

/// Needle index with the counters a heartbeat reports
#[derive(Debug, Default, Clone)]
pub struct NeedleMap {
    map: HashMap<NeedleKey, NeedleValue>,
    deleted_count: u64,
    deleted_bytes: u64,
    max_key: NeedleKey,
}

impl NeedleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite; an overwritten record counts as garbage.
    pub fn put(&mut self, key: NeedleKey, value: NeedleValue) -> Option<NeedleValue> {
        self.max_key = self.max_key.max(key);
        let old = self.map.insert(key, value);
        if let Some(old) = old {
            self.deleted_count += 1;
            self.deleted_bytes += record_len(old.size);
        }
        old
    }

    /// Drop a key. `tombstone_len` is the size of the delete marker
    /// appended for it.
    pub fn delete(&mut self, key: NeedleKey, tombstone_len: u64) -> Option<NeedleValue> {
        let old = self.map.remove(&key);
        if let Some(old) = old {
            self.deleted_count += 1;
            self.deleted_bytes += record_len(old.size) + tombstone_len;
        }
        old
    }

    pub fn get(&self, key: NeedleKey) -> Option<NeedleValue> {
        self.map.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count
    }

    pub fn deleted_bytes(&self) -> u64 {
        self.deleted_bytes
    }

    pub fn max_key(&self) -> NeedleKey {
        self.max_key
    }

    /// Live entries ordered by offset, the order they sit in the `.dat`
    pub fn entries_by_offset(&self) -> Vec<(NeedleKey, NeedleValue)> {
        let mut entries: Vec<_> = self.map.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(_, v)| v.offset);
        entries
    }

    /// Write a checkpoint covering `.dat` bytes `[0, covered)`.
    pub fn save_checkpoint(&self, path: &Path, covered: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(48 + self.map.len() * 20);
        buf.extend_from_slice(CHECKPOINT_MAGIC);
        buf.extend_from_slice(&covered.to_le_bytes());
        buf.extend_from_slice(&self.deleted_count.to_le_bytes());
        buf.extend_from_slice(&self.deleted_bytes.to_le_bytes());
        buf.extend_from_slice(&self.max_key.to_le_bytes());
        buf.extend_from_slice(&(self.map.len() as u64).to_le_bytes());
        for (key, value) in &self.map {
            buf.extend_from_slice(&key.to_le_bytes());
            buf.extend_from_slice(&value.offset.to_le_bytes());
            buf.extend_from_slice(&value.size.to_le_bytes());
        }
        let checksum = crc32(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let tmp = path.with_extension("idx.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(&buf)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a checkpoint and the `.dat` offset it covers.
    pub fn load_checkpoint(path: &Path) -> Result<(Self, u64)> {
        let buf = fs::read(path)?;
        if buf.len() < 52 || &buf[..8] != CHECKPOINT_MAGIC {
            return Err(Error::Corrupt(format!("{:?} is not an index checkpoint", path)));
        }
        let body = &buf[..buf.len() - 4];
        let stored = read_u32(&buf[buf.len() - 4..]);
        if crc32(body) != stored {
            return Err(Error::Corrupt(format!("{:?} checksum mismatch", path)));
        }

        let covered = read_u64(&body[8..]);
        let deleted_count = read_u64(&body[16..]);
        let deleted_bytes = read_u64(&body[24..]);
        let max_key = read_u64(&body[32..]);
        let count = read_u64(&body[40..]) as usize;
        let entries = &body[48..];
        if entries.len() != count * 20 {
            return Err(Error::Corrupt(format!(
                "{:?} holds {} entry bytes for {} entries",
                path,
                entries.len(),
                count
            )));
        }

        let mut map = HashMap::with_capacity(count);
        for chunk in entries.chunks_exact(20) {
            map.insert(
                read_u64(&chunk[0..]),
                NeedleValue {
                    offset: read_u64(&chunk[8..]),
                    size: read_u32(&chunk[16..]),
                },
            );
        }

        Ok((
            Self {
                map,
                deleted_count,
                deleted_bytes,
                max_key,
            },
            covered,
        ))
    }
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}
