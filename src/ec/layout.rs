//! On-disk layout of an encoded volume
//!
//! A volume's `.dat` is cut into N contiguous blocks of `shard_size` bytes
//! (the last zero padded); block i becomes `<vid>.ec{i:02}` and M parity
//! files follow. Byte `o` of the `.dat` therefore lives in shard
//! `o / shard_size` at offset `o % shard_size`. Files are produced in
//! bounded chunks so encoding never holds a whole volume in memory.

use crate::common::{
    Blake3Hasher, EcVolumeInfo, Error, NeedleKey, Result, ShardAck, ShardId, VolumeId,
};
use crate::ec::ReedSolomon;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Bytes per shard processed per encoding round
pub const ENCODE_BUFFER: usize = 1024 * 1024;

/// key u64 | offset u64 | size u32
pub const ECX_ENTRY_SIZE: usize = 20;

pub fn shard_file_name(volume_id: VolumeId, shard_id: ShardId) -> String {
    format!("{}.ec{:02}", volume_id, shard_id)
}

pub fn ecx_file_name(volume_id: VolumeId) -> String {
    format!("{}.ecx", volume_id)
}

pub fn vif_file_name(volume_id: VolumeId) -> String {
    format!("{}.vif", volume_id)
}

pub fn ecj_file_name(volume_id: VolumeId) -> String {
    format!("{}.ecj", volume_id)
}

/// Shard id from a file name like `7.ec03`
pub fn parse_shard_file_name(name: &str) -> Option<(VolumeId, ShardId)> {
    let (vid, ext) = name.split_once('.')?;
    let shard = ext.strip_prefix("ec")?;
    if shard.len() != 2 {
        return None;
    }
    Some((vid.parse().ok()?, shard.parse().ok()?))
}

pub fn shard_size_for(dat_size: u64, data_shards: usize) -> u64 {
    dat_size.div_ceil(data_shards as u64).max(1)
}

/// Live needle entry of an encoded volume, offsets into the original `.dat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcxEntry {
    pub key: NeedleKey,
    pub offset: u64,
    pub size: u32,
}

/// A contiguous range inside one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub shard_id: ShardId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EcLayout {
    pub data_shards: usize,
    pub shard_size: u64,
    pub dat_size: u64,
}

impl EcLayout {
    pub fn new(info: &EcVolumeInfo) -> Self {
        Self {
            data_shards: info.data_shards,
            shard_size: info.shard_size,
            dat_size: info.dat_size,
        }
    }

    /// Map a `.dat` byte range onto shard intervals.
    pub fn locate(&self, offset: u64, size: u64) -> Result<Vec<Interval>> {
        if offset.saturating_add(size) > self.dat_size {
            return Err(Error::Corrupt(format!(
                "range {}+{} beyond encoded size {}",
                offset, size, self.dat_size
            )));
        }

        let mut intervals = Vec::new();
        let mut offset = offset;
        let mut remaining = size;
        while remaining > 0 {
            let shard = offset / self.shard_size;
            let within = offset % self.shard_size;
            let take = remaining.min(self.shard_size - within);
            intervals.push(Interval {
                shard_id: shard as ShardId,
                offset: within,
                size: take,
            });
            offset += take;
            remaining -= take;
        }
        Ok(intervals)
    }
}

/// Fill `buf` from `offset`, zeroing whatever lies past end of file.
fn read_padded(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf[filled..].fill(0);
    Ok(())
}

fn create_shard_writers(dir: &Path, volume_id: VolumeId, ids: &[usize]) -> Result<Vec<BufWriter<File>>> {
    ids.iter()
        .map(|&i| {
            let path = dir.join(shard_file_name(volume_id, i as ShardId));
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            Ok(BufWriter::new(file))
        })
        .collect()
}

/// Encode `dat_path` into N+M shard files plus `.ecx` and `.vif` in
/// `out_dir`.
pub fn encode_volume(
    dat_path: &Path,
    out_dir: &Path,
    volume_id: VolumeId,
    replication: &str,
    entries: &[EcxEntry],
    rs: &ReedSolomon,
) -> Result<EcVolumeInfo> {
    fs::create_dir_all(out_dir)?;
    let dat = File::open(dat_path)?;
    let dat_size = dat.metadata()?.len();
    let data_shards = rs.data_shards();
    let total = rs.total_shards();
    let shard_size = shard_size_for(dat_size, data_shards);

    let ids: Vec<usize> = (0..total).collect();
    let mut writers = create_shard_writers(out_dir, volume_id, &ids)?;
    let mut hashers: Vec<Blake3Hasher> = (0..total).map(|_| Blake3Hasher::new()).collect();

    let chunk = (ENCODE_BUFFER as u64).min(shard_size) as usize;
    let mut buffers = vec![vec![0u8; chunk]; total];

    let mut pos = 0u64;
    while pos < shard_size {
        let len = (shard_size - pos).min(chunk as u64) as usize;
        for (i, buf) in buffers[..data_shards].iter_mut().enumerate() {
            read_padded(&dat, i as u64 * shard_size + pos, &mut buf[..len])?;
        }

        let (data, parity) = buffers.split_at_mut(data_shards);
        let data: Vec<&[u8]> = data.iter().map(|b| &b[..len]).collect();
        let mut parity: Vec<&mut [u8]> = parity.iter_mut().map(|b| &mut b[..len]).collect();
        rs.encode_parts(&data, &mut parity)?;

        for (i, buf) in buffers.iter().enumerate() {
            writers[i].write_all(&buf[..len])?;
            hashers[i].update(&buf[..len]);
        }
        pos += len as u64;
    }

    for writer in writers {
        let file = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
    }

    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|e| e.key);
    write_ecx(&out_dir.join(ecx_file_name(volume_id)), &sorted)?;

    let info = EcVolumeInfo {
        volume_id,
        data_shards,
        parity_shards: rs.parity_shards(),
        dat_size,
        shard_size,
        shard_checksums: hashers.iter().map(Blake3Hasher::finalize).collect(),
        needle_count: sorted.len() as u64,
        replication: replication.to_string(),
    };
    write_vif(&out_dir.join(vif_file_name(volume_id)), &info)?;

    tracing::info!(
        "Encoded volume {} ({} bytes) into {}+{} shards of {} bytes",
        volume_id,
        dat_size,
        data_shards,
        rs.parity_shards(),
        shard_size
    );
    Ok(info)
}

pub fn write_ecx(path: &Path, entries: &[EcxEntry]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for entry in entries {
        writer.write_all(&entry.key.to_le_bytes())?;
        writer.write_all(&entry.offset.to_le_bytes())?;
        writer.write_all(&entry.size.to_le_bytes())?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

pub fn read_ecx(path: &Path) -> Result<Vec<EcxEntry>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    parse_ecx(&bytes)
}

pub fn parse_ecx(bytes: &[u8]) -> Result<Vec<EcxEntry>> {
    if bytes.len() % ECX_ENTRY_SIZE != 0 {
        return Err(Error::Corrupt(format!(
            "ecx length {} is not a multiple of {}",
            bytes.len(),
            ECX_ENTRY_SIZE
        )));
    }
    Ok(bytes
        .chunks_exact(ECX_ENTRY_SIZE)
        .map(|c| {
            let mut key = [0u8; 8];
            let mut offset = [0u8; 8];
            let mut size = [0u8; 4];
            key.copy_from_slice(&c[0..8]);
            offset.copy_from_slice(&c[8..16]);
            size.copy_from_slice(&c[16..20]);
            EcxEntry {
                key: u64::from_le_bytes(key),
                offset: u64::from_le_bytes(offset),
                size: u32::from_le_bytes(size),
            }
        })
        .collect())
}

pub fn write_vif(path: &Path, info: &EcVolumeInfo) -> Result<()> {
    let tmp = path.with_extension("vif.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(info)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_vif(path: &Path) -> Result<EcVolumeInfo> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Recompute the `missing` shards of a volume from the shard files present
/// in `dir` and write them next to the others.
pub fn rebuild_shards(
    dir: &Path,
    info: &EcVolumeInfo,
    rs: &ReedSolomon,
    missing: &[ShardId],
) -> Result<Vec<ShardAck>> {
    let total = info.total_shards();
    let volume_id = info.volume_id;
    let sources: Vec<(usize, File)> = (0..total)
        .filter(|i| !missing.contains(&(*i as ShardId)))
        .filter_map(|i| {
            File::open(dir.join(shard_file_name(volume_id, i as ShardId)))
                .ok()
                .map(|f| (i, f))
        })
        .take(info.data_shards)
        .collect();
    if sources.len() < info.data_shards {
        return Err(Error::InsufficientShards {
            needed: info.data_shards,
            available: sources.len(),
        });
    }

    let targets: Vec<usize> = missing.iter().map(|&s| s as usize).collect();
    let tmp_dir = dir.join(format!(".rebuild-{}", volume_id));
    fs::create_dir_all(&tmp_dir)?;
    let mut writers = create_shard_writers(&tmp_dir, volume_id, &targets)?;
    let mut hashers: Vec<Blake3Hasher> = targets.iter().map(|_| Blake3Hasher::new()).collect();

    let chunk = (ENCODE_BUFFER as u64).min(info.shard_size) as usize;
    let mut pos = 0u64;
    while pos < info.shard_size {
        let len = (info.shard_size - pos).min(chunk as u64) as usize;
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        for (i, file) in &sources {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, pos).map_err(|e| {
                Error::Corrupt(format!("shard {} of volume {} is short: {}", i, volume_id, e))
            })?;
            shards[*i] = Some(buf);
        }
        rs.reconstruct(&mut shards)?;

        for (n, &t) in targets.iter().enumerate() {
            let buf = shards[t]
                .as_deref()
                .ok_or_else(|| Error::Internal(format!("shard {} not rebuilt", t)))?;
            writers[n].write_all(buf)?;
            hashers[n].update(buf);
        }
        pos += len as u64;
    }

    for writer in writers {
        let file = writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
    }

    let mut acks = Vec::with_capacity(targets.len());
    for (n, &t) in targets.iter().enumerate() {
        let name = shard_file_name(volume_id, t as ShardId);
        fs::rename(tmp_dir.join(&name), dir.join(&name))?;
        acks.push(ShardAck {
            shard_id: t as ShardId,
            checksum: hashers[n].finalize(),
            size: info.shard_size,
        });
    }
    fs::remove_dir_all(&tmp_dir)?;
    Ok(acks)
}

/// Reassemble the original `.dat` from the data shards in `dir`,
/// rebuilding any missing data shard first.
pub fn decode_to_dat(dir: &Path, info: &EcVolumeInfo, rs: &ReedSolomon, out: &Path) -> Result<()> {
    let volume_id = info.volume_id;
    let missing: Vec<ShardId> = (0..info.data_shards)
        .map(|i| i as ShardId)
        .filter(|&i| !dir.join(shard_file_name(volume_id, i)).exists())
        .collect();
    if !missing.is_empty() {
        rebuild_shards(dir, info, rs, &missing)?;
    }

    let tmp: PathBuf = out.with_extension("dat.tmp");
    let mut writer = BufWriter::new(File::create(&tmp)?);
    let mut remaining = info.dat_size;
    let mut buf = vec![0u8; ENCODE_BUFFER];
    for i in 0..info.data_shards {
        if remaining == 0 {
            break;
        }
        let file = File::open(dir.join(shard_file_name(volume_id, i as ShardId)))?;
        let mut pos = 0u64;
        let mut left = remaining.min(info.shard_size);
        while left > 0 {
            let len = left.min(buf.len() as u64) as usize;
            file.read_exact_at(&mut buf[..len], pos)?;
            writer.write_all(&buf[..len])?;
            pos += len as u64;
            left -= len as u64;
        }
        remaining -= remaining.min(info.shard_size);
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(&tmp, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_dat(dir: &Path, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.join("1.dat");
        fs::write(&path, &data).unwrap();
        (path, data)
    }

    #[test]
    fn test_locate_spans_shards() {
        let layout = EcLayout {
            data_shards: 4,
            shard_size: 100,
            dat_size: 400,
        };
        let intervals = layout.locate(90, 120).unwrap();
        assert_eq!(
            intervals,
            vec![
                Interval { shard_id: 0, offset: 90, size: 10 },
                Interval { shard_id: 1, offset: 0, size: 100 },
                Interval { shard_id: 2, offset: 0, size: 10 },
            ]
        );
        assert!(layout.locate(390, 20).is_err());
    }

    #[test]
    fn test_shard_file_names() {
        assert_eq!(shard_file_name(7, 3), "7.ec03");
        assert_eq!(parse_shard_file_name("7.ec03"), Some((7, 3)));
        assert_eq!(parse_shard_file_name("7.ecx"), None);
        assert_eq!(parse_shard_file_name("7.dat"), None);
    }

    #[test]
    fn test_encode_rebuild_decode() {
        let dir = tempdir().unwrap();
        let (dat, data) = write_dat(dir.path(), 10_007);
        let out = dir.path().join("ec");
        let rs = ReedSolomon::new(4, 2).unwrap();
        let entries = vec![
            EcxEntry { key: 9, offset: 8, size: 10 },
            EcxEntry { key: 2, offset: 100, size: 5 },
        ];

        let info = encode_volume(&dat, &out, 1, "000", &entries, &rs).unwrap();
        assert_eq!(info.dat_size, 10_007);
        assert_eq!(info.shard_size, 2502);
        assert_eq!(info.shard_checksums.len(), 6);
        assert_eq!(read_vif(&out.join("1.vif")).unwrap(), info);

        let ecx = read_ecx(&out.join("1.ecx")).unwrap();
        assert_eq!(ecx[0].key, 2);
        assert_eq!(ecx[1].key, 9);

        let lost = fs::read(out.join("1.ec01")).unwrap();
        fs::remove_file(out.join("1.ec01")).unwrap();
        fs::remove_file(out.join("1.ec05")).unwrap();
        let acks = rebuild_shards(&out, &info, &rs, &[1, 5]).unwrap();
        assert_eq!(fs::read(out.join("1.ec01")).unwrap(), lost);
        assert_eq!(acks[0].checksum, info.shard_checksums[1]);
        assert_eq!(acks[1].checksum, info.shard_checksums[5]);

        fs::remove_file(out.join("1.ec00")).unwrap();
        let decoded = dir.path().join("decoded.dat");
        decode_to_dat(&out, &info, &rs, &decoded).unwrap();
        assert_eq!(fs::read(&decoded).unwrap(), data);
    }

    #[test]
    fn test_ecx_rejects_truncated() {
        assert!(parse_ecx(&[0u8; 21]).is_err());
        assert!(parse_ecx(&[]).unwrap().is_empty());
    }
}
