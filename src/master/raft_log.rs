//! Durable Raft state: hard state, log and snapshot
//!
//! - `raft_state`: bincode `HardState`, replaced atomically
//! - `raft_log`: `[LEN:4][CRC32:4][bincode LogEntry]` records, appended;
//!   rewritten on truncation or compaction
//! - `raft_snapshot`: bincode `SnapshotFile`
//!
//! A `RaftLog` without a directory keeps everything in memory.

use crate::common::raft::LogEntry;
use crate::common::{crc32, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub last_index: u64,
    pub last_term: u64,
    pub data: Vec<u8>,
}

pub struct RaftLog {
    dir: Option<PathBuf>,
    log_file: Option<File>,
    pub hard_state: HardState,
    pub snapshot: SnapshotFile,
    /// Entries after `snapshot.last_index`
    pub entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            log_file: None,
            hard_state: HardState::default(),
            snapshot: SnapshotFile::default(),
            entries: Vec::new(),
        }
    }

    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let hard_state = match fs::read(dir.join("raft_state")) {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HardState::default(),
            Err(e) => return Err(e.into()),
        };
        let snapshot: SnapshotFile = match fs::read(dir.join("raft_snapshot")) {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SnapshotFile::default(),
            Err(e) => return Err(e.into()),
        };

        let log_path = dir.join("raft_log");
        let mut entries = Vec::new();
        let mut valid_len = 0usize;
        if let Ok(bytes) = fs::read(&log_path) {
            let mut pos = 0usize;
            while pos + 8 <= bytes.len() {
                let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as usize;
                let crc = u32::from_le_bytes([bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]]);
                let start = pos + 8;
                if start + len > bytes.len() || crc32(&bytes[start..start + len]) != crc {
                    tracing::warn!("Raft log has a torn record at byte {}, dropping the tail", pos);
                    break;
                }
                let entry: LogEntry = bincode::deserialize(&bytes[start..start + len])?;
                if entry.index > snapshot.last_index {
                    entries.push(entry);
                }
                pos = start + len;
                valid_len = pos;
            }
        }

        let log_file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        log_file.set_len(valid_len as u64)?;

        tracing::info!(
            "Raft storage loaded: term {}, snapshot at {}, {} log entries",
            hard_state.term,
            snapshot.last_index,
            entries.len()
        );
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            log_file: Some(log_file),
            hard_state,
            snapshot,
            entries,
        })
    }

    pub fn save_hard_state(&mut self, state: HardState) -> Result<()> {
        if state == self.hard_state {
            return Ok(());
        }
        if let Some(dir) = &self.dir {
            write_atomic(&dir.join("raft_state"), &bincode::serialize(&state)?)?;
        }
        self.hard_state = state;
        Ok(())
    }

    fn encode(entry: &LogEntry) -> Result<Vec<u8>> {
        let body = bincode::serialize(entry)?;
        let mut record = Vec::with_capacity(body.len() + 8);
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32(&body).to_le_bytes());
        record.extend_from_slice(&body);
        Ok(record)
    }

    pub fn append(&mut self, new: &[LogEntry]) -> Result<()> {
        if let Some(file) = self.log_file.as_mut() {
            let mut buf = Vec::new();
            for entry in new {
                buf.extend(Self::encode(entry)?);
            }
            file.write_all(&buf)?;
            file.sync_data()?;
        }
        self.entries.extend_from_slice(new);
        Ok(())
    }

    /// Drop entries at and after `index`.
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        let keep = index.saturating_sub(self.snapshot.last_index + 1) as usize;
        self.entries.truncate(keep);
        self.rewrite()
    }

    /// Install a snapshot and discard the entries it covers.
    pub fn install_snapshot(&mut self, snapshot: SnapshotFile) -> Result<()> {
        let last = snapshot.last_index;
        let last_term = snapshot.last_term;
        let matching = self
            .entries
            .iter()
            .position(|e| e.index == last && e.term == last_term);
        match matching {
            Some(pos) => {
                self.entries.drain(..=pos);
            }
            None => self.entries.clear(),
        }
        if let Some(dir) = &self.dir {
            write_atomic(&dir.join("raft_snapshot"), &bincode::serialize(&snapshot)?)?;
        }
        self.snapshot = snapshot;
        self.rewrite()
    }

    fn rewrite(&mut self) -> Result<()> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };
        let path = dir.join("raft_log");
        let tmp = dir.join("raft_log.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in &self.entries {
                writer.write_all(&Self::encode(entry)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.log_file = Some(OpenOptions::new().append(true).open(&path)?);
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            data: vec![index as u8; 3],
        }
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        {
            let mut log = RaftLog::open(dir.path()).unwrap();
            log.save_hard_state(HardState {
                term: 3,
                voted_for: Some("m1".into()),
            })
            .unwrap();
            log.append(&[entry(1, 1), entry(1, 2), entry(3, 3)]).unwrap();
        }
        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.hard_state.term, 3);
        assert_eq!(log.hard_state.voted_for.as_deref(), Some("m1"));
        assert_eq!(log.entries, vec![entry(1, 1), entry(1, 2), entry(3, 3)]);
    }

    #[test]
    fn test_truncate_and_snapshot() {
        let dir = tempdir().unwrap();
        {
            let mut log = RaftLog::open(dir.path()).unwrap();
            log.append(&(1..=6).map(|i| entry(1, i)).collect::<Vec<_>>()).unwrap();
            log.truncate_from(5).unwrap();
            assert_eq!(log.entries.len(), 4);
            log.append(&[entry(2, 5)]).unwrap();
            log.install_snapshot(SnapshotFile {
                last_index: 3,
                last_term: 1,
                data: b"state".to_vec(),
            })
            .unwrap();
            assert_eq!(log.entries, vec![entry(1, 4), entry(2, 5)]);
        }
        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.snapshot.last_index, 3);
        assert_eq!(log.snapshot.data, b"state");
        assert_eq!(log.entries, vec![entry(1, 4), entry(2, 5)]);
    }

    #[test]
    fn test_torn_tail_dropped() {
        let dir = tempdir().unwrap();
        {
            let mut log = RaftLog::open(dir.path()).unwrap();
            log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        }
        let path = dir.path().join("raft_log");
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, &bytes).unwrap();

        let mut log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.entries, vec![entry(1, 1)]);
        log.append(&[entry(2, 2)]).unwrap();
        drop(log);
        let log = RaftLog::open(dir.path()).unwrap();
        assert_eq!(log.entries, vec![entry(1, 1), entry(2, 2)]);
    }
}
