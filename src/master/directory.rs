//! Cluster directory: the Raft-replicated state machine of the master
//!
//! Holds volume ids, per-volume lifecycle and EC shard maps. Only
//! committed commands change it, so every master applies the same
//! sequence and followers can serve (possibly stale) reads.

use crate::common::{EcVolumeInfo, Error, Result, ShardId, VolumeId};
use crate::master::raft_node::{RaftNode, StateMachine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeLifecycle {
    Writable,
    ReadOnly,
    EcPending,
    EcEncoded,
    SourceDeleted,
}

impl VolumeLifecycle {
    pub fn is_ec(&self) -> bool {
        matches!(self, VolumeLifecycle::EcEncoded | VolumeLifecycle::SourceDeleted)
    }
}

impl std::fmt::Display for VolumeLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeLifecycle::Writable => "writable",
            VolumeLifecycle::ReadOnly => "read_only",
            VolumeLifecycle::EcPending => "ec_pending",
            VolumeLifecycle::EcEncoded => "ec_encoded",
            VolumeLifecycle::SourceDeleted => "source_deleted",
        };
        f.write_str(s)
    }
}

/// Shard map of an EC volume: shard id → holder urls
pub type ShardPlacement = BTreeMap<ShardId, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcRecord {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub placement: ShardPlacement,
    /// Known once the shards are committed
    pub info: Option<EcVolumeInfo>,
}

impl EcRecord {
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub id: VolumeId,
    pub replication: String,
    pub state: VolumeLifecycle,
    /// Lifecycle to restore when a conversion is aborted
    pub state_before_ec: Option<VolumeLifecycle>,
    pub ec: Option<EcRecord>,
    /// Raft index of the last change
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Noop,
    /// Allocates `max_volume_id + 1`
    AllocateVolume { replication: String },
    /// Adopts a volume reported by a server that the directory doesn't know
    RegisterVolume {
        volume_id: VolumeId,
        replication: String,
        read_only: bool,
    },
    SetReadOnly { volume_id: VolumeId, read_only: bool },
    /// Reserves `count` needle keys above both the last reservation and
    /// `floor`, returns the first
    ReserveKeys { count: u64, floor: u64 },
    BeginEc {
        volume_id: VolumeId,
        data_shards: usize,
        parity_shards: usize,
        placement: ShardPlacement,
    },
    CommitEc {
        volume_id: VolumeId,
        info: EcVolumeInfo,
        placement: ShardPlacement,
    },
    AbortEc { volume_id: VolumeId },
    SourceDeleted { volume_id: VolumeId },
    UpdateEcPlacement {
        volume_id: VolumeId,
        placement: ShardPlacement,
    },
    RemoveVolume { volume_id: VolumeId },
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Command::Noop);
        }
        Ok(bincode::deserialize(data)?)
    }

    /// Replicate through Raft and return the apply result.
    pub async fn propose(&self, raft: &RaftNode) -> Result<Vec<u8>> {
        raft.propose(self.encode()?).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryState {
    pub max_volume_id: VolumeId,
    pub max_file_key: u64,
    pub volumes: BTreeMap<VolumeId, VolumeRecord>,
    pub applied_index: u64,
    /// Term of the last applied entry
    pub epoch: u64,
}

#[derive(Default)]
pub struct Directory {
    state: RwLock<DirectoryState>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, volume_id: VolumeId) -> Option<VolumeRecord> {
        self.state.read().volumes.get(&volume_id).cloned()
    }

    pub fn lifecycle(&self, volume_id: VolumeId) -> Option<VolumeLifecycle> {
        self.state.read().volumes.get(&volume_id).map(|v| v.state)
    }

    pub fn volumes(&self) -> Vec<VolumeRecord> {
        self.state.read().volumes.values().cloned().collect()
    }

    pub fn max_volume_id(&self) -> VolumeId {
        self.state.read().max_volume_id
    }

    pub fn max_file_key(&self) -> u64 {
        self.state.read().max_file_key
    }

    pub fn applied_index(&self) -> u64 {
        self.state.read().applied_index
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    pub fn export(&self) -> DirectoryState {
        self.state.read().clone()
    }

    /// Volumes that may receive new needles
    pub fn is_assignable(&self, volume_id: VolumeId) -> bool {
        self.lifecycle(volume_id) == Some(VolumeLifecycle::Writable)
    }

    fn apply_command(state: &mut DirectoryState, index: u64, cmd: Command) -> Result<Vec<u8>> {
        match cmd {
            Command::Noop => Ok(Vec::new()),
            Command::AllocateVolume { replication } => {
                let vid = state.max_volume_id + 1;
                state.max_volume_id = vid;
                state.volumes.insert(
                    vid,
                    VolumeRecord {
                        id: vid,
                        replication,
                        state: VolumeLifecycle::Writable,
                        state_before_ec: None,
                        ec: None,
                        version: index,
                    },
                );
                Ok(bincode::serialize(&vid)?)
            }
            Command::RegisterVolume {
                volume_id,
                replication,
                read_only,
            } => {
                state.max_volume_id = state.max_volume_id.max(volume_id);
                state.volumes.entry(volume_id).or_insert(VolumeRecord {
                    id: volume_id,
                    replication,
                    state: if read_only {
                        VolumeLifecycle::ReadOnly
                    } else {
                        VolumeLifecycle::Writable
                    },
                    state_before_ec: None,
                    ec: None,
                    version: index,
                });
                Ok(Vec::new())
            }
            Command::SetReadOnly {
                volume_id,
                read_only,
            } => {
                let rec = record(state, volume_id)?;
                rec.state = match (rec.state, read_only) {
                    (VolumeLifecycle::Writable | VolumeLifecycle::ReadOnly, true) => {
                        VolumeLifecycle::ReadOnly
                    }
                    (VolumeLifecycle::Writable | VolumeLifecycle::ReadOnly, false) => {
                        VolumeLifecycle::Writable
                    }
                    (other, _) => {
                        return Err(Error::InvalidState(format!(
                            "volume {} is {}",
                            volume_id, other
                        )))
                    }
                };
                rec.version = index;
                Ok(Vec::new())
            }
            Command::ReserveKeys { count, floor } => {
                let base = state.max_file_key.max(floor);
                let start = base + 1;
                state.max_file_key = base.saturating_add(count.max(1));
                Ok(bincode::serialize(&start)?)
            }
            Command::BeginEc {
                volume_id,
                data_shards,
                parity_shards,
                placement,
            } => {
                let rec = record(state, volume_id)?;
                match rec.state {
                    VolumeLifecycle::Writable | VolumeLifecycle::ReadOnly => {}
                    other => {
                        return Err(Error::InvalidState(format!(
                            "volume {} is {}, cannot start erasure coding",
                            volume_id, other
                        )))
                    }
                }
                rec.state_before_ec = Some(rec.state);
                rec.state = VolumeLifecycle::EcPending;
                rec.ec = Some(EcRecord {
                    data_shards,
                    parity_shards,
                    placement,
                    info: None,
                });
                rec.version = index;
                Ok(Vec::new())
            }
            Command::CommitEc {
                volume_id,
                info,
                placement,
            } => {
                let rec = record(state, volume_id)?;
                if rec.state != VolumeLifecycle::EcPending {
                    return Err(Error::InvalidState(format!(
                        "volume {} is {}, cannot commit shards",
                        volume_id, rec.state
                    )));
                }
                rec.state = VolumeLifecycle::EcEncoded;
                rec.ec = Some(EcRecord {
                    data_shards: info.data_shards,
                    parity_shards: info.parity_shards,
                    placement,
                    info: Some(info),
                });
                rec.version = index;
                Ok(Vec::new())
            }
            Command::AbortEc { volume_id } => {
                let rec = record(state, volume_id)?;
                if rec.state != VolumeLifecycle::EcPending {
                    return Err(Error::InvalidState(format!(
                        "volume {} is {}, nothing to abort",
                        volume_id, rec.state
                    )));
                }
                rec.state = rec.state_before_ec.take().unwrap_or(VolumeLifecycle::ReadOnly);
                rec.ec = None;
                rec.version = index;
                Ok(Vec::new())
            }
            Command::SourceDeleted { volume_id } => {
                let rec = record(state, volume_id)?;
                if rec.state != VolumeLifecycle::EcEncoded {
                    return Err(Error::InvalidState(format!(
                        "volume {} is {}, source cannot be retired",
                        volume_id, rec.state
                    )));
                }
                rec.state = VolumeLifecycle::SourceDeleted;
                rec.version = index;
                Ok(Vec::new())
            }
            Command::UpdateEcPlacement {
                volume_id,
                placement,
            } => {
                let rec = record(state, volume_id)?;
                let ec = match (&rec.state, rec.ec.as_mut()) {
                    (s, Some(ec)) if s.is_ec() => ec,
                    _ => {
                        return Err(Error::InvalidState(format!(
                            "volume {} is not erasure coded",
                            volume_id
                        )))
                    }
                };
                for (shard, holders) in placement {
                    ec.placement.insert(shard, holders);
                }
                rec.version = index;
                Ok(Vec::new())
            }
            Command::RemoveVolume { volume_id } => {
                state.volumes.remove(&volume_id);
                Ok(Vec::new())
            }
        }
    }
}

fn record(state: &mut DirectoryState, vid: VolumeId) -> Result<&mut VolumeRecord> {
    state
        .volumes
        .get_mut(&vid)
        .ok_or_else(|| Error::NotFound(format!("volume {}", vid)))
}

impl StateMachine for Directory {
    fn apply(&self, index: u64, term: u64, data: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.write();
        if term < state.epoch {
            return Err(Error::StaleTerm {
                term,
                current: state.epoch,
            });
        }
        state.applied_index = index;
        state.epoch = term;
        let cmd = Command::decode(data)?;
        tracing::debug!("Directory applying {:?} at index {}", cmd, index);
        Self::apply_command(&mut state, index, cmd)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&*self.state.read())?)
    }

    fn restore(&self, data: &[u8]) -> Result<()> {
        let restored: DirectoryState = bincode::deserialize(data)?;
        *self.state.write() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(dir: &Directory, index: u64, cmd: Command) -> Result<Vec<u8>> {
        dir.apply(index, 1, &cmd.encode().unwrap())
    }

    #[test]
    fn test_allocate_assigns_increasing_ids() {
        let dir = Directory::new();
        let a: VolumeId =
            bincode::deserialize(&apply(&dir, 1, Command::AllocateVolume { replication: "000".into() }).unwrap())
                .unwrap();
        let b: VolumeId =
            bincode::deserialize(&apply(&dir, 2, Command::AllocateVolume { replication: "001".into() }).unwrap())
                .unwrap();
        assert_eq!((a, b), (1, 2));
        assert!(dir.is_assignable(1));
        assert_eq!(dir.get(2).unwrap().replication, "001");
        assert_eq!(dir.applied_index(), 2);
    }

    #[test]
    fn test_ec_lifecycle_and_rollback() {
        let dir = Directory::new();
        apply(&dir, 1, Command::AllocateVolume { replication: "000".into() }).unwrap();
        apply(&dir, 2, Command::SetReadOnly { volume_id: 1, read_only: true }).unwrap();

        let begin = Command::BeginEc {
            volume_id: 1,
            data_shards: 10,
            parity_shards: 4,
            placement: ShardPlacement::new(),
        };
        apply(&dir, 3, begin.clone()).unwrap();
        assert_eq!(dir.lifecycle(1), Some(VolumeLifecycle::EcPending));
        assert!(!dir.is_assignable(1));

        // One conversion per volume
        assert!(matches!(apply(&dir, 4, begin), Err(Error::InvalidState(_))));

        apply(&dir, 5, Command::AbortEc { volume_id: 1 }).unwrap();
        let rec = dir.get(1).unwrap();
        assert_eq!(rec.state, VolumeLifecycle::ReadOnly);
        assert!(rec.ec.is_none());
        assert_eq!(rec.version, 5);
    }

    #[test]
    fn test_invalid_transitions() {
        let dir = Directory::new();
        apply(&dir, 1, Command::AllocateVolume { replication: "000".into() }).unwrap();
        assert!(apply(&dir, 2, Command::SourceDeleted { volume_id: 1 }).is_err());
        assert!(apply(&dir, 3, Command::AbortEc { volume_id: 1 }).is_err());
        assert!(matches!(
            apply(&dir, 4, Command::SetReadOnly { volume_id: 9, read_only: true }),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_stale_term_rejected() {
        let dir = Directory::new();
        dir.apply(1, 3, &[]).unwrap();
        assert_eq!(dir.epoch(), 3);
        assert!(matches!(dir.apply(2, 2, &[]), Err(Error::StaleTerm { .. })));
    }

    #[test]
    fn test_reserve_keys_respects_floor() {
        let dir = Directory::new();
        let first: u64 =
            bincode::deserialize(&apply(&dir, 1, Command::ReserveKeys { count: 10, floor: 0 }).unwrap())
                .unwrap();
        assert_eq!(first, 1);
        let second: u64 =
            bincode::deserialize(&apply(&dir, 2, Command::ReserveKeys { count: 10, floor: 500 }).unwrap())
                .unwrap();
        assert_eq!(second, 501);
        assert_eq!(dir.max_file_key(), 510);
    }

    #[test]
    fn test_snapshot_restore() {
        let dir = Directory::new();
        apply(&dir, 1, Command::AllocateVolume { replication: "010".into() }).unwrap();
        apply(&dir, 2, Command::ReserveKeys { count: 100, floor: 0 }).unwrap();
        let snap = dir.snapshot().unwrap();

        let other = Directory::new();
        other.restore(&snap).unwrap();
        assert_eq!(other.export(), dir.export());
        assert_eq!(other.max_file_key(), 100);
    }
}
