//! Erasure coding engine
//!
//! - `codec`: systematic Reed-Solomon over GF(2^8)
//! - `layout`: volume ↔ shard files, intervals and `.ecx`/`.vif`
//! - `job`: master-driven conversion of a volume into placed shards
//! - `rebuild`: regenerating shards whose holders are gone
//! - `scanner`: background selection of volumes to convert

pub mod codec;
pub mod job;
pub mod layout;
pub mod rebuild;
pub mod scanner;

pub use codec::ReedSolomon;
pub use job::{EcJobReport, EcJobRunner, Reconciled};
pub use rebuild::{EcRebuilder, RebuildReport};
pub use layout::{EcLayout, EcxEntry, Interval};

use crate::common::{Result, ShardId, VolumeId};
use async_trait::async_trait;

/// Reads a byte range of a shard held by another server.
#[async_trait]
pub trait ShardReader: Send + Sync {
    async fn read_shard(
        &self,
        volume_id: VolumeId,
        shard_id: ShardId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>>;
}
