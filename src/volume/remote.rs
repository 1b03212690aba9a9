//! Reading EC shard ranges held by other volume servers

use crate::client::{MasterClient, VolumeClient};
use crate::common::{Error, Result, ShardId, VolumeId};
use crate::ec::ShardReader;
use async_trait::async_trait;
use std::sync::Arc;

/// Finds shard holders through the master and reads from them over HTTP.
pub struct RemoteShardReader {
    master: Arc<MasterClient>,
    client: VolumeClient,
    self_url: String,
}

impl RemoteShardReader {
    pub fn new(master: Arc<MasterClient>, client: VolumeClient, self_url: String) -> Self {
        Self {
            master,
            client,
            self_url,
        }
    }
}

#[async_trait]
impl ShardReader for RemoteShardReader {
    async fn read_shard(
        &self,
        volume_id: VolumeId,
        shard_id: ShardId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        let lookup = self.master.lookup_cached(volume_id).await?;
        let holders: Vec<String> = lookup
            .ec_shards
            .iter()
            .filter(|s| s.shard_id == shard_id)
            .flat_map(|s| s.locations.iter().map(|l| l.url.clone()))
            .filter(|url| *url != self.self_url)
            .collect();
        if holders.is_empty() {
            return Err(Error::NotFound(format!(
                "no holder of shard {} of volume {}",
                shard_id, volume_id
            )));
        }

        let mut last_err = None;
        for holder in holders {
            match self
                .client
                .read_shard(&holder, volume_id, shard_id, offset, size)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    tracing::debug!("Shard {} of volume {} on {} failed: {}", shard_id, volume_id, holder, e);
                    last_err = Some(e);
                }
            }
        }
        self.master.invalidate(volume_id);
        Err(last_err.unwrap_or_else(|| Error::NotFound(format!("shard {}", shard_id))))
    }
}
