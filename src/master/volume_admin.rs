//! Master → volume server control operations
//!
//! The EC job, repair and vacuum talk to volume servers only through this
//! trait, so they can run against in-process fakes.

use crate::client::VolumeClient;
use crate::common::{
    EcCopyRequest, EcRebuildRequest, EcVolumeInfo, Result, ShardAck, ShardId, VolumeId,
    VolumeVerifyReport,
};
use async_trait::async_trait;

#[async_trait]
pub trait VolumeAdmin: Send + Sync {
    async fn allocate_volume(&self, server: &str, vid: VolumeId, replication: &str) -> Result<()>;

    /// Quiescence barrier: returns the committed size of the volume
    async fn mark_readonly(&self, server: &str, vid: VolumeId) -> Result<u64>;

    async fn mark_writable(&self, server: &str, vid: VolumeId) -> Result<()>;

    async fn delete_volume(&self, server: &str, vid: VolumeId) -> Result<()>;

    async fn copy_volume(&self, target: &str, vid: VolumeId, source: &str) -> Result<()>;

    /// Returns the bytes reclaimed
    async fn vacuum_volume(&self, server: &str, vid: VolumeId) -> Result<u64>;

    async fn verify(&self, server: &str) -> Result<Vec<VolumeVerifyReport>>;

    async fn generate_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<EcVolumeInfo>;

    async fn copy_ec_shards(
        &self,
        target: &str,
        vid: VolumeId,
        req: EcCopyRequest,
    ) -> Result<Vec<ShardAck>>;

    async fn delete_ec_shards(&self, server: &str, vid: VolumeId, shard_ids: &[ShardId]) -> Result<()>;

    async fn drop_ec_staging(&self, server: &str, vid: VolumeId) -> Result<()>;

    async fn rebuild_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        req: EcRebuildRequest,
    ) -> Result<Vec<ShardAck>>;
}

#[async_trait]
impl VolumeAdmin for VolumeClient {
    async fn allocate_volume(&self, server: &str, vid: VolumeId, replication: &str) -> Result<()> {
        VolumeClient::allocate_volume(self, server, vid, replication).await
    }

    async fn mark_readonly(&self, server: &str, vid: VolumeId) -> Result<u64> {
        VolumeClient::mark_readonly(self, server, vid).await
    }

    async fn mark_writable(&self, server: &str, vid: VolumeId) -> Result<()> {
        VolumeClient::mark_writable(self, server, vid).await
    }

    async fn delete_volume(&self, server: &str, vid: VolumeId) -> Result<()> {
        VolumeClient::delete_volume(self, server, vid).await
    }

    async fn copy_volume(&self, target: &str, vid: VolumeId, source: &str) -> Result<()> {
        VolumeClient::copy_volume(self, target, vid, source).await
    }

    async fn vacuum_volume(&self, server: &str, vid: VolumeId) -> Result<u64> {
        VolumeClient::vacuum_volume(self, server, vid).await
    }

    async fn verify(&self, server: &str) -> Result<Vec<VolumeVerifyReport>> {
        VolumeClient::verify(self, server).await
    }

    async fn generate_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<EcVolumeInfo> {
        VolumeClient::generate_ec_shards(self, server, vid, data_shards, parity_shards).await
    }

    async fn copy_ec_shards(
        &self,
        target: &str,
        vid: VolumeId,
        req: EcCopyRequest,
    ) -> Result<Vec<ShardAck>> {
        VolumeClient::copy_ec_shards(self, target, vid, &req).await
    }

    async fn delete_ec_shards(&self, server: &str, vid: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        VolumeClient::delete_ec_shards(self, server, vid, shard_ids).await
    }

    async fn drop_ec_staging(&self, server: &str, vid: VolumeId) -> Result<()> {
        VolumeClient::drop_ec_staging(self, server, vid).await
    }

    async fn rebuild_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        req: EcRebuildRequest,
    ) -> Result<Vec<ShardAck>> {
        VolumeClient::rebuild_ec_shards(self, server, vid, &req).await
    }
}
