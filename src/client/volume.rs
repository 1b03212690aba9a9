//! Volume server client: needle data path and admin endpoints

use crate::client::{check_response, http_client};
use crate::common::{
    encode_query_value, normalize_url, EcCopyRequest, EcRebuildRequest, EcVolumeInfo, FileId, Result, ShardAck,
    ShardId, ShardIdsRequest, UploadResult, VolumeId, VolumeVerifyReport,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeResponse {
    pub size: u64,
}

#[derive(Clone)]
pub struct VolumeClient {
    client: reqwest::Client,
}

impl VolumeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: String,
        body: Option<&B>,
    ) -> Result<T> {
        let mut req = self.client.post(url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = check_response(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn get_bytes(&self, url: String) -> Result<Vec<u8>> {
        let resp = check_response(self.client.get(url).send().await?).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    // === Data path ===

    pub async fn upload(&self, server: &str, fid: &FileId, data: Vec<u8>) -> Result<UploadResult> {
        self.upload_inner(server, fid, data, false).await
    }

    /// Write to one replica only, without further forwarding
    pub async fn upload_replica(&self, server: &str, fid: &FileId, data: Vec<u8>) -> Result<UploadResult> {
        self.upload_inner(server, fid, data, true).await
    }

    async fn upload_inner(
        &self,
        server: &str,
        fid: &FileId,
        data: Vec<u8>,
        replicate: bool,
    ) -> Result<UploadResult> {
        let mut url = format!("{}/{}", normalize_url(server), fid);
        if replicate {
            url.push_str("?type=replicate");
        }
        let resp = self
            .client
            .post(url)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        Ok(check_response(resp).await?.json().await?)
    }

    pub async fn read(&self, server: &str, fid: &FileId) -> Result<Vec<u8>> {
        self.get_bytes(format!("{}/{}", normalize_url(server), fid)).await
    }

    pub async fn delete(&self, server: &str, fid: &FileId, replicate: bool) -> Result<()> {
        let mut url = format!("{}/{}", normalize_url(server), fid);
        if replicate {
            url.push_str("?type=replicate");
        }
        check_response(self.client.delete(url).send().await?).await?;
        Ok(())
    }

    // === Volume admin ===

    fn admin(server: &str, path: &str) -> String {
        format!("{}/admin/{}", normalize_url(server), path)
    }

    pub async fn allocate_volume(&self, server: &str, vid: VolumeId, replication: &str) -> Result<()> {
        let url = Self::admin(server, &format!("volume/{}/allocate?replication={}", vid, encode_query_value(replication)));
        let _: serde_json::Value = self.post_json::<(), _>(url, None).await?;
        Ok(())
    }

    pub async fn mark_readonly(&self, server: &str, vid: VolumeId) -> Result<u64> {
        let url = Self::admin(server, &format!("volume/{}/readonly", vid));
        let resp: SizeResponse = self.post_json::<(), _>(url, None).await?;
        Ok(resp.size)
    }

    pub async fn mark_writable(&self, server: &str, vid: VolumeId) -> Result<()> {
        let url = Self::admin(server, &format!("volume/{}/writable", vid));
        let _: serde_json::Value = self.post_json::<(), _>(url, None).await?;
        Ok(())
    }

    pub async fn delete_volume(&self, server: &str, vid: VolumeId) -> Result<()> {
        let url = Self::admin(server, &format!("volume/{}", vid));
        check_response(self.client.delete(url).send().await?).await?;
        Ok(())
    }

    pub async fn fetch_volume(&self, server: &str, vid: VolumeId) -> Result<Vec<u8>> {
        self.get_bytes(Self::admin(server, &format!("volume/{}/dat", vid))).await
    }

    /// Have `target` pull volume `vid` from `source`
    pub async fn copy_volume(&self, target: &str, vid: VolumeId, source: &str) -> Result<()> {
        let url = Self::admin(
            target,
            &format!(
                "volume/{}/copy?source={}",
                vid,
                encode_query_value(&normalize_url(source))
            ),
        );
        let _: serde_json::Value = self.post_json::<(), _>(url, None).await?;
        Ok(())
    }

    pub async fn vacuum_volume(&self, server: &str, vid: VolumeId) -> Result<u64> {
        let url = Self::admin(server, &format!("volume/{}/vacuum", vid));
        let resp: SizeResponse = self.post_json::<(), _>(url, None).await?;
        Ok(resp.size)
    }

    pub async fn verify(&self, server: &str) -> Result<Vec<VolumeVerifyReport>> {
        let resp = check_response(self.client.get(Self::admin(server, "verify")).send().await?).await?;
        Ok(resp.json().await?)
    }

    // === Erasure coding ===

    pub async fn generate_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<EcVolumeInfo> {
        let url = Self::admin(
            server,
            &format!("ec/{}/generate?data={}&parity={}", vid, data_shards, parity_shards),
        );
        self.post_json::<(), _>(url, None).await
    }

    pub async fn fetch_ec_file(&self, server: &str, vid: VolumeId, name: &str) -> Result<Vec<u8>> {
        self.get_bytes(Self::admin(server, &format!("ec/{}/file/{}", vid, name)))
            .await
    }

    pub async fn read_shard(
        &self,
        server: &str,
        vid: VolumeId,
        shard_id: ShardId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        self.get_bytes(Self::admin(
            server,
            &format!("ec/{}/shard/{}?offset={}&size={}", vid, shard_id, offset, size),
        ))
        .await
    }

    pub async fn copy_ec_shards(&self, target: &str, vid: VolumeId, req: &EcCopyRequest) -> Result<Vec<ShardAck>> {
        self.post_json(Self::admin(target, &format!("ec/{}/copy", vid)), Some(req))
            .await
    }

    pub async fn delete_ec_shards(&self, server: &str, vid: VolumeId, shard_ids: &[ShardId]) -> Result<()> {
        let req = ShardIdsRequest {
            shard_ids: shard_ids.to_vec(),
        };
        let _: serde_json::Value = self
            .post_json(Self::admin(server, &format!("ec/{}/delete", vid)), Some(&req))
            .await?;
        Ok(())
    }

    pub async fn drop_ec_staging(&self, server: &str, vid: VolumeId) -> Result<()> {
        let url = Self::admin(server, &format!("ec/{}/staging", vid));
        check_response(self.client.delete(url).send().await?).await?;
        Ok(())
    }

    pub async fn rebuild_ec_shards(
        &self,
        server: &str,
        vid: VolumeId,
        req: &EcRebuildRequest,
    ) -> Result<Vec<ShardAck>> {
        self.post_json(Self::admin(server, &format!("ec/{}/rebuild", vid)), Some(req))
            .await
    }
}
