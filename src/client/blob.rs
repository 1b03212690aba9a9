//! Blob client: assign, upload, read and delete needles by file id

use crate::client::{MasterClient, VolumeClient};
use crate::common::{AssignRequest, Error, FileId, LookupResponse, Result, UploadResult};
use std::sync::Arc;

#[derive(Clone)]
pub struct BlobClient {
    master: Arc<MasterClient>,
    volume: VolumeClient,
}

impl BlobClient {
    pub fn new(master: Arc<MasterClient>, volume: VolumeClient) -> Self {
        Self { master, volume }
    }

    pub fn master(&self) -> &Arc<MasterClient> {
        &self.master
    }

    /// Assign a file id and upload `data` to its primary.
    pub async fn put(&self, data: Vec<u8>, replication: Option<&str>) -> Result<UploadResult> {
        let assignment = self
            .master
            .assign(&AssignRequest {
                count: 1,
                size: data.len() as u64,
                replication: replication.map(str::to_string),
                data_center: None,
            })
            .await?;
        let fid = assignment.file_id()?;
        tracing::debug!("Uploading {} bytes as {} to {}", data.len(), fid, assignment.url);
        self.volume.upload(&assignment.url, &fid, data).await
    }

    pub async fn get(&self, fid: &FileId) -> Result<Vec<u8>> {
        let lookup = self.master.lookup_cached(fid.volume_id).await?;
        let mut last_err = Error::NotFound(format!("no location for {}", fid));
        for server in read_servers(&lookup) {
            match self.volume.read(&server, fid).await {
                Ok(data) => return Ok(data),
                Err(Error::NotFound(msg)) => last_err = Error::NotFound(msg),
                Err(e) => {
                    tracing::warn!("Read of {} from {} failed: {}", fid, server, e);
                    last_err = e;
                }
            }
        }
        self.master.invalidate(fid.volume_id);
        Err(last_err)
    }

    /// Delete through any holder; it forwards to the other copies.
    pub async fn delete(&self, fid: &FileId) -> Result<()> {
        let lookup = self.master.lookup_cached(fid.volume_id).await?;
        let mut last_err = Error::NotFound(format!("no location for {}", fid));
        for server in read_servers(&lookup) {
            match self.volume.delete(&server, fid, false).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = e,
            }
        }
        self.master.invalidate(fid.volume_id);
        Err(last_err)
    }
}

/// Replica holders first; for EC volumes every shard holder can serve reads.
fn read_servers(lookup: &LookupResponse) -> Vec<String> {
    let mut servers: Vec<String> = lookup.locations.iter().map(|l| l.url.clone()).collect();
    for shard in &lookup.ec_shards {
        for location in &shard.locations {
            if !servers.contains(&location.url) {
                servers.push(location.url.clone());
            }
        }
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EcShardLocation, Location};

    fn location(url: &str) -> Location {
        Location {
            url: url.into(),
            public_url: url.into(),
            data_center: "dc1".into(),
            rack: "r1".into(),
        }
    }

    #[test]
    fn test_read_servers_dedup_shard_holders() {
        let lookup = LookupResponse {
            volume_id: 3,
            locations: vec![],
            ec_shards: vec![
                EcShardLocation {
                    shard_id: 0,
                    locations: vec![location("http://a")],
                },
                EcShardLocation {
                    shard_id: 1,
                    locations: vec![location("http://b"), location("http://a")],
                },
            ],
            data_shards: 10,
            parity_shards: 4,
        };
        assert_eq!(read_servers(&lookup), vec!["http://a", "http://b"]);
    }
}
