//! Where chunk bytes live

use crate::client::BlobClient;
use crate::common::{Error, FileId, Result, UploadResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn put(&self, data: Vec<u8>, replication: Option<&str>) -> Result<UploadResult>;
    async fn get(&self, fid: &str) -> Result<Vec<u8>>;
    async fn delete(&self, fid: &str) -> Result<()>;
}

#[async_trait]
impl BlobStorage for BlobClient {
    async fn put(&self, data: Vec<u8>, replication: Option<&str>) -> Result<UploadResult> {
        BlobClient::put(self, data, replication).await
    }

    async fn get(&self, fid: &str) -> Result<Vec<u8>> {
        let fid: FileId = fid.parse()?;
        BlobClient::get(self, &fid).await
    }

    async fn delete(&self, fid: &str) -> Result<()> {
        let fid: FileId = fid.parse()?;
        BlobClient::delete(self, &fid).await
    }
}

/// Blobs kept in process, for tests and local tools
#[derive(Default)]
pub struct MemoryBlobs {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    next_key: Mutex<u64>,
}

impl MemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    pub fn contains(&self, fid: &str) -> bool {
        self.blobs.lock().contains_key(fid)
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobs {
    async fn put(&self, data: Vec<u8>, _replication: Option<&str>) -> Result<UploadResult> {
        let key = {
            let mut next = self.next_key.lock();
            *next += 1;
            *next
        };
        let fid = FileId::new(1, key, 0x1234_5678).to_string();
        let result = UploadResult {
            fid: fid.clone(),
            size: data.len() as u64,
            etag: crate::common::blake3_hash(&data),
        };
        self.blobs.lock().insert(fid, data);
        Ok(result)
    }

    async fn get(&self, fid: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(fid)
            .cloned()
            .ok_or_else(|| Error::NotFound(fid.to_string()))
    }

    async fn delete(&self, fid: &str) -> Result<()> {
        self.blobs
            .lock()
            .remove(fid)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(fid.to_string()))
    }
}
