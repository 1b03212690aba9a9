//! Namespace operations over a metadata store and chunk storage
//!
//! Metadata mutations hold the namespace lock for their whole duration, so
//! readers never see half of a rename or a recursive delete. Chunk uploads
//! happen before the lock is taken; chunks a mutation stops referencing go
//! to the GC queue and are deleted in the background.

use crate::common::{Error, Result};
use crate::filer::blobs::BlobStorage;
use crate::filer::chunks::{compact_chunks, read_plan};
use crate::filer::entry::{is_within, normalize_path, split_path, Entry, FileChunk};
use crate::filer::store::FilerStore;
use chrono::Utc;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Chunks uploaded or fetched at once by one request
const TRANSFER_CONCURRENCY: usize = 4;
const LIST_PAGE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the content
    Overwrite,
    /// Write after the current end of the file
    Append,
    /// Write at a logical offset, shadowing what was there
    At(u64),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub deleted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilerStatus {
    pub chunk_size: usize,
    pub replication: Option<String>,
    pub gc_pending: usize,
}

pub struct Filer {
    store: Arc<dyn FilerStore>,
    blobs: Arc<dyn BlobStorage>,
    chunk_size: usize,
    replication: Option<String>,
    namespace: RwLock<()>,
    last_version: AtomicI64,
    gc_queue: Mutex<VecDeque<String>>,
    gc_notify: Notify,
}

impl Filer {
    pub fn new(
        store: Arc<dyn FilerStore>,
        blobs: Arc<dyn BlobStorage>,
        chunk_size: usize,
        replication: Option<String>,
    ) -> Self {
        Self {
            store,
            blobs,
            chunk_size: chunk_size.max(1),
            replication,
            namespace: RwLock::new(()),
            last_version: AtomicI64::new(0),
            gc_queue: Mutex::new(VecDeque::new()),
            gc_notify: Notify::new(),
        }
    }

    pub fn status(&self) -> FilerStatus {
        FilerStatus {
            chunk_size: self.chunk_size,
            replication: self.replication.clone(),
            gc_pending: self.gc_pending(),
        }
    }

    // === Metadata ===

    pub fn find_entry(&self, path: &str) -> Result<Entry> {
        let path = normalize_path(path)?;
        let _read = self.namespace.read();
        self.lookup(&path)?
            .ok_or_else(|| Error::NotFound(format!("no entry at {}", path)))
    }

    /// Create or replace an entry, creating missing parent directories.
    /// Creating an existing directory returns it unchanged.
    pub fn create_entry(&self, mut entry: Entry) -> Result<Entry> {
        entry.path = normalize_path(&entry.path)?;
        if entry.path == "/" {
            return Err(Error::InvalidArgument("cannot replace the root".into()));
        }
        let _write = self.namespace.write();
        self.ensure_parents(&entry.path)?;

        let mut garbage = Vec::new();
        match self.store.get(&entry.path)? {
            Some(existing) if existing.is_directory && entry.is_directory => return Ok(existing),
            Some(existing) if existing.is_directory => {
                return Err(Error::InvalidState(format!("{} is a directory", entry.path)))
            }
            Some(_) if entry.is_directory => {
                return Err(Error::InvalidState(format!("{} is a file", entry.path)))
            }
            Some(existing) => {
                entry.created_at = existing.created_at;
                let kept: HashSet<&str> = entry.chunks.iter().map(|c| c.fid.as_str()).collect();
                garbage.extend(
                    existing
                        .chunks
                        .into_iter()
                        .filter(|c| !kept.contains(c.fid.as_str()))
                        .map(|c| c.fid),
                );
            }
            None => {}
        }
        self.store.insert(entry.clone())?;
        self.store.flush()?;
        self.enqueue_garbage(garbage);
        Ok(entry)
    }

    pub fn mkdir(&self, path: &str) -> Result<Entry> {
        self.create_entry(Entry::directory(path))
    }

    pub fn list_directory(&self, dir: &str, start_after: &str, limit: usize) -> Result<Vec<Entry>> {
        let dir = normalize_path(dir)?;
        let _read = self.namespace.read();
        match self.lookup(&dir)? {
            Some(entry) if entry.is_directory => self.store.list(&dir, start_after, limit),
            Some(_) => Err(Error::InvalidArgument(format!("{} is not a directory", dir))),
            None => Err(Error::NotFound(format!("no entry at {}", dir))),
        }
    }

    /// Remove an entry. A non-empty directory needs `recursive`.
    /// Returns the number of entries removed.
    pub fn delete_entry(&self, path: &str, recursive: bool) -> Result<usize> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(Error::InvalidArgument("cannot delete the root".into()));
        }
        let _write = self.namespace.write();
        let entry = self
            .store
            .get(&path)?
            .ok_or_else(|| Error::NotFound(format!("no entry at {}", path)))?;

        let mut removed = vec![entry];
        if removed[0].is_directory {
            let descendants = self.descendants(&path)?;
            if !descendants.is_empty() && !recursive {
                return Err(Error::InvalidState(format!("directory {} is not empty", path)));
            }
            removed.extend(descendants);
        }

        let mut garbage = Vec::new();
        for entry in &removed {
            self.store.remove(&entry.path)?;
            garbage.extend(entry.chunks.iter().map(|c| c.fid.clone()));
        }
        self.store.flush()?;
        tracing::debug!("Deleted {} ({} entries)", path, removed.len());
        self.enqueue_garbage(garbage);
        Ok(removed.len())
    }

    /// Move an entry and everything below it. A file may replace a file;
    /// nothing may replace a directory.
    pub fn rename(&self, from: &str, to: &str) -> Result<Entry> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        if from == "/" || to == "/" {
            return Err(Error::InvalidArgument("cannot rename the root".into()));
        }
        if from == to {
            return self.find_entry(&from);
        }
        if is_within(&to, &from) {
            return Err(Error::InvalidArgument(format!(
                "cannot move {} into itself",
                from
            )));
        }

        let _write = self.namespace.write();
        let source = self
            .store
            .get(&from)?
            .ok_or_else(|| Error::NotFound(format!("no entry at {}", from)))?;

        let mut garbage = Vec::new();
        if let Some(existing) = self.store.get(&to)? {
            if existing.is_directory || source.is_directory {
                return Err(Error::InvalidState(format!("{} already exists", to)));
            }
            garbage.extend(existing.chunks.into_iter().map(|c| c.fid));
            self.store.remove(&to)?;
        }
        self.ensure_parents(&to)?;

        let descendants = if source.is_directory {
            self.descendants(&from)?
        } else {
            Vec::new()
        };
        for mut entry in descendants {
            self.store.remove(&entry.path)?;
            entry.path = format!("{}{}", to, &entry.path[from.len()..]);
            self.store.insert(entry)?;
        }
        self.store.remove(&from)?;
        let moved = Entry {
            path: to.clone(),
            modified_at: Utc::now(),
            ..source
        };
        self.store.insert(moved.clone())?;
        self.store.flush()?;
        tracing::debug!("Renamed {} to {}", from, to);
        self.enqueue_garbage(garbage);
        Ok(moved)
    }

    // === Content ===

    /// Store `data` as chunks of at most `chunk_size` bytes and attach them
    /// to the file at `path`, creating it if needed.
    pub async fn write_file(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: WriteMode,
        mime: Option<String>,
    ) -> Result<Entry> {
        let path = normalize_path(path)?;
        if self.find_entry(&path).map(|e| e.is_directory).unwrap_or(false) || path == "/" {
            return Err(Error::InvalidState(format!("{} is a directory", path)));
        }

        let uploaded = self.upload_chunks(data).await?;
        let committed = self.commit_chunks(&path, uploaded.clone(), mode, mime);
        if committed.is_err() {
            self.enqueue_garbage(uploaded.into_iter().map(|c| c.fid).collect());
        }
        committed
    }

    /// Upload chunks with offsets relative to the start of `data`.
    async fn upload_chunks(&self, data: Vec<u8>) -> Result<Vec<FileChunk>> {
        let version = self.next_version();
        let replication = self.replication.as_deref();
        let pieces: Vec<(u64, Vec<u8>)> = data
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(i, piece)| ((i * self.chunk_size) as u64, piece.to_vec()))
            .collect();

        let results: Vec<Result<FileChunk>> = stream::iter(pieces)
            .map(|(offset, piece)| async move {
                let size = piece.len() as u64;
                let uploaded = self.blobs.put(piece, replication).await?;
                Ok::<_, Error>(FileChunk {
                    fid: uploaded.fid,
                    offset,
                    size,
                    version,
                    etag: uploaded.etag,
                })
            })
            .buffered(TRANSFER_CONCURRENCY)
            .collect()
            .await;

        let mut chunks = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) => {
                tracing::warn!("Chunk upload failed: {}", e);
                self.enqueue_garbage(chunks.into_iter().map(|c| c.fid).collect());
                Err(e)
            }
            None => Ok(chunks),
        }
    }

    fn commit_chunks(
        &self,
        path: &str,
        mut chunks: Vec<FileChunk>,
        mode: WriteMode,
        mime: Option<String>,
    ) -> Result<Entry> {
        let _write = self.namespace.write();
        self.ensure_parents(path)?;
        let existing = self.store.get(path)?;
        if existing.as_ref().is_some_and(|e| e.is_directory) {
            return Err(Error::InvalidState(format!("{} is a directory", path)));
        }

        let mut garbage = Vec::new();
        let mut entry = match existing {
            None => {
                if let WriteMode::At(offset) = mode {
                    shift(&mut chunks, offset);
                }
                Entry::file(path, chunks)
            }
            Some(mut entry) => {
                match mode {
                    WriteMode::Overwrite => {
                        garbage.extend(entry.chunks.drain(..).map(|c| c.fid));
                        entry.chunks = chunks;
                    }
                    WriteMode::Append => {
                        shift(&mut chunks, entry.size());
                        entry.chunks.extend(chunks);
                    }
                    WriteMode::At(offset) => {
                        shift(&mut chunks, offset);
                        entry.chunks.extend(chunks);
                        let (live, hidden) = compact_chunks(std::mem::take(&mut entry.chunks));
                        entry.chunks = live;
                        garbage.extend(hidden.into_iter().map(|c| c.fid));
                    }
                }
                entry.modified_at = Utc::now();
                entry
            }
        };
        if mime.is_some() {
            entry.mime = mime;
        }
        self.store.insert(entry.clone())?;
        self.store.flush()?;
        self.enqueue_garbage(garbage);
        Ok(entry)
    }

    /// Read `len` bytes at `offset`; `None` reads to the end. Ranges no chunk
    /// covers read as zeros.
    pub async fn read_file(&self, path: &str, offset: u64, len: Option<u64>) -> Result<Vec<u8>> {
        let entry = self.find_entry(path)?;
        if entry.is_directory {
            return Err(Error::InvalidArgument(format!("{} is a directory", entry.path)));
        }
        let size = entry.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = len.map_or(size, |len| offset.saturating_add(len).min(size));
        let views = read_plan(&entry.chunks, offset, end - offset);

        let mut fids: Vec<String> = views.iter().map(|v| v.fid.clone()).collect();
        fids.sort();
        fids.dedup();
        let fetched: HashMap<String, Vec<u8>> = stream::iter(fids)
            .map(|fid| async move {
                let data = self.blobs.get(&fid).await?;
                Ok::<_, Error>((fid, data))
            })
            .buffer_unordered(TRANSFER_CONCURRENCY)
            .try_collect()
            .await?;

        let mut buf = vec![0u8; (end - offset) as usize];
        for view in views {
            let data = fetched
                .get(&view.fid)
                .ok_or_else(|| Error::Internal(format!("chunk {} not fetched", view.fid)))?;
            let from = view.offset_in_chunk as usize;
            let to = from + view.size as usize;
            if data.len() < to {
                return Err(Error::Corrupt(format!(
                    "chunk {} of {} has {} bytes, expected at least {}",
                    view.fid,
                    entry.path,
                    data.len(),
                    to
                )));
            }
            let at = (view.logical_offset - offset) as usize;
            buf[at..at + view.size as usize].copy_from_slice(&data[from..to]);
        }
        Ok(buf)
    }

    // === Garbage collection ===

    pub fn gc_pending(&self) -> usize {
        self.gc_queue.lock().len()
    }

    fn enqueue_garbage(&self, fids: Vec<String>) {
        if fids.is_empty() {
            return;
        }
        self.gc_queue.lock().extend(fids);
        self.gc_notify.notify_one();
    }

    /// Delete every queued chunk once. Failed deletes stay queued.
    pub async fn collect_garbage(&self) -> GcReport {
        let batch: Vec<String> = self.gc_queue.lock().drain(..).collect();
        let mut report = GcReport::default();
        let mut retry = Vec::new();
        for fid in batch {
            match self.blobs.delete(&fid).await {
                Ok(()) | Err(Error::NotFound(_)) => report.deleted += 1,
                Err(e) => {
                    tracing::warn!("Cannot delete chunk {}: {}", fid, e);
                    report.failed += 1;
                    retry.push(fid);
                }
            }
        }
        if !retry.is_empty() {
            self.gc_queue.lock().extend(retry);
        }
        if report.deleted > 0 {
            tracing::debug!("GC deleted {} chunks", report.deleted);
        }
        report
    }

    /// Background GC: runs when garbage is queued, and every `interval` to
    /// retry failures.
    pub fn start_gc(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let filer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = filer.gc_notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if filer.gc_pending() > 0 {
                    filer.collect_garbage().await;
                }
            }
        })
    }

    // === Helpers ===

    fn lookup(&self, path: &str) -> Result<Option<Entry>> {
        if path == "/" {
            return Ok(Some(Entry::directory("/")));
        }
        self.store.get(path)
    }

    /// Create the missing ancestors of `path`. Caller holds the write lock.
    fn ensure_parents(&self, path: &str) -> Result<()> {
        let (parent, _) = split_path(path);
        if parent == "/" {
            return Ok(());
        }
        match self.store.get(parent)? {
            Some(entry) if entry.is_directory => Ok(()),
            Some(_) => Err(Error::InvalidState(format!("{} is a file", parent))),
            None => {
                self.ensure_parents(parent)?;
                self.store.insert(Entry::directory(parent))
            }
        }
    }

    fn descendants(&self, dir: &str) -> Result<Vec<Entry>> {
        let mut found = Vec::new();
        let mut pending = vec![dir.to_string()];
        while let Some(current) = pending.pop() {
            let mut after = String::new();
            loop {
                let page = self.store.list(&current, &after, LIST_PAGE)?;
                let last_page = page.len() < LIST_PAGE;
                if let Some(last) = page.last() {
                    after = last.name().to_string();
                }
                for entry in page {
                    if entry.is_directory {
                        pending.push(entry.path.clone());
                    }
                    found.push(entry);
                }
                if last_page {
                    break;
                }
            }
        }
        Ok(found)
    }

    /// Strictly increasing chunk version, in nanoseconds since the epoch
    fn next_version(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last_version.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_version.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

fn shift(chunks: &mut [FileChunk], by: u64) {
    for chunk in chunks {
        chunk.offset += by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filer::blobs::MemoryBlobs;
    use crate::filer::store::MemoryStore;

    fn filer(chunk_size: usize) -> (Arc<Filer>, Arc<MemoryBlobs>) {
        let blobs = Arc::new(MemoryBlobs::new());
        let filer = Filer::new(
            Arc::new(MemoryStore::in_memory()),
            blobs.clone(),
            chunk_size,
            None,
        );
        (Arc::new(filer), blobs)
    }

    #[tokio::test]
    async fn test_write_read_chunked() {
        let (filer, blobs) = filer(4);
        let entry = filer
            .write_file("/docs/a.txt", b"hello world".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();
        assert_eq!(entry.chunks.len(), 3);
        assert_eq!(entry.size(), 11);
        assert_eq!(blobs.len(), 3);
        assert!(filer.find_entry("/docs").unwrap().is_directory);

        assert_eq!(filer.read_file("/docs/a.txt", 0, None).await.unwrap(), b"hello world");
        assert_eq!(filer.read_file("/docs/a.txt", 3, Some(5)).await.unwrap(), b"lo wo");
        assert!(filer.read_file("/docs/a.txt", 20, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_queues_old_chunks() {
        let (filer, blobs) = filer(4);
        filer
            .write_file("/f", b"12345678".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();
        filer
            .write_file("/f", b"abc".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();
        assert_eq!(filer.gc_pending(), 2);
        let report = filer.collect_garbage().await;
        assert_eq!(report.deleted, 2);
        assert_eq!(blobs.len(), 1);
        assert_eq!(filer.read_file("/f", 0, None).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_append_and_write_at() {
        let (filer, _) = filer(16);
        filer
            .write_file("/log", b"aaaa".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();
        filer
            .write_file("/log", b"bbbb".to_vec(), WriteMode::Append, None)
            .await
            .unwrap();
        filer
            .write_file("/log", b"XY".to_vec(), WriteMode::At(3), None)
            .await
            .unwrap();
        assert_eq!(filer.read_file("/log", 0, None).await.unwrap(), b"aaaXYbbb");

        // Fully hidden chunk is collected
        filer
            .write_file("/log", b"12345678".to_vec(), WriteMode::At(0), None)
            .await
            .unwrap();
        assert_eq!(filer.find_entry("/log").unwrap().chunks.len(), 1);
        assert_eq!(filer.gc_pending(), 3);
    }

    #[tokio::test]
    async fn test_write_at_leaves_hole() {
        let (filer, _) = filer(16);
        filer
            .write_file("/sparse", b"zz".to_vec(), WriteMode::At(3), None)
            .await
            .unwrap();
        assert_eq!(filer.read_file("/sparse", 0, None).await.unwrap(), b"\0\0\0zz");
    }

    #[tokio::test]
    async fn test_rename_subtree() {
        let (filer, _) = filer(8);
        filer
            .write_file("/a/b/one", b"1".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();
        filer
            .write_file("/a/b/c/two", b"2".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();

        filer.rename("/a/b", "/x/y").unwrap();
        assert!(matches!(filer.find_entry("/a/b"), Err(Error::NotFound(_))));
        assert!(matches!(filer.find_entry("/a/b/c/two"), Err(Error::NotFound(_))));
        assert_eq!(filer.read_file("/x/y/one", 0, None).await.unwrap(), b"1");
        assert_eq!(filer.read_file("/x/y/c/two", 0, None).await.unwrap(), b"2");
        assert!(filer.find_entry("/a").unwrap().is_directory);

        assert!(matches!(
            filer.rename("/x", "/x/y/inner"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_file_over_file() {
        let (filer, _) = filer(8);
        filer.write_file("/a", b"new".to_vec(), WriteMode::Overwrite, None).await.unwrap();
        filer.write_file("/b", b"old".to_vec(), WriteMode::Overwrite, None).await.unwrap();
        filer.rename("/a", "/b").unwrap();
        assert_eq!(filer.read_file("/b", 0, None).await.unwrap(), b"new");
        assert_eq!(filer.gc_pending(), 1);

        filer.mkdir("/dir").unwrap();
        assert!(matches!(filer.rename("/b", "/dir"), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let (filer, blobs) = filer(2);
        filer
            .write_file("/d/e/f", b"abcdef".to_vec(), WriteMode::Overwrite, None)
            .await
            .unwrap();
        assert!(matches!(filer.delete_entry("/d", false), Err(Error::InvalidState(_))));
        assert_eq!(filer.delete_entry("/d", true).unwrap(), 3);
        assert!(matches!(filer.find_entry("/d/e"), Err(Error::NotFound(_))));
        filer.collect_garbage().await;
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_list_directory_paging() {
        let (filer, _) = filer(8);
        for name in ["c", "a", "b", "d"] {
            filer
                .write_file(&format!("/dir/{}", name), vec![1], WriteMode::Overwrite, None)
                .await
                .unwrap();
        }
        let first = filer.list_directory("/dir", "", 2).unwrap();
        let names: Vec<&str> = first.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let rest = filer.list_directory("/dir", "b", 10).unwrap();
        let names: Vec<&str> = rest.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["c", "d"]);
        assert!(filer.list_directory("/dir/a", "", 10).is_err());
    }

    #[tokio::test]
    async fn test_file_cannot_be_parent() {
        let (filer, _) = filer(8);
        filer.write_file("/f", vec![1], WriteMode::Overwrite, None).await.unwrap();
        let err = filer
            .write_file("/f/child", vec![2], WriteMode::Overwrite, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        // The orphaned upload is queued for deletion
        assert_eq!(filer.gc_pending(), 1);
    }
}
