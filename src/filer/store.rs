//! Filer metadata stores
//!
//! `MemoryStore` keeps entries in a BTreeMap keyed by (directory, name) so a
//! directory listing is one range scan. It persists to a bincode snapshot
//! written atomically on `flush`.

use crate::common::Result;
use crate::filer::entry::{split_path, Entry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const SNAPSHOT_FILE: &str = "filer.snapshot";

pub trait FilerStore: Send + Sync {
    /// Insert or replace the entry at `entry.path`.
    fn insert(&self, entry: Entry) -> Result<()>;

    fn get(&self, path: &str) -> Result<Option<Entry>>;

    fn remove(&self, path: &str) -> Result<Option<Entry>>;

    /// Direct children of `dir` with names after `start_after`, by name.
    fn list(&self, dir: &str, start_after: &str, limit: usize) -> Result<Vec<Entry>>;

    /// Make every change so far durable.
    fn flush(&self) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<Entry>,
}

type Key = (String, String);

fn key(path: &str) -> Key {
    let (dir, name) = split_path(path);
    (dir.to_string(), name.to_string())
}

pub struct MemoryStore {
    entries: RwLock<BTreeMap<Key, Entry>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl MemoryStore {
    /// Store without persistence
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Open the store persisted in `dir`, loading its last snapshot.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SNAPSHOT_FILE);
        let mut entries = BTreeMap::new();
        match fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot = bincode::deserialize(&bytes)?;
                for entry in snapshot.entries {
                    entries.insert(key(&entry.path), entry);
                }
                tracing::info!("Loaded {} filer entries from {}", entries.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FilerStore for MemoryStore {
    fn insert(&self, entry: Entry) -> Result<()> {
        self.entries.write().insert(key(&entry.path), entry);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Entry>> {
        Ok(self.entries.read().get(&key(path)).cloned())
    }

    fn remove(&self, path: &str) -> Result<Option<Entry>> {
        let removed = self.entries.write().remove(&key(path));
        if removed.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn list(&self, dir: &str, start_after: &str, limit: usize) -> Result<Vec<Entry>> {
        let entries = self.entries.read();
        let from = (dir.to_string(), start_after.to_string());
        Ok(entries
            .range((Bound::Excluded(from), Bound::Unbounded))
            .take_while(|((d, _), _)| d == dir)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = Snapshot {
            entries: self.entries.read().values().cloned().collect(),
        };
        let bytes = match bincode::serialize(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let tmp = path.with_extension("tmp");
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();
        if let Err(e) = written {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_children_only() {
        let store = MemoryStore::in_memory();
        for path in ["/a", "/a/x", "/a/y", "/a/y/deep", "/a/z", "/b"] {
            store.insert(Entry::directory(path)).unwrap();
        }
        let names: Vec<String> = store
            .list("/a", "", 100)
            .unwrap()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["x", "y", "z"]);

        let page = store.list("/a", "x", 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].path, "/a/y");

        let root: Vec<String> = store.list("/", "", 100).unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(root, vec!["/a", "/b"]);
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = MemoryStore::open(dir.path()).unwrap();
            store.insert(Entry::directory("/docs")).unwrap();
            store.insert(Entry::file("/docs/readme", vec![])).unwrap();
            store.remove("/docs/readme").unwrap();
            store.insert(Entry::file("/docs/guide", vec![])).unwrap();
            store.flush().unwrap();
        }
        let store = MemoryStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("/docs/guide").unwrap().is_some());
        assert!(store.get("/docs/readme").unwrap().is_none());
    }
}
