//! Filer entries and path handling

use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A piece of file content stored as one needle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub fid: String,
    /// Logical offset of the chunk in the file
    pub offset: u64,
    pub size: u64,
    /// Write time in nanoseconds; later chunks shadow earlier ones
    pub version: i64,
    #[serde(default)]
    pub etag: String,
}

impl FileChunk {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Normalized absolute path
    pub path: String,
    pub is_directory: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub chunks: Vec<FileChunk>,
}

impl Entry {
    pub fn directory(path: &str) -> Self {
        let now = Utc::now();
        Self {
            path: path.to_string(),
            is_directory: true,
            created_at: now,
            modified_at: now,
            mime: None,
            chunks: Vec::new(),
        }
    }

    pub fn file(path: &str, chunks: Vec<FileChunk>) -> Self {
        let now = Utc::now();
        Self {
            path: path.to_string(),
            is_directory: false,
            created_at: now,
            modified_at: now,
            mime: None,
            chunks,
        }
    }

    pub fn name(&self) -> &str {
        split_path(&self.path).1
    }

    /// Logical size: the end of the furthest chunk
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(FileChunk::end).max().unwrap_or(0)
    }
}

/// Canonical form of an absolute path: leading `/`, no empty, `.` or
/// trailing components. `..` is rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidArgument(format!(
                    "path may not contain '..': {}",
                    path
                )))
            }
            p => parts.push(p),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Split a normalized path into parent directory and name.
/// The root splits into `("/", "")`.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Is `path` equal to `ancestor` or below it?
pub fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor == "/"
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}
