//! Filer: a path namespace over volume-stored chunks
//!
//! Each file is an ordered list of chunks, each chunk one needle assigned by
//! the master. Directory metadata lives in a [`FilerStore`].

pub mod blobs;
pub mod chunks;
pub mod entry;
#[allow(clippy::module_inception)]
pub mod filer;
pub mod http;
pub mod server;
pub mod store;

pub use blobs::{BlobStorage, MemoryBlobs};
pub use entry::{Entry, FileChunk};
pub use filer::{Filer, WriteMode};
pub use server::FilerServer;
pub use store::{FilerStore, MemoryStore};
