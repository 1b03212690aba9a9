//! # miniweed
//!
//! A small distributed blob store:
//! - Raft-replicated masters that assign file ids and track volumes
//! - Volume servers storing checksummed needles in append-only volumes
//! - Erasure coding of cold volumes into Reed-Solomon shards
//! - A filer mapping file paths to chunk lists
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Master Cluster               │
//! │  (Raft consensus for the directory)     │
//! │   - Leader: assigns ids, grows volumes  │
//! │   - Followers: replicate the directory  │
//! └───────────┬─────────────────────────────┘
//!             │ HTTP heartbeats / admin
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌──▼───────────┐
//! │ Volume 1   │   │ Volume 2   │   │ Volume 3     │
//! │ .dat/.idx  │   │ .dat/.idx  │   │ EC shards    │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a master
//! ```bash
//! miniweed-master serve --id m1 --bind 0.0.0.0:9333 --data-dir ./master-data
//! ```
//!
//! ### Start a volume server
//! ```bash
//! miniweed-volume serve --bind 0.0.0.0:8080 --dir ./vol-data \
//!   --masters http://localhost:9333 --rack r1
//! ```
//!
//! ### Use the CLI
//! ```bash
//! miniweed upload ./photo.jpg
//! miniweed download 3,01637037d6 --output ./photo.jpg
//! miniweed ec encode 3
//! miniweed verify
//! miniweed repair --dry-run
//! ```

pub mod client;
pub mod common;
pub mod ec;
pub mod filer;
pub mod master;
pub mod ops;
pub mod volume;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use filer::FilerServer;
pub use master::MasterServer;
pub use volume::VolumeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
