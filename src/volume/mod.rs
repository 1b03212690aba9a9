//! Volume server implementation
//!
//! Stores needles in append-only volumes:
//! - `.dat` files of checksummed needle records behind a super block
//! - In-memory needle maps with periodic `.idx` checkpoints
//! - Read-only EC shard sets with degraded reads from peers
//! - Replicated writes forwarded to the other copies of a volume

pub mod ec_volume;
pub mod heartbeat;
pub mod http;
pub mod index;
pub mod needle;
pub mod remote;
pub mod server;
pub mod store;
#[allow(clippy::module_inception)]
pub mod volume;

pub use server::VolumeServer;
pub use store::Store;
