//! Master: the volume directory, replicated with Raft
//!
//! The master is responsible for:
//! - Volume and needle key allocation (`/dir/assign`)
//! - Volume location lookup, including EC shard locations
//! - Tracking volume servers through heartbeats
//! - Growing, repairing and erasure coding volumes

pub mod cluster;
pub mod directory;
pub mod health;
pub mod http;
pub mod placement;
pub mod raft_log;
pub mod raft_node;
pub mod raft_transport;
pub mod server;
pub mod topology;
pub mod volume_admin;

pub use cluster::Master;
pub use server::MasterServer;
