//! Ops commands for cluster management
//!
//! Run on the master leader and reached through its `/ops` endpoints.

pub mod repair;
pub mod vacuum;
pub mod verify;

pub use repair::{repair_cluster, RepairReport};
pub use vacuum::{vacuum_cluster, VacuumReport};
pub use verify::{verify_cluster, VerifyReport};
