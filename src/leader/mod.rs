//! Leader election over a shared volume
//!
//! Exactly one process in the cohort holds an advisory flock on a well-known
//! path; that process owns the KV-store subprocess and publishes its
//! coordinates for the others.

pub mod election;
pub mod lock;
pub mod store;

pub use election::{Election, Role, StorageConnector};
pub use lock::{LeaderCoordinates, LeaderLock};
pub use store::StoreSupervisor;
