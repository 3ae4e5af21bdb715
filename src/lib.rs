//! # metakv
//!
//! A shared-volume coordination sidecar with:
//! - Leader election via advisory flock on a shared filesystem
//! - A supervised redis-compatible KV subprocess owned by the leader
//! - File-based service registry with heartbeats and stale detection
//! - Debounced filesystem event pipeline with webhook and SSE fan-out
//! - A loopback HTTP control surface
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Shared volume                   │
//! │  locks/kv-leader.lock   (flock holder wins)  │
//! │  locks/kv-leader.info   (leader coordinates) │
//! │  db/store/              (KV data dir)        │
//! │  services/<name>.json   (registrations)      │
//! └───────────┬───────────────────┬──────────────┘
//!             │                   │
//!       ┌─────▼──────┐      ┌─────▼──────┐
//!       │  Leader    │      │  Follower  │
//!       │  (owns KV  │◄─────┤  (connects │
//!       │  process)  │ RESP │  to leader)│
//!       └────────────┘      └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! META_CORE_PATH=/meta-core FILES_PATH=/files metakv serve
//! ```
//!
//! Every instance exposes the same control surface; exactly one instance in
//! the cohort holds the lock and runs the store.

pub mod api;
pub mod common;
pub mod leader;
pub mod registry;
pub mod storage;
pub mod watcher;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use leader::{Election, LeaderCoordinates, Role};
pub use storage::StorageClient;
