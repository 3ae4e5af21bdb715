//! HTTP control surface
//!
//! Loopback-only axum router over the election, registry, storage client and
//! event pipeline. Handlers mirror the error taxonomy: 503 while the store
//! is disconnected, 404 for missing entities, 400 for bad input.

pub mod cid;
pub mod events;
pub mod handlers;
pub mod server;

pub use server::{build_router, AppState};
