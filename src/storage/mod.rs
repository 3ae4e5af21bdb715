//! Pooled client for the supervised KV store
//!
//! The store speaks RESP; the wire codec lives in [`resp`] and the pooled
//! client with the metadata operations in [`client`].

pub mod client;
pub mod resp;

pub use client::StorageClient;
