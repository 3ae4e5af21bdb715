//! Event pipeline data types

use serde::{Deserialize, Serialize};

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventType {
    Add,
    Change,
    Delete,
    Rename,
}

impl FileEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventType::Add => "add",
            FileEventType::Change => "change",
            FileEventType::Delete => "delete",
            FileEventType::Rename => "rename",
        }
    }
}

/// A filesystem event. `path` is relative to the files root, forward-slash
/// normalized. `partial_hash` is attached to add/change events after the
/// debounce window expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    #[serde(rename = "type")]
    pub event_type: FileEventType,

    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    pub timestamp: i64,

    #[serde(rename = "partialHash", default, skip_serializing_if = "Option::is_none")]
    pub partial_hash: Option<String>,

    #[serde(rename = "oldPath", default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

/// A webhook subscriber, keyed by URL. An empty filter accepts every event
/// type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub url: String,

    #[serde(rename = "registeredAt")]
    pub registered_at: i64,

    #[serde(rename = "eventTypes", default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,

    #[serde(rename = "lastDelivery", default, skip_serializing_if = "Option::is_none")]
    pub last_delivery: Option<i64>,

    #[serde(rename = "failCount")]
    pub fail_count: u32,
}

impl Subscriber {
    /// Does this subscriber's filter accept the event type?
    pub fn accepts(&self, event_type: FileEventType) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type.as_str())
    }
}

/// Watcher/scan state for the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub status: String,
    pub scanning: bool,

    #[serde(rename = "lastScan", skip_serializing_if = "Option::is_none")]
    pub last_scan: Option<i64>,

    #[serde(rename = "fileCount")]
    pub file_count: usize,
}
