//! Bounded in-memory event history
//!
//! Kept for cursor-based polling. When the buffer reaches capacity the
//! oldest half is discarded, so pollers that fall far behind lose history
//! rather than stalling producers.

use crate::watcher::types::FileEvent;

const CAPACITY: usize = 10_000;
const TRIM_TO: usize = 5_000;

#[derive(Debug)]
pub struct EventRing {
    events: Vec<FileEvent>,
    capacity: usize,
    trim_to: usize,
}

impl Default for EventRing {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRing {
    pub fn new() -> Self {
        Self::with_capacity(CAPACITY, TRIM_TO)
    }

    fn with_capacity(capacity: usize, trim_to: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
            trim_to,
        }
    }

    pub fn push(&mut self, event: FileEvent) {
        self.events.push(event);
        if self.events.len() > self.capacity {
            let drop_count = self.events.len() - self.trim_to;
            self.events.drain(..drop_count);
        }
    }

    /// Events strictly newer than `since_ms`, oldest first, at most `limit`
    /// (0 means unlimited).
    pub fn since(&self, since_ms: i64, limit: usize) -> Vec<FileEvent> {
        let mut result = Vec::new();
        for event in &self.events {
            if event.timestamp > since_ms {
                result.push(event.clone());
                if limit > 0 && result.len() >= limit {
                    break;
                }
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
