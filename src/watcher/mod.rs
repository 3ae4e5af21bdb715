//! Filesystem event pipeline
//!
//! Events flow `watch` → `debounce` → enrichment (partial hash) → `ring`
//! and `dispatch` (webhooks + live streams).

pub mod debounce;
pub mod dispatch;
pub mod ring;
pub mod types;
pub mod watch;

pub use debounce::Debouncer;
pub use dispatch::Dispatcher;
pub use types::{FileEvent, FileEventType, ScanStatus, Subscriber};
pub use watch::FileWatcher;
