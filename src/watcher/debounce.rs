//! Per-path event coalescing
//!
//! A path must stay quiet for the whole window before its event is emitted;
//! every new event for the path restarts the clock and replaces the payload
//! (latest wins — the stable final state matters, not the transitions).
//! Rename and delete supersede earlier add/change for the same path because
//! they all flow through one keyed map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::watcher::types::FileEvent;

type Callback = Arc<dyn Fn(FileEvent) + Send + Sync>;

struct Pending {
    event: FileEvent,
    first_seen: Instant,
    last_seen: Instant,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Pending>,
    callback: Option<Callback>,
    stopped: bool,
}

pub struct Debouncer {
    window: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Register the emission callback. Invoked outside the internal lock.
    pub fn set_callback(&self, callback: impl Fn(FileEvent) + Send + Sync + 'static) {
        self.inner.lock().unwrap().callback = Some(Arc::new(callback));
    }

    /// Add or refresh a pending event, keyed by path.
    pub fn add(&self, event: FileEvent) {
        let key = event.path.clone();
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return;
        }

        if let Some(pending) = inner.pending.get_mut(&key) {
            pending.event = event;
            pending.last_seen = Instant::now();
            // The armed timer rechecks last_seen on expiry and re-arms for
            // the remaining time, so no timer swap is needed here.
            return;
        }

        let now = Instant::now();
        let timer = spawn_timer(self.inner.clone(), key.clone(), self.window);
        inner.pending.insert(
            key,
            Pending {
                event,
                first_seen: now,
                last_seen: now,
                timer,
            },
        );
    }

    /// Emit every pending event immediately.
    pub fn flush_all(&self) {
        let (drained, callback) = {
            let mut inner = self.inner.lock().unwrap();
            let drained: Vec<Pending> = inner.pending.drain().map(|(_, p)| p).collect();
            (drained, inner.callback.clone())
        };

        for pending in drained {
            pending.timer.abort();
            if let Some(callback) = &callback {
                callback(pending.event);
            }
        }
    }

    /// Disarm all timers and discard pending state. Later `add` calls are
    /// ignored.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        for pending in inner.pending.values() {
            pending.timer.abort();
        }
        inner.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

fn spawn_timer(inner: Arc<Mutex<Inner>>, key: String, window: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut wait = window;
        loop {
            tokio::time::sleep(wait).await;

            let fired = {
                let mut inner = inner.lock().unwrap();
                let Some(pending) = inner.pending.get(&key) else {
                    // Flushed or stopped while we slept
                    return;
                };
                let idle = pending.last_seen.elapsed();
                if idle < window {
                    // The path saw activity after we were armed; sleep the
                    // remaining time instead of emitting early.
                    wait = window - idle;
                    None
                } else {
                    let pending = inner.pending.remove(&key).expect("entry checked above");
                    Some((pending, inner.callback.clone()))
                }
            };

            if let Some((pending, callback)) = fired {
                tracing::debug!(
                    "path {} quiet after {:?}, emitting",
                    key,
                    pending.first_seen.elapsed()
                );
                if let Some(callback) = callback {
                    callback(pending.event);
                }
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::types::FileEventType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn change(path: &str, timestamp: i64) -> FileEvent {
        FileEvent {
            event_type: FileEventType::Change,
            path: path.into(),
            size: Some(timestamp as u64),
            timestamp,
            partial_hash: None,
            old_path: None,
        }
    }

    fn collecting(window: Duration) -> (Debouncer, Arc<Mutex<Vec<FileEvent>>>) {
        let debouncer = Debouncer::new(window);
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = emitted.clone();
        debouncer.set_callback(move |event| sink.lock().unwrap().push(event));
        (debouncer, emitted)
    }

    #[tokio::test]
    async fn test_single_event_emitted_once() {
        let (debouncer, emitted) = collecting(Duration::from_millis(50));
        debouncer.add(change("/foo", 1));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].timestamp, 1);
    }

    #[tokio::test]
    async fn test_rapid_events_coalesce_latest_wins() {
        let (debouncer, emitted) = collecting(Duration::from_millis(80));

        for ts in 1..=3 {
            debouncer.add(change("/foo", ts));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1, "one callback per quiescent cluster");
        assert_eq!(emitted[0].timestamp, 3, "latest payload wins");
    }

    #[tokio::test]
    async fn test_reset_delays_emission() {
        let (debouncer, emitted) = collecting(Duration::from_millis(200));

        debouncer.add(change("/foo", 1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.add(change("/foo", 2));

        // First timer expires at 200ms but the path was active at 100ms;
        // nothing may be emitted before 300ms.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(emitted.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].timestamp, 2);
    }

    #[tokio::test]
    async fn test_paths_are_independent() {
        let (debouncer, emitted) = collecting(Duration::from_millis(50));
        debouncer.add(change("/a", 1));
        debouncer.add(change("/b", 2));
        assert_eq!(debouncer.pending_count(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(emitted.lock().unwrap().len(), 2);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_supersedes_change() {
        let (debouncer, emitted) = collecting(Duration::from_millis(50));
        debouncer.add(change("/foo", 1));
        debouncer.add(FileEvent {
            event_type: FileEventType::Delete,
            path: "/foo".into(),
            size: None,
            timestamp: 2,
            partial_hash: None,
            old_path: None,
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event_type, FileEventType::Delete);
    }

    #[tokio::test]
    async fn test_flush_all_is_immediate() {
        let (debouncer, emitted) = collecting(Duration::from_secs(3600));
        debouncer.add(change("/a", 1));
        debouncer.add(change("/b", 2));

        debouncer.flush_all();
        assert_eq!(emitted.lock().unwrap().len(), 2);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_discards_pending() {
        let (debouncer, emitted) = collecting(Duration::from_millis(30));
        debouncer.add(change("/a", 1));
        debouncer.stop();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(emitted.lock().unwrap().is_empty());

        // Adds after stop are ignored
        debouncer.add(change("/b", 2));
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_callback_outside_lock() {
        // A callback that re-enters the debouncer must not deadlock.
        let debouncer = Arc::new(Debouncer::new(Duration::from_millis(30)));
        let count = Arc::new(AtomicUsize::new(0));

        let inner = debouncer.clone();
        let seen = count.clone();
        debouncer.set_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            let _ = inner.pending_count();
        });

        debouncer.add(change("/foo", 1));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
