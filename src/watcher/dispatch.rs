//! Event fan-out to webhook subscribers and live streams
//!
//! Webhooks get at-least-once delivery while healthy: each event spawns one
//! delivery task per accepting subscriber, retrying on transport errors and
//! non-2xx replies. Live streams are best-effort: a slow consumer loses
//! events instead of blocking producers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::common::utils;
use crate::watcher::types::{FileEvent, Subscriber};

/// Total delivery attempts per event per subscriber
const MAX_RETRIES: u32 = 3;
/// Delay between attempts
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Per-attempt budget
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
/// Exhausted-delivery ceiling before a subscriber is evicted
const MAX_FAIL_COUNT: u32 = 10;
/// Live stream channel capacity
const STREAM_CAPACITY: usize = 100;

pub struct Dispatcher {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    streams: Mutex<HashMap<u64, mpsc::Sender<FileEvent>>>,
    next_stream_id: AtomicU64,
    http: reqwest::Client,
    retry_delay: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_retry_delay(RETRY_DELAY)
    }

    fn with_retry_delay(retry_delay: Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
            http: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .expect("failed to build webhook HTTP client"),
            retry_delay,
        }
    }

    /// Insert or replace a subscriber keyed by URL.
    pub fn subscribe(&self, url: &str, event_types: Vec<String>) {
        let subscriber = Subscriber {
            url: url.to_string(),
            registered_at: utils::now_ms(),
            event_types,
            last_delivery: None,
            fail_count: 0,
        };
        self.subscribers
            .write()
            .unwrap()
            .insert(url.to_string(), subscriber);
        tracing::info!("subscribed webhook {}", url);
    }

    pub fn unsubscribe(&self, url: &str) {
        self.subscribers.write().unwrap().remove(url);
        tracing::info!("unsubscribed webhook {}", url);
    }

    /// All subscribers, ordered by URL.
    pub fn list_subscribers(&self) -> Vec<Subscriber> {
        let mut subscribers: Vec<Subscriber> =
            self.subscribers.read().unwrap().values().cloned().collect();
        subscribers.sort_by(|a, b| a.url.cmp(&b.url));
        subscribers
    }

    /// Open a bounded live stream. The returned receiver sees events until
    /// [`detach_stream`](Self::detach_stream) or [`shutdown`](Self::shutdown).
    pub fn attach_stream(&self) -> (u64, mpsc::Receiver<FileEvent>) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn detach_stream(&self, id: u64) {
        self.streams.lock().unwrap().remove(&id);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Close every live stream. Receivers observe the end of their channel.
    pub fn shutdown(&self) {
        self.streams.lock().unwrap().clear();
    }

    /// Non-blocking fan-out: one background task per accepting webhook, a
    /// `try_send` per live stream with drop-on-full.
    pub fn dispatch(self: &Arc<Self>, event: FileEvent) {
        let targets: Vec<String> = {
            let subscribers = self.subscribers.read().unwrap();
            subscribers
                .values()
                .filter(|s| s.accepts(event.event_type))
                .map(|s| s.url.clone())
                .collect()
        };
        for url in targets {
            let dispatcher = self.clone();
            let event = event.clone();
            tokio::spawn(async move {
                dispatcher.deliver(&url, event).await;
            });
        }

        let mut streams = self.streams.lock().unwrap();
        streams.retain(|_, tx| !tx.is_closed());
        for tx in streams.values() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::debug!("live stream full, dropping event for {}", event.path);
            }
        }
    }

    /// One delivery: up to [`MAX_RETRIES`] attempts, then bookkeeping.
    /// Marshal failures abandon the event without touching fail counters.
    async fn deliver(&self, url: &str, event: FileEvent) {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("failed to encode event for {}: {}", url, e);
                return;
            }
        };

        let mut last_error = String::new();
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }

            let result = self
                .http
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-Event-Type", event.event_type.as_str())
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    let mut subscribers = self.subscribers.write().unwrap();
                    if let Some(subscriber) = subscribers.get_mut(url) {
                        subscriber.last_delivery = Some(utils::now_ms());
                        subscriber.fail_count = 0;
                    }
                    return;
                }
                Ok(response) => last_error = format!("status {}", response.status()),
                Err(e) => last_error = e.to_string(),
            }
        }

        tracing::warn!(
            "delivery to {} failed after {} attempts: {}",
            url,
            MAX_RETRIES,
            last_error
        );

        let mut subscribers = self.subscribers.write().unwrap();
        if let Some(subscriber) = subscribers.get_mut(url) {
            subscriber.fail_count += 1;
            if subscriber.fail_count >= MAX_FAIL_COUNT {
                subscribers.remove(url);
                tracing::warn!("evicted webhook {} after {} failures", url, MAX_FAIL_COUNT);
            }
        }
    }
}
