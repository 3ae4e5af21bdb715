//! Recursive filesystem observation and the initial scan
//!
//! OS notifications are bridged from the notify callback thread into tokio
//! over an unbounded channel; mapped events feed the debouncer. The
//! debounced callback enriches add/change events with a partial hash,
//! records them in the ring and hands them to the dispatcher. The initial
//! scan is a deliberate snapshot: it bypasses the debouncer entirely.

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher as _};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::common::{utils, Config, Error, Result};
use crate::watcher::debounce::Debouncer;
use crate::watcher::dispatch::Dispatcher;
use crate::watcher::ring::EventRing;
use crate::watcher::types::{FileEvent, FileEventType, ScanStatus};

/// Bytes of a file hashed for cheap identity
const PARTIAL_HASH_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct WatchState {
    running: bool,
    scanning: bool,
    last_scan: Option<i64>,
    file_count: usize,
}

pub struct FileWatcher {
    files_path: PathBuf,
    watch_paths: Vec<PathBuf>,
    debouncer: Arc<Debouncer>,
    dispatcher: Arc<Dispatcher>,
    ring: Arc<Mutex<EventRing>>,
    state: Arc<RwLock<WatchState>>,
    // The notify watcher must stay alive: dropping it deregisters the OS
    // watches and stops event delivery.
    os_watcher: Mutex<Option<notify::RecommendedWatcher>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    pub fn new(config: &Config, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let watcher = Arc::new(Self {
            files_path: config.files_path.clone(),
            watch_paths: config.watch_folders.clone(),
            debouncer: Arc::new(Debouncer::new(std::time::Duration::from_millis(
                config.debounce_ms,
            ))),
            dispatcher,
            ring: Arc::new(Mutex::new(EventRing::new())),
            state: Arc::new(RwLock::new(WatchState::default())),
            os_watcher: Mutex::new(None),
            reader_task: Mutex::new(None),
        });

        let this = watcher.clone();
        watcher
            .debouncer
            .set_callback(move |event| this.handle_debounced(event));

        watcher
    }

    /// Register OS watches and start processing; triggers the initial scan.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();

        let mut os_watcher = notify::RecommendedWatcher::new(
            move |result: std::result::Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::warn!("filesystem watcher error: {}", e),
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Watcher(format!("failed to create watcher: {}", e)))?;

        for path in &self.watch_paths {
            if let Err(e) = os_watcher.watch(path, RecursiveMode::Recursive) {
                tracing::warn!("cannot watch {}: {}", path.display(), e);
            }
        }
        *self.os_watcher.lock().unwrap() = Some(os_watcher);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_fs_event(event);
            }
        });
        *self.reader_task.lock().unwrap() = Some(handle);

        self.trigger_scan();

        tracing::info!("watching {} paths", self.watch_paths.len());
        Ok(())
    }

    /// Stop observation, discard pending debounces, close live streams.
    pub fn stop(&self) {
        {
            let mut state = self.state.write().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
        }

        *self.os_watcher.lock().unwrap() = None;
        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }
        self.debouncer.stop();
        self.dispatcher.shutdown();
    }

    /// Map one OS notification into the pipeline.
    fn handle_fs_event(&self, event: notify::Event) {
        let (event_type, old_path) = match event.kind {
            EventKind::Create(_) => (FileEventType::Add, None),
            EventKind::Modify(ModifyKind::Name(mode)) => {
                // A both-ends rename carries [old, new]
                let old = match (mode, event.paths.len()) {
                    (RenameMode::Both, 2) => {
                        Some(utils::relative_slash(&self.files_path, &event.paths[0]))
                    }
                    _ => None,
                };
                (FileEventType::Rename, old)
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => return,
            EventKind::Modify(_) => (FileEventType::Change, None),
            EventKind::Remove(_) => (FileEventType::Delete, None),
            _ => return,
        };

        let path = match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.last(),
            _ => event.paths.first(),
        };
        let Some(path) = path else { return };

        // Directories produce no file events; the recursive watch already
        // covers newly created ones. The target of a delete is gone, so it
        // is never stat'ed.
        let size = if event_type == FileEventType::Delete {
            None
        } else {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_dir() => return,
                Ok(meta) => Some(meta.len()),
                Err(_) => None,
            }
        };

        self.debouncer.add(FileEvent {
            event_type,
            path: utils::relative_slash(&self.files_path, path),
            size,
            timestamp: utils::now_ms(),
            partial_hash: None,
            old_path,
        });
    }

    /// Debounced emission: enrich, record, fan out.
    fn handle_debounced(&self, mut event: FileEvent) {
        if matches!(event.event_type, FileEventType::Add | FileEventType::Change) {
            let full_path = self.files_path.join(&event.path);
            match compute_partial_hash(&full_path) {
                Ok(hash) => event.partial_hash = Some(hash),
                Err(e) => tracing::debug!("no partial hash for {}: {}", event.path, e),
            }
        }

        self.ring.lock().unwrap().push(event.clone());
        tracing::info!("event: {} {}", event.event_type.as_str(), event.path);
        self.dispatcher.dispatch(event);
    }

    /// Kick off a scan in the background. A no-op when one is in flight.
    pub fn trigger_scan(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_scan().await;
        });
    }

    async fn run_scan(self: &Arc<Self>) {
        {
            let mut state = self.state.write().unwrap();
            if state.scanning {
                return;
            }
            state.scanning = true;
        }

        tracing::info!("starting directory scan");
        let roots = self.watch_paths.clone();
        let files_path = self.files_path.clone();
        let events = tokio::task::spawn_blocking(move || scan_roots(&roots, &files_path))
            .await
            .unwrap_or_default();

        let file_count = events.len();
        for event in events {
            self.ring.lock().unwrap().push(event.clone());
            self.dispatcher.dispatch(event);
        }

        {
            let mut state = self.state.write().unwrap();
            state.scanning = false;
            state.last_scan = Some(utils::now_ms());
            state.file_count = file_count;
        }
        tracing::info!("scan complete: {} files", file_count);
    }

    /// Events newer than `since_ms`, at most `limit` (0 = unlimited).
    pub fn recent_events(&self, since_ms: i64, limit: usize) -> Vec<FileEvent> {
        self.ring.lock().unwrap().since(since_ms, limit)
    }

    pub fn status(&self) -> ScanStatus {
        let state = self.state.read().unwrap();
        ScanStatus {
            status: if state.running { "running" } else { "stopped" }.to_string(),
            scanning: state.scanning,
            last_scan: state.last_scan,
            file_count: state.file_count,
        }
    }
}

/// Walk every root, emitting an `add` per regular file with its partial
/// hash. Dotfiles are skipped here (runtime events are not name-filtered).
fn scan_roots(roots: &[PathBuf], files_path: &Path) -> Vec<FileEvent> {
    let mut events = Vec::new();
    for root in roots {
        walk(root, files_path, &mut events);
    }
    events
}

fn walk(dir: &Path, files_path: &Path, events: &mut Vec<FileEvent>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }

        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            walk(&path, files_path, events);
            continue;
        }

        let partial_hash = compute_partial_hash(&path).ok();
        events.push(FileEvent {
            event_type: FileEventType::Add,
            path: utils::relative_slash(files_path, &path),
            size: Some(meta.len()),
            timestamp: utils::now_ms(),
            partial_hash,
            old_path: None,
        });
    }
}

/// Hex SHA-256 of the first 64 KiB of a file.
pub fn compute_partial_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = vec![0u8; PARTIAL_HASH_SIZE];
    let mut filled = 0;

    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let digest = Sha256::digest(&buffer[..filled]);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}
