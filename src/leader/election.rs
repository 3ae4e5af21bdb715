//! Leader election state machine
//!
//! One shot per process lifetime: `unknown → leader` when the flock is won,
//! `unknown → follower` otherwise. A follower never promotes while the
//! process lives; restarting the process is the recovery path. The health
//! loop keeps the leader's coordinates fresh (the periodic rewrite doubles
//! as a liveness beacon) and keeps followers pointed at the current store.

use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::{utils, Config, Result};
use crate::leader::lock::{self, LeaderCoordinates, LeaderLock};
use crate::leader::store::StoreSupervisor;

/// Backoff between leader-info reads when a fresh follower finds no file
const FOLLOWER_INFO_RETRY_DELAY: Duration = Duration::from_millis(500);
const FOLLOWER_INFO_RETRIES: usize = 3;

/// Connection capability the election drives when leadership is
/// established or moves. The storage client implements it; anything that
/// can point itself at a URL can too.
#[async_trait::async_trait]
pub trait StorageConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Unknown,
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Unknown => write!(f, "unknown"),
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

type LeaderCallback = Arc<dyn Fn() + Send + Sync>;
type FollowerCallback = Arc<dyn Fn(&LeaderCoordinates) + Send + Sync>;

#[derive(Default)]
struct ElectionState {
    role: Option<Role>,
    leader_info: Option<LeaderCoordinates>,
    lock: Option<LeaderLock>,
}

impl ElectionState {
    fn role(&self) -> Role {
        self.role.unwrap_or(Role::Unknown)
    }
}

/// Leader election over the shared volume's lock file.
pub struct Election {
    config: Arc<Config>,
    supervisor: Arc<StoreSupervisor>,
    storage: Arc<dyn StorageConnector>,
    state: Arc<RwLock<ElectionState>>,
    on_become_leader: Mutex<Option<LeaderCallback>>,
    on_become_follower: Mutex<Option<FollowerCallback>>,
    shutdown: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Election {
    pub fn new(config: Arc<Config>, storage: Arc<dyn StorageConnector>) -> Self {
        let supervisor = Arc::new(StoreSupervisor::new(&config));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            supervisor,
            storage,
            state: Arc::new(RwLock::new(ElectionState::default())),
            on_become_leader: Mutex::new(None),
            on_become_follower: Mutex::new(None),
            shutdown,
            health_task: Mutex::new(None),
        }
    }

    /// Register the leader callback. Must be called before [`start`](Self::start).
    pub fn on_become_leader(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_become_leader.lock().unwrap() = Some(Arc::new(f));
    }

    /// Register the follower callback. Must be called before [`start`](Self::start).
    pub fn on_become_follower(&self, f: impl Fn(&LeaderCoordinates) + Send + Sync + 'static) {
        *self.on_become_follower.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn role(&self) -> Role {
        self.state.read().unwrap().role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn leader_info(&self) -> Option<LeaderCoordinates> {
        self.state.read().unwrap().leader_info.clone()
    }

    /// Run the election once and start the health loop.
    ///
    /// A readiness failure on the leader path is returned to the caller; the
    /// expected reaction is process exit, which releases the flock so a peer
    /// can take over.
    pub async fn start(&self) -> Result<()> {
        tracing::info!("starting leader election");

        let lock_path = self.config.lock_file_path();
        match LeaderLock::try_acquire(&lock_path)? {
            Some(held) => {
                tracing::info!("acquired flock on {}", lock_path.display());
                self.state.write().unwrap().lock = Some(held);
                self.become_leader().await?;
            }
            None => {
                tracing::info!("lock held by another process");
                self.become_follower().await?;
            }
        }

        let handle = tokio::spawn(health_loop(
            self.config.clone(),
            self.supervisor.clone(),
            self.storage.clone(),
            self.state.clone(),
            self.shutdown.subscribe(),
        ));
        *self.health_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    async fn become_leader(&self) -> Result<()> {
        tracing::info!("transitioning to leader");
        self.state.write().unwrap().role = Some(Role::Leader);

        self.supervisor.start().await?;
        self.supervisor
            .wait_ready(Duration::from_millis(self.config.store_ready_timeout_ms))
            .await?;

        let info = build_leader_info(&self.config);
        lock::publish(&self.config.info_file_path(), &info)?;
        self.state.write().unwrap().leader_info = Some(info.clone());

        if let Err(e) = self.storage.connect(&info.store_url).await {
            tracing::warn!("failed to connect storage to local store: {}", e);
        }

        let callback = self.on_become_leader.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }

        tracing::info!("now acting as leader");
        Ok(())
    }

    async fn become_follower(&self) -> Result<()> {
        tracing::info!("transitioning to follower");
        self.state.write().unwrap().role = Some(Role::Follower);

        // The lock holder may still be publishing; give it a few chances
        // before settling in without coordinates.
        let info_path = self.config.info_file_path();
        let mut info = lock::read(&info_path)?;
        for _ in 0..FOLLOWER_INFO_RETRIES {
            if info.is_some() {
                break;
            }
            tokio::time::sleep(FOLLOWER_INFO_RETRY_DELAY).await;
            info = lock::read(&info_path)?;
        }

        if let Some(info) = info {
            tracing::info!("leader is at {}", info.store_url);
            self.state.write().unwrap().leader_info = Some(info.clone());

            if let Err(e) = self.storage.connect(&info.store_url).await {
                tracing::warn!("failed to connect to leader store: {}", e);
            }

            let callback = self.on_become_follower.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(&info);
            }
        } else {
            tracing::warn!("no leader info published yet; will keep retrying on health ticks");
        }

        tracing::info!("now acting as follower");
        Ok(())
    }

    /// Stop the health loop, tear down the store when leader, release the
    /// lock. The info file is removed on a graceful leader exit; leaving it
    /// would also be safe since the flock is the liveness signal.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("stopping leader election");
        let _ = self.shutdown.send(true);

        let handle = self.health_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if self.role() == Role::Leader {
            if let Err(e) = self.supervisor.stop().await {
                tracing::warn!("error stopping store: {}", e);
            }
            if let Err(e) = lock::remove(&self.config.info_file_path()) {
                tracing::warn!("error removing leader info: {}", e);
            }
        }

        if self.state.write().unwrap().lock.take().is_some() {
            tracing::info!("released leader lock");
        }
        Ok(())
    }
}

fn build_leader_info(config: &Config) -> LeaderCoordinates {
    let ip = utils::local_ip();
    LeaderCoordinates {
        host: utils::hostname(),
        store_url: format!("redis://{}:{}", ip, config.store_port),
        http_url: format!("http://{}:{}", ip, config.api_port),
        base_url: if config.base_url.is_empty() {
            None
        } else {
            Some(config.base_url.clone())
        },
        timestamp: utils::now_ms(),
        pid: std::process::id(),
    }
}

async fn health_loop(
    config: Arc<Config>,
    supervisor: Arc<StoreSupervisor>,
    storage: Arc<dyn StorageConnector>,
    state: Arc<RwLock<ElectionState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_millis(config.health_check_interval_ms.max(100));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let role = state.read().unwrap().role();
                match role {
                    Role::Leader => leader_tick(&config, &supervisor, &state).await,
                    Role::Follower => follower_tick(&config, storage.as_ref(), &state).await,
                    Role::Unknown => {}
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Leader: refresh the published timestamp and respawn a dead store.
async fn leader_tick(
    config: &Config,
    supervisor: &StoreSupervisor,
    state: &RwLock<ElectionState>,
) {
    let refreshed = {
        let mut state = state.write().unwrap();
        state.leader_info.as_mut().map(|info| {
            info.timestamp = utils::now_ms();
            info.clone()
        })
    };
    if let Some(info) = refreshed {
        if let Err(e) = lock::publish(&config.info_file_path(), &info) {
            tracing::warn!("failed to refresh leader info: {}", e);
        }
    }

    if !supervisor.is_running() {
        tracing::warn!("store not running, attempting restart");
        match supervisor.start().await {
            Ok(()) => {
                let timeout = Duration::from_millis(config.store_ready_timeout_ms);
                if let Err(e) = supervisor.wait_ready(timeout).await {
                    tracing::warn!("restarted store not ready: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to restart store: {}", e),
        }
    }
}

/// Follower: reread the coordinates, reconnect when the store URL moved.
/// A missing file is benign (the holder may be mid-republish); never promote.
async fn follower_tick(
    config: &Config,
    storage: &dyn StorageConnector,
    state: &RwLock<ElectionState>,
) {
    match lock::read(&config.info_file_path()) {
        Ok(Some(info)) => {
            let previous_url = {
                let state = state.read().unwrap();
                state.leader_info.as_ref().map(|i| i.store_url.clone())
            };

            if previous_url.as_deref() != Some(info.store_url.as_str()) {
                tracing::info!("leader store moved to {}", info.store_url);
                if let Err(e) = storage.connect(&info.store_url).await {
                    tracing::warn!("failed to reconnect to leader store: {}", e);
                }
            }

            state.write().unwrap().leader_info = Some(info);
        }
        Ok(None) => {
            tracing::debug!("leader info absent; staying follower");
        }
        Err(e) => {
            tracing::warn!("failed to read leader info: {}", e);
        }
    }
}
