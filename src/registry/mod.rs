//! File-based service registry
//!
//! One JSON file per service under `<root>/services/`, rewritten atomically
//! on every heartbeat. Staleness is a read-time derivation from the
//! heartbeat age; nothing culls files in the background.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::{utils, Config, Error, Result};

/// A service's registry entry. `name` is the primary key; the file on disk
/// is `<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub version: String,
    #[serde(rename = "api")]
    pub api_url: String,
    pub status: String,
    pub pid: u32,
    pub hostname: String,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: String,
    pub capabilities: Vec<String>,
    pub endpoints: BTreeMap<String, String>,
}

pub struct Registry {
    config: Arc<Config>,
    services_dir: PathBuf,
    service_file: PathBuf,
    info: Arc<RwLock<Option<ServiceRegistration>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Self {
        let services_dir = config.services_dir();
        let service_file = services_dir.join(format!("{}.json", config.service_name));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            services_dir,
            service_file,
            info: Arc::new(RwLock::new(None)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Register this process and start the heartbeat loop.
    pub fn start(&self) -> Result<()> {
        tracing::info!("registering service {}", self.config.service_name);
        std::fs::create_dir_all(&self.services_dir)?;

        let registration = build_registration(&self.config);
        write_atomic(&self.service_file, &registration)?;
        *self.info.write().unwrap() = Some(registration);

        let info = self.info.clone();
        let service_file = self.service_file.clone();
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(10));
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeat(&info, &service_file) {
                            tracing::warn!("failed to update heartbeat: {}", e);
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Change the advertised status and rewrite the registration.
    pub fn update_status(&self, status: &str) -> Result<()> {
        let mut guard = self.info.write().unwrap();
        let info = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("service not registered".into()))?;
        info.status = status.to_string();
        info.last_heartbeat = now_rfc3339();
        write_atomic(&self.service_file, info)
    }

    /// Read a registration by name, synthesizing `stale` when the heartbeat
    /// is older than the configured threshold.
    pub fn discover(&self, name: &str) -> Result<Option<ServiceRegistration>> {
        let path = self.services_dir.join(format!("{}.json", name));
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut info: ServiceRegistration = serde_json::from_slice(&data)
            .map_err(|e| Error::Internal(format!("bad registration {}: {}", path.display(), e)))?;

        if let Ok(heartbeat) = DateTime::parse_from_rfc3339(&info.last_heartbeat) {
            let age_ms = utils::now_ms() - heartbeat.timestamp_millis();
            if age_ms > self.config.stale_threshold_ms as i64 {
                info.status = "stale".to_string();
            }
        }

        Ok(Some(info))
    }

    /// Enumerate every registration in the services directory.
    pub fn discover_all(&self) -> Result<Vec<ServiceRegistration>> {
        let entries = match std::fs::read_dir(&self.services_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut services = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            match self.discover(&name) {
                Ok(Some(info)) => services.push(info),
                Ok(None) => {}
                Err(e) => tracing::warn!("failed to read service {}: {}", name, e),
            }
        }

        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    /// Stop the heartbeat loop and unregister.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("unregistering service {}", self.config.service_name);
        let _ = self.shutdown.send(true);

        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        match std::fs::remove_file(&self.service_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn heartbeat(
    info: &RwLock<Option<ServiceRegistration>>,
    service_file: &Path,
) -> Result<()> {
    let mut guard = info.write().unwrap();
    let Some(info) = guard.as_mut() else {
        return Ok(());
    };
    info.last_heartbeat = now_rfc3339();
    write_atomic(service_file, info)
}

fn build_registration(config: &Config) -> ServiceRegistration {
    let ip = utils::local_ip();
    let api_base = format!("http://{}:{}", ip, config.api_port);
    let sidecar_base = format!("http://{}:{}", ip, config.http_port);
    let now = now_rfc3339();

    let mut endpoints = BTreeMap::new();
    endpoints.insert("health".into(), format!("{}/health", sidecar_base));
    endpoints.insert("meta".into(), format!("{}/meta", sidecar_base));
    endpoints.insert("leader".into(), format!("{}/leader", sidecar_base));
    endpoints.insert("services".into(), format!("{}/services", sidecar_base));
    endpoints.insert("events".into(), format!("{}/api/events/subscribe", sidecar_base));
    endpoints.insert("api".into(), format!("{}/api", api_base));

    ServiceRegistration {
        name: config.service_name.clone(),
        version: config.service_version.clone(),
        api_url: api_base,
        status: "running".to_string(),
        pid: std::process::id(),
        hostname: utils::hostname(),
        started_at: now.clone(),
        last_heartbeat: now,
        capabilities: vec!["metakv".to_string()],
        endpoints,
    }
}

/// Write-to-temp-then-rename in the target's directory, so readers never see
/// a torn registration.
fn write_atomic(path: &Path, info: &ServiceRegistration) -> Result<()> {
    let data = serde_json::to_vec_pretty(info)
        .map_err(|e| Error::Internal(format!("failed to encode registration: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Millisecond-precision RFC 3339 in UTC.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
