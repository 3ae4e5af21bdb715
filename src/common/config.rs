//! Configuration for the metakv sidecar
//!
//! Loaded from environment variables. The variable names are preserved from
//! earlier deployments of this sidecar, so existing compose files keep
//! working unchanged.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the shared coordination volume
    pub root_path: PathBuf,

    /// Path to the files volume served and watched by the sidecar
    pub files_path: PathBuf,

    /// Service name (primary key in the registry)
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Port of the main application API (published in registrations)
    pub api_port: u16,

    /// Stable base URL for discovery, if any
    pub base_url: String,

    /// Port the supervised KV store listens on
    pub store_port: u16,

    /// Binary spawned as the KV store
    pub store_binary: String,

    /// How long to wait for the store to accept connections after spawn
    pub store_ready_timeout_ms: u64,

    /// HTTP control surface bind host (loopback by default)
    pub http_host: String,

    /// HTTP control surface port
    pub http_port: u16,

    /// Election health loop period
    pub health_check_interval_ms: u64,

    /// Registry heartbeat period
    pub heartbeat_interval_ms: u64,

    /// Heartbeat age beyond which a registration reads as stale
    pub stale_threshold_ms: u64,

    /// Directories observed by the file watcher
    pub watch_folders: Vec<PathBuf>,

    /// Quiet window a path must stay idle before its event is emitted
    pub debounce_ms: u64,

    /// Whether to run the file watcher at all
    pub enable_watcher: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/meta-core"),
            files_path: PathBuf::from("/files"),
            service_name: "metakv".to_string(),
            service_version: "1.0.0".to_string(),
            api_port: 8180,
            base_url: String::new(),
            store_port: 6379,
            store_binary: "redis-server".to_string(),
            store_ready_timeout_ms: 30_000,
            http_host: "127.0.0.1".to_string(),
            http_port: 9000,
            health_check_interval_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            stale_threshold_ms: 60_000,
            watch_folders: vec![PathBuf::from("/files/")],
            debounce_ms: 30_000,
            enable_watcher: true,
        }
    }
}

impl Config {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let mut cfg = Config {
            root_path: env_path("META_CORE_PATH", defaults.root_path),
            files_path: env_path("FILES_PATH", defaults.files_path),
            service_name: env_str("SERVICE_NAME", defaults.service_name),
            service_version: env_str("SERVICE_VERSION", defaults.service_version),
            api_port: env_parse("API_PORT", defaults.api_port),
            base_url: env_str("BASE_URL", defaults.base_url),
            store_port: env_parse("REDIS_PORT", defaults.store_port),
            store_binary: env_str("STORE_BINARY", defaults.store_binary),
            store_ready_timeout_ms: env_parse(
                "STORE_READY_TIMEOUT_MS",
                defaults.store_ready_timeout_ms,
            ),
            http_host: env_str("META_CORE_HTTP_HOST", defaults.http_host),
            http_port: env_parse("META_CORE_HTTP_PORT", defaults.http_port),
            health_check_interval_ms: env_parse(
                "HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval_ms,
            ),
            heartbeat_interval_ms: env_parse(
                "HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            ),
            stale_threshold_ms: env_parse("STALE_THRESHOLD_MS", defaults.stale_threshold_ms),
            watch_folders: defaults.watch_folders,
            debounce_ms: env_parse("DEBOUNCE_MS", defaults.debounce_ms),
            enable_watcher: env_bool("ENABLE_FILE_WATCHER", defaults.enable_watcher),
        };

        if let Ok(list) = std::env::var("WATCH_FOLDER_LIST") {
            cfg.watch_folders = parse_path_list(&list);
        }

        cfg
    }

    /// Path to the leader lock file
    pub fn lock_file_path(&self) -> PathBuf {
        self.root_path.join("locks").join("kv-leader.lock")
    }

    /// Path to the leader info file
    pub fn info_file_path(&self) -> PathBuf {
        self.root_path.join("locks").join("kv-leader.info")
    }

    /// Path to the KV store data directory
    pub fn store_data_dir(&self) -> PathBuf {
        self.root_path.join("db").join("store")
    }

    /// Path to the service registry directory
    pub fn services_dir(&self) -> PathBuf {
        self.root_path.join("services")
    }

    /// Address the HTTP control surface binds to
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.service_name.is_empty() {
            return Err(crate::Error::InvalidConfig("service name is required".into()));
        }
        if self.store_port == 0 {
            return Err(crate::Error::InvalidConfig("store port is required".into()));
        }
        if self.http_port == 0 {
            return Err(crate::Error::InvalidConfig("http port is required".into()));
        }
        if self.enable_watcher && self.debounce_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "debounce window must be non-zero when the watcher is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn env_str(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => {
            matches!(v.to_lowercase().as_str(), "true" | "1" | "yes")
        }
        _ => default,
    }
}

fn parse_path_list(s: &str) -> Vec<PathBuf> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.store_port, 6379);
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.debounce_ms, 30_000);
        assert!(cfg.enable_watcher);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_volume_paths() {
        let cfg = Config {
            root_path: PathBuf::from("/mnt/shared"),
            ..Default::default()
        };
        assert_eq!(
            cfg.lock_file_path(),
            PathBuf::from("/mnt/shared/locks/kv-leader.lock")
        );
        assert_eq!(
            cfg.info_file_path(),
            PathBuf::from("/mnt/shared/locks/kv-leader.info")
        );
        assert_eq!(cfg.services_dir(), PathBuf::from("/mnt/shared/services"));
        assert_eq!(cfg.store_data_dir(), PathBuf::from("/mnt/shared/db/store"));
    }

    #[test]
    fn test_parse_path_list() {
        assert_eq!(
            parse_path_list("/files/, /mnt/extra ,"),
            vec![PathBuf::from("/files/"), PathBuf::from("/mnt/extra")]
        );
        assert!(parse_path_list("").is_empty());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let cfg = Config {
            service_name: String::new(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_debounce() {
        let cfg = Config {
            debounce_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            debounce_ms: 0,
            enable_watcher: false,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
