//! KV store subprocess supervision
//!
//! The leader (and only the leader) spawns the store with a deterministic
//! command line, watches for exit in the background, and tears it down with
//! SIGTERM before escalating to SIGKILL.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::common::{Config, Error, Result};

/// How long stop() waits for a graceful exit before SIGKILL
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll period for readiness probes and exit observation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct ProcState {
    running: bool,
    pid: Option<u32>,
}

/// Supervisor for the KV store subprocess.
///
/// `start`/`stop` serialize on an internal mutex; a second `start` while the
/// process lives is a no-op success.
pub struct StoreSupervisor {
    binary: String,
    port: u16,
    data_dir: PathBuf,
    state: Arc<RwLock<ProcState>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl StoreSupervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.store_binary.clone(),
            port: config.store_port,
            data_dir: config.store_data_dir(),
            state: Arc::new(RwLock::new(ProcState::default())),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Command line handed to the store binary: data directory, port,
    /// write-ahead log enabled, periodic snapshot threshold.
    fn build_args(port: u16, data_dir: &std::path::Path) -> Vec<String> {
        vec![
            "--port".into(),
            port.to_string(),
            "--bind".into(),
            "0.0.0.0".into(),
            "--dir".into(),
            data_dir.display().to_string(),
            "--appendonly".into(),
            "yes".into(),
            "--appendfilename".into(),
            "appendonly.aof".into(),
            "--dbfilename".into(),
            "dump.rdb".into(),
            "--save".into(),
            "60".into(),
            "1".into(),
            "--loglevel".into(),
            "warning".into(),
        ]
    }

    /// Spawn the store process. Returns after the spawn, not after readiness;
    /// use [`wait_ready`](Self::wait_ready) for that.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        if self.state.read().unwrap().running {
            return Ok(());
        }

        std::fs::create_dir_all(&self.data_dir)?;

        tracing::info!("spawning {} on port {}", self.binary, self.port);

        let mut child = tokio::process::Command::new(&self.binary)
            .args(Self::build_args(self.port, &self.data_dir))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", self.binary, e)))?;

        let pid = child.id();
        {
            let mut state = self.state.write().unwrap();
            state.running = true;
            state.pid = pid;
        }
        tracing::info!("store started with pid {:?}", pid);

        // Exit observer: the only task that waits on the child
        let state = self.state.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            {
                let mut state = state.write().unwrap();
                state.running = false;
                state.pid = None;
            }
            match status {
                Ok(status) if status.success() => tracing::info!("store exited normally"),
                Ok(status) => tracing::warn!("store exited with {}", status),
                Err(e) => tracing::warn!("failed to observe store exit: {}", e),
            }
        });

        Ok(())
    }

    /// Whether the last spawned process is still alive.
    pub fn is_running(&self) -> bool {
        self.state.read().unwrap().running
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.read().unwrap().pid
    }

    /// Block until a TCP probe to the store port succeeds, polling at 100 ms.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let addr = format!("127.0.0.1:{}", self.port);

        loop {
            if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                tracing::info!("store ready on {}", addr);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NotReady(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Graceful stop: SIGTERM, wait up to 10 s, then SIGKILL.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let pid = {
            let state = self.state.read().unwrap();
            if !state.running {
                return Ok(());
            }
            match state.pid {
                Some(pid) => pid,
                None => return Ok(()),
            }
        };

        tracing::info!("stopping store (pid {})", pid);
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        if self.wait_stopped(GRACEFUL_STOP_TIMEOUT).await {
            tracing::info!("store stopped gracefully");
            return Ok(());
        }

        tracing::warn!("store did not stop within {:?}, sending SIGKILL", GRACEFUL_STOP_TIMEOUT);
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);

        if !self.wait_stopped(Duration::from_secs(5)).await {
            return Err(Error::Internal(format!(
                "store pid {} survived SIGKILL observation window",
                pid
            )));
        }
        Ok(())
    }

    /// Poll the exit observer's flag until the process is gone or `timeout`
    /// elapses.
    async fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.state.read().unwrap().running {
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        !self.state.read().unwrap().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor(binary: &str, port: u16, dir: &TempDir) -> StoreSupervisor {
        let config = Config {
            store_binary: binary.to_string(),
            store_port: port,
            root_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        StoreSupervisor::new(&config)
    }

    #[test]
    fn test_build_args() {
        let args = StoreSupervisor::build_args(6400, std::path::Path::new("/data/store"));
        assert_eq!(args[0], "--port");
        assert_eq!(args[1], "6400");
        assert!(args.contains(&"--appendonly".to_string()));
        assert!(args.contains(&"/data/store".to_string()));
        // Snapshot threshold: save after 60s if at least one key changed
        let save = args.iter().position(|a| a == "--save").unwrap();
        assert_eq!(&args[save + 1..save + 3], ["60", "1"]);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor("/nonexistent/kv-store-binary", 6401, &dir);
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let dir = TempDir::new().unwrap();
        // `true` ignores the store arguments and exits immediately; the
        // observer must flip is_running back to false.
        let sup = supervisor("true", 6402, &dir);
        sup.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while sup.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!sup.is_running());
        assert_eq!(sup.pid(), None);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor("true", 6403, &dir);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ready_succeeds_when_port_listens() {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let sup = supervisor("true", port, &dir);
        sup.wait_ready(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let dir = TempDir::new().unwrap();
        // Grab a free port, then release it so nothing listens there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let sup = supervisor("true", port, &dir);
        let err = sup.wait_ready(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }
}
