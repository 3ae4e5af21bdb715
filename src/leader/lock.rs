//! Advisory lock file and leader coordinate publication
//!
//! The lock is a kernel flock on an open descriptor: released automatically
//! on process death, so no on-disk cleanup is ever required. Coordinates are
//! published next to the lock with a write-to-temp-then-rename so readers
//! never observe a partial file.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};

/// Externally visible address of the elected leader.
///
/// Wire keys match earlier deployments of this sidecar: `api` is the store
/// URL, `http` the control surface URL, `timestamp` is epoch millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderCoordinates {
    pub host: String,

    #[serde(rename = "api")]
    pub store_url: String,

    #[serde(rename = "http")]
    pub http_url: String,

    #[serde(rename = "baseUrl", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    pub timestamp: i64,

    pub pid: u32,
}

/// Held advisory exclusive lock on the leader lock file.
///
/// Dropping the handle unlocks and closes. The descriptor is opened with
/// O_CLOEXEC (Rust's std default), so the store subprocess never inherits it.
#[derive(Debug)]
pub struct LeaderLock {
    file: File,
    path: PathBuf,
}

impl LeaderLock {
    /// Attempt a non-blocking exclusive flock on `path`, creating the file
    /// if needed.
    ///
    /// Returns `Ok(None)` when another process holds the lock (contention is
    /// not an error) and `Err` on real I/O failures.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Lock(format!("failed to open {}: {}", path.display(), e)))?;

        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res == 0 {
            return Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            }));
        }

        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        Err(Error::Lock(format!("flock on {} failed: {}", path.display(), err)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Atomically write leader coordinates to `path`.
///
/// The temp file lives in the same directory as the target so the rename
/// stays on one volume.
pub fn publish(path: &Path, info: &LeaderCoordinates) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let data = serde_json::to_vec_pretty(info)
        .map_err(|e| Error::Internal(format!("failed to encode leader info: {}", e)))?;

    let tmp = path.with_extension("info.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read leader coordinates from `path`.
///
/// Returns `Ok(None)` when the file does not exist; a malformed file is an
/// error, not an absence.
pub fn read(path: &Path) -> Result<Option<LeaderCoordinates>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| Error::LeaderInfoCorrupt(format!("{}: {}", path.display(), e)))
}

/// Remove the info file if present. Leaving it behind is safe (the flock is
/// the real liveness signal), so removal failures are ignored by callers.
pub fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn coords() -> LeaderCoordinates {
        LeaderCoordinates {
            host: "node-a".into(),
            store_url: "redis://10.0.0.5:6379".into(),
            http_url: "http://10.0.0.5:9000".into(),
            base_url: None,
            timestamp: 1_700_000_000_000,
            pid: 4242,
        }
    }

    #[test]
    fn test_acquire_then_contend() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("kv-leader.lock");

        let held = LeaderLock::try_acquire(&path).unwrap();
        assert!(held.is_some());

        // flock on a second descriptor for the same file is denied even
        // within one process
        let second = LeaderLock::try_acquire(&path).unwrap();
        assert!(second.is_none());

        drop(held);
        let reacquired = LeaderLock::try_acquire(&path).unwrap();
        assert!(reacquired.is_some());
    }

    #[test]
    fn test_publish_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv-leader.info");

        let info = coords();
        publish(&path, &info).unwrap();
        assert_eq!(read(&path).unwrap(), Some(info));

        // No stray temp file left behind
        assert!(!path.with_extension("info.tmp").exists());
    }

    #[test]
    fn test_read_absent_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read(&dir.path().join("missing.info")).unwrap(), None);
    }

    #[test]
    fn test_read_malformed_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv-leader.info");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(read(&path), Err(Error::LeaderInfoCorrupt(_))));
    }

    #[test]
    fn test_wire_keys() {
        let json = serde_json::to_value(coords()).unwrap();
        assert!(json.get("api").is_some());
        assert!(json.get("http").is_some());
        assert!(json.get("timestamp").is_some());
        // baseUrl omitted when absent
        assert!(json.get("baseUrl").is_none());
    }

    #[test]
    fn test_remove_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv-leader.info");
        publish(&path, &coords()).unwrap();
        remove(&path).unwrap();
        remove(&path).unwrap();
        assert_eq!(read(&path).unwrap(), None);
    }
}
