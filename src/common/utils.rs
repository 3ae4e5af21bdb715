//! Utility functions for metakv

use std::net::IpAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Hostname of this machine, or "unknown" when unavailable
pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Best-effort local IP address, falling back to the hostname.
///
/// Connecting a UDP socket never sends a packet; it only asks the kernel
/// which source address would be used for that destination.
pub fn local_ip() -> String {
    fn probe() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        Some(socket.local_addr().ok()?.ip())
    }

    match probe() {
        Some(ip) if !ip.is_loopback() => ip.to_string(),
        _ => hostname(),
    }
}

/// Normalize a path to forward-slash form, regardless of host conventions
pub fn to_slash(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::RootDir => out.push('/'),
            Component::Normal(part) => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str("..");
            }
            Component::Prefix(prefix) => out.push_str(&prefix.as_os_str().to_string_lossy()),
        }
    }
    out
}

/// Relative forward-slash path of `path` under `base`; falls back to the
/// full path when `path` is not under `base`.
pub fn relative_slash(base: &Path, path: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => to_slash(rel),
        Err(_) => to_slash(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_now_ms_is_positive() {
        let a = now_ms();
        assert!(a > 1_600_000_000_000);
        assert!(now_ms() >= a);
    }

    #[test]
    fn test_hostname_nonempty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn test_to_slash() {
        assert_eq!(to_slash(Path::new("a/b/c.txt")), "a/b/c.txt");
        assert_eq!(to_slash(Path::new("/a/b")), "/a/b");
        assert_eq!(to_slash(Path::new("./a/b")), "a/b");
    }

    #[test]
    fn test_relative_slash() {
        let base = PathBuf::from("/files");
        assert_eq!(
            relative_slash(&base, Path::new("/files/movies/x.mkv")),
            "movies/x.mkv"
        );
        // Outside the base: full path is returned
        assert_eq!(relative_slash(&base, Path::new("/other/y")), "/other/y");
    }
}
