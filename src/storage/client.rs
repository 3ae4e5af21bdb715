//! Connection-pooled client for the KV store
//!
//! The client is built to be re-pointed at a different store when leadership
//! moves: `connect` swaps the pool in place, so holders of the outer client
//! never need to be rebuilt. Metadata lives as flat keys
//! `/file/{hashId}/{property}`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use crate::common::{Error, Result};
use crate::storage::resp::{self, Value};

const POOL_SIZE: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const OP_TIMEOUT: Duration = Duration::from_secs(30);
const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const SCAN_TIMEOUT: Duration = Duration::from_secs(60);
const SCAN_BATCH: &[u8] = b"1000";

type Conn = BufStream<TcpStream>;

async fn exec(conn: &mut Conn, args: &[&[u8]]) -> Result<Value> {
    resp::write_command(conn, args).await?;
    conn.flush().await?;
    resp::read_value(conn).await
}

/// Fixed-size pool of RESP connections to one store address.
struct Pool {
    addr: String,
    idle: tokio::sync::Mutex<Vec<Conn>>,
    permits: Arc<Semaphore>,
}

impl Pool {
    fn new(addr: String) -> Self {
        Self {
            addr,
            idle: tokio::sync::Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(POOL_SIZE)),
        }
    }

    async fn dial(&self) -> Result<Conn> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Timeout(format!("dial {}", self.addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", self.addr, e)))?;
        Ok(BufStream::new(stream))
    }

    /// Run one command on a pooled connection. A connection that errored is
    /// discarded rather than returned to the pool.
    async fn command(&self, args: &[&[u8]]) -> Result<Value> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::NotConnected)?;

        let mut conn = match self.idle.lock().await.pop() {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        match exec(&mut conn, args).await {
            Ok(value) => {
                self.idle.lock().await.push(conn);
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Run several commands pipelined on one connection, returning one reply
    /// per command.
    async fn pipeline(&self, commands: &[Vec<Vec<u8>>]) -> Result<Vec<Value>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::NotConnected)?;

        let mut conn = match self.idle.lock().await.pop() {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        let run = async {
            for command in commands {
                let args: Vec<&[u8]> = command.iter().map(|a| a.as_slice()).collect();
                resp::write_command(&mut conn, &args).await?;
            }
            conn.flush().await?;

            let mut replies = Vec::with_capacity(commands.len());
            for _ in commands {
                replies.push(resp::read_value(&mut conn).await?);
            }
            Ok(replies)
        };

        match run.await {
            Ok(replies) => {
                self.idle.lock().await.push(conn);
                Ok(replies)
            }
            Err(e) => Err(e),
        }
    }
}

/// Strip any `scheme://` prefix and trailing slash from a store URL.
fn host_port(url: &str) -> String {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    rest.trim_end_matches('/').to_string()
}

/// Pooled storage client with the metadata operations of the control surface.
pub struct StorageClient {
    prefix: String,
    pool: std::sync::RwLock<Option<Arc<Pool>>>,
}

impl StorageClient {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            pool: std::sync::RwLock::new(None),
        }
    }

    /// Connect (or reconnect) to the store at `url`, verifying with a ping.
    /// The previous pool, if any, is replaced only after the ping succeeds.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let addr = host_port(url);
        let pool = Arc::new(Pool::new(addr.clone()));

        tokio::time::timeout(SHORT_TIMEOUT, pool.command(&[b"PING"]))
            .await
            .map_err(|_| Error::Timeout(format!("ping {}", addr)))??
            .ok()?;

        *self.pool.write().unwrap() = Some(pool);
        tracing::info!("connected to store at {}", addr);
        Ok(())
    }

    /// Tear down the pool. Subsequent operations fail with `NotConnected`.
    pub fn close(&self) {
        *self.pool.write().unwrap() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.pool.read().unwrap().is_some()
    }

    /// Last-mile liveness: a ping within a 2 s budget.
    pub async fn health(&self) -> bool {
        let Ok(pool) = self.current_pool() else {
            return false;
        };
        matches!(
            tokio::time::timeout(HEALTH_TIMEOUT, pool.command(&[b"PING"])).await,
            Ok(Ok(Value::Simple(ref s))) if s == "PONG"
        )
    }

    fn current_pool(&self) -> Result<Arc<Pool>> {
        self.pool.read().unwrap().clone().ok_or(Error::NotConnected)
    }

    async fn command(&self, budget: Duration, args: &[&[u8]]) -> Result<Value> {
        let pool = self.current_pool()?;
        tokio::time::timeout(budget, pool.command(args))
            .await
            .map_err(|_| Error::Timeout(format!("{:?} budget exceeded", budget)))?
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn file_prefix(&self, hash_id: &str) -> String {
        self.build_key(&format!("/file/{}", hash_id))
    }

    /// SCAN the full keyspace for `pattern`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let pool = self.current_pool()?;
        tokio::time::timeout(SCAN_TIMEOUT, Self::scan_keys_inner(&pool, pattern))
            .await
            .map_err(|_| Error::Timeout("scan".into()))?
    }

    async fn scan_keys_inner(pool: &Pool, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = "0".to_string();

        loop {
            let reply = pool
                .command(&[
                    b"SCAN",
                    cursor.as_bytes(),
                    b"MATCH",
                    pattern.as_bytes(),
                    b"COUNT",
                    SCAN_BATCH,
                ])
                .await?;

            let mut items = reply.into_array()?.into_iter();
            cursor = items
                .next()
                .ok_or_else(|| Error::Protocol("scan reply missing cursor".into()))?
                .into_string()?
                .unwrap_or_default();
            let batch = items
                .next()
                .ok_or_else(|| Error::Protocol("scan reply missing keys".into()))?
                .into_array()?;

            for key in batch {
                if let Some(key) = key.into_string()? {
                    keys.push(key);
                }
            }

            if cursor == "0" {
                break;
            }
        }

        Ok(keys)
    }

    // === Metadata operations ===

    /// All properties of a file as a flat map, or `None` when no key exists.
    pub async fn get_metadata_flat(&self, hash_id: &str) -> Result<Option<HashMap<String, String>>> {
        let prefix = self.file_prefix(hash_id);
        let keys = self.scan_keys(&format!("{}/*", prefix)).await?;
        if keys.is_empty() {
            return Ok(None);
        }

        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"MGET");
        for key in &keys {
            args.push(key.as_bytes());
        }
        let values = self.command(OP_TIMEOUT, &args).await?.into_array()?;

        let mut result = HashMap::new();
        for (key, value) in keys.iter().zip(values) {
            if let Some(value) = value.into_string()? {
                let prop = key
                    .strip_prefix(&format!("{}/", prefix))
                    .unwrap_or(key)
                    .to_string();
                result.insert(prop, value);
            }
        }

        if result.is_empty() {
            return Ok(None);
        }
        Ok(Some(result))
    }

    /// Store a flat property map. Existing properties not named are kept
    /// (the full-replace semantics live in the HTTP layer, which deletes
    /// first when it wants them).
    pub async fn set_metadata_flat(
        &self,
        hash_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if metadata.is_empty() {
            return Ok(());
        }

        let prefix = self.file_prefix(hash_id);
        let commands: Vec<Vec<Vec<u8>>> = metadata
            .iter()
            .map(|(prop, value)| {
                vec![
                    b"SET".to_vec(),
                    format!("{}/{}", prefix, prop).into_bytes(),
                    value.clone().into_bytes(),
                ]
            })
            .collect();

        let pool = self.current_pool()?;
        let replies = tokio::time::timeout(OP_TIMEOUT, pool.pipeline(&commands))
            .await
            .map_err(|_| Error::Timeout("batch set".into()))??;
        for reply in replies {
            reply.ok()?;
        }
        Ok(())
    }

    /// PATCH semantics: upsert the given properties, never delete missing
    /// ones. Returns how many properties were written.
    pub async fn merge_metadata_flat(
        &self,
        hash_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<usize> {
        self.set_metadata_flat(hash_id, metadata).await?;
        Ok(metadata.len())
    }

    /// Delete every property of a file; returns the number of keys removed.
    pub async fn delete_metadata(&self, hash_id: &str) -> Result<i64> {
        let prefix = self.file_prefix(hash_id);
        let keys = self.scan_keys(&format!("{}/*", prefix)).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"DEL");
        for key in &keys {
            args.push(key.as_bytes());
        }
        self.command(OP_TIMEOUT, &args).await?.into_int()
    }

    /// All distinct file hash IDs in the store, sorted.
    pub async fn all_hash_ids(&self) -> Result<Vec<String>> {
        let prefix = self.build_key("/file/");
        let keys = self.scan_keys(&format!("{}*", prefix)).await?;

        let mut ids = BTreeSet::new();
        for key in keys {
            let stripped = key.strip_prefix(&prefix).unwrap_or(&key);
            if let Some(id) = stripped.split('/').next() {
                if !id.is_empty() {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    pub async fn count_files(&self) -> Result<usize> {
        Ok(self.all_hash_ids().await?.len())
    }

    pub async fn get_property(&self, hash_id: &str, property: &str) -> Result<Option<String>> {
        let key = format!("{}/{}", self.file_prefix(hash_id), property);
        self.command(SHORT_TIMEOUT, &[b"GET", key.as_bytes()])
            .await?
            .into_string()
    }

    pub async fn set_property(&self, hash_id: &str, property: &str, value: &str) -> Result<()> {
        let key = format!("{}/{}", self.file_prefix(hash_id), property);
        self.command(SHORT_TIMEOUT, &[b"SET", key.as_bytes(), value.as_bytes()])
            .await?
            .ok()
    }

    pub async fn delete_property(&self, hash_id: &str, property: &str) -> Result<()> {
        let key = format!("{}/{}", self.file_prefix(hash_id), property);
        self.command(SHORT_TIMEOUT, &[b"DEL", key.as_bytes()])
            .await?
            .ok()
    }

    /// Add a value to a pipe-delimited set property. Returns whether the
    /// value was actually added.
    pub async fn add_to_set(&self, hash_id: &str, property: &str, value: &str) -> Result<bool> {
        let current = self.get_property(hash_id, property).await?;
        match pipe_set_add(current.as_deref(), value) {
            Some(updated) => {
                self.set_property(hash_id, property, &updated).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a value from a pipe-delimited set property. Returns whether the
    /// value was present. An emptied set deletes the key.
    pub async fn remove_from_set(&self, hash_id: &str, property: &str, value: &str) -> Result<bool> {
        let Some(current) = self.get_property(hash_id, property).await? else {
            return Ok(false);
        };
        match pipe_set_remove(&current, value) {
            None => Ok(false),
            Some(Some(updated)) => {
                self.set_property(hash_id, property, &updated).await?;
                Ok(true)
            }
            Some(None) => {
                self.delete_property(hash_id, property).await?;
                Ok(true)
            }
        }
    }

    /// Find the file path whose `poster` or `backdrop` property equals `cid`.
    pub async fn lookup_path_by_cid(&self, cid: &str) -> Result<Option<String>> {
        if cid.is_empty() {
            return Ok(None);
        }

        for hash_id in self.all_hash_ids().await? {
            for (cid_prop, path_prop) in [("poster", "posterPath"), ("backdrop", "backdropPath")] {
                if self.get_property(&hash_id, cid_prop).await?.as_deref() == Some(cid) {
                    if let Some(path) = self.get_property(&hash_id, path_prop).await? {
                        if !path.is_empty() {
                            return Ok(Some(path));
                        }
                    }
                }
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl crate::leader::StorageConnector for StorageClient {
    async fn connect(&self, url: &str) -> Result<()> {
        StorageClient::connect(self, url).await
    }

    async fn close(&self) -> Result<()> {
        StorageClient::close(self);
        Ok(())
    }
}

/// New pipe-delimited value after adding `value`, or `None` when it is
/// already a member.
fn pipe_set_add(current: Option<&str>, value: &str) -> Option<String> {
    let mut members: Vec<&str> = match current {
        Some(s) if !s.is_empty() => s.split('|').collect(),
        _ => Vec::new(),
    };
    if members.contains(&value) {
        return None;
    }
    members.push(value);
    Some(members.join("|"))
}

/// `None` when `value` is not a member; `Some(None)` when removal empties
/// the set; otherwise the new joined value.
fn pipe_set_remove(current: &str, value: &str) -> Option<Option<String>> {
    let members: Vec<&str> = current.split('|').collect();
    if !members.contains(&value) {
        return None;
    }
    let remaining: Vec<&str> = members.into_iter().filter(|m| *m != value).collect();
    if remaining.is_empty() {
        Some(None)
    } else {
        Some(Some(remaining.join("|")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("redis://10.0.0.5:6379"), "10.0.0.5:6379");
        assert_eq!(host_port("kv://host:1234/"), "host:1234");
        assert_eq!(host_port("host:1234"), "host:1234");
    }

    #[test]
    fn test_pipe_set_add() {
        assert_eq!(pipe_set_add(None, "a"), Some("a".into()));
        assert_eq!(pipe_set_add(Some(""), "a"), Some("a".into()));
        assert_eq!(pipe_set_add(Some("a|b"), "c"), Some("a|b|c".into()));
        assert_eq!(pipe_set_add(Some("a|b"), "b"), None);
    }

    #[test]
    fn test_pipe_set_remove() {
        assert_eq!(pipe_set_remove("a|b|c", "b"), Some(Some("a|c".into())));
        assert_eq!(pipe_set_remove("a", "a"), Some(None));
        assert_eq!(pipe_set_remove("a|b", "x"), None);
    }

    /// A stand-in store that answers +PONG to any command frame.
    async fn spawn_pong_server() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if sock.write_all(b"+PONG\r\n").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_ping_and_close() {
        let addr = spawn_pong_server().await;
        let client = StorageClient::new("");

        assert!(!client.is_connected());
        client.connect(&format!("redis://{}", addr)).await.unwrap();
        assert!(client.is_connected());
        assert!(client.health().await);

        client.close();
        assert!(!client.is_connected());
        assert!(!client.health().await);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then release it so nothing listens there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = StorageClient::new("");
        let err = client
            .connect(&format!("redis://127.0.0.1:{}", port))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_ops_require_connection() {
        let client = StorageClient::new("");
        assert!(matches!(
            client.get_property("h", "title").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            client.all_hash_ids().await,
            Err(Error::NotConnected)
        ));
    }
}
