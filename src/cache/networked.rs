//! Networked store backed by an external key-value service.
//!
//! Physical expiry is delegated to the service (`SET .. EX`); reads still
//! check `timestamp + ttl` locally to absorb clock skew and whole-second TTL
//! rounding on the server. Read-path failures degrade to empty results,
//! while `set` and `clear` propagate.

use super::backend::StorageBackend;
use super::config::MAX_TTL_SECS;
use super::entry::{now_millis, CacheEntry};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Wire operations the networked store needs from a key-value service.
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    /// Delete several keys at once, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Every key starting with `prefix` (full, un-stripped keys).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    async fn close(&self) -> Result<()>;
}

/// Redis implementation over a lazily established multiplexed connection.
pub struct RedisKeyValueClient {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl RedisKeyValueClient {
    /// Parses the URL only; no connection is made until the first command.
    pub fn open(url: &str, connect_timeout: Duration, operation_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid redis url: {}", e),
                ErrorContext::new()
                    .with_field_path("networked.url")
                    .with_source("redis_client"),
            )
        })?;
        Ok(Self {
            client,
            conn: tokio::sync::Mutex::new(None),
            connect_timeout,
            operation_timeout,
        })
    }

    /// Reuse the cached connection or dial a new one.
    ///
    /// The slot lock is only held to read or publish the connection, so
    /// concurrent callers wait on their own dial and never on each other.
    async fn connection(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            Error::storage_with_context(
                "redis connect timed out",
                ErrorContext::new()
                    .with_details(format!("after {:?}", self.connect_timeout))
                    .with_source("redis_client"),
            )
        })??;
        let mut slot = self.conn.lock().await;
        match slot.as_ref() {
            // Another caller won the race; drop ours.
            Some(existing) => Ok(existing.clone()),
            None => {
                debug!("redis connection established");
                *slot = Some(conn.clone());
                Ok(conn)
            }
        }
    }

    async fn run<T: FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T> {
        let mut conn = self.connection().await?;
        let outcome = tokio::time::timeout(self.operation_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| {
                Error::storage_with_context(
                    "redis operation timed out",
                    ErrorContext::new()
                        .with_details(format!("after {:?}", self.operation_timeout))
                        .with_source("redis_client"),
                )
            })?;
        match outcome {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    // Force a reconnect on the next command.
                    *self.conn.lock().await = None;
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl KeyValueClient for RedisKeyValueClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs);
        self.run(cmd).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);
        self.run(cmd).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(&pattern).arg("COUNT").arg(500);
            let (next, batch): (u64, Vec<String>) = self.run(cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may report a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn close(&self) -> Result<()> {
        if self.conn.lock().await.take().is_some() {
            debug!("redis connection released");
        }
        Ok(())
    }
}

/// Escape Redis glob metacharacters so a namespace matches literally.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn expiry_millis(ttl_secs: u64) -> u64 {
    now_millis().saturating_add(ttl_secs.saturating_mul(1000))
}

/// In-process [`KeyValueClient`] with server-style expiry and failure injection.
///
/// Useful for exercising [`NetworkedStore`] without a running service.
#[derive(Default)]
pub struct InMemoryKeyValueClient {
    data: Mutex<HashMap<String, (String, u64)>>,
    failing: AtomicBool,
}

impl InMemoryKeyValueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with a storage error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw stored payload, ignoring expiry.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .ok()
            .and_then(|d| d.get(key).map(|(v, _)| v.clone()))
    }

    /// Server-side expiry instant (epoch ms) of a key.
    pub fn expires_at(&self, key: &str) -> Option<u64> {
        self.data.lock().ok().and_then(|d| d.get(key).map(|(_, t)| *t))
    }

    /// Write a payload directly, bypassing the store (e.g. to plant stale entries).
    pub fn insert_raw(&self, key: &str, value: &str, ttl_secs: u64) {
        if let Ok(mut d) = self.data.lock() {
            d.insert(
                key.to_string(),
                (value.to_string(), expiry_millis(ttl_secs)),
            );
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, u64)>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::storage_with_context(
                "connection refused",
                ErrorContext::new().with_source("in_memory_kv"),
            ));
        }
        let mut data = self.data.lock().map_err(|_| {
            Error::storage_with_context(
                "in-memory kv lock poisoned",
                ErrorContext::new().with_source("in_memory_kv"),
            )
        })?;
        let now = now_millis();
        data.retain(|_, (_, exp)| *exp > now);
        Ok(data)
    }
}

#[async_trait]
impl KeyValueClient for InMemoryKeyValueClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.guard()?.get(key).map(|(v, _)| v.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires = expiry_millis(ttl_secs);
        self.guard()?
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut data = self.guard()?;
        Ok(keys.iter().filter(|k| data.remove(*k).is_some()).count() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.guard()?.contains_key(key))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .guard()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Storage backend delegating to a [`KeyValueClient`] under a namespace prefix.
pub struct NetworkedStore {
    client: Box<dyn KeyValueClient>,
    namespace: String,
}

impl NetworkedStore {
    pub fn new(client: Box<dyn KeyValueClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Build a Redis-backed store; the connection is opened on first use.
    pub fn redis(options: &super::config::NetworkedOptions) -> Result<Self> {
        let client = RedisKeyValueClient::open(
            &options.url,
            options.connect_timeout,
            options.operation_timeout,
        )?;
        Ok(Self::new(Box::new(client), options.namespace.clone()))
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Seconds for the service's native expiry, within `1..=MAX_TTL_SECS`.
    fn physical_ttl(entry: &CacheEntry) -> u64 {
        entry.ttl.clamp(1, MAX_TTL_SECS)
    }
}

#[async_trait]
impl StorageBackend for NetworkedStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let full = self.namespaced(key);
        let raw = match self.client.get(&full).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(key, error = %e, "networked get failed; treating as absent");
                return Ok(None);
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "undecodable cache payload; treating as absent");
                return Ok(None);
            }
        };
        if entry.is_expired_at(now_millis()) {
            debug!(key, "service still holds an expired entry; deleting");
            if let Err(e) = self.client.del(&[full]).await {
                warn!(key, error = %e, "failed to delete expired entry");
            }
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let ttl = Self::physical_ttl(&entry);
        let payload = serde_json::to_string(&entry)?;
        self.client
            .set_ex(&self.namespaced(key), &payload, ttl)
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self.client.del(&[self.namespaced(key)]).await {
            Ok(n) => Ok(n > 0),
            Err(e) => {
                warn!(key, error = %e, "networked delete failed");
                Ok(false)
            }
        }
    }

    async fn clear(&self) -> Result<()> {
        let keys = self.client.scan_prefix(&self.namespace).await?;
        let removed = self.client.del(&keys).await?;
        debug!(namespace = %self.namespace, removed, "cleared networked namespace");
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match self.client.exists(&self.namespaced(key)).await {
            Ok(false) => Ok(false),
            Ok(true) => Ok(self.get(key).await?.is_some()),
            Err(e) => {
                warn!(key, error = %e, "networked exists failed");
                Ok(false)
            }
        }
    }

    async fn size(&self) -> Result<usize> {
        match self.client.scan_prefix(&self.namespace).await {
            Ok(keys) => Ok(keys.len()),
            Err(e) => {
                warn!(error = %e, "networked size failed");
                Ok(0)
            }
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        match self.client.scan_prefix(&self.namespace).await {
            Ok(keys) => Ok(keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&self.namespace).map(str::to_string))
                .collect()),
            Err(e) => {
                warn!(error = %e, "networked key listing failed");
                Ok(Vec::new())
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.close().await
    }

    fn name(&self) -> &'static str {
        "networked"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    struct Shared(Arc<InMemoryKeyValueClient>);

    #[async_trait]
    impl KeyValueClient for Shared {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
            self.0.set_ex(key, value, ttl_secs).await
        }
        async fn del(&self, keys: &[String]) -> Result<u64> {
            self.0.del(keys).await
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.0.exists(key).await
        }
        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.scan_prefix(prefix).await
        }
        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    fn store() -> (NetworkedStore, Arc<InMemoryKeyValueClient>) {
        let kv = Arc::new(InMemoryKeyValueClient::new());
        (
            NetworkedStore::new(Box::new(Shared(kv.clone())), "ns:"),
            kv,
        )
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("a*b?[c]"), r"a\*b\?\[c\]");
        assert_eq!(escape_glob("plain:"), "plain:");
    }

    #[tokio::test]
    async fn test_keys_are_namespaced_and_stripped() {
        let (store, kv) = store();
        let e = CacheEntry::new("k1", json!("v"), 60, "p", "m");
        store.set("k1", e.clone()).await.unwrap();
        assert!(kv.raw("ns:k1").is_some());
        assert_eq!(store.keys().await.unwrap(), vec!["k1".to_string()]);
        assert_eq!(store.get("k1").await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_physical_ttl_comes_from_entry() {
        let (store, kv) = store();
        let before = now_millis();
        store
            .set("k", CacheEntry::new("k", json!(1), 120, "p", "m"))
            .await
            .unwrap();
        let exp = kv.expires_at("ns:k").unwrap();
        assert!(exp >= before + 120_000);
        assert!(exp <= now_millis() + 120_000);
    }

    #[tokio::test]
    async fn test_local_expiry_check_deletes() {
        let (store, kv) = store();
        let stale = CacheEntry::new("k", json!(1), 1, "p", "m")
            .with_timestamp(now_millis() - 10_000);
        // Service still holds it (e.g. clock skew).
        kv.insert_raw("ns:k", &serde_json::to_string(&stale).unwrap(), 60);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(kv.raw("ns:k").is_none());

        kv.insert_raw("ns:k", &serde_json::to_string(&stale).unwrap(), 60);
        assert!(!store.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_only_touches_namespace() {
        let (store, kv) = store();
        kv.insert_raw("other:k", "x", 60);
        store
            .set("a", CacheEntry::new("a", json!(1), 60, "p", "m"))
            .await
            .unwrap();
        store
            .set("b", CacheEntry::new("b", json!(2), 60, "p", "m"))
            .await
            .unwrap();
        assert_eq!(store.size().await.unwrap(), 2);
        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        assert_eq!(kv.raw("other:k").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_read_failures_degrade_write_failures_propagate() {
        let (store, kv) = store();
        store
            .set("a", CacheEntry::new("a", json!(1), 60, "p", "m"))
            .await
            .unwrap();
        kv.set_failing(true);

        assert!(store.get("a").await.unwrap().is_none());
        assert!(!store.has("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.size().await.unwrap(), 0);
        assert!(store.keys().await.unwrap().is_empty());

        let err = store
            .set("b", CacheEntry::new("b", json!(2), 60, "p", "m"))
            .await
            .unwrap_err();
        assert!(err.is_storage());
        assert!(store.clear().await.is_err());

        kv.set_failing(false);
        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_miss() {
        let (store, kv) = store();
        kv.insert_raw("ns:bad", "not json", 60);
        assert!(store.get("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (store, _kv) = store();
        store
            .set("a", CacheEntry::new("a", json!(1), 60, "p", "m"))
            .await
            .unwrap();
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.name(), "networked");
    }

    #[test]
    fn test_redis_url_is_validated() {
        let err = RedisKeyValueClient::open(
            "not a url",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .err()
        .expect("invalid url should be rejected");
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_unresponsive_server_does_not_serialize_callers() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let budget = Duration::from_millis(300);
        let client =
            RedisKeyValueClient::open(&format!("redis://{}", addr), budget, budget).unwrap();
        let store = NetworkedStore::new(Box::new(client), "ns:");

        let started = std::time::Instant::now();
        let store = &store;
        let results = futures::future::join_all((0..8).map(|i| async move {
            let key = format!("k{i}");
            store.get(&key).await
        }))
        .await;
        let elapsed = started.elapsed();

        assert!(results.iter().all(|r| matches!(r, Ok(None))));
        // One connect plus one operation budget, not one per caller.
        assert!(
            elapsed < budget * 4,
            "8 concurrent gets took {:?}",
            elapsed
        );
        accept.abort();
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow() {
        let (store, kv) = store();
        kv.set_ex("ns:raw", "v", u64::MAX / 500).await.unwrap();
        assert_eq!(kv.expires_at("ns:raw"), Some(u64::MAX));

        let e = CacheEntry::new("k", json!(1), u64::MAX / 500, "p", "m");
        store.set("k", e.clone()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(e));
        let exp = kv.expires_at("ns:k").unwrap();
        assert!(exp <= now_millis() + MAX_TTL_SECS * 1000);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis; set AI_CACHE_REDIS_URL"]
    async fn test_live_redis_round_trip() {
        let Ok(url) = std::env::var("AI_CACHE_REDIS_URL") else {
            return;
        };
        let client =
            RedisKeyValueClient::open(&url, Duration::from_secs(2), Duration::from_secs(2))
                .unwrap();
        let store = NetworkedStore::new(Box::new(client), "ai-response-cache-test:");
        store.clear().await.unwrap();
        let e = CacheEntry::new("k", json!({"a": 1}), 5, "p", "m").with_usage(3, 0.1);
        store.set("k", e.clone()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(e));
        assert_eq!(store.keys().await.unwrap(), vec!["k".to_string()]);
        store.clear().await.unwrap();
        store.disconnect().await.unwrap();
    }
}
