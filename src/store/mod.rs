//! Key-value store for Tally
//!
//! A facade over two backends:
//!
//! - **Shared**: NATS JetStream key-value bucket, visible to every process
//! - **Local**: in-process DashMap used when no shared backend is configured
//!   or it could not be opened at construction time
//!
//! The facade prioritises availability over consistency. A transport error
//! or timeout against the shared backend is logged and counted, then:
//!
//! - `get`, `increment`, `exists`, `scan` fall back to best-effort local state
//! - `set`, `delete`, `expire` become no-op failures (return `false`)
//!
//! Callers that need their own failure policy use `try_get` /
//! `try_increment`, which return the raw result of the active backend.
//! Fallback mode is surfaced through [`KeyValueStore::status`], never hidden.

pub mod backend;
pub mod local;
pub mod nats_kv;

pub use backend::{decode_counter, encode_counter, Increment, KvBackend};
pub use local::{LocalBackend, LocalStats};
pub use nats_kv::NatsKvBackend;

use bytes::Bytes;
use glob::Pattern;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::nats::NatsClient;
use crate::types::{Result, TallyError};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// JetStream key-value bucket name
    pub bucket: String,
    /// Upper bound for a single shared-backend round trip
    pub op_timeout: Duration,
    /// Interval of the expiry sweep; also bounds one shared sweep
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: "tally".to_string(),
            op_timeout: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Which backend serves requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Shared backend with cross-process visibility
    Shared,
    /// In-process only: no cross-process visibility, no crash durability
    Fallback,
}

/// Health snapshot of the store
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub mode: StoreMode,
    pub backend: &'static str,
    /// True in fallback mode or once a shared operation has failed
    pub degraded: bool,
    /// Shared-backend operations that failed or timed out
    pub shared_failures: u64,
    pub local: LocalStats,
}

/// Key-value store with shared backend and local fallback
pub struct KeyValueStore {
    shared: Option<Arc<dyn KvBackend>>,
    local: Arc<LocalBackend>,
    config: StoreConfig,
    shared_failures: AtomicU64,
}

impl KeyValueStore {
    /// Store running in fallback mode only
    pub fn local(config: StoreConfig) -> Self {
        Self {
            shared: None,
            local: Arc::new(LocalBackend::new()),
            config,
            shared_failures: AtomicU64::new(0),
        }
    }

    /// Store backed by an explicit shared backend
    pub fn with_backend(shared: Arc<dyn KvBackend>, config: StoreConfig) -> Self {
        Self {
            shared: Some(shared),
            ..Self::local(config)
        }
    }

    /// Pick the shared backend when a NATS connection is available and the
    /// bucket opens; otherwise run in fallback mode. The choice is made once.
    pub async fn connect(nats: Option<&NatsClient>, config: StoreConfig) -> Self {
        let Some(nats) = nats else {
            warn!("No shared backend configured, key-value store in fallback mode");
            return Self::local(config);
        };

        match nats.key_value(&config.bucket).await {
            Ok(kv) => {
                info!(bucket = %config.bucket, "Key-value store using NATS bucket");
                Self::with_backend(Arc::new(NatsKvBackend::new(kv)), config)
            }
            Err(e) => {
                warn!(
                    bucket = %config.bucket,
                    error = %e,
                    "Shared bucket unavailable, key-value store in fallback mode"
                );
                Self::local(config)
            }
        }
    }

    pub fn mode(&self) -> StoreMode {
        if self.shared.is_some() {
            StoreMode::Shared
        } else {
            StoreMode::Fallback
        }
    }

    pub fn status(&self) -> StoreStatus {
        let shared_failures = self.shared_failures.load(Ordering::Relaxed);
        let mode = self.mode();
        StoreStatus {
            mode,
            backend: self.active().name(),
            degraded: mode == StoreMode::Fallback || shared_failures > 0,
            shared_failures,
            local: self.local.stats(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn active(&self) -> &dyn KvBackend {
        match &self.shared {
            Some(shared) => shared.as_ref(),
            None => self.local.as_ref(),
        }
    }

    /// Run an operation against the active backend, bounding shared calls
    /// by the configured timeout
    async fn call<T, F>(&self, op: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.shared.is_none() {
            return fut.await;
        }
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TallyError::Timeout(format!(
                "{} {} exceeded {:?}",
                op, key, self.config.op_timeout
            ))),
        }
    }

    fn note_failure(&self, op: &str, key: &str, err: &TallyError) {
        self.shared_failures.fetch_add(1, Ordering::Relaxed);
        warn!(op = op, key = key, error = %err, "Shared store operation failed, degrading");
    }

    // ========================================================================
    // Raw operations
    // ========================================================================

    /// Read from the active backend without fallback
    pub async fn try_get(&self, key: &str) -> Result<Option<Bytes>> {
        self.call("get", key, self.active().get(key)).await
    }

    /// Atomic increment on the active backend without fallback
    pub async fn try_increment(
        &self,
        key: &str,
        amount: i64,
        ttl_on_create: Option<Duration>,
    ) -> Result<Increment> {
        self.call(
            "increment",
            key,
            self.active().increment(key, amount, ttl_on_create),
        )
        .await
    }

    /// Read a counter (absent = 0) without fallback
    pub async fn try_get_counter(&self, key: &str) -> Result<i64> {
        match self.try_get(key).await? {
            Some(raw) => decode_counter(key, &raw),
            None => Ok(0),
        }
    }

    // ========================================================================
    // Degrading operations
    // ========================================================================

    /// Read a value; on shared failure, best-effort local state
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.try_get(key).await {
            Ok(value) => value,
            Err(e) if e.is_backend_failure() => {
                self.note_failure("get", key, &e);
                self.local.get(key).await.ok().flatten()
            }
            Err(e) => {
                warn!(key = key, error = %e, "Unreadable value, treating as absent");
                None
            }
        }
    }

    /// Write a value; returns false when the write could not be made
    pub async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> bool {
        match self.call("set", key, self.active().set(key, value, ttl)).await {
            Ok(()) => {
                debug!(key = key, ttl_secs = ttl.map(|t| t.as_secs()), "Store set");
                true
            }
            Err(e) => {
                self.note_failure("set", key, &e);
                false
            }
        }
    }

    /// Delete a key; returns false when nothing was deleted or the call failed
    pub async fn delete(&self, key: &str) -> bool {
        match self.call("delete", key, self.active().delete(key)).await {
            Ok(existed) => existed,
            Err(e) => {
                self.note_failure("delete", key, &e);
                false
            }
        }
    }

    /// Atomically add to a counter. Shared failures fall back to the local
    /// counter; only undecodable values are reported as errors.
    pub async fn increment(&self, key: &str, amount: i64) -> Result<Increment> {
        self.increment_with_ttl(key, amount, None).await
    }

    /// Atomic increment that applies `ttl` when it creates the key
    pub async fn increment_with_ttl(
        &self,
        key: &str,
        amount: i64,
        ttl: Option<Duration>,
    ) -> Result<Increment> {
        match self.try_increment(key, amount, ttl).await {
            Err(e) if e.is_backend_failure() => {
                self.note_failure("increment", key, &e);
                self.local.increment(key, amount, ttl).await
            }
            other => other,
        }
    }

    /// Set the TTL of an existing key
    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.call("expire", key, self.active().expire(key, ttl)).await {
            Ok(applied) => applied,
            Err(e) => {
                self.note_failure("expire", key, &e);
                false
            }
        }
    }

    /// Whether a live value exists
    pub async fn exists(&self, key: &str) -> bool {
        match self.call("exists", key, self.active().exists(key)).await {
            Ok(found) => found,
            Err(e) => {
                self.note_failure("exists", key, &e);
                self.local.exists(key).await.unwrap_or(false)
            }
        }
    }

    /// Keys matching a glob pattern (`*`, `?`, `[...]`)
    pub async fn scan(&self, pattern: &str) -> Result<BTreeSet<String>> {
        let compiled = Pattern::new(pattern).map_err(|e| {
            TallyError::InvalidAction(format!("bad key pattern {}: {}", pattern, e))
        })?;

        match self.call("scan", pattern, self.active().scan(&compiled)).await {
            Err(e) if e.is_backend_failure() => {
                self.note_failure("scan", pattern, &e);
                self.local.scan(&compiled).await
            }
            other => other,
        }
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    /// Read a counter (absent = 0) with fallback
    pub async fn get_counter(&self, key: &str) -> Result<i64> {
        match self.get(key).await {
            Some(raw) => decode_counter(key, &raw),
            None => Ok(0),
        }
    }

    /// Read and decode a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| TallyError::InvalidValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let raw = serde_json::to_vec(value)?;
        Ok(self.set(key, Bytes::from(raw), ttl).await)
    }

    /// Sweep expired entries from the local backend and the shared one
    pub async fn cleanup_expired(&self) -> usize {
        let mut removed = self.local.cleanup_expired();

        if let Some(shared) = &self.shared {
            let limit = self.config.cleanup_interval;
            match tokio::time::timeout(limit, shared.sweep_expired()).await {
                Ok(Ok(reaped)) => removed += reaped,
                Ok(Err(e)) => self.note_failure("sweep", "*", &e),
                Err(_) => {
                    let e = TallyError::Timeout(format!("sweep exceeded {:?}", limit));
                    self.note_failure("sweep", "*", &e);
                }
            }
        }

        removed
    }
}

/// Spawn a background task that periodically sweeps expired entries
pub fn spawn_cleanup_task(store: Arc<KeyValueStore>, mut shutdown: broadcast::Receiver<()>) {
    let interval = store.config().cleanup_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.recv() => {
                    debug!("Store cleanup task stopping");
                    break;
                }
            }
            let removed = store.cleanup_expired().await;
            let status = store.status();
            debug!(
                removed = removed,
                local_entries = status.local.entries,
                degraded = status.degraded,
                "Store cleanup completed"
            );
        }
    });
    info!(interval_secs = interval.as_secs(), "Store cleanup task started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    /// Shared backend that is always down
    struct DownBackend;

    #[async_trait::async_trait]
    impl KvBackend for DownBackend {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            Err(TallyError::Nats("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<()> {
            Err(TallyError::Nats("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(TallyError::Nats("connection refused".into()))
        }
        async fn increment(&self, _key: &str, _amount: i64, _ttl: Option<Duration>) -> Result<Increment> {
            Err(TallyError::Nats("connection refused".into()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Err(TallyError::Nats("connection refused".into()))
        }
        async fn scan(&self, _pattern: &Pattern) -> Result<BTreeSet<String>> {
            Err(TallyError::Nats("connection refused".into()))
        }
    }

    /// Shared backend that never answers
    struct HangingBackend;

    #[async_trait::async_trait]
    impl KvBackend for HangingBackend {
        fn name(&self) -> &'static str {
            "hanging"
        }
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            std::future::pending().await
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<()> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            std::future::pending().await
        }
        async fn increment(&self, _key: &str, _amount: i64, _ttl: Option<Duration>) -> Result<Increment> {
            std::future::pending().await
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            std::future::pending().await
        }
        async fn scan(&self, _pattern: &Pattern) -> Result<BTreeSet<String>> {
            std::future::pending().await
        }
        async fn sweep_expired(&self) -> Result<usize> {
            std::future::pending().await
        }
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        tags: Vec<String>,
    }

    #[tokio::test]
    async fn test_fallback_mode_is_reported() {
        let store = KeyValueStore::local(StoreConfig::default());
        let status = store.status();
        assert_eq!(status.mode, StoreMode::Fallback);
        assert_eq!(status.backend, "local");
        assert!(status.degraded);
    }

    #[tokio::test]
    async fn test_json_roundtrip_within_ttl() {
        let store = KeyValueStore::local(StoreConfig::default());
        let doc = Doc {
            name: "한국어".to_string(),
            tags: vec!["a".into(), "b".into()],
        };

        assert!(store
            .set_json("doc:1", &doc, Some(Duration::from_secs(60)))
            .await
            .unwrap());
        let back: Option<Doc> = store.get_json("doc:1").await.unwrap();
        assert_eq!(back, Some(doc));
    }

    #[tokio::test]
    async fn test_get_json_reports_undecodable() {
        let store = KeyValueStore::local(StoreConfig::default());
        store.set("doc:bad", Bytes::from_static(b"not json"), None).await;
        assert!(store.get_json::<Doc>("doc:bad").await.is_err());
    }

    #[tokio::test]
    async fn test_shared_failures_degrade_without_errors() {
        let store = KeyValueStore::with_backend(Arc::new(DownBackend), StoreConfig::default());
        assert_eq!(store.mode(), StoreMode::Shared);

        assert!(!store.set("k", Bytes::from_static(b"v"), None).await);
        assert!(!store.delete("k").await);
        assert!(!store.expire("k", Duration::from_secs(1)).await);
        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);

        // Increments land in the local fallback
        assert_eq!(store.increment("c", 2).await.unwrap().value, 2);
        assert_eq!(store.increment("c", 3).await.unwrap().value, 5);
        assert_eq!(store.get_counter("c").await.unwrap(), 5);
        assert_eq!(store.scan("*").await.unwrap().len(), 1);

        // Raw calls surface the failure
        assert!(store.try_get("c").await.unwrap_err().is_backend_failure());

        let status = store.status();
        assert!(status.degraded);
        assert!(status.shared_failures >= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_timeouts_are_failures() {
        let config = StoreConfig {
            op_timeout: Duration::from_millis(50),
            ..StoreConfig::default()
        };
        let store = KeyValueStore::with_backend(Arc::new(HangingBackend), config);

        let err = store.try_get("k").await.unwrap_err();
        assert!(matches!(err, TallyError::Timeout(_)));
        assert_eq!(store.increment("k", 1).await.unwrap().value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sweeps_shared_backend() {
        let shared = Arc::new(LocalBackend::new());
        let store = KeyValueStore::with_backend(shared.clone(), StoreConfig::default());

        let ttl = Some(Duration::from_secs(10));
        assert!(store.set("usage:u1:talk:2024-05-01", Bytes::from_static(b"3"), ttl).await);
        assert!(store.set("usage:u2:talk:2024-05-01", Bytes::from_static(b"1"), ttl).await);
        assert!(store.set("profile:u1", Bytes::from_static(b"{}"), None).await);

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.cleanup_expired().await, 2);
        assert_eq!(shared.stats().entries, 1);
        assert!(store.exists("profile:u1").await);
        assert_eq!(store.cleanup_expired().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_shared_sweep_is_a_failure() {
        let config = StoreConfig {
            cleanup_interval: Duration::from_millis(100),
            ..StoreConfig::default()
        };
        let store = KeyValueStore::with_backend(Arc::new(HangingBackend), config);

        assert_eq!(store.cleanup_expired().await, 0);
        assert_eq!(store.status().shared_failures, 1);
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_pattern() {
        let store = KeyValueStore::local(StoreConfig::default());
        assert!(store.scan("usage:[").await.is_err());
    }
}
