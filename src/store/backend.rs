//! Key-value backend trait
//!
//! Both the shared NATS bucket and the in-process fallback implement this
//! trait, so the store facade (and tests) can swap them freely.

use bytes::Bytes;
use glob::Pattern;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::types::{Result, TallyError};

/// Outcome of an atomic increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    /// Counter value after the increment
    pub value: i64,
    /// Whether this increment created the key
    pub created: bool,
}

/// A TTL-capable key-value backend
///
/// Values are opaque bytes; counters are stored as ASCII decimal so that
/// `get` on a counter key returns its textual value.
#[async_trait::async_trait]
pub trait KvBackend: Send + Sync {
    /// Short backend name for logs and status
    fn name(&self) -> &'static str;

    /// Read a value; expired keys read as absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically add `amount` to the counter at `key`, creating it at
    /// `amount` when absent or expired. `ttl_on_create` applies only when
    /// this call created the key.
    async fn increment(
        &self,
        key: &str,
        amount: i64,
        ttl_on_create: Option<Duration>,
    ) -> Result<Increment>;

    /// Set the TTL of an existing key; returns false if the key is absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Whether a live (non-expired) value exists
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All live keys matching a glob pattern
    async fn scan(&self, pattern: &Pattern) -> Result<BTreeSet<String>>;

    /// Physically remove expired entries, returning how many were dropped.
    /// Backends that expire eagerly have nothing to do.
    async fn sweep_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Encode a counter value
pub fn encode_counter(value: i64) -> Bytes {
    Bytes::from(value.to_string())
}

/// Decode a counter value stored by `encode_counter`
pub fn decode_counter(key: &str, raw: &[u8]) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| TallyError::InvalidValue {
            key: key.to_string(),
            reason: "not an integer counter".to_string(),
        })
}

/// Add to a counter without wrapping
pub(crate) fn checked_add(key: &str, current: i64, amount: i64) -> Result<i64> {
    current
        .checked_add(amount)
        .ok_or_else(|| TallyError::InvalidValue {
            key: key.to_string(),
            reason: "counter overflow".to_string(),
        })
}
