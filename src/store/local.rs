//! In-process fallback backend
//!
//! DashMap-backed storage with lazy TTL expiry on read and a best-effort
//! periodic sweep. Scoped to one running instance: no cross-process
//! visibility and no crash durability.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use glob::Pattern;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::backend::{checked_add, decode_counter, encode_counter, Increment, KvBackend};
use crate::types::Result;

/// Stored value with optional expiry
#[derive(Debug, Clone)]
struct LocalEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Statistics about the local store
#[derive(Debug, Clone, Default)]
pub struct LocalStats {
    pub entries: usize,
    pub expirations: u64,
}

/// In-process key-value backend
#[derive(Default)]
pub struct LocalBackend {
    entries: DashMap<String, LocalEntry>,
    expirations: AtomicU64,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(count = removed, "Cleaned up expired local entries");
        }
        removed
    }

    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.entries.len(),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Drop an entry if it has expired; returns the live entry otherwise
    fn live(&self, key: &str) -> Option<LocalEntry> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
            drop(entry); // Release the shard lock before removing
            if self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl KvBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), LocalEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some() && self.entries.remove(key).is_some())
    }

    async fn increment(
        &self,
        key: &str,
        amount: i64,
        ttl_on_create: Option<Duration>,
    ) -> Result<Increment> {
        let now = Instant::now();

        // The entry guard holds the shard lock, making read-add-write atomic
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let current = decode_counter(key, &occupied.get().value)?;
                let value = checked_add(key, current, amount)?;
                occupied.get_mut().value = encode_counter(value);
                Ok(Increment {
                    value,
                    created: false,
                })
            }
            Entry::Occupied(mut expired) => {
                expired.insert(LocalEntry::new(encode_counter(amount), ttl_on_create));
                self.expirations.fetch_add(1, Ordering::Relaxed);
                Ok(Increment {
                    value: amount,
                    created: true,
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry::new(encode_counter(amount), ttl_on_create));
                Ok(Increment {
                    value: amount,
                    created: true,
                })
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self, pattern: &Pattern) -> Result<BTreeSet<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn sweep_expired(&self) -> Result<usize> {
        Ok(self.cleanup_expired())
    }
}
