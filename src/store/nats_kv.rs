//! Shared backend on a NATS JetStream key-value bucket
//!
//! JetStream keys only allow `[-/_=.a-zA-Z0-9]`, so store keys are
//! base64url-encoded. Values are wrapped in a small JSON envelope that
//! carries an optional absolute expiry; expired entries read as absent.
//! Increments are compare-and-swap updates on the entry revision, which
//! makes them atomic across every process sharing the bucket.
//!
//! JetStream knows nothing about envelope expiry, so dead keys are purged
//! from the underlying stream (messages up to the observed revision, no
//! marker left behind) when a read or scan meets them, on `delete`, and by
//! the periodic `sweep_expired`. The bucket has no `max_age`: profiles and
//! XP totals never expire.

use async_nats::jetstream::kv::{self, Operation};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use bytes::Bytes;
use futures_util::StreamExt;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

use super::backend::{checked_add, decode_counter, encode_counter, Increment, KvBackend};
use crate::types::{Result, TallyError};

/// Maximum compare-and-swap attempts before an increment gives up
const MAX_CAS_ATTEMPTS: usize = 16;

/// Stored representation of a value
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    /// Base64 of the raw value bytes
    #[serde(rename = "v")]
    value: String,
    /// Absolute expiry, unix milliseconds
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl Envelope {
    fn new(value: &[u8], expires_at_ms: Option<i64>) -> Self {
        Self {
            value: STANDARD.encode(value),
            expires_at_ms,
        }
    }

    fn decode(key: &str, raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| TallyError::InvalidValue {
            key: key.to_string(),
            reason: format!("bad envelope: {}", e),
        })
    }

    fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn bytes(&self, key: &str) -> Result<Bytes> {
        STANDARD
            .decode(&self.value)
            .map(Bytes::from)
            .map_err(|e| TallyError::InvalidValue {
                key: key.to_string(),
                reason: format!("bad value encoding: {}", e),
            })
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// Latest state of a key in the bucket
enum Slot {
    /// Never written, or history dropped
    Missing,
    /// Deleted, purged or expired; the revision is needed to overwrite it
    Dead(u64),
    Live(Envelope, u64),
}

/// Encode a store key into a valid JetStream key
pub fn encode_key(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Reverse `encode_key`; foreign keys in the bucket decode to `None`
pub fn decode_key(encoded: &str) -> Option<String> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
}

/// Stream subject holding a bucket key
fn key_subject(prefix: &str, encoded: &str) -> String {
    format!("{}{}", prefix, encoded)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_from(now_ms: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64))
}

fn nats_err(op: &str, key: &str, err: impl std::fmt::Display) -> TallyError {
    TallyError::Nats(format!("{} {} failed: {}", op, key, err))
}

/// JetStream key-value backend
pub struct NatsKvBackend {
    kv: kv::Store,
}

impl NatsKvBackend {
    pub fn new(kv: kv::Store) -> Self {
        Self { kv }
    }

    async fn slot(&self, key: &str) -> Result<Slot> {
        let entry = self
            .kv
            .entry(encode_key(key))
            .await
            .map_err(|e| nats_err("entry", key, e))?;

        match entry {
            None => Ok(Slot::Missing),
            Some(entry) if matches!(entry.operation, Operation::Put) => {
                let envelope = Envelope::decode(key, &entry.value)?;
                if envelope.is_expired(now_ms()) {
                    Ok(Slot::Dead(entry.revision))
                } else {
                    Ok(Slot::Live(envelope, entry.revision))
                }
            }
            Some(entry) => Ok(Slot::Dead(entry.revision)),
        }
    }

    /// Drop every stored message of `key` up to `revision`. A later write
    /// to the key is kept.
    async fn reap(&self, key: &str, revision: u64) -> Result<u64> {
        let response = self
            .kv
            .stream
            .purge()
            .filter(key_subject(&self.kv.prefix, &encode_key(key)))
            .sequence(revision + 1)
            .await
            .map_err(|e| nats_err("purge", key, e))?;
        Ok(response.purged)
    }

    async fn reap_quietly(&self, key: &str, revision: u64) {
        if let Err(e) = self.reap(key, revision).await {
            debug!(key = key, error = %e, "Dead key not purged");
        }
    }

    /// Write `payload` only if the key is still at the observed state
    async fn swap(&self, key: &str, observed: Option<u64>, payload: Bytes) -> Result<()> {
        let encoded = encode_key(key);
        match observed {
            Some(revision) => self
                .kv
                .update(&encoded, payload, revision)
                .await
                .map(|_| ())
                .map_err(|e| nats_err("update", key, e)),
            None => self
                .kv
                .create(&encoded, payload)
                .await
                .map(|_| ())
                .map_err(|e| nats_err("create", key, e)),
        }
    }
}

#[async_trait::async_trait]
impl KvBackend for NatsKvBackend {
    fn name(&self) -> &'static str {
        "nats-kv"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.slot(key).await? {
            Slot::Live(envelope, _) => envelope.bytes(key).map(Some),
            Slot::Dead(revision) => {
                self.reap_quietly(key, revision).await;
                Ok(None)
            }
            Slot::Missing => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let payload = Envelope::new(&value, expiry_from(now_ms(), ttl)).encode()?;
        self.kv
            .put(encode_key(key), payload)
            .await
            .map(|_| ())
            .map_err(|e| nats_err("put", key, e))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let (existed, revision) = match self.slot(key).await? {
            Slot::Live(_, revision) => (true, revision),
            Slot::Dead(revision) => (false, revision),
            Slot::Missing => return Ok(false),
        };
        self.reap(key, revision).await?;
        Ok(existed)
    }

    async fn increment(
        &self,
        key: &str,
        amount: i64,
        ttl_on_create: Option<Duration>,
    ) -> Result<Increment> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (next, expires_at_ms, observed, created) = match self.slot(key).await? {
                Slot::Live(envelope, revision) => {
                    let current = decode_counter(key, &envelope.bytes(key)?)?;
                    (
                        checked_add(key, current, amount)?,
                        envelope.expires_at_ms,
                        Some(revision),
                        false,
                    )
                }
                Slot::Dead(revision) => {
                    (amount, expiry_from(now_ms(), ttl_on_create), Some(revision), true)
                }
                Slot::Missing => (amount, expiry_from(now_ms(), ttl_on_create), None, true),
            };

            let payload = Envelope::new(&encode_counter(next), expires_at_ms).encode()?;
            match self.swap(key, observed, payload).await {
                Ok(()) => {
                    return Ok(Increment {
                        value: next,
                        created,
                    })
                }
                Err(e) => debug!(key = key, attempt = attempt, error = %e, "Increment lost a race, retrying"),
            }
        }

        Err(TallyError::BackendUnavailable(format!(
            "increment of {} did not converge after {} attempts",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (envelope, revision) = match self.slot(key).await? {
                Slot::Live(envelope, revision) => (envelope, revision),
                Slot::Missing | Slot::Dead(_) => return Ok(false),
            };

            let updated = Envelope {
                expires_at_ms: expiry_from(now_ms(), Some(ttl)),
                ..envelope
            };
            if self.swap(key, Some(revision), updated.encode()?).await.is_ok() {
                return Ok(true);
            }
        }

        Err(TallyError::BackendUnavailable(format!(
            "expire of {} did not converge after {} attempts",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    async fn scan(&self, pattern: &Pattern) -> Result<BTreeSet<String>> {
        let mut keys = Box::pin(
            self.kv
                .keys()
                .await
                .map_err(|e| nats_err("keys", pattern.as_str(), e))?,
        );

        let mut matched = BTreeSet::new();
        while let Some(encoded) = keys.next().await {
            let encoded = encoded.map_err(|e| nats_err("keys", pattern.as_str(), e))?;
            let Some(key) = decode_key(&encoded) else {
                continue;
            };
            if !pattern.matches(&key) {
                continue;
            }
            // Listing does not know about envelope expiry; confirm liveness
            match self.slot(&key).await? {
                Slot::Live(..) => {
                    matched.insert(key);
                }
                Slot::Dead(revision) => self.reap_quietly(&key, revision).await,
                Slot::Missing => {}
            }
        }

        Ok(matched)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let mut keys = Box::pin(self.kv.keys().await.map_err(|e| nats_err("keys", "*", e))?);

        let mut reaped = 0;
        while let Some(encoded) = keys.next().await {
            let encoded = encoded.map_err(|e| nats_err("keys", "*", e))?;
            let Some(key) = decode_key(&encoded) else {
                continue;
            };
            if let Slot::Dead(revision) = self.slot(&key).await? {
                if self.reap(&key, revision).await? > 0 {
                    reaped += 1;
                }
            }
        }

        if reaped > 0 {
            debug!(count = reaped, "Purged expired shared entries");
        }
        Ok(reaped)
    }
}
