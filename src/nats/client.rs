//! NATS client wrapper
//!
//! Connection management with fast initial failure, plus access to the
//! JetStream key-value bucket backing the shared store and the core
//! publish/subscribe primitives used by the event channel.

use async_nats::jetstream::{self, kv};
use async_nats::{Client, ConnectOptions};
use bytes::Bytes;
use std::time::Duration;
use tracing::info;

use crate::config::NatsArgs;
use crate::types::TallyError;

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Connection timeout for the initial connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// NATS client wrapper
#[derive(Clone)]
pub struct NatsClient {
    /// Underlying NATS client
    client: Client,
}

impl NatsClient {
    /// Connect to the NATS server named in `args`
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self, TallyError> {
        let url = args
            .nats_url
            .as_deref()
            .ok_or_else(|| TallyError::Config("NATS_URL is not set".into()))?;

        info!("Connecting to NATS at {}", url);

        // No retry_on_initial_connect(): an unreachable server must fail fast so
        // the engine can start in fallback mode. Reconnection still works after
        // a successful initial connection.
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(CONNECT_TIMEOUT);

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(url)
            .await
            .map_err(|e| TallyError::Nats(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", url);

        Ok(Self { client })
    }

    /// Open (or create) the key-value bucket used by the shared store
    pub async fn key_value(&self, bucket: &str) -> Result<kv::Store, TallyError> {
        let context = jetstream::new(self.client.clone());

        match context.get_key_value(bucket).await {
            Ok(store) => Ok(store),
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| TallyError::Nats(format!("Key-value bucket {}: {}", bucket, e))),
        }
    }

    /// Publish a message to a subject
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TallyError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| TallyError::Nats(format!("Publish failed: {}", e)))
    }

    /// Subscribe to a subject (wildcards allowed)
    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber, TallyError> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TallyError::Nats(format!("Subscribe failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let args = NatsArgs {
            nats_url: None,
            nats_user: None,
            nats_password: None,
        };
        let err = NatsClient::new(&args, "tally-test").await.err().unwrap();
        assert!(matches!(err, TallyError::Config(_)));
    }

    // Connection tests require a running NATS server with JetStream enabled
}
