//! Event handler trait

use std::future::Future;
use std::sync::Arc;

use super::types::DomainEvent;
use crate::types::Result;

/// Receives events for the names it is subscribed to
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler
///
/// ```ignore
/// channel.subscribe("xp_awarded", handler_fn(|event| async move {
///     tracing::info!(payload = %event.payload, "XP awarded");
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
