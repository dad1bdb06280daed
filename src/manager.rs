use anyhow::Result;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::cache::TtlCache;
use crate::client::ClientFactory;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::registry::{ConnectionRegistry, RegistryError, RegistryStats};
use crate::retry::RetryPolicy;
use crate::session::SessionCredential;

/// One explicitly constructed bundle of the resilience components.
///
/// Construct it once at startup and share it (typically behind an `Arc`).
/// Every piece of shared state lives inside, so independent instances (one
/// per test, for example) never interfere with each other.
pub struct ApiManager<F: ClientFactory> {
    registry: ConnectionRegistry<F>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    cache: TtlCache<Value>,
}

impl<F: ClientFactory> ApiManager<F> {
    /// Build all components from one [`Config`]. Must be called within a
    /// tokio runtime (the registry and limiter spawn background tasks).
    pub fn new(factory: F, config: Config) -> Self {
        Self {
            registry: ConnectionRegistry::new(factory, config.registry),
            limiter: RateLimiter::new(config.rate_limiter),
            retry: RetryPolicy::new(config.retry),
            cache: TtlCache::new(config.cache),
        }
    }

    /// See [`ConnectionRegistry::get_connection`].
    pub async fn get_connection(
        &self,
        credential: &SessionCredential,
    ) -> Result<Arc<F::Handle>, RegistryError> {
        self.registry.get_connection(credential).await
    }

    /// See [`ConnectionRegistry::disconnect`].
    pub async fn disconnect(&self, credential: &SessionCredential) {
        self.registry.disconnect(credential).await;
    }

    /// See [`ConnectionRegistry::cleanup_all`].
    pub async fn cleanup_all(&self) {
        self.registry.cleanup_all().await;
    }

    /// Run `op` through the paced queue only (no retries).
    pub async fn with_rate_limit<T, Op, Fut>(&self, op: Op, priority: bool) -> Result<T>
    where
        Op: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.limiter.execute(op, priority).await
    }

    /// Run `op` with retry/backoff only (no pacing).
    pub async fn safe_execute<T, Op, Fut>(&self, op: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.safe_execute(op).await
    }

    /// Run `op` with both layers: paced dispatch on the outside, retry/
    /// backoff on the inside. One queue slot covers the whole retry loop, so
    /// a long flood wait does not let other requests overtake the remote
    /// call-rate budget.
    pub async fn call<T, Op, Fut>(&self, op: Op, priority: bool) -> Result<T>
    where
        Op: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let retry = self.retry.clone();
        self.limiter
            .execute(move || async move { retry.safe_execute(op).await }, priority)
            .await
    }

    pub async fn registry_stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    pub fn registry(&self) -> &ConnectionRegistry<F> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Shared lookup cache. Values are JSON so heterogeneous API results
    /// (users, chats, dialog listings) share one store.
    pub fn cache(&self) -> &TtlCache<Value> {
        &self.cache
    }
}
