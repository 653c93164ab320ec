//! Key/value backends shared by every relay instance.
//!
//! The channel store and the blacklist only talk to a [`KeyValueBackend`].
//! Production deployments point every instance at the same Redis; a single
//! instance can run on the in-process [`MemoryBackend`], which offers the
//! same atomicity within one process but nothing across processes.

mod memory;
mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

use crate::config::BackendConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Atomic key/value store with per-key TTL.
///
/// A `ttl` of `None` keeps the key until it is deleted.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short name used in logs and health output.
    fn name(&self) -> &'static str;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store `value` unconditionally.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> Result<(), BackendError>;

    /// Store `value` only if `key` is absent. Returns whether it was stored.
    async fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> Result<bool, BackendError>;

    /// Compare-and-swap.
    ///
    /// Stores `value` only if the current value equals `expected`
    /// (`None` meaning the key must be absent). Returns whether it was stored.
    async fn cas(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Atomically increment a decimal counter, creating it at 1 with `ttl`.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64, BackendError>;

    /// Reset the TTL of a live `key`. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Remove `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;
}

/// Connect to the configured shared backend.
///
/// Falls back to an in-process [`MemoryBackend`] when no Redis URL is
/// configured or the connection fails; the relay then only behaves
/// correctly as a single instance.
pub async fn connect(config: &BackendConfig) -> Arc<dyn KeyValueBackend> {
    let Some(url) = config.redis_url.as_deref() else {
        tracing::info!("No shared backend configured, using in-process store (single instance)");
        return Arc::new(MemoryBackend::new());
    };

    match RedisBackend::connect(url, config.key_prefix.clone()).await {
        Ok(backend) => {
            tracing::info!("Connected to shared backend (prefix: {})", config.key_prefix);
            Arc::new(backend)
        }
        Err(e) => {
            tracing::warn!(
                "Shared backend unavailable ({}), falling back to in-process store (single instance)",
                e
            );
            Arc::new(MemoryBackend::new())
        }
    }
}
