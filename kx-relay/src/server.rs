//! Main KeyExchangeRelay server coordination.
//!
//! KeyExchangeRelay owns the channel store, the blacklist and the rate
//! limiter, all built over one shared backend, and wires them into the
//! HTTP listeners.

use crate::backend::{self, KeyValueBackend};
use crate::blacklist::Blacklist;
use crate::channels::ChannelStore;
use crate::config::Config;
use crate::error::Result;
use crate::http::{build_admin_router, build_router};
use crate::limits::RateLimiter;
use crate::report::{FailureReporter, TracingReporter};
use crate::sync::{spawn_sync_task, SyncTask};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Channels created.
    pub channels_created: AtomicU64,
    /// Reads that returned content.
    pub reads_total: AtomicU64,
    /// Reads answered with 304.
    pub not_modified_total: AtomicU64,
    /// Successful writes.
    pub writes_total: AtomicU64,
    /// Writes rejected with 412.
    pub conflicts_total: AtomicU64,
    /// Channels torn down by the poll ceiling or a third participant.
    pub teardowns_total: AtomicU64,
    /// Client reports received.
    pub reports_total: AtomicU64,
    /// Requests rejected because the caller IP is blacklisted.
    pub blocked_requests: AtomicU64,
    /// IPs promoted into the blacklist by this instance.
    pub blacklist_promotions: AtomicU64,
    /// Requests that failed on the backend (503).
    pub backend_errors: AtomicU64,
}

/// Main relay server.
pub struct KeyExchangeRelay {
    config: Config,
    backend: Arc<dyn KeyValueBackend>,
    channels: ChannelStore,
    blacklist: Arc<Blacklist>,
    limiter: RateLimiter,
    reporter: Arc<dyn FailureReporter>,
    metrics: RelayMetrics,
    started_at: Instant,
}

impl std::fmt::Debug for KeyExchangeRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchangeRelay")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .field("channels", &self.channels)
            .field("limiter", &self.limiter)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl KeyExchangeRelay {
    /// Create a relay over `backend`, sending security events to `reporter`.
    pub fn new(
        config: Config,
        backend: Arc<dyn KeyValueBackend>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        let channels = ChannelStore::new(
            backend.clone(),
            config.channels.ttl(),
            config.channels.max_gets,
            config.channels.channel_id_length,
        );
        let blacklist = Arc::new(Blacklist::new(
            backend.clone(),
            config.blacklist.max_publish_attempts,
        ));
        let limiter = RateLimiter::new(config.limits.clone(), blacklist.clone(), reporter.clone());

        Self {
            config,
            backend,
            channels,
            blacklist,
            limiter,
            reporter,
            metrics: RelayMetrics::default(),
            started_at: Instant::now(),
        }
    }

    /// Share the relay and start its background blacklist sync.
    pub fn start(self) -> (Arc<Self>, SyncTask) {
        let period = self.config.blacklist.sync_interval();
        let relay = Arc::new(self);
        let task = spawn_sync_task(relay.blacklist.clone(), period);
        (relay, task)
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the shared backend.
    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// Get the channel store.
    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    /// Get the blacklist.
    pub fn blacklist(&self) -> &Arc<Blacklist> {
        &self.blacklist
    }

    /// Get the rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Get the security-event reporter.
    pub fn reporter(&self) -> &dyn FailureReporter {
        self.reporter.as_ref()
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Seconds since the relay was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Run the relay until `shutdown` resolves.
///
/// Connects the backend, binds the public listener (and the admin listener
/// when configured) and serves until shutdown. The blacklist sync task is
/// stopped last so pending entries are published.
pub async fn serve<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let backend = backend::connect(&config.backend).await;
    let relay = KeyExchangeRelay::new(config, backend, Arc::new(TracingReporter));
    let (relay, sync_task) = relay.start();

    let listener = TcpListener::bind(&relay.config().server.bind_address).await?;
    tracing::info!("kx-relay listening on {}", listener.local_addr()?);

    let admin_stop = CancellationToken::new();
    let admin = match relay.config().admin.bind_address.as_deref() {
        Some(addr) => {
            let admin_listener = TcpListener::bind(addr).await?;
            tracing::info!("Admin endpoints on {}", admin_listener.local_addr()?);
            let router = build_admin_router(relay.clone());
            let token = admin_stop.clone();
            Some(tokio::spawn(async move {
                axum::serve(admin_listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    let result = axum::serve(
        listener,
        build_router(relay.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    admin_stop.cancel();
    if let Some(admin) = admin {
        match admin.await {
            Ok(Err(e)) => tracing::warn!("Admin listener failed: {}", e),
            Err(e) => tracing::warn!("Admin listener task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    sync_task.stop().await;
    tracing::info!("kx-relay stopped");
    result.map_err(Into::into)
}
