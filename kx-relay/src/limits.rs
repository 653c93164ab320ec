//! Per-IP admission limits for kx-relay.
//!
//! Two counters are kept per client IP for the lifetime of the process:
//! - **attempts**: every request that reached the relay
//! - **bad requests**: requests answered with 400, 404 or 405 (malformed
//!   calls and channel-id guessing)
//!
//! When either counter passes its threshold the IP is pushed into the
//! shared [`Blacklist`] and its counters start over. Only the most recently
//! seen IPs are tracked; the least recently seen one is evicted when the
//! working set is full.

use crate::blacklist::Blacklist;
use crate::config::LimitsConfig;
use crate::report::FailureReporter;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    attempts: u32,
    bad_requests: u32,
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Attempts,
    BadRequests,
}

/// Counts requests per IP and promotes abusive IPs into the blacklist.
pub struct RateLimiter {
    config: LimitsConfig,
    blacklist: Arc<Blacklist>,
    reporter: Arc<dyn FailureReporter>,
    /// Ordered from least to most recently seen.
    counters: Mutex<IndexMap<String, Counters>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("blacklist", &self.blacklist)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter that promotes into `blacklist`.
    pub fn new(
        config: LimitsConfig,
        blacklist: Arc<Blacklist>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            config,
            blacklist,
            reporter,
            counters: Mutex::new(IndexMap::new()),
        }
    }

    /// Count a request from `ip`. Returns whether `ip` was just blacklisted.
    pub async fn record_attempt(&self, ip: &str) -> bool {
        self.bump(ip, Counter::Attempts).await
    }

    /// Count a rejected request from `ip`. Returns whether `ip` was just blacklisted.
    pub async fn record_bad_request(&self, ip: &str) -> bool {
        self.bump(ip, Counter::BadRequests).await
    }

    /// Whether `ip` is blacklisted.
    pub async fn is_blocked(&self, ip: &str) -> bool {
        self.blacklist.contains(ip).await
    }

    /// Number of IPs currently tracked (for metrics).
    pub async fn tracked_ips(&self) -> usize {
        self.counters.lock().await.len()
    }

    async fn bump(&self, ip: &str, counter: Counter) -> bool {
        let (limit, count) = {
            let mut counters = self.counters.lock().await;
            let entry = touch(&mut counters, ip, self.config.tracked_ips);
            let (limit, count) = match counter {
                Counter::Attempts => {
                    entry.attempts = entry.attempts.saturating_add(1);
                    (self.config.max_requests, entry.attempts)
                }
                Counter::BadRequests => {
                    entry.bad_requests = entry.bad_requests.saturating_add(1);
                    (self.config.max_bad_requests, entry.bad_requests)
                }
            };
            if limit == 0 || count <= limit {
                return false;
            }
            counters.shift_remove(ip);
            (limit, count)
        };

        self.blacklist
            .add(ip, self.config.blacklist_ttl())
            .await;
        let message = match counter {
            Counter::Attempts => format!("{ip} blacklisted: {count} requests (limit {limit})"),
            Counter::BadRequests => {
                format!("{ip} blacklisted: {count} bad requests (limit {limit})")
            }
        };
        tracing::warn!("{}", message);
        self.reporter.report(&message);
        true
    }
}

/// Counters of `ip`, marked as most recently seen.
///
/// Evicts the least recently seen IP when `capacity` would be exceeded.
fn touch<'a>(
    counters: &'a mut IndexMap<String, Counters>,
    ip: &str,
    capacity: usize,
) -> &'a mut Counters {
    let index = match counters.get_index_of(ip) {
        Some(index) => {
            let last = counters.len() - 1;
            counters.move_index(index, last);
            last
        }
        None => {
            if counters.len() >= capacity.max(1) {
                counters.shift_remove_index(0);
            }
            counters.insert(ip.to_string(), Counters::default());
            counters.len() - 1
        }
    };
    &mut counters[index]
}
