//! IP blacklist shared across relay instances.
//!
//! Every instance keeps its own in-memory view and reconciles it with one
//! snapshot key in the shared backend:
//! - [`Blacklist::pull`] merges the remote snapshot into the local view,
//!   never dropping local entries (other instances may not have synced yet).
//! - [`Blacklist::push`] publishes the local view with a CAS against the
//!   snapshot last seen, re-pulling and retrying on every lost race, up to
//!   a fixed number of attempts.
//!
//! Convergence is best effort: a publish that keeps losing races is dropped
//! and retried on the next sync cycle.

use crate::backend::KeyValueBackend;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Backend key of the shared snapshot.
pub const BLACKLIST_KEY: &str = "blacklist";

/// Shared snapshot format: IP to expiry in unix milliseconds (`None` = permanent).
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: BTreeMap<String, Option<u64>>,
}

#[derive(Debug, Default)]
struct BlacklistState {
    entries: HashMap<String, Option<u64>>,
    /// Local changes not yet published.
    dirty: bool,
    /// Bumped on every local mutation.
    generation: u64,
    /// Snapshot bytes last read from or written to the backend; the
    /// expected value of the next CAS.
    remote: Option<Vec<u8>>,
}

impl BlacklistState {
    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }

    /// Drop `ip`; caller holds the state lock.
    fn remove_locked(&mut self, ip: &str) -> bool {
        let removed = self.entries.remove(ip).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    fn snapshot(&self, now: u64) -> Snapshot {
        Snapshot {
            entries: self
                .entries
                .iter()
                .filter(|(_, expires_at)| is_live(**expires_at, now))
                .map(|(ip, expires_at)| (ip.clone(), *expires_at))
                .collect(),
        }
    }
}

/// TTL-aware IP blacklist synchronized through a [`KeyValueBackend`].
pub struct Blacklist {
    backend: Arc<dyn KeyValueBackend>,
    state: Mutex<BlacklistState>,
    /// Held for a whole pull/push so at most one publish is in flight.
    publish: Mutex<()>,
    max_publish_attempts: usize,
}

impl std::fmt::Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blacklist")
            .field("backend", &self.backend.name())
            .field("max_publish_attempts", &self.max_publish_attempts)
            .finish_non_exhaustive()
    }
}

impl Blacklist {
    /// Create an empty blacklist over `backend`.
    pub fn new(backend: Arc<dyn KeyValueBackend>, max_publish_attempts: usize) -> Self {
        Self {
            backend,
            state: Mutex::new(BlacklistState::default()),
            publish: Mutex::new(()),
            max_publish_attempts: max_publish_attempts.max(1),
        }
    }

    /// Whether `ip` is currently blocked.
    ///
    /// An expired entry is removed on the spot and reported as absent.
    pub async fn contains(&self, ip: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.entries.get(ip).copied() {
            None => false,
            Some(expires_at) if is_live(expires_at, now_millis()) => true,
            Some(_) => {
                state.remove_locked(ip);
                tracing::debug!("Blacklist entry for {} expired", ip);
                false
            }
        }
    }

    /// Block `ip`, for `ttl` or until removed.
    pub async fn add(&self, ip: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| now_millis().saturating_add(ttl.as_millis() as u64));
        let mut state = self.state.lock().await;
        state.entries.insert(ip.to_string(), expires_at);
        state.mark_dirty();
    }

    /// Unblock `ip` locally. Returns whether it was present.
    ///
    /// Instances that still hold the entry will hand it back on the next
    /// pull until it expires there too.
    pub async fn remove(&self, ip: &str) -> bool {
        self.state.lock().await.remove_locked(ip)
    }

    /// Number of entries, including expired ones not yet looked up.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether the blacklist holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Blocked IPs, sorted.
    pub async fn ips(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ips: Vec<String> = state.entries.keys().cloned().collect();
        ips.sort();
        ips
    }

    /// Whether local changes are waiting to be published.
    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Merge the shared snapshot into the local view.
    ///
    /// Returns the number of entries added or extended.
    pub async fn pull(&self) -> StoreResult<usize> {
        let _publish = self.publish.lock().await;
        self.pull_locked().await
    }

    /// Publish local changes, if any. Returns whether a snapshot was written.
    pub async fn push(&self) -> StoreResult<bool> {
        let _publish = self.publish.lock().await;
        self.push_locked().await
    }

    /// One sync cycle: pull remote entries, then publish local changes.
    ///
    /// An undecodable snapshot does not stop the cycle; the publish
    /// overwrites it.
    pub async fn sync(&self) -> StoreResult<bool> {
        let _publish = self.publish.lock().await;
        self.pull_or_replace().await?;
        self.push_locked().await
    }

    /// Pull, treating an undecodable snapshot as empty.
    async fn pull_or_replace(&self) -> StoreResult<usize> {
        match self.pull_locked().await {
            Err(StoreError::Decode(e)) => {
                tracing::warn!("Shared blacklist snapshot is unreadable, replacing it: {}", e);
                Ok(0)
            }
            other => other,
        }
    }

    async fn pull_locked(&self) -> StoreResult<usize> {
        let raw = self.backend.get(BLACKLIST_KEY).await?;
        let mut state = self.state.lock().await;
        // Remember the raw bytes even if they fail to decode, so the next
        // CAS can replace a corrupt snapshot.
        state.remote = raw.clone();
        let Some(raw) = raw else {
            return Ok(0);
        };

        let snapshot: Snapshot = rmp_serde::from_slice(&raw)?;
        let now = now_millis();
        let mut merged = 0;
        for (ip, remote_expiry) in snapshot.entries {
            if !is_live(remote_expiry, now) {
                continue;
            }
            let extends = match state.entries.get(&ip) {
                None => true,
                Some(local_expiry) => outlasts(remote_expiry, *local_expiry),
            };
            if extends {
                state.entries.insert(ip, remote_expiry);
                merged += 1;
            }
        }

        if merged > 0 {
            tracing::debug!("Merged {} blacklist entries from shared backend", merged);
        }
        Ok(merged)
    }

    async fn push_locked(&self) -> StoreResult<bool> {
        for attempt in 1..=self.max_publish_attempts {
            let (expected, encoded, generation) = {
                let state = self.state.lock().await;
                if !state.dirty {
                    return Ok(false);
                }
                let encoded = rmp_serde::to_vec(&state.snapshot(now_millis()))?;
                (state.remote.clone(), encoded, state.generation)
            };

            if self
                .backend
                .cas(BLACKLIST_KEY, expected.as_deref(), &encoded, None)
                .await?
            {
                let mut state = self.state.lock().await;
                state.remote = Some(encoded);
                // Mutations made while publishing stay dirty
                if state.generation == generation {
                    state.dirty = false;
                }
                tracing::debug!("Published blacklist (attempt {})", attempt);
                return Ok(true);
            }

            tracing::debug!("Blacklist publish lost a race (attempt {}), reloading", attempt);
            self.pull_or_replace().await?;
        }

        tracing::debug!(
            "Giving up blacklist publish after {} attempts",
            self.max_publish_attempts
        );
        Ok(false)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn is_live(expires_at: Option<u64>, now: u64) -> bool {
    expires_at.map_or(true, |at| at > now)
}

/// Whether expiry `a` blocks for longer than `b`.
fn outlasts(a: Option<u64>, b: Option<u64>) -> bool {
    match (a, b) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(a), Some(b)) => a > b,
    }
}
