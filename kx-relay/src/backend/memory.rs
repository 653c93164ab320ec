//! In-process backend for single-instance deployments and tests.

use super::KeyValueBackend;
use crate::error::BackendError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &[u8], ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_vec(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// DashMap-backed store.
///
/// Every conditional operation runs under the shard lock of its key, so
/// `add`, `cas` and `incr` are atomic against each other within the process.
/// Expired keys are dropped lazily when touched.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), BackendError> {
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(Entry::new(value, ttl));
                Ok(true)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn cas(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let entry = self.entries.entry(key.to_string());
        let current = match &entry {
            MapEntry::Occupied(occupied) if occupied.get().is_live(now) => {
                Some(occupied.get().value.as_slice())
            }
            _ => None,
        };
        if current != expected {
            return Ok(false);
        }
        entry.insert(Entry::new(value, ttl));
        Ok(true)
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64, BackendError> {
        let now = Instant::now();
        let mut slot = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.insert(Entry::new(b"0", ttl));
                }
                occupied.into_ref()
            }
            MapEntry::Vacant(vacant) => vacant.insert(Entry::new(b"0", ttl)),
        };

        let current: u64 = std::str::from_utf8(&slot.value)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| BackendError::NotACounter {
                key: key.to_string(),
            })?;
        let next = current.saturating_add(1);
        slot.value = next.to_string().into_bytes();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, entry)| entry.is_live(now))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_get_delete() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("k").await.unwrap(), None);

        backend.set("k", b"v", None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn add_only_when_absent() {
        let backend = MemoryBackend::new();
        assert!(backend.add("k", b"first", None).await.unwrap());
        assert!(!backend.add("k", b"second", None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn cas_compares_current_value() {
        let backend = MemoryBackend::new();

        // Absent key only matches `None`
        assert!(!backend.cas("k", Some(b"x"), b"a", None).await.unwrap());
        assert!(backend.cas("k", None, b"a", None).await.unwrap());

        // Stale expectation is refused
        assert!(!backend.cas("k", None, b"b", None).await.unwrap());
        assert!(!backend.cas("k", Some(b"zzz"), b"b", None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"a".to_vec()));

        assert!(backend.cas("k", Some(b"a"), b"b", None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn ttl_expires_keys() {
        let backend = MemoryBackend::new();
        backend
            .set("k", b"v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.is_empty());

        // An expired key counts as absent for add and cas
        backend
            .set("k", b"old", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.cas("k", None, b"new", None).await.unwrap());
    }

    #[tokio::test]
    async fn incr_counts_from_one() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.incr("c", None).await.unwrap(), 1);
        assert_eq!(backend.incr("c", None).await.unwrap(), 2);
        assert_eq!(backend.get("c").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn expire_extends_live_keys_only() {
        let backend = MemoryBackend::new();
        assert!(!backend.expire("k", Duration::from_secs(1)).await.unwrap());

        backend
            .set("k", b"v", Some(Duration::from_millis(40)))
            .await
            .unwrap();
        assert!(backend.expire("k", Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        backend
            .set("gone", b"v", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!backend.expire("gone", Duration::from_secs(60)).await.unwrap());
        assert_eq!(backend.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_rejects_non_counters() {
        let backend = MemoryBackend::new();
        backend.set("c", b"abc", None).await.unwrap();
        assert!(matches!(
            backend.incr("c", None).await,
            Err(BackendError::NotACounter { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_cas_has_one_winner() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set("k", b"base", None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.cas("k", Some(b"base"), &[i], None).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
