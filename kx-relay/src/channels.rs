//! Channel records and their optimistic-concurrency store.
//!
//! A channel lives under its id as a MessagePack-encoded [`ChannelRecord`].
//! Its poll counter lives next to it under `GET:<id>` so a read only needs
//! an atomic increment, never a rewrite of the record.
//!
//! Both keys share one lifetime: a rewrite of the record refreshes the
//! counter's TTL as well, so a channel kept alive by writes keeps its count.
//!
//! Every rewrite of a record is a CAS against the exact bytes that were
//! read. Losing the CAS means someone else changed the channel in between:
//! the record is read again and the request re-evaluated against it, so a
//! stale `If-Match` turns into a conflict instead of a lost update.

use crate::backend::KeyValueBackend;
use crate::error::{StoreError, StoreResult};
use kx_types::{ChannelId, ClientId, ETag};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Participants a channel accepts.
pub const MAX_PARTICIPANTS: usize = 2;

/// Rewrites attempted before a contended update gives up.
pub const MAX_CAS_ATTEMPTS: usize = 10;

/// Ids drawn before channel creation gives up.
const MAX_ID_ATTEMPTS: usize = 16;

/// Stored state of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Last payload written by either participant.
    pub content: Vec<u8>,
    /// Tag of `content`.
    pub version: ETag,
    /// Distinct clients seen on this channel, in arrival order.
    pub participants: Vec<ClientId>,
}

impl ChannelRecord {
    fn empty() -> Self {
        Self {
            content: Vec::new(),
            version: ETag::of(b""),
            participants: Vec::new(),
        }
    }

    fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn admit(&mut self, caller: &ClientId) -> Admission {
        if self.participants.contains(caller) {
            Admission::Known
        } else if self.participants.len() < MAX_PARTICIPANTS {
            self.participants.push(caller.clone());
            Admission::Joined
        } else {
            Admission::Rejected
        }
    }
}

enum Admission {
    Known,
    Joined,
    Rejected,
}

/// Why a channel must be torn down after the current response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The read reached the poll ceiling.
    PollCeiling {
        /// Reads counted so far.
        polls: u64,
    },
    /// A third distinct client showed up.
    ThirdParticipant,
}

/// What a read returns to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Current payload and its tag.
    Content {
        /// Payload.
        content: Vec<u8>,
        /// Tag of the payload.
        version: ETag,
    },
    /// The caller's `If-None-Match` tag is current.
    NotModified {
        /// Current tag.
        version: ETag,
    },
}

/// Result of [`ChannelStore::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRead {
    /// Response for this request.
    pub outcome: ReadOutcome,
    /// Set when the channel has to be deleted once the response is built.
    pub teardown: Option<Teardown>,
}

/// CRUD and CAS operations over channels.
#[derive(Clone)]
pub struct ChannelStore {
    backend: Arc<dyn KeyValueBackend>,
    ttl: Duration,
    max_gets: u64,
    id_length: usize,
}

impl std::fmt::Debug for ChannelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStore")
            .field("backend", &self.backend.name())
            .field("ttl", &self.ttl)
            .field("max_gets", &self.max_gets)
            .field("id_length", &self.id_length)
            .finish()
    }
}

impl ChannelStore {
    /// Create a store over `backend`.
    ///
    /// * `ttl` - channel lifetime, refreshed on every write
    /// * `max_gets` - successful reads after which a channel is torn down
    /// * `id_length` - length of generated channel ids
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        ttl: Duration,
        max_gets: u64,
        id_length: usize,
    ) -> Self {
        Self {
            backend,
            ttl,
            max_gets,
            id_length,
        }
    }

    /// Length of the ids this store hands out.
    pub fn id_length(&self) -> usize {
        self.id_length
    }

    /// Allocate a fresh, empty channel.
    pub async fn create(&self) -> StoreResult<ChannelId> {
        let record = ChannelRecord::empty().encode()?;

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = ChannelId::random(self.id_length);
            if self
                .backend
                .add(id.as_str(), &record, Some(self.ttl))
                .await?
            {
                // A counter left over from an expired channel with this id
                // must not count against the new one.
                self.backend.delete(&poll_key(&id)).await?;
                tracing::debug!("Created channel {} (attempt {})", id, attempt);
                return Ok(id);
            }
            tracing::debug!("Channel id collision on {}", id);
        }

        Err(StoreError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Read a channel on behalf of `caller`.
    ///
    /// The caller joins the participant set if there is room. A third
    /// distinct caller gets [`StoreError::ThirdParticipant`] and never sees
    /// the payload. A matching `if_none_match` yields
    /// [`ReadOutcome::NotModified`] and does not count as a poll.
    pub async fn read(
        &self,
        id: &ChannelId,
        caller: &ClientId,
        if_none_match: Option<&ETag>,
    ) -> StoreResult<ChannelRead> {
        let record = self.load_and_admit(id, caller).await?;

        if if_none_match == Some(&record.version) {
            return Ok(ChannelRead {
                outcome: ReadOutcome::NotModified {
                    version: record.version,
                },
                teardown: None,
            });
        }

        let polls = self.backend.incr(&poll_key(id), Some(self.ttl)).await?;
        let teardown = (polls >= self.max_gets).then_some(Teardown::PollCeiling { polls });

        Ok(ChannelRead {
            outcome: ReadOutcome::Content {
                content: record.content,
                version: record.version,
            },
            teardown,
        })
    }

    /// Replace a channel's content on behalf of `caller`.
    ///
    /// With `if_match`, the write only happens if the channel still holds
    /// that version; otherwise [`StoreError::Conflict`] carries the current
    /// one. The caller joins the participant set even when the write
    /// conflicts.
    pub async fn write(
        &self,
        id: &ChannelId,
        caller: &ClientId,
        content: &[u8],
        if_match: Option<&ETag>,
    ) -> StoreResult<ETag> {
        let version = ETag::of(content);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.fetch(id).await?;
            let mut record = ChannelRecord::decode(&raw)?;

            let joined = match record.admit(caller) {
                Admission::Known => false,
                Admission::Joined => true,
                Admission::Rejected => {
                    return Err(StoreError::ThirdParticipant {
                        channel: id.to_string(),
                    })
                }
            };

            if let Some(expected) = if_match {
                if *expected != record.version {
                    if joined && !self.swap(id, &raw, &record).await? {
                        continue;
                    }
                    return Err(StoreError::Conflict {
                        current: record.version,
                    });
                }
            }

            record.content = content.to_vec();
            record.version = version.clone();
            if self.swap(id, &raw, &record).await? {
                return Ok(version);
            }
            tracing::debug!("Write to {} lost a race, re-reading", id);
        }

        Err(StoreError::Contention {
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Remove a channel and its poll counter. Returns whether it existed.
    pub async fn delete(&self, id: &ChannelId) -> StoreResult<bool> {
        let existed = self.backend.delete(id.as_str()).await?;
        self.backend.delete(&poll_key(id)).await?;
        Ok(existed)
    }

    /// Number of counted reads of a channel.
    pub async fn poll_count(&self, id: &ChannelId) -> StoreResult<u64> {
        let raw = self.backend.get(&poll_key(id)).await?;
        Ok(raw
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|text| text.parse().ok())
            .unwrap_or(0))
    }

    /// Fetch the current record of a channel, if any.
    pub async fn get(&self, id: &ChannelId) -> StoreResult<Option<ChannelRecord>> {
        match self.backend.get(id.as_str()).await? {
            Some(raw) => Ok(Some(ChannelRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn fetch(&self, id: &ChannelId) -> StoreResult<Vec<u8>> {
        self.backend
            .get(id.as_str())
            .await?
            .ok_or_else(|| StoreError::NotFound {
                channel: id.to_string(),
            })
    }

    /// Load a record and register `caller` as a participant.
    async fn load_and_admit(&self, id: &ChannelId, caller: &ClientId) -> StoreResult<ChannelRecord> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.fetch(id).await?;
            let mut record = ChannelRecord::decode(&raw)?;

            match record.admit(caller) {
                Admission::Known => return Ok(record),
                Admission::Rejected => {
                    return Err(StoreError::ThirdParticipant {
                        channel: id.to_string(),
                    })
                }
                Admission::Joined => {
                    if self.swap(id, &raw, &record).await? {
                        return Ok(record);
                    }
                }
            }
        }

        Err(StoreError::Contention {
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// CAS `record` over `raw` and refresh the poll counter's TTL with it.
    async fn swap(&self, id: &ChannelId, raw: &[u8], record: &ChannelRecord) -> StoreResult<bool> {
        let stored = self
            .backend
            .cas(id.as_str(), Some(raw), &record.encode()?, Some(self.ttl))
            .await?;
        if stored {
            self.backend.expire(&poll_key(id), self.ttl).await?;
        }
        Ok(stored)
    }
}

fn poll_key(id: &ChannelId) -> String {
    format!("GET:{id}")
}
