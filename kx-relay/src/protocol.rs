//! Request-level handling of the key-exchange protocol.
//!
//! [`RelayProtocol`] validates identifiers, drives the channel store and
//! turns its outcomes into [`ProtocolError`]s. It knows nothing about HTTP
//! beyond the header values it is handed.
//!
//! A channel goes through `created -> exchanging -> closed`, where closed is
//! simply the absence of the record. Reaching the poll ceiling, a third
//! participant or a client report all close it.

use crate::channels::{ReadOutcome, Teardown};
use crate::error::{BackendError, ProtocolError, StoreError};
use crate::server::KeyExchangeRelay;
use kx_types::{ChannelId, ClientId, ETag};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Protocol handler shared by every request.
#[derive(Clone, Debug)]
pub struct RelayProtocol {
    relay: Arc<KeyExchangeRelay>,
}

impl RelayProtocol {
    /// Create a new protocol handler.
    pub fn new(relay: Arc<KeyExchangeRelay>) -> Self {
        Self { relay }
    }

    /// Get the relay this handler serves.
    pub fn relay(&self) -> &Arc<KeyExchangeRelay> {
        &self.relay
    }

    /// Allocate a channel for `client_id`.
    pub async fn new_channel(&self, client_id: Option<&str>) -> Result<ChannelId, ProtocolError> {
        self.client_id(client_id)?;
        let id = self
            .relay
            .channels()
            .create()
            .await
            .map_err(|e| self.store_error(e))?;

        self.relay
            .metrics()
            .channels_created
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Created channel {}", id);
        Ok(id)
    }

    /// Read a channel.
    ///
    /// A read that crosses the poll ceiling still returns the content; the
    /// channel is gone afterwards. A third client is rejected and closes
    /// the channel.
    pub async fn get_channel(
        &self,
        raw_id: &str,
        client_id: Option<&str>,
        if_none_match: Option<&str>,
    ) -> Result<ReadOutcome, ProtocolError> {
        let id = self.channel_id(raw_id)?;
        let caller = self.client_id(client_id)?;
        let tag = if_none_match.and_then(ETag::from_header);

        let read = match self.relay.channels().read(&id, &caller, tag.as_ref()).await {
            Ok(read) => read,
            Err(err @ StoreError::ThirdParticipant { .. }) => {
                self.teardown(&id, Teardown::ThirdParticipant).await;
                return Err(err.into());
            }
            Err(err) => return Err(self.store_error(err)),
        };

        let counter = match read.outcome {
            ReadOutcome::Content { .. } => &self.relay.metrics().reads_total,
            ReadOutcome::NotModified { .. } => &self.relay.metrics().not_modified_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(teardown) = read.teardown {
            self.teardown(&id, teardown).await;
        }
        Ok(read.outcome)
    }

    /// Write a channel. Returns the new version.
    pub async fn put_channel(
        &self,
        raw_id: &str,
        client_id: Option<&str>,
        content: &[u8],
        if_match: Option<&str>,
    ) -> Result<ETag, ProtocolError> {
        let id = self.channel_id(raw_id)?;
        let caller = self.client_id(client_id)?;
        let tag = if_match.and_then(ETag::from_header);

        match self
            .relay
            .channels()
            .write(&id, &caller, content, tag.as_ref())
            .await
        {
            Ok(version) => {
                self.relay
                    .metrics()
                    .writes_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(version)
            }
            Err(StoreError::Conflict { current }) => {
                self.relay
                    .metrics()
                    .conflicts_total
                    .fetch_add(1, Ordering::Relaxed);
                Err(ProtocolError::PreconditionFailed { current })
            }
            Err(err @ StoreError::ThirdParticipant { .. }) => {
                self.teardown(&id, Teardown::ThirdParticipant).await;
                Err(err.into())
            }
            Err(err) => Err(self.store_error(err)),
        }
    }

    /// Forward a client report, deleting `channel` when given.
    ///
    /// The message is the log header and the body joined by a newline.
    pub async fn report(
        &self,
        channel: Option<&str>,
        log_header: Option<&str>,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        let body = String::from_utf8_lossy(body);
        let message = [log_header.unwrap_or_default(), &*body]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if message.trim().is_empty() {
            return Err(ProtocolError::bad_request("empty report"));
        }

        if let Some(raw_id) = channel {
            match ChannelId::parse(raw_id, self.relay.channels().id_length()) {
                Ok(id) => {
                    self.relay
                        .channels()
                        .delete(&id)
                        .await
                        .map_err(|e| self.store_error(e))?;
                    tracing::info!("Channel {} deleted on client report", id);
                }
                Err(e) => tracing::debug!("Report names no valid channel: {}", e),
            }
        }

        self.relay
            .metrics()
            .reports_total
            .fetch_add(1, Ordering::Relaxed);
        self.relay.reporter().report(&message);
        Ok(())
    }

    /// Check the backend answers by adding and deleting a throwaway key.
    pub async fn health_probe(&self) -> Result<(), ProtocolError> {
        let key = format!("health:{}", ChannelId::random(16));
        let backend = self.relay.backend();
        let probe = async {
            let stored = backend.add(&key, b"ok", None).await?;
            backend.delete(&key).await?;
            Ok::<_, BackendError>(stored)
        };
        let reason = match probe.await {
            Ok(true) => return Ok(()),
            Ok(false) => "backend refused the probe write".to_string(),
            Err(e) => e.to_string(),
        };
        tracing::error!("Health probe failed on {}: {}", backend.name(), reason);
        Err(ProtocolError::ServiceUnavailable { reason })
    }

    /// Whether `raw` could name a channel. Malformed ids are never looked up.
    pub fn is_channel_path(&self, raw: &str) -> bool {
        self.channel_id(raw).is_ok()
    }

    fn channel_id(&self, raw: &str) -> Result<ChannelId, ProtocolError> {
        ChannelId::parse(raw, self.relay.channels().id_length())
            .map_err(|_| ProtocolError::NotFound)
    }

    fn client_id(&self, raw: Option<&str>) -> Result<ClientId, ProtocolError> {
        Ok(ClientId::parse(
            raw,
            self.relay.config().channels.client_id_length,
        )?)
    }

    async fn teardown(&self, id: &ChannelId, reason: Teardown) {
        if let Err(e) = self.relay.channels().delete(id).await {
            tracing::error!("Failed to tear down channel {}: {}", id, e);
            return;
        }
        self.relay
            .metrics()
            .teardowns_total
            .fetch_add(1, Ordering::Relaxed);

        match reason {
            Teardown::PollCeiling { polls } => {
                tracing::info!("Channel {} closed after {} reads", id, polls);
            }
            Teardown::ThirdParticipant => {
                self.relay
                    .reporter()
                    .report(&format!("Channel {id} closed: third participant"));
            }
        }
    }

    fn store_error(&self, err: StoreError) -> ProtocolError {
        let err = ProtocolError::from(err);
        if let ProtocolError::ServiceUnavailable { reason } = &err {
            tracing::error!("Backend failure: {}", reason);
            self.relay
                .metrics()
                .backend_errors
                .fetch_add(1, Ordering::Relaxed);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::Config;
    use crate::report::MemoryReporter;

    fn client(c: char) -> String {
        std::iter::repeat(c).take(256).collect()
    }

    fn setup() -> (RelayProtocol, Arc<MemoryReporter>) {
        let reporter = Arc::new(MemoryReporter::new());
        let relay = KeyExchangeRelay::new(
            Config::default(),
            Arc::new(MemoryBackend::new()),
            reporter.clone(),
        );
        (RelayProtocol::new(Arc::new(relay)), reporter)
    }

    fn content(outcome: ReadOutcome) -> (Vec<u8>, ETag) {
        match outcome {
            ReadOutcome::Content { content, version } => (content, version),
            other => panic!("expected content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_channel_requires_client_id() {
        let (protocol, _) = setup();
        assert!(matches!(
            protocol.new_channel(None).await,
            Err(ProtocolError::BadRequest { .. })
        ));
        assert!(matches!(
            protocol.new_channel(Some("short")).await,
            Err(ProtocolError::BadRequest { .. })
        ));

        let a = client('a');
        let id = protocol.new_channel(Some(&a)).await.unwrap();
        assert_eq!(id.as_str().len(), 4);
    }

    #[tokio::test]
    async fn exchange_follows_versions() {
        let (protocol, _) = setup();
        let (a, b) = (client('a'), client('b'));
        let id = protocol.new_channel(Some(&a)).await.unwrap();
        let id = id.as_str();

        let v1 = protocol.put_channel(id, Some(&a), b"one", None).await.unwrap();
        let v2 = protocol
            .put_channel(id, Some(&b), b"two", Some(v1.as_str()))
            .await
            .unwrap();

        let stale = protocol
            .put_channel(id, Some(&a), b"three", Some(v1.as_str()))
            .await;
        assert_eq!(
            stale,
            Err(ProtocolError::PreconditionFailed {
                current: v2.clone()
            })
        );

        let (data, version) = content(protocol.get_channel(id, Some(&a), None).await.unwrap());
        assert_eq!(data, b"two");
        assert_eq!(version, v2);
    }

    #[tokio::test]
    async fn malformed_path_is_not_found_before_client_check() {
        let (protocol, _) = setup();
        assert_eq!(
            protocol.get_channel("BOO!", None, None).await,
            Err(ProtocolError::NotFound)
        );
        assert!(!protocol.is_channel_path("new_channels"));
        assert!(protocol.is_channel_path("abcd"));
    }

    #[tokio::test]
    async fn bad_client_id_is_rejected_on_known_shape() {
        let (protocol, _) = setup();
        assert!(matches!(
            protocol.get_channel("abcd", Some("x"), None).await,
            Err(ProtocolError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn matching_tag_is_not_modified() {
        let (protocol, _) = setup();
        let a = client('a');
        let id = protocol.new_channel(Some(&a)).await.unwrap();
        let v1 = protocol
            .put_channel(id.as_str(), Some(&a), b"one", None)
            .await
            .unwrap();

        let quoted = format!("\"{}\"", v1);
        let outcome = protocol
            .get_channel(id.as_str(), Some(&a), Some(&quoted))
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::NotModified { version: v1 });
        assert_eq!(protocol.relay().channels().poll_count(&id).await.unwrap(), 0);

        // Empty tag never matches
        let outcome = protocol
            .get_channel(id.as_str(), Some(&a), Some(""))
            .await
            .unwrap();
        assert!(matches!(outcome, ReadOutcome::Content { .. }));
    }

    #[tokio::test]
    async fn poll_ceiling_closes_channel_after_response() {
        let (protocol, _) = setup();
        let a = client('a');
        let id = protocol.new_channel(Some(&a)).await.unwrap();
        protocol
            .put_channel(id.as_str(), Some(&a), b"data", None)
            .await
            .unwrap();

        for _ in 0..6 {
            let (data, _) = content(
                protocol
                    .get_channel(id.as_str(), Some(&a), None)
                    .await
                    .unwrap(),
            );
            assert_eq!(data, b"data");
        }
        assert_eq!(
            protocol.get_channel(id.as_str(), Some(&a), None).await,
            Err(ProtocolError::NotFound)
        );
    }

    #[tokio::test]
    async fn third_reader_is_rejected_and_channel_closes() {
        let (protocol, reporter) = setup();
        let (a, b, c) = (client('a'), client('b'), client('c'));
        let id = protocol.new_channel(Some(&a)).await.unwrap();
        let id = id.as_str();
        protocol.put_channel(id, Some(&a), b"hello", None).await.unwrap();
        protocol.get_channel(id, Some(&b), None).await.unwrap();

        assert!(matches!(
            protocol.get_channel(id, Some(&c), None).await,
            Err(ProtocolError::BadRequest { .. })
        ));

        assert_eq!(
            protocol.get_channel(id, Some(&a), None).await,
            Err(ProtocolError::NotFound)
        );
        assert_eq!(
            protocol.get_channel(id, Some(&b), None).await,
            Err(ProtocolError::NotFound)
        );
        assert_eq!(reporter.messages().len(), 1);
    }

    #[tokio::test]
    async fn third_writer_is_rejected_and_channel_closes() {
        let (protocol, _) = setup();
        let (a, b, c) = (client('a'), client('b'), client('c'));
        let id = protocol.new_channel(Some(&a)).await.unwrap();
        let id = id.as_str();
        protocol.put_channel(id, Some(&a), b"one", None).await.unwrap();
        protocol.put_channel(id, Some(&b), b"two", None).await.unwrap();

        assert!(matches!(
            protocol.put_channel(id, Some(&c), b"evil", None).await,
            Err(ProtocolError::BadRequest { .. })
        ));
        assert_eq!(
            protocol.get_channel(id, Some(&a), None).await,
            Err(ProtocolError::NotFound)
        );
    }

    #[tokio::test]
    async fn report_joins_header_and_body() {
        let (protocol, reporter) = setup();
        protocol.report(None, None, b"somelog").await.unwrap();
        protocol.report(None, Some("some"), b"more").await.unwrap();
        assert_eq!(reporter.messages(), vec!["somelog", "some\nmore"]);

        assert!(matches!(
            protocol.report(None, None, b"").await,
            Err(ProtocolError::BadRequest { .. })
        ));
    }

    #[tokio::test]
    async fn report_deletes_named_channel() {
        let (protocol, reporter) = setup();
        let a = client('a');
        let id = protocol.new_channel(Some(&a)).await.unwrap();

        protocol
            .report(Some(id.as_str()), Some("my log"), b"")
            .await
            .unwrap();
        assert_eq!(reporter.messages(), vec!["my log"]);
        assert_eq!(
            protocol.get_channel(id.as_str(), Some(&a), None).await,
            Err(ProtocolError::NotFound)
        );
    }

    #[tokio::test]
    async fn health_probe_leaves_no_keys() {
        let backend = Arc::new(MemoryBackend::new());
        let relay = KeyExchangeRelay::new(
            Config::default(),
            backend.clone(),
            Arc::new(MemoryReporter::new()),
        );
        let protocol = RelayProtocol::new(Arc::new(relay));

        protocol.health_probe().await.unwrap();
        assert!(backend.is_empty());
    }
}
