//! Lazy transport wrapper
//!
//! Agents and builders want a transport reference at construction time,
//! but the overlay host may not exist yet. The wrapper binds on first use:
//! a read-locked fast path once initialized, a rate-limited bind attempt
//! until then. Unbound calls fail with `NotReady` rather than blocking.

use crate::messages::{BidMessage, Intent, MatchResult, TransportEnvelope};
use crate::transport::manager::TransportManager;
use crate::transport::{
    BidHandler, EnvelopeHandler, IntentHandler, MatchResultHandler, Transport, TransportError,
    TransportMetrics,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Supplies the real transport once the underlay host is present
#[async_trait]
pub trait TransportSource: Send + Sync {
    /// Returns the transport when it is ready to serve, `None` otherwise
    async fn acquire(&self) -> Option<Arc<dyn Transport>>;
}

/// [`TransportSource`] that hands out a manager once it reports running
pub struct RunningTransportSource {
    manager: Arc<TransportManager>,
}

impl RunningTransportSource {
    /// Wraps a transport manager
    #[must_use]
    pub fn new(manager: Arc<TransportManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

#[async_trait]
impl TransportSource for RunningTransportSource {
    async fn acquire(&self) -> Option<Arc<dyn Transport>> {
        if self.manager.is_running() {
            Some(Arc::clone(&self.manager) as Arc<dyn Transport>)
        } else {
            None
        }
    }
}

/// Deferred-binding transport
///
/// Double-check pattern: the read lock covers the forwarding fast path;
/// the write lock covers the one-time bind. Failed bind attempts are
/// rate-limited by `retry_interval`.
pub struct LazyTransport {
    source: Arc<dyn TransportSource>,
    inner: RwLock<Option<Arc<dyn Transport>>>,
    retry_interval: Duration,
    last_attempt: Mutex<Option<Instant>>,
}

impl LazyTransport {
    /// Default spacing between bind attempts
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

    /// Creates an unbound wrapper over the given source
    #[must_use]
    pub fn new(source: Arc<dyn TransportSource>) -> Arc<Self> {
        Self::with_retry_interval(source, Self::DEFAULT_RETRY_INTERVAL)
    }

    /// Creates an unbound wrapper with a custom retry interval
    #[must_use]
    pub fn with_retry_interval(source: Arc<dyn TransportSource>, retry_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            inner: RwLock::new(None),
            retry_interval,
            last_attempt: Mutex::new(None),
        })
    }

    /// Whether the real transport has been bound
    pub fn is_initialized(&self) -> bool {
        self.inner.try_read().map(|guard| guard.is_some()).unwrap_or(false)
    }

    /// Returns the bound transport, attempting the bind if necessary
    async fn get(&self) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(transport) = self.inner.read().await.as_ref() {
            return Ok(Arc::clone(transport));
        }
        self.try_initialize().await
    }

    async fn try_initialize(&self) -> Result<Arc<dyn Transport>, TransportError> {
        {
            let mut last = self.last_attempt.lock().map_err(|_| TransportError::NotReady)?;
            if let Some(at) = *last {
                if at.elapsed() < self.retry_interval {
                    return Err(TransportError::NotReady);
                }
            }
            *last = Some(Instant::now());
        }

        let mut inner = self.inner.write().await;
        if let Some(transport) = inner.as_ref() {
            return Ok(Arc::clone(transport));
        }
        match self.source.acquire().await {
            Some(transport) => {
                info!(peer = %transport.local_peer(), "lazy transport bound");
                *inner = Some(Arc::clone(&transport));
                Ok(transport)
            }
            None => {
                debug!("transport source not ready yet");
                Err(TransportError::NotReady)
            }
        }
    }
}

#[async_trait]
impl Transport for LazyTransport {
    fn local_peer(&self) -> String {
        self.inner
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|t| t.local_peer()))
            .unwrap_or_default()
    }

    fn is_running(&self) -> bool {
        self.inner
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|t| t.is_running()))
            .unwrap_or(false)
    }

    fn metrics(&self) -> Result<TransportMetrics, TransportError> {
        self.inner
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|t| t.metrics()))
            .unwrap_or(Err(TransportError::NotReady))
    }

    async fn publish_envelope(
        &self,
        topic: &str,
        envelope: TransportEnvelope,
    ) -> Result<(), TransportError> {
        self.get().await?.publish_envelope(topic, envelope).await
    }

    async fn subscribe_envelopes(
        &self,
        topic: &str,
        handler: EnvelopeHandler,
    ) -> Result<(), TransportError> {
        self.get().await?.subscribe_envelopes(topic, handler).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.get().await?.unsubscribe(topic).await
    }

    async fn publish_intent(&self, intent: &Intent) -> Result<(), TransportError> {
        self.get().await?.publish_intent(intent).await
    }

    async fn publish_bid(&self, bid: &BidMessage) -> Result<(), TransportError> {
        self.get().await?.publish_bid(bid).await
    }

    async fn publish_match_result(&self, result: &MatchResult) -> Result<(), TransportError> {
        self.get().await?.publish_match_result(result).await
    }

    async fn subscribe_intents(
        &self,
        topic: &str,
        handler: IntentHandler,
    ) -> Result<(), TransportError> {
        self.get().await?.subscribe_intents(topic, handler).await
    }

    async fn subscribe_bids(&self, handler: BidHandler) -> Result<(), TransportError> {
        self.get().await?.subscribe_bids(handler).await
    }

    async fn subscribe_matches(&self, handler: MatchResultHandler) -> Result<(), TransportError> {
        self.get().await?.subscribe_matches(handler).await
    }
}
