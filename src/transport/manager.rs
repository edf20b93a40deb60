//! Transport manager: composes codec, topics, router, and pub/sub
//!
//! The publish path is route (dedup + filter) → access + rate checks →
//! sign → topic validation → serialize → size check → overlay publish.
//! The subscribe path unwraps `pubsub` envelopes, re-admits the decoded
//! envelope through the router, and hands it to the registered handlers.

use crate::messages::{
    now_millis, BidMessage, Intent, MatchResult, TransportEnvelope, MSG_TYPE_BID_COMMITMENT,
    MSG_TYPE_BID_REVEAL, MSG_TYPE_BID_SUBMISSION, MSG_TYPE_INTENT_BROADCAST,
    MSG_TYPE_MATCH_RESULT, MSG_TYPE_PUBSUB,
};
use crate::commitment::{BidCommitment, BidReveal};
use crate::domain_types::{IntentId, IntentPriority};
use crate::transport::codec::{CodecError, MessageCodec};
use crate::transport::pubsub::{GossipOverlay, GossipParams, PubSubEngine};
use crate::transport::router::{MessageRouter, RouterConfig};
use crate::transport::topics::{TopicConfig, TopicRegistry};
use crate::transport::{
    BidHandler, EnvelopeHandler, IntentHandler, MatchResultHandler, Transport, TransportError,
    TransportMetrics, TOPIC_BID_COMMITMENTS, TOPIC_BID_REVEALS, TOPIC_BID_SUBMISSION,
    TOPIC_INTENT_BROADCAST, TOPIC_INTENT_BROADCAST_ALIAS, TOPIC_MATCH_RESULTS,
};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default TTL stamped on locally originated envelopes
const DEFAULT_ENVELOPE_TTL_MS: i64 = 60_000;

/// Transport manager configuration
#[derive(Debug, Clone, Default)]
pub struct TransportManagerConfig {
    /// Gossip mesh parameters for the bound overlay
    pub gossip: GossipParams,
    /// Router dedup and filter settings
    pub router: RouterConfig,
}

/// Owner of the transport sub-components
///
/// Identity key, dedup cache, and topic registry live here for the life of
/// the process; `start` sets them up and `stop` tears them down.
pub struct TransportManager {
    codec: MessageCodec,
    topics: TopicRegistry,
    router: Arc<MessageRouter>,
    pubsub: PubSubEngine,
    inbound: Arc<RwLock<HashMap<String, Vec<EnvelopeHandler>>>>,
    running: AtomicBool,
    published: AtomicU64,
}

impl TransportManager {
    /// Creates a manager over the given overlay, signing with `signing_key`
    #[must_use]
    pub fn new(
        overlay: Arc<dyn GossipOverlay>,
        signing_key: Vec<u8>,
        config: TransportManagerConfig,
    ) -> Arc<Self> {
        let topics = TopicRegistry::new();
        for topic in [
            TOPIC_INTENT_BROADCAST,
            TOPIC_INTENT_BROADCAST_ALIAS,
            TOPIC_BID_SUBMISSION,
            TOPIC_MATCH_RESULTS,
            TOPIC_BID_COMMITMENTS,
            TOPIC_BID_REVEALS,
        ] {
            if let Ok(config) = TopicConfig::public(topic) {
                topics.register(config);
            }
        }
        Arc::new(Self {
            codec: MessageCodec::new(signing_key),
            topics,
            router: Arc::new(MessageRouter::new(config.router.clone())),
            pubsub: PubSubEngine::new(overlay, config.gossip),
            inbound: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            published: AtomicU64::new(0),
        })
    }

    /// Starts the router pruning task and the pub/sub engine
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("transport manager already running");
            return;
        }
        self.router.start();
        self.pubsub.start();
        info!(peer = %self.pubsub.local_peer(), "transport manager started");
    }

    /// Stops the engine and background tasks
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pubsub.stop().await;
        self.inbound.write().await.clear();
        self.router.stop();
        info!("transport manager stopped");
    }

    /// The topic registry, for registering domain-specific topics
    #[must_use]
    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    /// The admission router, for installing extra filters
    #[must_use]
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Builds a signed envelope around a serialized domain payload
    fn make_envelope(
        &self,
        message_type: &str,
        payload: Vec<u8>,
        metadata: HashMap<String, String>,
        priority: i32,
        ttl: i64,
    ) -> Result<TransportEnvelope, TransportError> {
        let sender = self.pubsub.local_peer();
        let timestamp = now_millis();
        let mut envelope = TransportEnvelope {
            id: MessageCodec::message_id(message_type, &sender, timestamp, &payload),
            message_type: message_type.to_string(),
            payload,
            timestamp,
            sender,
            metadata,
            signature: Vec::new(),
            priority,
            ttl,
        };
        if self.pubsub.params().sign_messages {
            self.codec.sign(&mut envelope)?;
        }
        Ok(envelope)
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(value)
            .map_err(|source| TransportError::Codec {
                source: CodecError::EncodeError { source },
            })
    }

    async fn publish_payload(
        &self,
        topic: &str,
        message_type: &str,
        payload: Vec<u8>,
        metadata: HashMap<String, String>,
        priority: i32,
        ttl: i64,
    ) -> Result<(), TransportError> {
        let envelope = self.make_envelope(message_type, payload, metadata, priority, ttl)?;
        self.publish_envelope(topic, envelope).await
    }

    /// Subscribes a typed handler, decoding the payload of matching envelopes
    async fn subscribe_typed<T>(
        &self,
        topic: &str,
        message_type: &'static str,
        handler: Arc<
            dyn Fn(T) -> futures::future::BoxFuture<'static, Result<(), TransportError>>
                + Send
                + Sync,
        >,
    ) -> Result<(), TransportError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let wrapped: EnvelopeHandler = Arc::new(move |envelope: TransportEnvelope| {
            let handler = Arc::clone(&handler);
            async move {
                if envelope.message_type != message_type {
                    return Ok(());
                }
                match serde_json::from_slice::<T>(&envelope.payload) {
                    Ok(decoded) => handler(decoded).await,
                    Err(err) => {
                        warn!(
                            message_id = %envelope.id,
                            expected = message_type,
                            error = %err,
                            "payload decode failed, dropping"
                        );
                        Ok(())
                    }
                }
            }
            .boxed()
        });
        self.subscribe_envelopes(topic, wrapped).await
    }

    /// Publishes a sealed bid commitment
    pub async fn publish_bid_commitment(
        &self,
        commitment: &BidCommitment,
    ) -> Result<(), TransportError> {
        let mut metadata = HashMap::new();
        metadata.insert("intent_id".to_string(), commitment.intent_id.clone());
        metadata.insert("agent_id".to_string(), commitment.agent_id.clone());
        self.publish_payload(
            TOPIC_BID_COMMITMENTS,
            MSG_TYPE_BID_COMMITMENT,
            Self::encode(commitment)?,
            metadata,
            5,
            DEFAULT_ENVELOPE_TTL_MS,
        )
        .await
    }

    /// Publishes a bid reveal
    pub async fn publish_bid_reveal(&self, reveal: &BidReveal) -> Result<(), TransportError> {
        let mut metadata = HashMap::new();
        metadata.insert("intent_id".to_string(), reveal.intent_id.clone());
        metadata.insert("agent_id".to_string(), reveal.agent_id.clone());
        self.publish_payload(
            TOPIC_BID_REVEALS,
            MSG_TYPE_BID_REVEAL,
            Self::encode(reveal)?,
            metadata,
            5,
            DEFAULT_ENVELOPE_TTL_MS,
        )
        .await
    }
}

#[async_trait]
impl Transport for TransportManager {
    fn local_peer(&self) -> String {
        self.pubsub.local_peer()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> Result<TransportMetrics, TransportError> {
        Ok(TransportMetrics {
            subscriptions: self.pubsub.physical_subscriptions(),
            active_topics: self.topics.len(),
            connected_peers: self.pubsub.peer_count(),
            messages_published: self.published.load(Ordering::Relaxed),
            messages_received: self.pubsub.received_count(),
            duplicates_dropped: self.router.duplicate_count(),
            messages_filtered: self.router.dropped_count(),
        })
    }

    async fn publish_envelope(
        &self,
        topic: &str,
        mut envelope: TransportEnvelope,
    ) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }
        self.router.admit(topic, &envelope)?;
        self.topics.validate_access(topic, &envelope.sender)?;
        self.topics.check_rate(topic)?;
        if self.pubsub.params().sign_messages && envelope.signature.is_empty() {
            self.codec.sign(&mut envelope)?;
        }
        self.topics.validate_message(topic, &envelope)?;
        let bytes = self.codec.serialize(&envelope)?;
        let max = self.router.config().max_message_bytes.as_usize();
        if bytes.len() > max {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max,
            });
        }
        self.pubsub.publish(topic, bytes).await?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe_envelopes(
        &self,
        topic: &str,
        handler: EnvelopeHandler,
    ) -> Result<(), TransportError> {
        // Decode, validation, and dedup admission run once per inbound
        // delivery; the decoded envelope then fans out to every handler
        // registered here for the topic.
        let mut inbound = self.inbound.write().await;
        if let Some(handlers) = inbound.get_mut(topic) {
            handlers.push(handler);
            return Ok(());
        }
        inbound.insert(topic.to_string(), vec![handler]);
        drop(inbound);

        let codec = self.codec.clone();
        let router = Arc::clone(&self.router);
        let registered = Arc::clone(&self.inbound);
        let strict_verify = self.pubsub.params().strict_verify;
        let topic_owned = topic.to_string();
        let wrapped: EnvelopeHandler = Arc::new(move |outer: TransportEnvelope| {
            let codec = codec.clone();
            let router = Arc::clone(&router);
            let registered = Arc::clone(&registered);
            let topic = topic_owned.clone();
            async move {
                let inner = if outer.message_type == MSG_TYPE_PUBSUB && !outer.payload.is_empty() {
                    let inner = match codec.deserialize(&outer.payload) {
                        Ok(inner) => inner,
                        Err(err) => {
                            warn!(%topic, error = %err, "inbound envelope decode failed");
                            return Ok(());
                        }
                    };
                    if let Err(err) = codec.validate(&inner) {
                        debug!(%topic, message_id = %inner.id, error = %err, "inbound envelope rejected");
                        return Ok(());
                    }
                    if strict_verify {
                        if let Err(err) = codec.verify(&inner) {
                            warn!(%topic, message_id = %inner.id, error = %err, "signature check failed");
                            return Ok(());
                        }
                    }
                    match router.admit(&topic, &inner) {
                        Ok(()) => inner,
                        Err(err) => {
                            debug!(%topic, code = err.code(), "inbound message dropped");
                            return Ok(());
                        }
                    }
                } else {
                    outer
                };

                let handlers: Vec<EnvelopeHandler> = registered
                    .read()
                    .await
                    .get(&topic)
                    .cloned()
                    .unwrap_or_default();
                for (index, subscriber) in handlers.iter().enumerate() {
                    let outcome = std::panic::AssertUnwindSafe(subscriber(inner.clone()))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!(%topic, handler = index, error = %err, "subscriber returned error");
                        }
                        Err(_) => {
                            warn!(%topic, handler = index, "subscriber panicked; delivery continues");
                        }
                    }
                }
                Ok(())
            }
            .boxed()
        });
        self.pubsub.subscribe(topic, wrapped).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.inbound.write().await.remove(topic);
        self.pubsub.unsubscribe(topic).await
    }

    async fn publish_intent(&self, intent: &Intent) -> Result<(), TransportError> {
        IntentId::try_new(intent.id.clone()).map_err(|err| TransportError::Codec {
            source: CodecError::InvalidMessage {
                reason: format!("intent id: {err}"),
            },
        })?;
        IntentPriority::try_new(intent.priority).map_err(|err| TransportError::Codec {
            source: CodecError::InvalidMessage {
                reason: format!("intent priority: {err}"),
            },
        })?;
        let mut metadata = HashMap::new();
        metadata.insert("intent_id".to_string(), intent.id.clone());
        metadata.insert("intent_type".to_string(), intent.intent_type.clone());
        self.publish_payload(
            TOPIC_INTENT_BROADCAST,
            MSG_TYPE_INTENT_BROADCAST,
            Self::encode(intent)?,
            metadata,
            intent.priority,
            if intent.ttl_ms > 0 {
                intent.ttl_ms
            } else {
                DEFAULT_ENVELOPE_TTL_MS
            },
        )
        .await
    }

    async fn publish_bid(&self, bid: &BidMessage) -> Result<(), TransportError> {
        let mut metadata = HashMap::new();
        metadata.insert("intent_id".to_string(), bid.intent_id.clone());
        metadata.insert("agent_id".to_string(), bid.agent_id.clone());
        metadata.insert("agent_type".to_string(), bid.agent_type.clone());
        self.publish_payload(
            TOPIC_BID_SUBMISSION,
            MSG_TYPE_BID_SUBMISSION,
            Self::encode(bid)?,
            metadata,
            5,
            DEFAULT_ENVELOPE_TTL_MS,
        )
        .await
    }

    async fn publish_match_result(&self, result: &MatchResult) -> Result<(), TransportError> {
        let mut metadata = HashMap::new();
        metadata.insert("intent_id".to_string(), result.intent_id.clone());
        metadata.insert("status".to_string(), result.status.to_string());
        if !result.winning_agent.is_empty() {
            metadata.insert("winning_agent".to_string(), result.winning_agent.clone());
        }
        self.publish_payload(
            TOPIC_MATCH_RESULTS,
            MSG_TYPE_MATCH_RESULT,
            Self::encode(result)?,
            metadata,
            5,
            DEFAULT_ENVELOPE_TTL_MS,
        )
        .await
    }

    async fn subscribe_intents(
        &self,
        topic: &str,
        handler: IntentHandler,
    ) -> Result<(), TransportError> {
        self.subscribe_typed(topic, MSG_TYPE_INTENT_BROADCAST, handler)
            .await
    }

    async fn subscribe_bids(&self, handler: BidHandler) -> Result<(), TransportError> {
        self.subscribe_typed(TOPIC_BID_SUBMISSION, MSG_TYPE_BID_SUBMISSION, handler)
            .await
    }

    async fn subscribe_matches(&self, handler: MatchResultHandler) -> Result<(), TransportError> {
        self.subscribe_typed(TOPIC_MATCH_RESULTS, MSG_TYPE_MATCH_RESULT, handler)
            .await
    }
}
