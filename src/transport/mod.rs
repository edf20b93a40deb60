//! Transport layer for the intent auction network
//!
//! The transport composes four stages behind one manager:
//!
//! - [`codec::MessageCodec`]: envelope serialization, validation, signing
//! - [`topics::TopicRegistry`]: per-topic access control and limits
//! - [`router::MessageRouter`]: dedup and ordered filter-chain admission
//! - [`pubsub::PubSubEngine`]: gossip overlay adapter with handler fan-out
//!
//! Higher layers hold an `Arc<dyn Transport>`; the [`lazy::LazyTransport`]
//! wrapper lets them bind before the overlay host exists, and
//! [`readiness::ReadinessChecker`] gates startup on the whole stack being
//! demonstrably healthy.

pub mod codec;
pub mod lazy;
pub mod manager;
pub mod pubsub;
pub mod readiness;
pub mod router;
pub mod topics;

use crate::messages::{BidMessage, Intent, MatchResult, TransportEnvelope};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

pub use codec::{CodecError, MessageCodec};
pub use lazy::{LazyTransport, RunningTransportSource, TransportSource};
pub use manager::{TransportManager, TransportManagerConfig};
pub use pubsub::{
    GossipOverlay, GossipParams, LoopbackHub, LoopbackOverlay, OverlayMessage, PubSubEngine,
};
pub use readiness::{ReadinessChecker, ReadinessConfig, ReadinessError, ReadyCallback};
pub use router::{
    FilterDecision, MessageFilter, MessageRouter, RouterConfig, SenderFilter, SizeFilter,
    TtlFilter,
};
pub use topics::{AccessPolicy, TopicConfig, TopicRegistry};

/// Well-known topic for intent broadcasts
pub const TOPIC_INTENT_BROADCAST: &str = "/intent-network/intents/1.0.0";
/// Well-known topic for bid submissions
pub const TOPIC_BID_SUBMISSION: &str = "/intent-network/bids/1.0.0";
/// Well-known topic for match results
pub const TOPIC_MATCH_RESULTS: &str = "/intent-network/matches/1.0.0";
/// Well-known topic for sealed bid commitments
pub const TOPIC_BID_COMMITMENTS: &str = "/intent-network/commitments/1.0.0";
/// Well-known topic for bid reveals
pub const TOPIC_BID_REVEALS: &str = "/intent-network/reveals/1.0.0";
/// Descriptive alias root for categorized intent broadcasts
pub const TOPIC_INTENT_BROADCAST_ALIAS: &str = "intent.broadcast";

/// All topics carrying `intent_broadcast` envelopes for the given subtypes
#[must_use]
pub fn intent_broadcast_topics(subtypes: &[String]) -> Vec<String> {
    let mut topics = vec![
        TOPIC_INTENT_BROADCAST.to_string(),
        TOPIC_INTENT_BROADCAST_ALIAS.to_string(),
    ];
    topics.extend(
        subtypes
            .iter()
            .map(|s| format!("{TOPIC_INTENT_BROADCAST_ALIAS}.{s}")),
    );
    topics
}

/// Errors produced by the transport layer
///
/// Every variant maps to a stable code string via [`TransportError::code`];
/// callers branch on the code, never on message text.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not running")]
    NotRunning,

    #[error("transport is not ready yet")]
    NotReady,

    #[error("invalid topic name: {name}")]
    InvalidTopic { name: String },

    #[error("codec failure: {source}")]
    Codec {
        #[from]
        source: CodecError,
    },

    #[error("duplicate message: {message_id}")]
    DuplicateMessage { message_id: String },

    #[error("message dropped by filter: {filter_id}")]
    MessageFiltered { filter_id: String },

    #[error("access denied to topic {topic} for peer {peer}")]
    AccessDenied { topic: String, peer: String },

    #[error("rate limit exceeded on topic {topic}")]
    RateLimitExceeded { topic: String },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("overlay publish failed on {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("no subscription exists for topic {topic}")]
    NotSubscribed { topic: String },
}

impl TransportError {
    /// Stable machine-readable code for this error
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotRunning => "TRANSPORT_NOT_RUNNING",
            Self::NotReady => "TRANSPORT_NOT_READY",
            Self::InvalidTopic { .. } => "INVALID_TOPIC",
            Self::Codec { source } => source.code(),
            Self::DuplicateMessage { .. } => "DUPLICATE_MESSAGE",
            Self::MessageFiltered { .. } => "MESSAGE_FILTERED",
            Self::AccessDenied { .. } => "ACCESS_DENIED",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::NotSubscribed { .. } => "NOT_SUBSCRIBED",
        }
    }
}

/// Type-erased async handler for decoded envelopes
pub type EnvelopeHandler =
    Arc<dyn Fn(TransportEnvelope) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Typed handler for bid submissions
pub type BidHandler =
    Arc<dyn Fn(BidMessage) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Typed handler for intents
pub type IntentHandler =
    Arc<dyn Fn(Intent) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Typed handler for match results
pub type MatchResultHandler =
    Arc<dyn Fn(MatchResult) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Point-in-time transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    /// Number of physical topic subscriptions
    pub subscriptions: usize,
    /// Number of registered topics
    pub active_topics: usize,
    /// Overlay peer count
    pub connected_peers: usize,
    /// Envelopes published by this node
    pub messages_published: u64,
    /// Envelopes delivered to local handlers
    pub messages_received: u64,
    /// Envelopes dropped as duplicates
    pub duplicates_dropped: u64,
    /// Envelopes dropped by a router filter
    pub messages_filtered: u64,
}

/// High-level transport surface used by agents and builders
///
/// Both the concrete [`TransportManager`] and the [`LazyTransport`] wrapper
/// implement this; components never publish outside it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Peer id of the local node
    fn local_peer(&self) -> String;

    /// Whether the transport stack is started
    fn is_running(&self) -> bool;

    /// Snapshot of transport counters
    fn metrics(&self) -> Result<TransportMetrics, TransportError>;

    /// Publishes a pre-built envelope on a topic
    async fn publish_envelope(
        &self,
        topic: &str,
        envelope: TransportEnvelope,
    ) -> Result<(), TransportError>;

    /// Subscribes a handler to a topic; multiple handlers per topic fan out
    async fn subscribe_envelopes(
        &self,
        topic: &str,
        handler: EnvelopeHandler,
    ) -> Result<(), TransportError>;

    /// Cancels the physical subscription for a topic
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Marshals and publishes an intent broadcast
    async fn publish_intent(&self, intent: &Intent) -> Result<(), TransportError>;

    /// Marshals and publishes a bid on the bid-submission topic
    async fn publish_bid(&self, bid: &BidMessage) -> Result<(), TransportError>;

    /// Marshals and publishes a match result
    async fn publish_match_result(&self, result: &MatchResult) -> Result<(), TransportError>;

    /// Subscribes a typed handler to intent broadcasts on the given topic
    async fn subscribe_intents(
        &self,
        topic: &str,
        handler: IntentHandler,
    ) -> Result<(), TransportError>;

    /// Subscribes a typed handler to the bid-submission topic
    async fn subscribe_bids(&self, handler: BidHandler) -> Result<(), TransportError>;

    /// Subscribes a typed handler to the match-results topic
    async fn subscribe_matches(&self, handler: MatchResultHandler) -> Result<(), TransportError>;
}
