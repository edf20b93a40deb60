//! Wire-level message types for the intent auction network
//!
//! Everything here crosses the overlay as JSON. Binary fields (payloads and
//! signatures) serialize as base64 strings; timestamps are milliseconds
//! since the Unix epoch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Envelope type for intent broadcasts
pub const MSG_TYPE_INTENT_BROADCAST: &str = "intent_broadcast";
/// Envelope type for bid submissions
pub const MSG_TYPE_BID_SUBMISSION: &str = "bid_submission";
/// Envelope type for match results
pub const MSG_TYPE_MATCH_RESULT: &str = "match_result";
/// Envelope type for raw overlay deliveries carrying a nested envelope
pub const MSG_TYPE_PUBSUB: &str = "pubsub";
/// Envelope type for sealed bid commitments
pub const MSG_TYPE_BID_COMMITMENT: &str = "bid_commitment";
/// Envelope type for bid reveals
pub const MSG_TYPE_BID_REVEAL: &str = "bid_reveal";

/// Current time in milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Base64 (de)serialization for binary fields
pub mod serde_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes bytes as a base64 string
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserializes a base64 string into bytes
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Transport message envelope carried on every topic
///
/// The `id` is an 8-byte hex prefix of a deterministic hash over
/// `type_sender_timestamp_payload`; the signature covers
/// `id|type|timestamp|sender|payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEnvelope {
    /// Deterministic message id (hex)
    pub id: String,
    /// Message type tag, e.g. `intent_broadcast`
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque payload bytes
    #[serde(with = "serde_base64")]
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Peer id of the originator
    pub sender: String,
    /// Free-form routing metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Detached signature; empty when unsigned
    #[serde(with = "serde_base64", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
    /// Delivery priority
    #[serde(default)]
    pub priority: i32,
    /// Time-to-live in milliseconds; 0 disables expiry
    #[serde(default)]
    pub ttl: i64,
}

impl TransportEnvelope {
    /// Whether the envelope's TTL has elapsed relative to `now` (millis)
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.ttl > 0 && now > self.timestamp.saturating_add(self.ttl)
    }

    /// Whether the envelope's TTL has elapsed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Total byte size considered by size-based filters
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.id.len()
            + self.message_type.len()
            + self.payload.len()
            + self.sender.len()
            + self.signature.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A tag attached to an intent, optionally carrying a tradable fee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentTag {
    /// Tag name, matched against agent filter requirements
    pub name: String,
    /// Fee as a decimal string when the tag is priced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    /// Whether the tag's fee participates in bid cost calculation
    #[serde(default)]
    pub tradable: bool,
}

/// A request for service broadcast to the network
///
/// Immutable once received; agents and builders only ever read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Intent identifier (hex)
    pub id: String,
    /// Free-form type tag, e.g. `trade` or `swap`
    #[serde(rename = "type")]
    pub intent_type: String,
    /// Peer id of the originator
    pub sender: String,
    /// Opaque payload bytes
    #[serde(with = "serde_base64")]
    pub payload: Vec<u8>,
    /// Priority, 1 through 10
    pub priority: i32,
    /// Time-to-live in milliseconds
    pub ttl_ms: i64,
    /// Maximum acceptable service duration in seconds; 0 when unconstrained
    #[serde(default)]
    pub max_duration_secs: u64,
    /// Tags relevant to this intent
    #[serde(default)]
    pub tags: Vec<IntentTag>,
    /// Detached signature; empty when unsigned
    #[serde(with = "serde_base64", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

/// An offer by a service agent to fulfill a specific intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidMessage {
    /// The intent this bid targets
    pub intent_id: String,
    /// The bidding agent
    pub agent_id: String,
    /// Bid amount as a decimal string; precision is preserved on the wire
    pub bid_amount: String,
    /// Capabilities the agent declares for this bid
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Agent type tag, e.g. `trading` or `computation`
    pub agent_type: String,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Detached signature; empty when unsigned
    #[serde(with = "serde_base64", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

/// Terminal status of a matching attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// A winning bid was selected
    Matched,
    /// The session closed without enough bids
    NoMatch,
    /// The matching algorithm failed
    MatchFailed,
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::NoMatch => write!(f, "no_match"),
            Self::MatchFailed => write!(f, "match_failed"),
        }
    }
}

/// Outcome of a matching run, published on the match-results topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    /// The intent that was matched
    pub intent_id: String,
    /// Winning agent id; empty unless `status` is `matched`
    #[serde(default)]
    pub winning_agent: String,
    /// Winning bid amount as a decimal string; empty unless matched
    #[serde(default)]
    pub winning_bid: String,
    /// Number of bids considered
    pub total_bids: usize,
    /// Milliseconds since the Unix epoch at which matching concluded
    pub matched_at: i64,
    /// Terminal status of the attempt
    pub status: MatchStatus,
    /// Algorithm name, winner agent type, failure reasons, and similar
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// The builder that ran the match
    pub block_builder_id: String,
}
