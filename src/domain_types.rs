//! Strongly-typed domain values for the intent auction network
//!
//! This module defines validated newtypes to prevent primitive obsession
//! and keep identifier and configuration invariants in one place.

use nutype::nutype;

/// Unique identifier of an intent (hex string assigned by the originator)
#[nutype(
    validate(predicate = |s| !s.trim().is_empty() && s.len() <= 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct IntentId(String);

/// Identifier of a service agent
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AgentId(String);

/// Identifier of a block builder
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct BuilderId(String);

/// Name of a pub/sub topic
///
/// Topic names are non-empty, at most 256 characters, and contain no
/// whitespace.
#[nutype(
    validate(predicate = |s| !s.is_empty() && s.len() <= 256 && !s.chars().any(char::is_whitespace)),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TopicName(String);

/// Intent priority, 1 (lowest) through 10 (highest)
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct IntentPriority(i32);

impl IntentPriority {
    /// Gets the value as i32
    #[must_use]
    pub fn as_i32(&self) -> i32 {
        self.into_inner()
    }
}

/// Channel capacity for bounded queues
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum retry attempts for failed operations
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Retry delay in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2000
)]
pub struct RetryDelayMs(u64);

impl RetryDelayMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Bid collection window in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct BidCollectionWindowMs(u64);

impl BidCollectionWindowMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }
}

/// Minimum number of bids required before a session may be matched
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1
)]
pub struct MinBidsRequired(usize);

impl MinBidsRequired {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Upper bound on concurrently tracked intents
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct MaxConcurrentIntents(usize);

impl MaxConcurrentIntents {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Capacity of the message dedup cache
#[nutype(
    validate(greater_or_equal = 16, less_or_equal = 10_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct DedupCacheSize(usize);

impl DedupCacheSize {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum serialized message size in bytes
#[nutype(
    validate(greater_or_equal = 64, less_or_equal = 67_108_864),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1_048_576
)]
pub struct MaxMessageBytes(usize);

impl MaxMessageBytes {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_rejects_whitespace_and_empty() {
        assert!(TopicName::try_new("/intent-network/intents/1.0.0".to_string()).is_ok());
        assert!(TopicName::try_new(String::new()).is_err());
        assert!(TopicName::try_new("has space".to_string()).is_err());
        assert!(TopicName::try_new("tab\there".to_string()).is_err());
        assert!(TopicName::try_new("x".repeat(257)).is_err());
    }

    #[test]
    fn priority_bounds_enforced() {
        assert!(IntentPriority::try_new(1).is_ok());
        assert!(IntentPriority::try_new(10).is_ok());
        assert!(IntentPriority::try_new(0).is_err());
        assert!(IntentPriority::try_new(11).is_err());
        assert_eq!(IntentPriority::default().as_i32(), 5);
    }

    #[test]
    fn bounded_config_values_have_sane_defaults() {
        assert_eq!(ChannelCapacity::default().as_usize(), 1000);
        assert_eq!(MaxRetries::default().as_u32(), 5);
        assert_eq!(RetryDelayMs::default().as_u64(), 2000);
        assert_eq!(DedupCacheSize::default().as_usize(), 10_000);
        assert_eq!(MinBidsRequired::default().as_usize(), 1);
    }
}
