//! Topic registry with per-topic access control and message limits

use crate::domain_types::TopicName;
use crate::messages::TransportEnvelope;
use crate::transport::TransportError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Access-control policy applied to a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPolicy {
    /// Every peer may publish and subscribe
    #[default]
    Public,
    /// Only peers on the allow list are admitted
    Whitelist,
    /// Every peer except those on the deny list is admitted
    Blacklist,
    /// No peer is admitted
    Private,
}

/// Custom per-topic message validator
pub type TopicValidator = Arc<dyn Fn(&TransportEnvelope) -> Result<(), String> + Send + Sync>;

/// Registered configuration for one topic
#[derive(Clone)]
pub struct TopicConfig {
    /// Validated topic name
    pub name: TopicName,
    /// Human-readable description
    pub description: String,
    /// Access-control policy
    pub policy: AccessPolicy,
    /// Peers admitted under [`AccessPolicy::Whitelist`]
    pub allowed_peers: HashSet<String>,
    /// Peers rejected under [`AccessPolicy::Blacklist`]
    pub denied_peers: HashSet<String>,
    /// Maximum serialized message size
    pub max_message_bytes: usize,
    /// Messages per second admitted for publish; 0 disables the limit
    pub rate_limit_per_sec: u32,
    /// Whether envelopes on this topic must carry a signature
    pub require_signature: bool,
    /// Optional custom validator, applied after size and TTL checks
    pub custom_validator: Option<TopicValidator>,
}

impl std::fmt::Debug for TopicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicConfig")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("allowed_peers", &self.allowed_peers.len())
            .field("denied_peers", &self.denied_peers.len())
            .field("max_message_bytes", &self.max_message_bytes)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("require_signature", &self.require_signature)
            .field("custom_validator", &self.custom_validator.is_some())
            .finish()
    }
}

impl TopicConfig {
    /// Creates a public topic with the given name and default limits
    pub fn public(name: &str) -> Result<Self, TransportError> {
        let name = TopicName::try_new(name.to_string()).map_err(|_| {
            TransportError::InvalidTopic {
                name: name.to_string(),
            }
        })?;
        Ok(Self {
            name,
            description: String::new(),
            policy: AccessPolicy::Public,
            allowed_peers: HashSet::new(),
            denied_peers: HashSet::new(),
            max_message_bytes: 1_048_576,
            rate_limit_per_sec: 0,
            require_signature: false,
            custom_validator: None,
        })
    }
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Registry of topics and their admission rules
///
/// Unregistered topics are admitted leniently; their messages still pass
/// generic envelope validation in the codec and router.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: DashMap<String, TopicConfig>,
    rate_windows: DashMap<String, RateWindow>,
}

impl TopicRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a topic, replacing any previous configuration
    pub fn register(&self, config: TopicConfig) {
        self.topics
            .insert(config.name.clone().into_inner(), config);
    }

    /// Removes a topic registration
    pub fn unregister(&self, topic: &str) {
        self.topics.remove(topic);
        self.rate_windows.remove(topic);
    }

    /// Looks up a topic configuration
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<TopicConfig> {
        self.topics.get(topic).map(|entry| entry.value().clone())
    }

    /// Number of registered topics
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether no topics are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Applies the topic's access policy to a peer
    pub fn validate_access(&self, topic: &str, peer: &str) -> Result<(), TransportError> {
        let Some(config) = self.topics.get(topic) else {
            return Ok(());
        };
        let admitted = match config.policy {
            AccessPolicy::Public => true,
            AccessPolicy::Whitelist => config.allowed_peers.contains(peer),
            AccessPolicy::Blacklist => !config.denied_peers.contains(peer),
            AccessPolicy::Private => false,
        };
        if admitted {
            Ok(())
        } else {
            Err(TransportError::AccessDenied {
                topic: topic.to_string(),
                peer: peer.to_string(),
            })
        }
    }

    /// Applies max-size, TTL, and any custom validator, in that order
    pub fn validate_message(
        &self,
        topic: &str,
        envelope: &TransportEnvelope,
    ) -> Result<(), TransportError> {
        let Some(config) = self.topics.get(topic) else {
            return Ok(());
        };
        let size = envelope.byte_size();
        if size > config.max_message_bytes {
            return Err(TransportError::MessageTooLarge {
                size,
                max: config.max_message_bytes,
            });
        }
        if envelope.is_expired() {
            return Err(crate::transport::CodecError::Expired {
                expiry_ms: envelope.timestamp.saturating_add(envelope.ttl),
            }
            .into());
        }
        if let Some(validator) = &config.custom_validator {
            validator(envelope).map_err(|reason| TransportError::MessageFiltered {
                filter_id: format!("topic-validator:{reason}"),
            })?;
        }
        Ok(())
    }

    /// Counts one publish against the topic's rate limit
    pub fn check_rate(&self, topic: &str) -> Result<(), TransportError> {
        let Some(config) = self.topics.get(topic) else {
            return Ok(());
        };
        if config.rate_limit_per_sec == 0 {
            return Ok(());
        }
        let limit = config.rate_limit_per_sec;
        drop(config);

        let mut window = self
            .rate_windows
            .entry(topic.to_string())
            .or_insert_with(|| RateWindow {
                window_start: Instant::now(),
                count: 0,
            });
        if window.window_start.elapsed().as_secs() >= 1 {
            window.window_start = Instant::now();
            window.count = 0;
        }
        if window.count >= limit {
            return Err(TransportError::RateLimitExceeded {
                topic: topic.to_string(),
            });
        }
        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::now_millis;
    use std::collections::HashMap;

    fn envelope(payload_len: usize) -> TransportEnvelope {
        TransportEnvelope {
            id: "ab12cd34ef56ab78".to_string(),
            message_type: "intent_broadcast".to_string(),
            payload: vec![0u8; payload_len],
            timestamp: now_millis(),
            sender: "peer-a".to_string(),
            metadata: HashMap::new(),
            signature: Vec::new(),
            priority: 5,
            ttl: 0,
        }
    }

    #[test]
    fn access_policies() {
        let registry = TopicRegistry::new();

        let mut config = TopicConfig::public("topic.public").unwrap();
        registry.register(config.clone());
        assert!(registry.validate_access("topic.public", "anyone").is_ok());

        config = TopicConfig::public("topic.white").unwrap();
        config.policy = AccessPolicy::Whitelist;
        config.allowed_peers.insert("peer-a".to_string());
        registry.register(config);
        assert!(registry.validate_access("topic.white", "peer-a").is_ok());
        assert!(registry.validate_access("topic.white", "peer-b").is_err());

        config = TopicConfig::public("topic.black").unwrap();
        config.policy = AccessPolicy::Blacklist;
        config.denied_peers.insert("peer-x".to_string());
        registry.register(config);
        assert!(registry.validate_access("topic.black", "peer-a").is_ok());
        assert!(registry.validate_access("topic.black", "peer-x").is_err());

        config = TopicConfig::public("topic.private").unwrap();
        config.policy = AccessPolicy::Private;
        registry.register(config);
        assert!(registry.validate_access("topic.private", "peer-a").is_err());

        // Unregistered topics admit leniently.
        assert!(registry.validate_access("topic.unknown", "peer-a").is_ok());
    }

    #[test]
    fn message_validation_order() {
        let registry = TopicRegistry::new();
        let mut config = TopicConfig::public("topic.sized").unwrap();
        config.max_message_bytes = 128;
        config.custom_validator = Some(Arc::new(|env| {
            if env.priority >= 0 {
                Ok(())
            } else {
                Err("negative priority".to_string())
            }
        }));
        registry.register(config);

        assert!(registry
            .validate_message("topic.sized", &envelope(16))
            .is_ok());
        assert!(matches!(
            registry.validate_message("topic.sized", &envelope(4096)),
            Err(TransportError::MessageTooLarge { .. })
        ));

        let mut negative = envelope(16);
        negative.priority = -1;
        assert!(matches!(
            registry.validate_message("topic.sized", &negative),
            Err(TransportError::MessageFiltered { .. })
        ));
    }

    #[test]
    fn rate_limit_counts_per_window() {
        let registry = TopicRegistry::new();
        let mut config = TopicConfig::public("topic.limited").unwrap();
        config.rate_limit_per_sec = 2;
        registry.register(config);

        assert!(registry.check_rate("topic.limited").is_ok());
        assert!(registry.check_rate("topic.limited").is_ok());
        assert!(matches!(
            registry.check_rate("topic.limited"),
            Err(TransportError::RateLimitExceeded { .. })
        ));
        // Unlimited topics never hit the limiter.
        assert!(registry.check_rate("topic.unknown").is_ok());
    }
}
