//! Intent admission filter for service agents

use crate::messages::Intent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an intent was rejected by the filter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterRejection {
    #[error("intent type {intent_type} not in allowed set")]
    TypeNotAllowed { intent_type: String },

    #[error("intent type {intent_type} is blocked")]
    TypeBlocked { intent_type: String },

    #[error("sender {sender} not in allowed set")]
    SenderNotAllowed { sender: String },

    #[error("sender {sender} is blocked")]
    SenderBlocked { sender: String },

    #[error("priority {priority} outside [{min}, {max}]")]
    PriorityOutOfRange { priority: i32, min: i32, max: i32 },

    #[error("required tag {tag} missing")]
    MissingRequiredTag { tag: String },
}

/// Declarative intent filter
///
/// Empty allow lists admit everything; block lists always apply; priority
/// bounds apply only when set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentFilterConfig {
    /// When non-empty, only these intent types pass
    #[serde(default)]
    pub allowed_types: Vec<String>,
    /// Intent types rejected unconditionally
    #[serde(default)]
    pub blocked_types: Vec<String>,
    /// When non-empty, only these senders pass
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// Senders rejected unconditionally
    #[serde(default)]
    pub blocked_senders: Vec<String>,
    /// Minimum admissible priority
    #[serde(default)]
    pub min_priority: Option<i32>,
    /// Maximum admissible priority
    #[serde(default)]
    pub max_priority: Option<i32>,
    /// Tags that must all be present on the intent
    #[serde(default)]
    pub required_tags: Vec<String>,
}

impl IntentFilterConfig {
    /// Applies the filter to an intent
    pub fn accepts(&self, intent: &Intent) -> Result<(), FilterRejection> {
        if !self.allowed_types.is_empty() && !self.allowed_types.contains(&intent.intent_type) {
            return Err(FilterRejection::TypeNotAllowed {
                intent_type: intent.intent_type.clone(),
            });
        }
        if self.blocked_types.contains(&intent.intent_type) {
            return Err(FilterRejection::TypeBlocked {
                intent_type: intent.intent_type.clone(),
            });
        }
        if !self.allowed_senders.is_empty() && !self.allowed_senders.contains(&intent.sender) {
            return Err(FilterRejection::SenderNotAllowed {
                sender: intent.sender.clone(),
            });
        }
        if self.blocked_senders.contains(&intent.sender) {
            return Err(FilterRejection::SenderBlocked {
                sender: intent.sender.clone(),
            });
        }
        let min = self.min_priority.unwrap_or(i32::MIN);
        let max = self.max_priority.unwrap_or(i32::MAX);
        if intent.priority < min || intent.priority > max {
            return Err(FilterRejection::PriorityOutOfRange {
                priority: intent.priority,
                min,
                max,
            });
        }
        for tag in &self.required_tags {
            if !intent.tags.iter().any(|t| &t.name == tag) {
                return Err(FilterRejection::MissingRequiredTag { tag: tag.clone() });
            }
        }
        Ok(())
    }
}
