//! Per-intent session state machine
//!
//! A session tracks one intent from first sighting to its terminal state:
//!
//! ```text
//! collecting -> matching -> completed
//! collecting -> expired            (cleanup, insufficient bids)
//! matching   -> expired            (matching failure)
//! ```
//!
//! Terminal states are sinks; bids are only accepted while collecting.

use crate::domain_types::BidCollectionWindowMs;
use crate::messages::{BidMessage, Intent, MatchResult};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lifecycle state of an intent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Accepting bids until quorum or deadline
    Collecting,
    /// Matching has been dispatched; no further bids
    Matching,
    /// A result was produced and recorded
    Completed,
    /// Closed without a winner
    Expired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collecting => write!(f, "collecting"),
            Self::Matching => write!(f, "matching"),
            Self::Completed => write!(f, "completed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// How an incoming bid was applied to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidAdmission {
    /// First bid from this agent, appended
    Added,
    /// The agent had already bid; amount and timestamp were overwritten
    Updated,
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is {state}, not collecting")]
    NotCollecting { state: SessionState },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Builder-local state for one intent
#[derive(Debug, Clone)]
pub struct IntentSession {
    intent: Intent,
    bids: Vec<BidMessage>,
    started_at: Instant,
    deadline: Instant,
    state: SessionState,
    result: Option<MatchResult>,
}

impl IntentSession {
    /// Opens a session in `collecting` with deadline `now + window`
    #[must_use]
    pub fn new(intent: Intent, window: BidCollectionWindowMs) -> Self {
        let started_at = Instant::now();
        Self {
            intent,
            bids: Vec::new(),
            started_at,
            deadline: started_at + window.as_duration(),
            state: SessionState::Collecting,
            result: None,
        }
    }

    /// The intent this session tracks
    #[must_use]
    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    /// Bids collected so far, in arrival order
    #[must_use]
    pub fn bids(&self) -> &[BidMessage] {
        &self.bids
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The recorded result, if the session reached one
    #[must_use]
    pub fn result(&self) -> Option<&MatchResult> {
        self.result.as_ref()
    }

    /// When the session was opened
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The bid-collection deadline
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the collection window has elapsed
    #[must_use]
    pub fn deadline_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Whether the deadline lies more than `grace` in the past
    #[must_use]
    pub fn past_deadline_by(&self, grace: Duration) -> bool {
        Instant::now() >= self.deadline + grace
    }

    /// Records a bid while collecting
    ///
    /// At most one bid exists per agent: a repeat submission overwrites the
    /// existing entry's amount and timestamp in place, preserving its
    /// arrival-order position.
    pub fn add_or_update_bid(&mut self, bid: BidMessage) -> Result<BidAdmission, SessionError> {
        if self.state != SessionState::Collecting {
            return Err(SessionError::NotCollecting { state: self.state });
        }
        if let Some(existing) = self.bids.iter_mut().find(|b| b.agent_id == bid.agent_id) {
            existing.bid_amount = bid.bid_amount;
            existing.timestamp = bid.timestamp;
            Ok(BidAdmission::Updated)
        } else {
            self.bids.push(bid);
            Ok(BidAdmission::Added)
        }
    }

    /// Transitions `collecting -> matching`; false if already left collecting
    ///
    /// The at-most-once guarantee for matching dispatch rests on this being
    /// called under the builder lock.
    pub fn begin_matching(&mut self) -> bool {
        if self.state == SessionState::Collecting {
            self.state = SessionState::Matching;
            true
        } else {
            false
        }
    }

    /// Transitions `matching -> completed`, attaching the result
    pub fn complete(&mut self, result: MatchResult) -> Result<(), SessionError> {
        if self.state != SessionState::Matching {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: SessionState::Completed,
            });
        }
        self.state = SessionState::Completed;
        self.result = Some(result);
        Ok(())
    }

    /// Transitions to `expired` from any non-terminal state
    pub fn expire(&mut self, result: Option<MatchResult>) -> Result<(), SessionError> {
        match self.state {
            SessionState::Collecting | SessionState::Matching => {
                self.state = SessionState::Expired;
                if result.is_some() {
                    self.result = result;
                }
                Ok(())
            }
            terminal => Err(SessionError::InvalidTransition {
                from: terminal,
                to: SessionState::Expired,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::now_millis;
    use std::collections::HashMap;

    fn intent(id: &str) -> Intent {
        Intent {
            id: id.to_string(),
            intent_type: "trade".to_string(),
            sender: "peer-a".to_string(),
            payload: b"p".to_vec(),
            priority: 5,
            ttl_ms: 30_000,
            max_duration_secs: 0,
            tags: Vec::new(),
            signature: Vec::new(),
        }
    }

    fn bid(agent: &str, amount: &str) -> BidMessage {
        BidMessage {
            intent_id: "i1".to_string(),
            agent_id: agent.to_string(),
            bid_amount: amount.to_string(),
            capabilities: Vec::new(),
            timestamp: now_millis(),
            agent_type: "trading".to_string(),
            metadata: HashMap::new(),
            signature: Vec::new(),
        }
    }

    fn window() -> BidCollectionWindowMs {
        BidCollectionWindowMs::try_new(5_000).unwrap()
    }

    #[test]
    fn repeat_bid_overwrites_in_place() {
        let mut session = IntentSession::new(intent("i1"), window());
        assert_eq!(
            session.add_or_update_bid(bid("agent-a", "100")).unwrap(),
            BidAdmission::Added
        );
        assert_eq!(
            session.add_or_update_bid(bid("agent-b", "200")).unwrap(),
            BidAdmission::Added
        );
        assert_eq!(
            session.add_or_update_bid(bid("agent-a", "300")).unwrap(),
            BidAdmission::Updated
        );
        assert_eq!(session.bids().len(), 2);
        // Arrival-order position is preserved on update.
        assert_eq!(session.bids()[0].agent_id, "agent-a");
        assert_eq!(session.bids()[0].bid_amount, "300");
    }

    #[test]
    fn matching_begins_at_most_once() {
        let mut session = IntentSession::new(intent("i1"), window());
        assert!(session.begin_matching());
        assert!(!session.begin_matching());
        assert_eq!(session.state(), SessionState::Matching);
    }

    #[test]
    fn terminal_states_reject_bids_and_transitions() {
        let mut session = IntentSession::new(intent("i1"), window());
        session.add_or_update_bid(bid("agent-a", "100")).unwrap();
        assert!(session.begin_matching());
        assert!(matches!(
            session.add_or_update_bid(bid("agent-b", "200")),
            Err(SessionError::NotCollecting { .. })
        ));
        session.expire(None).unwrap();
        assert_eq!(session.state(), SessionState::Expired);
        assert!(session.expire(None).is_err());
        assert!(!session.begin_matching());
    }

    #[test]
    fn complete_requires_matching_state() {
        let mut session = IntentSession::new(intent("i1"), window());
        let result = MatchResult {
            intent_id: "i1".to_string(),
            winning_agent: "agent-a".to_string(),
            winning_bid: "100".to_string(),
            total_bids: 1,
            matched_at: now_millis(),
            status: crate::messages::MatchStatus::Matched,
            metadata: HashMap::new(),
            block_builder_id: "builder-1".to_string(),
        };
        assert!(session.complete(result.clone()).is_err());
        session.begin_matching();
        session.complete(result).unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.result().is_some());
    }
}
