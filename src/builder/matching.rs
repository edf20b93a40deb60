//! Matching engine: pure selection of a winning bid
//!
//! Bid amounts travel as decimal strings; unparseable amounts are skipped
//! with a warning and never win. Ties break by arrival order: the scan
//! only replaces the current best on a strictly better score, so the
//! first-seen bid wins among equals.

use crate::messages::BidMessage;
use rand::seq::IndexedRandom;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Selection algorithm configured per builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchingAlgorithm {
    /// Highest decimal amount wins
    #[default]
    HighestBid,
    /// Highest `amount x reputation(agent)` wins
    ReputationWeighted,
    /// Uniform random pick among parseable bids
    Random,
}

impl MatchingAlgorithm {
    /// Parses an algorithm name; unknown names fall back to `highest_bid`
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "highest_bid" => Self::HighestBid,
            "reputation_weighted" => Self::ReputationWeighted,
            "random" => Self::Random,
            other => {
                warn!(algorithm = other, "unknown matching algorithm, using highest_bid");
                Self::HighestBid
            }
        }
    }

    /// Canonical name, recorded in result metadata
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighestBid => "highest_bid",
            Self::ReputationWeighted => "reputation_weighted",
            Self::Random => "random",
        }
    }
}

/// Matching failures
#[derive(Debug, Error)]
pub enum MatchingError {
    #[error("no valid bids to match")]
    NoValidBids,
}

/// A selected winner with its parsed amount
#[derive(Debug, Clone)]
pub struct WinningBid {
    /// The winning bid as received
    pub bid: BidMessage,
    /// The parsed decimal amount
    pub amount: Decimal,
}

/// Pure function from a bid list to a winner
#[derive(Debug, Clone, Copy)]
pub struct MatchingEngine {
    algorithm: MatchingAlgorithm,
}

impl MatchingEngine {
    /// Creates an engine for the given algorithm
    #[must_use]
    pub fn new(algorithm: MatchingAlgorithm) -> Self {
        Self { algorithm }
    }

    /// The configured algorithm
    #[must_use]
    pub fn algorithm(&self) -> MatchingAlgorithm {
        self.algorithm
    }

    /// Selects the winning bid
    ///
    /// Fails iff no bid has a parseable decimal amount.
    pub fn select_winner(&self, bids: &[BidMessage]) -> Result<WinningBid, MatchingError> {
        let parseable = parse_amounts(bids);
        if parseable.is_empty() {
            return Err(MatchingError::NoValidBids);
        }
        let winner = match self.algorithm {
            MatchingAlgorithm::HighestBid => highest_bid(&parseable),
            MatchingAlgorithm::ReputationWeighted => reputation_weighted(&parseable),
            MatchingAlgorithm::Random => random_pick(&parseable),
        };
        Ok(winner)
    }
}

fn parse_amounts(bids: &[BidMessage]) -> Vec<WinningBid> {
    bids.iter()
        .filter_map(|bid| match Decimal::from_str(&bid.bid_amount) {
            Ok(amount) => Some(WinningBid {
                bid: bid.clone(),
                amount,
            }),
            Err(err) => {
                warn!(
                    agent_id = %bid.agent_id,
                    amount = %bid.bid_amount,
                    error = %err,
                    "skipping unparseable bid amount"
                );
                None
            }
        })
        .collect()
}

fn highest_bid(candidates: &[WinningBid]) -> WinningBid {
    let mut best = &candidates[0];
    for candidate in &candidates[1..] {
        if candidate.amount > best.amount {
            best = candidate;
        }
    }
    best.clone()
}

fn reputation_weighted(candidates: &[WinningBid]) -> WinningBid {
    let mut best = &candidates[0];
    let mut best_score = score(best);
    for candidate in &candidates[1..] {
        let candidate_score = score(candidate);
        if candidate_score > best_score {
            best = candidate;
            best_score = candidate_score;
        }
    }
    best.clone()
}

fn score(candidate: &WinningBid) -> f64 {
    let amount = candidate.amount.to_f64().unwrap_or(0.0);
    amount * reputation(&candidate.bid.agent_id, &candidate.bid.agent_type)
}

/// Placeholder reputation: a per-type base with a fresh ±10% perturbation
///
/// Non-deterministic across calls on purpose; a real oracle replaces this.
fn reputation(_agent_id: &str, agent_type: &str) -> f64 {
    let base = match agent_type {
        "trading" => 1.2,
        "data_access" => 1.1,
        "computation" => 1.0,
        _ => 0.9,
    };
    let perturbation: f64 = rand::rng().random_range(-0.1..=0.1);
    (base + perturbation).clamp(0.1, 2.0)
}

fn random_pick(candidates: &[WinningBid]) -> WinningBid {
    let mut rng = rand::rng();
    candidates
        .choose(&mut rng)
        .cloned()
        .unwrap_or_else(|| candidates[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::now_millis;
    use std::collections::HashMap;

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

    #[test]
    fn highest_bid_wins_and_ties_break_first_seen() {
        let engine = MatchingEngine::new(MatchingAlgorithm::HighestBid);
        let bids = vec![bid("a", "100"), bid("b", "250"), bid("c", "250")];
        let winner = engine.select_winner(&bids).unwrap();
        assert_eq!(winner.bid.agent_id, "b");
        assert_eq!(winner.bid.bid_amount, "250");
    }

    #[test]
    fn unparseable_amounts_never_win() {
        let engine = MatchingEngine::new(MatchingAlgorithm::Random);
        let bids = vec![bid("a", "100"), bid("b", "foo"), bid("c", "200")];
        for _ in 0..50 {
            let winner = engine.select_winner(&bids).unwrap();
            assert_ne!(winner.bid.agent_id, "b");
        }
    }

    #[test]
    fn all_unparseable_is_no_valid_bids() {
        let engine = MatchingEngine::new(MatchingAlgorithm::HighestBid);
        let bids = vec![bid("a", "abc"), bid("b", "")];
        assert!(matches!(
            engine.select_winner(&bids),
            Err(MatchingError::NoValidBids)
        ));
        assert!(matches!(
            engine.select_winner(&[]),
            Err(MatchingError::NoValidBids)
        ));
    }

    #[test]
    fn reputation_weighted_returns_a_parseable_bid() {
        let engine = MatchingEngine::new(MatchingAlgorithm::ReputationWeighted);
        let bids = vec![bid("a", "100"), bid("b", "nope"), bid("c", "105")];
        // The perturbation makes the exact winner nondeterministic, but it
        // is always drawn from the parseable set.
        for _ in 0..20 {
            let winner = engine.select_winner(&bids).unwrap();
            assert_ne!(winner.bid.agent_id, "b");
        }
    }

    #[test]
    fn unknown_algorithm_falls_back_to_highest_bid() {
        assert_eq!(
            MatchingAlgorithm::from_name("galactic"),
            MatchingAlgorithm::HighestBid
        );
        assert_eq!(
            MatchingAlgorithm::from_name("reputation_weighted"),
            MatchingAlgorithm::ReputationWeighted
        );
    }

    #[test]
    fn decimal_precision_is_respected() {
        let engine = MatchingEngine::new(MatchingAlgorithm::HighestBid);
        let bids = vec![bid("a", "100.000000001"), bid("b", "100.000000002")];
        assert_eq!(engine.select_winner(&bids).unwrap().bid.agent_id, "b");
    }
}
