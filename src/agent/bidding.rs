//! Bid-decision engine
//!
//! Pricing model: base cost from tradable tag fees plus the agent's base
//! fee, scaled by priority; a capability-fit score gates participation and
//! shapes the competitive price together with urgency, profit margin, and
//! the strategy adjustment.

use crate::messages::Intent;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Per-capability weight in the fit score
const CAPABILITY_WEIGHT: f64 = 0.3;
/// Per-specialization weight in the fit score
const SPECIALIZATION_WEIGHT: f64 = 0.4;
/// Agent-type weight in the fit score
const AGENT_TYPE_WEIGHT: f64 = 0.3;
/// Fit score below which non-aggressive agents decline
const MIN_CAPABILITY_SCORE: f64 = 0.3;
/// Urgency multiplier for short-deadline intents
const URGENCY_MULTIPLIER: f64 = 1.2;
/// Deadline below which an intent counts as urgent
const URGENT_MAX_DURATION_SECS: u64 = 3600;

/// Bidding posture of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidStrategyKind {
    /// Bids 10% under the competitive price
    Conservative,
    /// Bids the competitive price
    #[default]
    Balanced,
    /// Bids 10% over and ignores the capability gate
    Aggressive,
}

impl BidStrategyKind {
    fn multiplier(self) -> f64 {
        match self {
            Self::Conservative => 0.9,
            Self::Balanced => 1.0,
            Self::Aggressive => 1.1,
        }
    }

    /// Canonical name, recorded in bid metadata
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }
}

/// Bid strategy parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidStrategy {
    /// Bidding posture
    #[serde(rename = "type", default)]
    pub kind: BidStrategyKind,
    /// Flat fee added to every bid's base cost
    #[serde(default)]
    pub base_fee: f64,
    /// Profit margin applied to the competitive price
    #[serde(default = "BidStrategy::default_profit_margin")]
    pub profit_margin: f64,
    /// Risk appetite, scales the final amount by `1 + risk_factor * 0.1`
    #[serde(default)]
    pub risk_factor: f64,
}

impl BidStrategy {
    fn default_profit_margin() -> f64 {
        0.15
    }
}

impl Default for BidStrategy {
    fn default() -> Self {
        Self {
            kind: BidStrategyKind::default(),
            base_fee: 0.0,
            profit_margin: Self::default_profit_margin(),
            risk_factor: 0.0,
        }
    }
}

/// Why the engine declined to bid
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BidDecline {
    #[error("insufficient capability match ({score:.2})")]
    InsufficientCapability { score: f64 },

    #[error("bid amount {amount:.2} outside [{min:.2}, {max:.2}]")]
    AmountOutOfRange { amount: f64, min: f64, max: f64 },
}

/// A positive bid decision
#[derive(Debug, Clone, PartialEq)]
pub struct BidDecision {
    /// Bid amount as a decimal string with two fractional digits
    pub amount: String,
    /// Confidence in [0.1, 1.0]
    pub confidence: f64,
    /// The capability-fit score that produced this decision
    pub capability_score: f64,
}

/// Decides whether and how much to bid on an intent
#[derive(Debug, Clone)]
pub struct BidEngine {
    agent_type: String,
    capabilities: Vec<String>,
    specializations: Vec<String>,
    strategy: BidStrategy,
    min_bid_amount: f64,
    max_bid_amount: f64,
}

impl BidEngine {
    /// Creates an engine from the agent's profile
    #[must_use]
    pub fn new(
        agent_type: String,
        capabilities: Vec<String>,
        specializations: Vec<String>,
        strategy: BidStrategy,
        min_bid_amount: f64,
        max_bid_amount: f64,
    ) -> Self {
        Self {
            agent_type,
            capabilities,
            specializations,
            strategy,
            min_bid_amount,
            max_bid_amount,
        }
    }

    /// The configured strategy
    #[must_use]
    pub fn strategy(&self) -> &BidStrategy {
        &self.strategy
    }

    /// Evaluates an intent into a bid or a decline
    pub fn evaluate(&self, intent: &Intent) -> Result<BidDecision, BidDecline> {
        let capability_score = self.capability_score(&intent.intent_type);
        if capability_score < MIN_CAPABILITY_SCORE
            && self.strategy.kind != BidStrategyKind::Aggressive
        {
            return Err(BidDecline::InsufficientCapability {
                score: capability_score,
            });
        }

        let base_cost = self.base_cost(intent);
        let urgency = urgency_multiplier(intent);
        let competitive = base_cost
            * (1.0 + (capability_score - 0.5) * 0.5)
            * urgency
            * (1.0 + self.strategy.profit_margin);
        let amount = competitive
            * self.strategy.kind.multiplier()
            * (1.0 + self.strategy.risk_factor * 0.1);

        if amount < self.min_bid_amount || amount > self.max_bid_amount {
            return Err(BidDecline::AmountOutOfRange {
                amount,
                min: self.min_bid_amount,
                max: self.max_bid_amount,
            });
        }

        let confidence =
            (capability_score * 0.7 + (urgency - 1.0) * 0.3).clamp(0.1, 1.0);
        Ok(BidDecision {
            amount: format!("{amount:.2}"),
            confidence,
            capability_score,
        })
    }

    /// Tradable tag fees plus the base fee, scaled by priority
    fn base_cost(&self, intent: &Intent) -> f64 {
        let tag_fees: f64 = intent
            .tags
            .iter()
            .filter(|tag| tag.tradable)
            .filter_map(|tag| {
                let price = tag.price.as_ref()?;
                match Decimal::from_str(price) {
                    Ok(fee) => Some(decimal_to_f64(fee)),
                    Err(err) => {
                        warn!(tag = %tag.name, price = %price, error = %err, "unparseable tag fee");
                        None
                    }
                }
            })
            .sum();
        let priority_adjustment = 1.0 + (f64::from(intent.priority) - 1.0) * 0.1;
        (tag_fees + self.strategy.base_fee) * priority_adjustment
    }

    /// Case-insensitive substring fit against the intent type, clamped to 1
    ///
    /// One-directional: a declared string scores only when it is found
    /// within the intent type, so short capability keywords match longer,
    /// more specific intent types and never the reverse.
    fn capability_score(&self, intent_type: &str) -> f64 {
        let haystack = intent_type.to_lowercase();
        let mut score = 0.0;
        for capability in &self.capabilities {
            if found_in_intent_type(&capability.to_lowercase(), &haystack) {
                score += CAPABILITY_WEIGHT;
            }
        }
        for specialization in &self.specializations {
            if found_in_intent_type(&specialization.to_lowercase(), &haystack) {
                score += SPECIALIZATION_WEIGHT;
            }
        }
        if found_in_intent_type(&self.agent_type.to_lowercase(), &haystack) {
            score += AGENT_TYPE_WEIGHT;
        }
        score.min(1.0)
    }
}

fn found_in_intent_type(candidate: &str, intent_type: &str) -> bool {
    !candidate.is_empty() && intent_type.contains(candidate)
}

fn urgency_multiplier(intent: &Intent) -> f64 {
    if intent.max_duration_secs > 0 && intent.max_duration_secs < URGENT_MAX_DURATION_SECS {
        URGENCY_MULTIPLIER
    } else {
        1.0
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}
