//! Commit–reveal support for sealed bidding
//!
//! A commitment is the lowercase hex SHA-256 of
//! `intent_id:agent_id:bid_amount:agent_type:timestamp:nonce`. The reveal
//! republishes the bid fields plus the nonce; validation recomputes the
//! hash and compares. The baseline matching path does not depend on this
//! module.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A sealed commitment to a bid, published before the reveal phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidCommitment {
    /// The intent the sealed bid targets
    pub intent_id: String,
    /// The committing agent
    pub agent_id: String,
    /// Lowercase hex SHA-256 commitment
    pub commitment_hash: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// The opened bid matching an earlier commitment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidReveal {
    /// The intent the bid targets
    pub intent_id: String,
    /// The revealing agent
    pub agent_id: String,
    /// Bid amount as a decimal string
    pub bid_amount: String,
    /// Agent type tag
    pub agent_type: String,
    /// Timestamp used in the original commitment
    pub timestamp: i64,
    /// Random nonce used in the original commitment
    pub nonce: String,
}

/// Deterministic commitment hash over the bid fields and nonce
#[must_use]
pub fn commitment_hash(
    intent_id: &str,
    agent_id: &str,
    bid_amount: &str,
    agent_type: &str,
    timestamp: i64,
    nonce: &str,
) -> String {
    let preimage =
        format!("{intent_id}:{agent_id}:{bid_amount}:{agent_type}:{timestamp}:{nonce}");
    hex::encode(Sha256::digest(preimage.as_bytes()))
}

impl BidReveal {
    /// Recomputes the commitment hash for this reveal
    #[must_use]
    pub fn commitment_hash(&self) -> String {
        commitment_hash(
            &self.intent_id,
            &self.agent_id,
            &self.bid_amount,
            &self.agent_type,
            self.timestamp,
            &self.nonce,
        )
    }
}

/// Whether a reveal opens the given commitment
///
/// True iff both the bid fields and the nonce are unchanged.
#[must_use]
pub fn validate_bid_reveal(reveal: &BidReveal, commitment: &BidCommitment) -> bool {
    reveal.intent_id == commitment.intent_id
        && reveal.agent_id == commitment.agent_id
        && reveal.commitment_hash() == commitment.commitment_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reveal() -> BidReveal {
        BidReveal {
            intent_id: "deadbeef".to_string(),
            agent_id: "agent-1".to_string(),
            bid_amount: "150.25".to_string(),
            agent_type: "trading".to_string(),
            timestamp: 1_700_000_000_000,
            nonce: "a1b2c3".to_string(),
        }
    }

    fn commitment_for(reveal: &BidReveal) -> BidCommitment {
        BidCommitment {
            intent_id: reveal.intent_id.clone(),
            agent_id: reveal.agent_id.clone(),
            commitment_hash: reveal.commitment_hash(),
            timestamp: reveal.timestamp,
        }
    }

    #[test]
    fn hash_is_deterministic_lowercase_hex() {
        let a = commitment_hash("i", "a", "100", "trading", 42, "n");
        let b = commitment_hash("i", "a", "100", "trading", 42, "n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn unchanged_reveal_validates() {
        let reveal = reveal();
        let commitment = commitment_for(&reveal);
        assert!(validate_bid_reveal(&reveal, &commitment));
    }

    #[test]
    fn changed_bid_or_nonce_fails_validation() {
        let original = reveal();
        let commitment = commitment_for(&original);

        let mut tampered = original.clone();
        tampered.bid_amount = "150.26".to_string();
        assert!(!validate_bid_reveal(&tampered, &commitment));

        let mut tampered = original;
        tampered.nonce = "zzz".to_string();
        assert!(!validate_bid_reveal(&tampered, &commitment));
    }
}
