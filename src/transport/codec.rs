//! Envelope codec: serialization, validation, signing, verification
//!
//! Envelopes are framed as JSON. The signing input is the canonical byte
//! string `id|type|timestamp|sender|payload` keyed with the node identity
//! key; JSON framing is never part of the signed material. The reference
//! scheme is keyed SHA-256; a production deployment substitutes an
//! asymmetric signature over the same input.

use crate::messages::TransportEnvelope;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

/// Length of the hex-encoded message id (8 bytes of hash prefix)
const MESSAGE_ID_HEX_LEN: usize = 16;

/// Errors raised by the codec
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("empty data")]
    EmptyData,

    #[error("decode failed: {source}")]
    DecodeError {
        #[source]
        source: serde_json::Error,
    },

    #[error("encode failed: {source}")]
    EncodeError {
        #[source]
        source: serde_json::Error,
    },

    #[error("message has no signature")]
    MissingSignature,

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("message expired at {expiry_ms}")]
    Expired { expiry_ms: i64 },
}

impl CodecError {
    /// Stable machine-readable code for this error
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage { .. } => "INVALID_MESSAGE",
            Self::EmptyData => "EMPTY_DATA",
            Self::DecodeError { .. } => "DECODE_ERROR",
            Self::EncodeError { .. } => "ENCODE_ERROR",
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            Self::Expired { .. } => "MESSAGE_EXPIRED",
        }
    }
}

/// Serializes, validates, signs, and verifies transport envelopes
#[derive(Debug, Clone)]
pub struct MessageCodec {
    signing_key: Vec<u8>,
}

impl MessageCodec {
    /// Creates a codec signing with the given identity key material
    #[must_use]
    pub fn new(signing_key: Vec<u8>) -> Self {
        Self { signing_key }
    }

    /// Deterministic message id: 8-byte hex prefix of the content hash
    #[must_use]
    pub fn message_id(message_type: &str, sender: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(message_type.as_bytes());
        hasher.update(b"_");
        hasher.update(sender.as_bytes());
        hasher.update(b"_");
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(b"_");
        hasher.update(payload);
        let digest = hasher.finalize();
        hex::encode(&digest[..MESSAGE_ID_HEX_LEN / 2])
    }

    /// Serializes a validated envelope to wire bytes
    pub fn serialize(&self, envelope: &TransportEnvelope) -> Result<Vec<u8>, CodecError> {
        Self::validate_format(envelope)?;
        serde_json::to_vec(envelope).map_err(|source| CodecError::EncodeError { source })
    }

    /// Deserializes wire bytes into an envelope, re-validating its format
    pub fn deserialize(&self, data: &[u8]) -> Result<TransportEnvelope, CodecError> {
        if data.is_empty() {
            return Err(CodecError::EmptyData);
        }
        let envelope: TransportEnvelope =
            serde_json::from_slice(data).map_err(|source| CodecError::DecodeError { source })?;
        Self::validate_format(&envelope)?;
        Ok(envelope)
    }

    /// Computes and stores the envelope signature
    pub fn sign(&self, envelope: &mut TransportEnvelope) -> Result<(), CodecError> {
        Self::validate_format(envelope)?;
        envelope.signature = self.compute_signature(envelope);
        Ok(())
    }

    /// Verifies a previously attached signature
    ///
    /// Length mismatch is failure, same as content mismatch.
    pub fn verify(&self, envelope: &TransportEnvelope) -> Result<(), CodecError> {
        if envelope.signature.is_empty() {
            return Err(CodecError::MissingSignature);
        }
        let expected = self.compute_signature(envelope);
        if expected.len() != envelope.signature.len() || expected != envelope.signature {
            return Err(CodecError::SignatureVerificationFailed);
        }
        Ok(())
    }

    /// Full admission validation: format, TTL expiry, id consistency
    ///
    /// An id that does not match the recomputed hash is logged but never
    /// rejected; peers may canonicalize differently.
    pub fn validate(&self, envelope: &TransportEnvelope) -> Result<(), CodecError> {
        Self::validate_format(envelope)?;
        if envelope.is_expired() {
            return Err(CodecError::Expired {
                expiry_ms: envelope.timestamp.saturating_add(envelope.ttl),
            });
        }
        let recomputed = Self::message_id(
            &envelope.message_type,
            &envelope.sender,
            envelope.timestamp,
            &envelope.payload,
        );
        if recomputed != envelope.id {
            warn!(
                message_id = %envelope.id,
                recomputed = %recomputed,
                "message id does not match content hash"
            );
        }
        Ok(())
    }

    /// Structural validation of required fields
    pub fn validate_format(envelope: &TransportEnvelope) -> Result<(), CodecError> {
        if envelope.id.is_empty() {
            return Err(CodecError::InvalidMessage {
                reason: "empty id".to_string(),
            });
        }
        if envelope.message_type.is_empty() {
            return Err(CodecError::InvalidMessage {
                reason: "empty type".to_string(),
            });
        }
        if envelope.sender.is_empty() {
            return Err(CodecError::InvalidMessage {
                reason: "empty sender".to_string(),
            });
        }
        if envelope.timestamp <= 0 {
            return Err(CodecError::InvalidMessage {
                reason: format!("non-positive timestamp {}", envelope.timestamp),
            });
        }
        if envelope.payload.is_empty() {
            return Err(CodecError::InvalidMessage {
                reason: "empty payload".to_string(),
            });
        }
        Ok(())
    }

    fn compute_signature(&self, envelope: &TransportEnvelope) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.signing_key);
        hasher.update(envelope.id.as_bytes());
        hasher.update(b"|");
        hasher.update(envelope.message_type.as_bytes());
        hasher.update(b"|");
        hasher.update(envelope.timestamp.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(envelope.sender.as_bytes());
        hasher.update(b"|");
        hasher.update(&envelope.payload);
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{now_millis, MSG_TYPE_INTENT_BROADCAST};
    use std::collections::HashMap;

    fn codec() -> MessageCodec {
        MessageCodec::new(b"test-signing-key".to_vec())
    }

    fn envelope() -> TransportEnvelope {
        let timestamp = now_millis();
        let payload = b"payload".to_vec();
        TransportEnvelope {
            id: MessageCodec::message_id(MSG_TYPE_INTENT_BROADCAST, "peer-a", timestamp, &payload),
            message_type: MSG_TYPE_INTENT_BROADCAST.to_string(),
            payload,
            timestamp,
            sender: "peer-a".to_string(),
            metadata: HashMap::new(),
            signature: Vec::new(),
            priority: 5,
            ttl: 60_000,
        }
    }

    #[test]
    fn round_trip_preserves_envelope() {
        let codec = codec();
        let original = envelope();
        let bytes = codec.serialize(&original).unwrap();
        let decoded = codec.deserialize(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn serialize_rejects_missing_fields() {
        let codec = codec();
        let mut bad = envelope();
        bad.payload.clear();
        assert!(matches!(
            codec.serialize(&bad),
            Err(CodecError::InvalidMessage { .. })
        ));

        let mut bad = envelope();
        bad.timestamp = 0;
        assert!(matches!(
            codec.serialize(&bad),
            Err(CodecError::InvalidMessage { .. })
        ));

        let mut bad = envelope();
        bad.sender.clear();
        assert!(matches!(
            codec.serialize(&bad),
            Err(CodecError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn deserialize_error_cases() {
        let codec = codec();
        assert!(matches!(codec.deserialize(&[]), Err(CodecError::EmptyData)));
        assert!(matches!(
            codec.deserialize(b"not json"),
            Err(CodecError::DecodeError { .. })
        ));
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let codec = codec();
        let mut signed = envelope();
        codec.sign(&mut signed).unwrap();
        assert!(codec.verify(&signed).is_ok());
    }

    #[test]
    fn mutation_after_sign_fails_verification() {
        let codec = codec();
        let mut signed = envelope();
        codec.sign(&mut signed).unwrap();

        let mut tampered = signed.clone();
        tampered.payload = b"other".to_vec();
        assert!(matches!(
            codec.verify(&tampered),
            Err(CodecError::SignatureVerificationFailed)
        ));

        let mut tampered = signed.clone();
        tampered.sender = "peer-b".to_string();
        assert!(matches!(
            codec.verify(&tampered),
            Err(CodecError::SignatureVerificationFailed)
        ));

        let mut tampered = signed.clone();
        tampered.timestamp += 1;
        assert!(matches!(
            codec.verify(&tampered),
            Err(CodecError::SignatureVerificationFailed)
        ));

        let mut truncated = signed;
        truncated.signature.pop();
        assert!(matches!(
            codec.verify(&truncated),
            Err(CodecError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn verify_requires_signature() {
        let codec = codec();
        assert!(matches!(
            codec.verify(&envelope()),
            Err(CodecError::MissingSignature)
        ));
    }

    #[test]
    fn validate_flags_expired_messages() {
        let codec = codec();
        let mut old = envelope();
        old.timestamp = 1_000;
        old.ttl = 1;
        old.id = MessageCodec::message_id(&old.message_type, &old.sender, old.timestamp, &old.payload);
        assert!(matches!(
            codec.validate(&old),
            Err(CodecError::Expired { .. })
        ));
    }

    #[test]
    fn message_id_is_deterministic_hash_prefix() {
        let a = MessageCodec::message_id("t", "s", 42, b"p");
        let b = MessageCodec::message_id("t", "s", 42, b"p");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, MessageCodec::message_id("t", "s", 43, b"p"));
    }
}
