//! Signing message types

use crate::crypto::{self, NonceCommitment};
use crate::{Error, ParticipantId, PublicKey, Result, SessionId, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Round 1: commitment exchange
pub const ROUND_COMMIT: u8 = 1;
/// Round 2: signature share exchange
pub const ROUND_SHARE: u8 = 2;
/// Round 3: outcome announcement
pub const ROUND_OUTCOME: u8 = 3;

/// Encoded hiding/binding nonce commitments `(D, E)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitmentPair {
    #[serde(with = "hex")]
    pub hiding: PublicKey,
    #[serde(with = "hex")]
    pub binding: PublicKey,
}

impl CommitmentPair {
    /// Decode and validate both points
    pub fn decode(&self) -> Result<NonceCommitment> {
        NonceCommitment::from_parts(&self.hiding, &self.binding)
    }

    /// Key used to track consumed commitments
    pub fn fingerprint(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.hiding);
        bytes[32..].copy_from_slice(&self.binding);
        bytes
    }
}

impl From<&NonceCommitment> for CommitmentPair {
    fn from(commitment: &NonceCommitment) -> Self {
        Self {
            hiding: crypto::encode_point(&commitment.hiding),
            binding: crypto::encode_point(&commitment.binding),
        }
    }
}

/// Everything a signer needs for round 2: the message and the commitment
/// list of exactly the participants who committed in round 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningPackage {
    #[serde(with = "hex")]
    pub message: Vec<u8>,
    pub commitments: BTreeMap<ParticipantId, CommitmentPair>,
}

impl SigningPackage {
    /// Signers bound into this package, ascending
    pub fn signers(&self) -> Vec<ParticipantId> {
        self.commitments.keys().copied().collect()
    }

    /// Decode every commitment, attributing failures to their owner
    pub fn decode_commitments(&self) -> Result<BTreeMap<ParticipantId, NonceCommitment>> {
        self.commitments
            .iter()
            .map(|(id, pair)| {
                pair.decode()
                    .map(|c| (*id, c))
                    .map_err(|e| Error::violation(*id, format!("invalid commitment: {}", e)))
            })
            .collect()
    }

    /// Stable digest identifying the package
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.message.len() as u64).to_be_bytes());
        hasher.update(&self.message);
        for (id, pair) in &self.commitments {
            hasher.update(id.to_be_bytes());
            hasher.update(pair.hiding);
            hasher.update(pair.binding);
        }
        hasher.finalize().into()
    }
}

/// Round payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SigningPayload {
    /// Coordinator asks a signer for fresh commitments
    CommitRequest {
        chain_reference: String,
        attempt: u32,
        #[serde(with = "hex")]
        message: Vec<u8>,
        signers: Vec<ParticipantId>,
    },
    /// Signer's commitments
    Commitment(CommitmentPair),
    /// Coordinator distributes the binding data
    SignRequest(SigningPackage),
    /// Signer's signature share z_i
    Share {
        #[serde(with = "hex")]
        share: [u8; 32],
    },
    /// Signer refuses to take part
    Decline { reason: String },
    /// Coordinator announces the verified aggregate
    Outcome {
        chain_reference: String,
        #[serde(with = "hex")]
        message: Vec<u8>,
        signature: Signature,
    },
}

impl SigningPayload {
    /// Round the payload belongs to; a decline answers either round 1 or 2
    pub fn round(&self) -> Option<u8> {
        match self {
            SigningPayload::CommitRequest { .. } | SigningPayload::Commitment(_) => {
                Some(ROUND_COMMIT)
            }
            SigningPayload::SignRequest(_) | SigningPayload::Share { .. } => Some(ROUND_SHARE),
            SigningPayload::Outcome { .. } => Some(ROUND_OUTCOME),
            SigningPayload::Decline { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SigningPayload::CommitRequest { .. } => "commit_request",
            SigningPayload::Commitment(_) => "commitment",
            SigningPayload::SignRequest(_) => "sign_request",
            SigningPayload::Share { .. } => "share",
            SigningPayload::Decline { .. } => "decline",
            SigningPayload::Outcome { .. } => "outcome",
        }
    }
}

/// Envelope of every signing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningMessage {
    #[serde(with = "hex")]
    pub session_id: SessionId,
    pub sender: ParticipantId,
    pub round: u8,
    pub payload: SigningPayload,
}

impl SigningMessage {
    /// Build a message whose round follows from the payload
    pub fn new(session_id: SessionId, sender: ParticipantId, payload: SigningPayload) -> Self {
        let round = payload.round().unwrap_or(ROUND_COMMIT);
        Self {
            session_id,
            sender,
            round,
            payload,
        }
    }

    /// Decline answering a request of the given round
    pub fn decline(
        session_id: SessionId,
        sender: ParticipantId,
        round: u8,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            sender,
            round,
            payload: SigningPayload::Decline {
                reason: reason.into(),
            },
        }
    }

    /// Reject messages whose round does not match their payload
    pub fn check_round(&self) -> Result<()> {
        let consistent = match self.payload.round() {
            Some(round) => round == self.round,
            None => self.round == ROUND_COMMIT || self.round == ROUND_SHARE,
        };
        if consistent {
            Ok(())
        } else {
            Err(Error::violation(
                self.sender,
                format!("{} sent as round {}", self.payload.kind(), self.round),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_consistency() {
        let id = [1u8; 32];
        let message = SigningMessage::new(id, 2, SigningPayload::Share { share: [0u8; 32] });
        assert_eq!(message.round, ROUND_SHARE);
        assert!(message.check_round().is_ok());

        let mut tampered = message.clone();
        tampered.round = ROUND_COMMIT;
        assert_eq!(tampered.check_round().unwrap_err().culprit(), Some(2));

        let decline = SigningMessage::decline(id, 3, ROUND_SHARE, "busy");
        assert!(decline.check_round().is_ok());
        let bad_decline = SigningMessage::decline(id, 3, ROUND_OUTCOME, "busy");
        assert!(bad_decline.check_round().is_err());
    }

    #[test]
    fn test_package_digest_binds_commitments() {
        let pair = CommitmentPair {
            hiding: [1u8; 32],
            binding: [2u8; 32],
        };
        let package = SigningPackage {
            message: b"msg".to_vec(),
            commitments: BTreeMap::from([(1, pair), (2, pair)]),
        };
        let mut other = package.clone();
        other.commitments.remove(&2);

        assert_ne!(package.digest(), other.digest());
        assert_eq!(package.signers(), vec![1, 2]);
    }

    #[test]
    fn test_wire_format() {
        let message = SigningMessage::new(
            [5u8; 32],
            1,
            SigningPayload::Decline {
                reason: "halted".into(),
            },
        );
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["payload"]["type"], "decline");
        assert_eq!(json["session_id"], hex::encode([5u8; 32]));

        let decoded: SigningMessage = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, message);
    }
}
