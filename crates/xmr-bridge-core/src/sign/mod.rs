//! Threshold signing (FROST)
//!
//! Two rounds per session:
//! 1. the coordinator collects nonce commitments from the selected signers;
//! 2. it distributes the signing package, collects and verifies shares, and
//!    aggregates them into an ordinary Ed25519 signature.
//!
//! A third message announces the verified outcome to every participant.

mod coordinator;
mod messages;
mod responder;
mod session;

pub use coordinator::{respond, Coordinator};
pub use messages::{
    CommitmentPair, SigningMessage, SigningPackage, SigningPayload, ROUND_COMMIT, ROUND_OUTCOME,
    ROUND_SHARE,
};
pub use responder::{ApprovalPolicy, FixedMessage, Responder};
pub use session::{
    ConsumedCommitments, SessionFailure, SessionHandle, SessionManager, SessionStatus,
    SigningSession,
};

use crate::{Error, ParticipantId, Result, SessionId};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

const SESSION_DOMAIN: &[u8] = b"xmr-bridge/session/v1";

/// Fresh session identifier bound to a request and attempt.
///
/// Random bytes keep two attempts with the same number distinct.
pub fn new_session_id(chain_reference: &str, attempt: u32) -> SessionId {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);

    let mut hasher = Sha256::new();
    hasher.update(SESSION_DOMAIN);
    hasher.update((chain_reference.len() as u64).to_be_bytes());
    hasher.update(chain_reference.as_bytes());
    hasher.update(attempt.to_be_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Participant that coordinates `attempt` for a request.
///
/// Every node computes the same answer; later attempts rotate through the
/// roster so a silent coordinator cannot stall a request.
pub fn coordinator_for(
    participants: &[ParticipantId],
    chain_reference: &str,
    attempt: u32,
) -> Result<ParticipantId> {
    if participants.is_empty() {
        return Err(Error::InvalidConfig("empty participant roster".into()));
    }
    let mut sorted = participants.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let digest = Sha256::digest(chain_reference.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    let n = sorted.len() as u64;
    let index = (u64::from_be_bytes(seed) % n + u64::from(attempt) % n) % n;
    Ok(sorted[index as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(new_session_id("tx", 0), new_session_id("tx", 0));
    }

    #[test]
    fn test_coordinator_rotates() {
        let ids = [3, 1, 2];
        let first = coordinator_for(&ids, "deposit-7", 0).unwrap();
        assert_eq!(first, coordinator_for(&[1, 2, 3], "deposit-7", 0).unwrap());

        let rotation: Vec<_> = (0..3)
            .map(|attempt| coordinator_for(&ids, "deposit-7", attempt).unwrap())
            .collect();
        let mut distinct = rotation.clone();
        distinct.sort_unstable();
        assert_eq!(distinct, vec![1, 2, 3]);

        assert!(coordinator_for(&[], "x", 0).is_err());
    }
}
