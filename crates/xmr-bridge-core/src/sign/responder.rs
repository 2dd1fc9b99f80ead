//! Responder role: answer commit and sign requests from a coordinator
//!
//! Nonces are generated once per session and destroyed as soon as a share
//! has been computed from them. A second, different signing package for the
//! same session would reuse those nonces and leak the signing share, so it is
//! refused; the identical package is answered from cache so that re-delivered
//! requests stay harmless.

use super::{CommitmentPair, SigningPackage};
use crate::crypto::{self, NonceCommitment};
use crate::{Error, KeyShare, ParticipantId, PublicKey, Result, SessionId, Signature};
use curve25519_dalek::scalar::Scalar;
use dashmap::{mapref::entry::Entry, DashMap};
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Decides whether this participant agrees to sign a message
pub trait ApprovalPolicy: Send + Sync {
    fn approve(&self, chain_reference: &str, message: &[u8]) -> Result<()>;
}

/// Approve exactly one message, whatever the reference
#[derive(Debug, Clone)]
pub struct FixedMessage(pub Vec<u8>);

impl ApprovalPolicy for FixedMessage {
    fn approve(&self, _chain_reference: &str, message: &[u8]) -> Result<()> {
        if self.0 == message {
            Ok(())
        } else {
            Err(Error::InvalidTransition("message was not approved for signing".into()))
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SigningNonces {
    hiding: Scalar,
    binding: Scalar,
}

enum ResponderState {
    Committed {
        coordinator: ParticipantId,
        message: Vec<u8>,
        nonces: SigningNonces,
        commitment: CommitmentPair,
        created_at: Instant,
    },
    Consumed {
        coordinator: ParticipantId,
        package_digest: [u8; 32],
        share: [u8; 32],
        created_at: Instant,
    },
}

impl ResponderState {
    fn created_at(&self) -> Instant {
        match self {
            ResponderState::Committed { created_at, .. } => *created_at,
            ResponderState::Consumed { created_at, .. } => *created_at,
        }
    }
}

/// Per-participant responder state across sessions
pub struct Responder {
    key_share: Arc<KeyShare>,
    sessions: DashMap<SessionId, ResponderState>,
}

impl Responder {
    pub fn new(key_share: Arc<KeyShare>) -> Self {
        Self {
            key_share,
            sessions: DashMap::new(),
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.key_share.participant_id
    }

    pub fn group_public_key(&self) -> PublicKey {
        self.key_share.group_public_key
    }

    /// Produce this participant's commitments for a session.
    ///
    /// A re-delivered request returns the commitments already issued.
    pub fn commit(
        &self,
        session_id: SessionId,
        coordinator: ParticipantId,
        message: &[u8],
    ) -> Result<CommitmentPair> {
        match self.sessions.entry(session_id) {
            Entry::Occupied(entry) => match entry.get() {
                ResponderState::Committed {
                    coordinator: c,
                    message: m,
                    commitment,
                    ..
                } if *c == coordinator && m.as_slice() == message => Ok(*commitment),
                ResponderState::Committed { .. } => Err(Error::violation(
                    coordinator,
                    "conflicting commit request for an open session",
                )),
                ResponderState::Consumed { .. } => Err(Error::InvalidTransition(
                    "nonces for this session were already consumed".into(),
                )),
            },
            Entry::Vacant(entry) => {
                let mut rng = OsRng;
                let secret = self.key_share.signing_share();
                let nonces = SigningNonces {
                    hiding: crypto::generate_nonce(secret, &mut rng),
                    binding: crypto::generate_nonce(secret, &mut rng),
                };
                let commitment = CommitmentPair::from(&NonceCommitment {
                    hiding: crypto::mul_base(&nonces.hiding),
                    binding: crypto::mul_base(&nonces.binding),
                });

                entry.insert(ResponderState::Committed {
                    coordinator,
                    message: message.to_vec(),
                    nonces,
                    commitment,
                    created_at: Instant::now(),
                });
                debug!(
                    participant_id = self.participant_id(),
                    session_id = %crate::types::session_label(&session_id),
                    "Issued commitments"
                );
                Ok(commitment)
            }
        }
    }

    /// Compute this participant's signature share, consuming the session nonces
    pub fn sign(
        &self,
        session_id: SessionId,
        coordinator: ParticipantId,
        package: &SigningPackage,
    ) -> Result<[u8; 32]> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::SessionNotFound(hex::encode(session_id)))?;
        let digest = package.digest();

        let share = match &*entry {
            ResponderState::Consumed {
                coordinator: c,
                package_digest,
                share,
                ..
            } => {
                if *c == coordinator && bool::from(package_digest.as_slice().ct_eq(digest.as_slice())) {
                    return Ok(*share);
                }
                warn!(
                    participant_id = self.participant_id(),
                    coordinator,
                    session_id = %crate::types::session_label(&session_id),
                    "Refusing second signing package for consumed nonces"
                );
                return Err(Error::NonceReuse(coordinator));
            }
            ResponderState::Committed {
                coordinator: c,
                message,
                nonces,
                commitment,
                ..
            } => {
                if *c != coordinator {
                    return Err(Error::violation(
                        coordinator,
                        "signing package from a different coordinator",
                    ));
                }
                if package.message != *message {
                    return Err(Error::violation(
                        coordinator,
                        "package message differs from the committed message",
                    ));
                }
                self.compute_share(coordinator, package, nonces, commitment)?
            }
        };

        *entry = ResponderState::Consumed {
            coordinator,
            package_digest: digest,
            share,
            created_at: Instant::now(),
        };
        debug!(
            participant_id = self.participant_id(),
            session_id = %crate::types::session_label(&session_id),
            "Produced signature share"
        );
        Ok(share)
    }

    fn compute_share(
        &self,
        coordinator: ParticipantId,
        package: &SigningPackage,
        nonces: &SigningNonces,
        own_commitment: &CommitmentPair,
    ) -> Result<[u8; 32]> {
        let id = self.participant_id();
        if package.commitments.get(&id) != Some(own_commitment) {
            return Err(Error::violation(
                coordinator,
                "package does not carry our commitment",
            ));
        }
        if package.commitments.len() < self.key_share.threshold {
            return Err(Error::ThresholdNotMet {
                required: self.key_share.threshold,
                actual: package.commitments.len(),
            });
        }
        if let Some(unknown) = package
            .commitments
            .keys()
            .find(|candidate| !self.key_share.verifying_shares.contains_key(*candidate))
        {
            return Err(Error::InvalidParticipantId(*unknown));
        }

        let commitments = package.decode_commitments()?;
        let group_key = self.key_share.group_key_point()?;
        let binding_factors = crypto::binding_factors(&group_key, &package.message, &commitments);
        let r = crypto::group_commitment(&commitments, &binding_factors)?;
        let c = crypto::challenge(&r, &group_key, &package.message);
        let lambda = crypto::lagrange_coefficient(id, &package.signers())?;
        let rho = binding_factors
            .get(&id)
            .ok_or_else(|| Error::Internal("missing own binding factor".into()))?;

        let mut z = nonces.hiding
            + nonces.binding * rho
            + lambda * self.key_share.signing_share() * c;
        let bytes = z.to_bytes();
        z.zeroize();
        Ok(bytes)
    }

    /// Check an outcome announced by a coordinator
    pub fn verify_outcome(&self, message: &[u8], signature: &Signature) -> Result<()> {
        signature.verify(&self.key_share.group_public_key, message)
    }

    /// Forget sessions older than `retention`
    pub fn prune(&self, retention: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, state| state.created_at().elapsed() < retention);
        before - self.sessions.len()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::dealer_shares;
    use std::collections::BTreeMap;

    fn responders() -> Vec<Responder> {
        dealer_shares(2, 3, 41)
            .into_iter()
            .map(|s| Responder::new(Arc::new(s)))
            .collect()
    }

    #[test]
    fn test_recommit_returns_same_commitment() {
        let responders = responders();
        let session = [1u8; 32];

        let first = responders[0].commit(session, 2, b"msg").unwrap();
        let again = responders[0].commit(session, 2, b"msg").unwrap();
        assert_eq!(first, again);

        let err = responders[0].commit(session, 2, b"other").unwrap_err();
        assert_eq!(err.culprit(), Some(2));
    }

    #[test]
    fn test_nonces_are_single_use() {
        let responders = responders();
        let session = [2u8; 32];
        let message = b"withdrawal".to_vec();

        let mut commitments = BTreeMap::new();
        for r in &responders[..2] {
            commitments.insert(r.participant_id(), r.commit(session, 1, &message).unwrap());
        }
        let package = SigningPackage {
            message: message.clone(),
            commitments,
        };

        let share = responders[0].sign(session, 1, &package).unwrap();
        // Re-delivery of the same package is answered from cache
        assert_eq!(responders[0].sign(session, 1, &package).unwrap(), share);

        // Any other package would reuse the nonces
        let mut altered = package.clone();
        altered.commitments.insert(
            3,
            responders[2].commit(session, 1, &message).unwrap(),
        );
        assert!(matches!(
            responders[0].sign(session, 1, &altered),
            Err(Error::NonceReuse(1))
        ));

        // Fresh nonces are never issued for a consumed session
        assert!(responders[0].commit(session, 1, &message).is_err());
    }

    #[test]
    fn test_package_must_carry_own_commitment() {
        let responders = responders();
        let session = [3u8; 32];
        let message = b"deposit".to_vec();

        responders[0].commit(session, 1, &message).unwrap();
        let mut commitments = BTreeMap::new();
        commitments.insert(1, responders[1].commit(session, 1, &message).unwrap());
        commitments.insert(2, responders[1].commit(session, 1, &message).unwrap());

        let package = SigningPackage { message, commitments };
        assert!(responders[0].sign(session, 1, &package).is_err());
    }

    #[test]
    fn test_sign_unknown_session() {
        let responders = responders();
        let package = SigningPackage {
            message: vec![],
            commitments: BTreeMap::new(),
        };
        assert!(matches!(
            responders[0].sign([9u8; 32], 1, &package),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_prune() {
        let responders = responders();
        responders[0].commit([4u8; 32], 1, b"m").unwrap();
        assert_eq!(responders[0].prune(Duration::from_secs(60)), 0);
        assert_eq!(responders[0].prune(Duration::ZERO), 1);
        assert_eq!(responders[0].open_sessions(), 0);
    }

    #[test]
    fn test_fixed_message_policy() {
        let policy = FixedMessage(b"yes".to_vec());
        assert!(policy.approve("ref", b"yes").is_ok());
        assert!(policy.approve("ref", b"no").is_err());
    }
}
