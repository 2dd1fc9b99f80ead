//! Coordinator-side signing session records
//!
//! Every mutation of a session happens under its own mutex, so "threshold
//! reached" is always judged from a consistent view. Sessions for different
//! requests share nothing mutable except the consumed-commitment set.

use super::{CommitmentPair, SigningPackage};
use crate::crypto::{self, NonceCommitment};
use crate::registry::ParticipantRegistry;
use crate::types::session_label;
use crate::{Error, ErrorKind, ParticipantId, PublicKey, Result, SessionId, Signature};
use curve25519_dalek::{edwards::EdwardsPoint, scalar::Scalar};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Signing session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Committing,
    Sharing,
    Aggregated,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Aggregated | SessionStatus::Failed | SessionStatus::Expired
        )
    }
}

/// Why a session failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    pub kind: ErrorKind,
    pub culprit: Option<ParticipantId>,
    pub reason: String,
}

impl SessionFailure {
    fn from_error(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            culprit: error.culprit(),
            reason: error.to_string(),
        }
    }

    /// Rebuild an error of the same class for the session driver
    pub fn to_error(&self) -> Error {
        match (self.kind, self.culprit) {
            (ErrorKind::ProtocolViolation, Some(culprit)) => {
                Error::violation(culprit, self.reason.clone())
            }
            (ErrorKind::Liveness, _) => Error::Timeout(self.reason.clone()),
            (ErrorKind::External, _) => Error::Transport(self.reason.clone()),
            (ErrorKind::FatalInvariant, _) => Error::FatalInvariant(self.reason.clone()),
            _ => Error::Internal(self.reason.clone()),
        }
    }
}

struct SigningContext {
    commitments: BTreeMap<ParticipantId, NonceCommitment>,
    binding_factors: BTreeMap<ParticipantId, Scalar>,
    group_commitment: EdwardsPoint,
    challenge: Scalar,
    lambdas: BTreeMap<ParticipantId, Scalar>,
}

/// One signing attempt for one transaction request
pub struct SigningSession {
    session_id: SessionId,
    chain_reference: String,
    attempt: u32,
    message: Vec<u8>,
    coordinator: ParticipantId,
    threshold: usize,
    signers: BTreeSet<ParticipantId>,
    status: SessionStatus,
    commitments: BTreeMap<ParticipantId, CommitmentPair>,
    declined: BTreeMap<ParticipantId, String>,
    package: Option<SigningPackage>,
    context: Option<SigningContext>,
    shares: BTreeMap<ParticipantId, [u8; 32]>,
    signature: Option<Signature>,
    failure: Option<SessionFailure>,
    finished_at: Option<Instant>,
}

impl SigningSession {
    pub fn new(
        session_id: SessionId,
        chain_reference: impl Into<String>,
        attempt: u32,
        message: Vec<u8>,
        coordinator: ParticipantId,
        threshold: usize,
        signers: impl IntoIterator<Item = ParticipantId>,
    ) -> Result<Self> {
        let signers: BTreeSet<ParticipantId> = signers.into_iter().collect();
        if signers.len() < threshold {
            return Err(Error::ThresholdNotMet {
                required: threshold,
                actual: signers.len(),
            });
        }

        Ok(Self {
            session_id,
            chain_reference: chain_reference.into(),
            attempt,
            message,
            coordinator,
            threshold,
            signers,
            status: SessionStatus::Open,
            commitments: BTreeMap::new(),
            declined: BTreeMap::new(),
            package: None,
            context: None,
            shares: BTreeMap::new(),
            signature: None,
            failure: None,
            finished_at: None,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn chain_reference(&self) -> &str {
        &self.chain_reference
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn coordinator(&self) -> ParticipantId {
        self.coordinator
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Participants selected for round 1
    pub fn signers(&self) -> Vec<ParticipantId> {
        self.signers.iter().copied().collect()
    }

    pub fn participants_committed(&self) -> BTreeSet<ParticipantId> {
        self.commitments.keys().copied().collect()
    }

    pub fn participants_shared(&self) -> BTreeSet<ParticipantId> {
        self.shares.keys().copied().collect()
    }

    pub fn package(&self) -> Option<&SigningPackage> {
        self.package.as_ref()
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn failure(&self) -> Option<&SessionFailure> {
        self.failure.as_ref()
    }

    /// Open → Committing
    pub fn begin(&mut self) -> Result<()> {
        if self.status != SessionStatus::Open {
            return Err(Error::InvalidTransition(format!(
                "cannot start session in {:?}",
                self.status
            )));
        }
        self.status = SessionStatus::Committing;
        Ok(())
    }

    /// Record a round 1 commitment
    pub fn record_commitment(
        &mut self,
        from: ParticipantId,
        pair: CommitmentPair,
        consumed: &ConsumedCommitments,
    ) -> Result<()> {
        if self.commitments.get(&from) == Some(&pair) {
            return Ok(());
        }
        if self.status != SessionStatus::Committing {
            return Err(Error::InvalidTransition(format!(
                "commitment from {} arrived in {:?}",
                from, self.status
            )));
        }
        if !self.signers.contains(&from) {
            return Err(Error::violation(from, "not selected for this session"));
        }

        let rejected = if self.commitments.contains_key(&from) {
            Some(Error::violation(from, "conflicting commitments"))
        } else if let Err(e) = pair.decode() {
            Some(Error::violation(from, format!("invalid commitment: {}", e)))
        } else if consumed.contains(&pair) {
            Some(Error::NonceReuse(from))
        } else if self.commitments.values().any(|existing| *existing == pair) {
            Some(Error::violation(from, "commitment duplicates another signer's"))
        } else {
            None
        };
        if let Some(err) = rejected {
            self.fail(&err);
            return Err(err);
        }

        self.commitments.insert(from, pair);
        self.declined.remove(&from);
        Ok(())
    }

    /// Record that a signer refused to take part
    pub fn record_decline(&mut self, from: ParticipantId, reason: String) -> Result<()> {
        if !self.signers.contains(&from) {
            return Err(Error::violation(from, "not selected for this session"));
        }
        match self.status {
            SessionStatus::Committing if !self.commitments.contains_key(&from) => {
                self.declined.insert(from, reason);
            }
            SessionStatus::Sharing if self.commitments.contains_key(&from) => {
                let err = Error::Timeout(format!(
                    "participant {} declined round 2: {}",
                    from, reason
                ));
                self.fail(&err);
            }
            _ => {}
        }
        Ok(())
    }

    /// Every selected signer has either committed or declined
    pub fn round1_settled(&self) -> bool {
        self.commitments.len() + self.declined.len() >= self.signers.len()
    }

    /// Close round 1 and bind the committed set into a signing package.
    ///
    /// Fails the session unless at least `threshold` participants committed.
    pub fn close_commitments(
        &mut self,
        group_key: &EdwardsPoint,
        consumed: &ConsumedCommitments,
    ) -> Result<SigningPackage> {
        if self.status != SessionStatus::Committing {
            return Err(Error::InvalidTransition(format!(
                "cannot close round 1 in {:?}",
                self.status
            )));
        }

        if self.commitments.len() < self.threshold {
            let err = Error::ThresholdNotMet {
                required: self.threshold,
                actual: self.commitments.len(),
            };
            self.fail(&err);
            return Err(err);
        }

        if let Err(err) = consumed.consume_all(&self.session_id, &self.commitments) {
            self.fail(&err);
            return Err(err);
        }

        let package = SigningPackage {
            message: self.message.clone(),
            commitments: self.commitments.clone(),
        };
        let commitments = match package.decode_commitments() {
            Ok(commitments) => commitments,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        let binding_factors = crypto::binding_factors(group_key, &self.message, &commitments);
        let group_commitment = crypto::group_commitment(&commitments, &binding_factors)?;
        let challenge = crypto::challenge(&group_commitment, group_key, &self.message);
        let signers = package.signers();
        let lambdas = signers
            .iter()
            .map(|id| crypto::lagrange_coefficient(*id, &signers).map(|l| (*id, l)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        self.context = Some(SigningContext {
            commitments,
            binding_factors,
            group_commitment,
            challenge,
            lambdas,
        });
        self.package = Some(package.clone());
        self.status = SessionStatus::Sharing;
        Ok(package)
    }

    /// Record and verify a round 2 signature share:
    /// `z_i·G == D_i + ρ_i·E_i + c·λ_i·Y_i`
    pub fn record_share(
        &mut self,
        from: ParticipantId,
        share: [u8; 32],
        verifying_share: &EdwardsPoint,
    ) -> Result<()> {
        if self.shares.get(&from) == Some(&share) {
            return Ok(());
        }
        if self.status != SessionStatus::Sharing {
            return Err(Error::InvalidTransition(format!(
                "share from {} arrived in {:?}",
                from, self.status
            )));
        }
        if !self.commitments.contains_key(&from) {
            return Err(Error::violation(from, "did not commit in round 1"));
        }

        let verified = self.verify_share(from, &share, verifying_share);
        if let Err(err) = verified {
            self.fail(&err);
            return Err(err);
        }

        self.shares.insert(from, share);
        Ok(())
    }

    fn verify_share(
        &self,
        from: ParticipantId,
        share: &[u8; 32],
        verifying_share: &EdwardsPoint,
    ) -> Result<()> {
        if self.shares.contains_key(&from) {
            return Err(Error::violation(from, "conflicting signature shares"));
        }
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| Error::Internal("signing context missing".into()))?;
        let z = crypto::decode_scalar(share)
            .map_err(|e| Error::violation(from, format!("invalid share: {}", e)))?;

        let (Some(commitment), Some(rho), Some(lambda)) = (
            context.commitments.get(&from),
            context.binding_factors.get(&from),
            context.lambdas.get(&from),
        ) else {
            return Err(Error::Internal(format!("no binding data for {}", from)));
        };

        let expected = commitment.hiding
            + commitment.binding * rho
            + verifying_share * (context.challenge * lambda);
        if crypto::mul_base(&z) != expected {
            return Err(Error::violation(from, "signature share does not verify"));
        }
        Ok(())
    }

    /// Every committed signer delivered a verified share
    pub fn shares_complete(&self) -> bool {
        self.status == SessionStatus::Sharing && self.shares.len() == self.commitments.len()
    }

    /// Sum the verified shares and self-verify the aggregate
    pub fn aggregate(&mut self, group_public_key: &PublicKey) -> Result<Signature> {
        if !self.shares_complete() {
            return Err(Error::InvalidTransition(format!(
                "cannot aggregate with {} of {} shares in {:?}",
                self.shares.len(),
                self.commitments.len(),
                self.status
            )));
        }
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| Error::Internal("signing context missing".into()))?;

        let mut z = Scalar::ZERO;
        for share in self.shares.values() {
            z += crypto::decode_scalar(share)?;
        }
        let signature = Signature::new(crypto::encode_point(&context.group_commitment), z.to_bytes());

        if signature.verify(group_public_key, &self.message).is_err() {
            let err = Error::FatalInvariant(format!(
                "aggregate signature for session {} failed self-verification",
                session_label(&self.session_id)
            ));
            self.fail(&err);
            return Err(err);
        }

        self.signature = Some(signature);
        self.status = SessionStatus::Aggregated;
        self.finished_at = Some(Instant::now());
        Ok(signature)
    }

    /// Move to `Failed`, discarding the partial data of the open round
    pub fn fail(&mut self, error: &Error) {
        if self.status.is_terminal() {
            return;
        }
        warn!(
            session_id = %session_label(&self.session_id),
            chain_reference = %self.chain_reference,
            status = ?self.status,
            culprit = ?error.culprit(),
            error = %error,
            "Signing session failed"
        );
        self.status = SessionStatus::Failed;
        self.failure = Some(SessionFailure::from_error(error));
        self.commitments.clear();
        self.shares.clear();
        self.package = None;
        self.context = None;
        self.finished_at = Some(Instant::now());
    }

    /// Move to `Expired` (abandoned without a protocol outcome)
    pub fn expire(&mut self, reason: &str) {
        if self.status.is_terminal() {
            return;
        }
        debug!(session_id = %session_label(&self.session_id), reason, "Signing session expired");
        self.status = SessionStatus::Expired;
        self.failure = Some(SessionFailure {
            kind: ErrorKind::Liveness,
            culprit: None,
            reason: reason.to_string(),
        });
        self.commitments.clear();
        self.shares.clear();
        self.package = None;
        self.context = None;
        self.finished_at = Some(Instant::now());
    }

    fn finished_before(&self, cutoff: Duration) -> bool {
        self.finished_at
            .map(|at| at.elapsed() >= cutoff)
            .unwrap_or(false)
    }
}

/// Commitments already bound into a signing package, across all sessions
#[derive(Debug, Default)]
pub struct ConsumedCommitments {
    seen: DashMap<[u8; 64], (SessionId, ParticipantId)>,
}

impl ConsumedCommitments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pair: &CommitmentPair) -> bool {
        self.seen.contains_key(&pair.fingerprint())
    }

    /// Mark every commitment consumed by `session_id`; a commitment already
    /// consumed by another session is nonce reuse by its owner.
    pub fn consume_all(
        &self,
        session_id: &SessionId,
        commitments: &BTreeMap<ParticipantId, CommitmentPair>,
    ) -> Result<()> {
        for (id, pair) in commitments {
            match self.seen.entry(pair.fingerprint()) {
                Entry::Occupied(entry) => {
                    if entry.get().0 != *session_id {
                        return Err(Error::NonceReuse(*id));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert((*session_id, *id));
                }
            }
        }
        Ok(())
    }

    /// Forget the commitments consumed by `sessions`; a fingerprint lives as
    /// long as the session record that consumed it.
    pub fn release(&self, sessions: &BTreeSet<SessionId>) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, (session_id, _)| !sessions.contains(session_id));
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Shared handle on one session
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<SigningSession>>,
    changed: Arc<watch::Sender<u64>>,
}

impl SessionHandle {
    pub async fn lock(&self) -> MutexGuard<'_, SigningSession> {
        self.session.lock().await
    }

    /// Wake drivers waiting on this session
    pub fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

/// All signing sessions coordinated by this node
pub struct SessionManager {
    registry: Arc<ParticipantRegistry>,
    sessions: DashMap<SessionId, SessionHandle>,
    consumed: ConsumedCommitments,
    retention: Duration,
}

impl SessionManager {
    pub fn new(registry: Arc<ParticipantRegistry>, retention: Duration) -> Self {
        Self {
            registry,
            sessions: DashMap::new(),
            consumed: ConsumedCommitments::new(),
            retention,
        }
    }

    pub fn registry(&self) -> &Arc<ParticipantRegistry> {
        &self.registry
    }

    pub fn consumed(&self) -> &ConsumedCommitments {
        &self.consumed
    }

    /// Register a new session
    pub fn insert(&self, session: SigningSession) -> Result<SessionHandle> {
        let session_id = *session.session_id();
        let (changed, _) = watch::channel(0u64);
        let handle = SessionHandle {
            session: Arc::new(Mutex::new(session)),
            changed: Arc::new(changed),
        };
        match self.sessions.entry(session_id) {
            Entry::Occupied(_) => Err(Error::Internal(format!(
                "duplicate session id {}",
                session_label(&session_id)
            ))),
            Entry::Vacant(entry) => {
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn handle(&self, session_id: &SessionId) -> Result<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SessionNotFound(hex::encode(session_id)))
    }

    pub async fn status(&self, session_id: &SessionId) -> Result<SessionStatus> {
        Ok(self.handle(session_id)?.lock().await.status())
    }

    pub async fn record_commitment(
        &self,
        session_id: &SessionId,
        from: ParticipantId,
        pair: CommitmentPair,
    ) -> Result<()> {
        let handle = self.handle(session_id)?;
        let result = handle
            .lock()
            .await
            .record_commitment(from, pair, &self.consumed);
        handle.notify();
        result
    }

    pub async fn record_share(
        &self,
        session_id: &SessionId,
        from: ParticipantId,
        share: [u8; 32],
    ) -> Result<()> {
        let handle = self.handle(session_id)?;
        let verifying_share = self.registry.verifying_share(from)?;
        let result = handle
            .lock()
            .await
            .record_share(from, share, &verifying_share);
        handle.notify();
        result
    }

    pub async fn record_decline(
        &self,
        session_id: &SessionId,
        from: ParticipantId,
        reason: String,
    ) -> Result<()> {
        let handle = self.handle(session_id)?;
        let result = handle.lock().await.record_decline(from, reason);
        handle.notify();
        result
    }

    /// Expire every session that is still running
    pub async fn expire_all(&self, reason: &str) {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.lock().await.expire(reason);
            handle.notify();
        }
    }

    /// Drop terminal sessions past the retention window
    pub async fn prune(&self) -> usize {
        let candidates: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut removed = BTreeSet::new();
        for (session_id, handle) in candidates {
            let expired = {
                let session = handle.lock().await;
                session.status().is_terminal() && session.finished_before(self.retention)
            };
            if expired && self.sessions.remove(&session_id).is_some() {
                removed.insert(session_id);
            }
        }
        let released = self.consumed.release(&removed);
        if !removed.is_empty() {
            debug!(sessions = removed.len(), commitments = released, "Pruned signing sessions");
        }
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::Responder;
    use crate::test_support::dealer_shares;
    use crate::KeyShare;

    struct Fixture {
        shares: Vec<KeyShare>,
        responders: Vec<Responder>,
        group_key: EdwardsPoint,
        consumed: ConsumedCommitments,
    }

    fn fixture() -> Fixture {
        let shares = dealer_shares(2, 3, 51);
        let responders = shares
            .iter()
            .map(|s| Responder::new(Arc::new(s.clone())))
            .collect();
        let group_key = shares[0].group_key_point().unwrap();
        Fixture {
            shares,
            responders,
            group_key,
            consumed: ConsumedCommitments::new(),
        }
    }

    fn session(id: u8, message: &[u8]) -> SigningSession {
        let mut session =
            SigningSession::new([id; 32], "ref", 0, message.to_vec(), 1, 2, [1, 2, 3]).unwrap();
        session.begin().unwrap();
        session
    }

    #[test]
    fn test_full_session_with_two_of_three() {
        let f = fixture();
        let message = b"transfer";
        let mut s = session(1, message);

        for id in [1u16, 3] {
            let pair = f.responders[id as usize - 1].commit([1; 32], 1, message).unwrap();
            s.record_commitment(id, pair, &f.consumed).unwrap();
        }
        assert!(!s.round1_settled());

        let package = s.close_commitments(&f.group_key, &f.consumed).unwrap();
        assert_eq!(package.signers(), vec![1, 3]);
        assert_eq!(s.status(), SessionStatus::Sharing);

        for id in [1u16, 3] {
            let share = f.responders[id as usize - 1].sign([1; 32], 1, &package).unwrap();
            let y = f.shares[0].verifying_share(id).unwrap();
            s.record_share(id, share, &y).unwrap();
        }

        let signature = s.aggregate(&f.shares[0].group_public_key).unwrap();
        assert_eq!(s.status(), SessionStatus::Aggregated);
        signature.verify(&f.shares[0].group_public_key, message).unwrap();
        assert_eq!(s.participants_shared().len(), 2);
    }

    #[test]
    fn test_below_threshold_fails() {
        let f = fixture();
        let mut s = session(2, b"m");

        let pair = f.responders[0].commit([2; 32], 1, b"m").unwrap();
        s.record_commitment(1, pair, &f.consumed).unwrap();

        let err = s.close_commitments(&f.group_key, &f.consumed).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(s.status(), SessionStatus::Failed);
        assert!(s.signature().is_none());
    }

    #[test]
    fn test_commitment_reuse_across_sessions() {
        let f = fixture();
        let mut first = session(3, b"m");
        let p1 = f.responders[0].commit([3; 32], 1, b"m").unwrap();
        let p2 = f.responders[1].commit([3; 32], 1, b"m").unwrap();
        first.record_commitment(1, p1, &f.consumed).unwrap();
        first.record_commitment(2, p2, &f.consumed).unwrap();
        first.close_commitments(&f.group_key, &f.consumed).unwrap();

        // Participant 2 replays its consumed commitment in a new session
        let mut second = session(4, b"m");
        let err = second.record_commitment(2, p2, &f.consumed).unwrap_err();
        assert!(matches!(err, Error::NonceReuse(2)));
        assert_eq!(second.status(), SessionStatus::Failed);
    }

    #[test]
    fn test_stale_share_is_rejected() {
        let f = fixture();
        let message = b"stale";

        // Session A completes round 1 with participants 1 and 2
        let mut a = session(5, message);
        for id in [1u16, 2] {
            let pair = f.responders[id as usize - 1].commit([5; 32], 1, message).unwrap();
            a.record_commitment(id, pair, &f.consumed).unwrap();
        }
        let package_a = a.close_commitments(&f.group_key, &f.consumed).unwrap();
        let stale = f.responders[1].sign([5; 32], 1, &package_a).unwrap();

        // Session B: participant 2 answers with the share bound to A's commitments
        let mut b = session(6, message);
        for id in [1u16, 2] {
            let pair = f.responders[id as usize - 1].commit([6; 32], 1, message).unwrap();
            b.record_commitment(id, pair, &f.consumed).unwrap();
        }
        b.close_commitments(&f.group_key, &f.consumed).unwrap();

        let y = f.shares[0].verifying_share(2).unwrap();
        let err = b.record_share(2, stale, &y).unwrap_err();
        assert_eq!(err.culprit(), Some(2));
        assert_eq!(b.status(), SessionStatus::Failed);
        assert!(b.aggregate(&f.shares[0].group_public_key).is_err());
    }

    #[test]
    fn test_duplicates_and_late_joiners() {
        let f = fixture();
        let mut s = session(7, b"m");
        let p1 = f.responders[0].commit([7; 32], 1, b"m").unwrap();
        let p2 = f.responders[1].commit([7; 32], 1, b"m").unwrap();
        s.record_commitment(1, p1, &f.consumed).unwrap();
        s.record_commitment(1, p1, &f.consumed).unwrap();
        s.record_commitment(2, p2, &f.consumed).unwrap();
        s.close_commitments(&f.group_key, &f.consumed).unwrap();

        // Late commitment after round 1 closed
        let p3 = f.responders[2].commit([7; 32], 1, b"m").unwrap();
        assert!(matches!(
            s.record_commitment(3, p3, &f.consumed),
            Err(Error::InvalidTransition(_))
        ));
        // Share from a participant outside the committed set
        let y3 = f.shares[0].verifying_share(3).unwrap();
        assert_eq!(s.record_share(3, [0u8; 32], &y3).unwrap_err().culprit(), Some(3));
        assert_eq!(s.status(), SessionStatus::Sharing);
    }

    #[test]
    fn test_invalid_commitment_fails_session() {
        let f = fixture();
        let message = b"m";
        let mut s = session(10, message);

        let garbage = CommitmentPair {
            hiding: [0; 32],
            binding: [0; 32],
        };
        let err = s.record_commitment(2, garbage, &f.consumed).unwrap_err();
        assert_eq!(err.culprit(), Some(2));
        assert_eq!(s.status(), SessionStatus::Failed);
        assert_eq!(s.failure().unwrap().culprit, Some(2));

        // The honest signers can no longer push the session to an aggregate
        for id in [1u16, 3] {
            let pair = f.responders[id as usize - 1].commit([10; 32], 1, message).unwrap();
            assert!(matches!(
                s.record_commitment(id, pair, &f.consumed),
                Err(Error::InvalidTransition(_))
            ));
        }
        assert!(s.close_commitments(&f.group_key, &f.consumed).is_err());
        assert!(s.participants_committed().is_empty());
        assert!(s.package().is_none());
        assert!(s.signature().is_none());
        assert!(f.consumed.is_empty());
    }

    #[test]
    fn test_conflicting_and_copied_commitments_fail_session() {
        let f = fixture();

        let mut conflicting = session(11, b"m");
        let first = f.responders[0].commit([11; 32], 1, b"m").unwrap();
        let second = f.responders[0].commit([12; 32], 1, b"m").unwrap();
        conflicting.record_commitment(1, first, &f.consumed).unwrap();
        let err = conflicting.record_commitment(1, second, &f.consumed).unwrap_err();
        assert_eq!(err.culprit(), Some(1));
        assert_eq!(conflicting.status(), SessionStatus::Failed);

        let mut copied = session(13, b"m");
        let p1 = f.responders[0].commit([13; 32], 1, b"m").unwrap();
        copied.record_commitment(1, p1, &f.consumed).unwrap();
        let err = copied.record_commitment(3, p1, &f.consumed).unwrap_err();
        assert_eq!(err.culprit(), Some(3));
        assert_eq!(copied.status(), SessionStatus::Failed);
        assert!(copied.participants_committed().is_empty());
    }

    #[test]
    fn test_outsider_cannot_fail_session() {
        let f = fixture();
        let mut s = SigningSession::new([14; 32], "ref", 0, b"m".to_vec(), 1, 2, [1, 2]).unwrap();
        s.begin().unwrap();

        let outsider = f.responders[2].commit([14; 32], 1, b"m").unwrap();
        let err = s.record_commitment(3, outsider, &f.consumed).unwrap_err();
        assert_eq!(err.culprit(), Some(3));
        assert_eq!(s.status(), SessionStatus::Committing);

        for id in [1u16, 2] {
            let pair = f.responders[id as usize - 1].commit([14; 32], 1, b"m").unwrap();
            s.record_commitment(id, pair, &f.consumed).unwrap();
        }
        assert!(s.round1_settled());
        s.close_commitments(&f.group_key, &f.consumed).unwrap();
    }

    #[test]
    fn test_release_forgets_pruned_sessions_only() {
        let f = fixture();
        let mut a = session(15, b"m");
        let mut b = session(16, b"m");
        for (s, id) in [(&mut a, 15u8), (&mut b, 16u8)] {
            for signer in [1u16, 2] {
                let pair = f.responders[signer as usize - 1].commit([id; 32], 1, b"m").unwrap();
                s.record_commitment(signer, pair, &f.consumed).unwrap();
            }
            s.close_commitments(&f.group_key, &f.consumed).unwrap();
        }
        assert_eq!(f.consumed.len(), 4);

        let released = f.consumed.release(&BTreeSet::from([[15u8; 32]]));
        assert_eq!(released, 2);
        assert_eq!(f.consumed.len(), 2);
        assert!(f.consumed.contains(&b.package().unwrap().commitments[&1]));
    }

    #[test]
    fn test_declines_settle_round_one() {
        let f = fixture();
        let mut s = session(8, b"m");
        let p1 = f.responders[0].commit([8; 32], 1, b"m").unwrap();
        s.record_commitment(1, p1, &f.consumed).unwrap();
        s.record_decline(2, "not observed".into()).unwrap();
        assert!(!s.round1_settled());
        s.record_decline(3, "not observed".into()).unwrap();
        assert!(s.round1_settled());
        assert!(s.record_decline(4, "x".into()).is_err());
    }

    #[tokio::test]
    async fn test_manager_prunes_terminal_sessions() {
        let f = fixture();
        let mut registry = ParticipantRegistry::new(2, 3).unwrap();
        for id in 1..=3 {
            registry.register(id, format!("p{}", id)).unwrap();
        }
        registry.seal().unwrap();
        registry.install_key_share(&f.shares[0]).unwrap();

        let manager = SessionManager::new(Arc::new(registry), Duration::ZERO);
        manager.insert(session(9, b"m")).unwrap();
        assert!(manager.insert(session(9, b"m")).is_err());

        assert_eq!(manager.prune().await, 0);
        manager.expire_all("shutdown").await;
        assert_eq!(manager.status(&[9; 32]).await.unwrap(), SessionStatus::Expired);
        assert_eq!(manager.prune().await, 1);
        assert!(manager.is_empty());
    }
}
