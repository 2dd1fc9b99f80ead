//! Sans-IO key generation ceremony

use super::{
    CeremonyGuard, CeremonySlot, DkgMessage, DkgRound1Message, DkgRound2Message,
    DkgRound3Message, DkgStatus, Outbound,
};
use crate::config::BridgeConfig;
use crate::{crypto, Error, KeyShare, ParticipantId, PublicKey, Result, SessionId};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use curve25519_dalek::{edwards::EdwardsPoint, scalar::Scalar, traits::Identity};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey as ExchangeKey, ReusableSecret};
use zeroize::Zeroize;

const SHARE_ENCRYPTION_DOMAIN: &[u8] = b"xmr-bridge/dkg-share/v1";

/// Parameters of one ceremony
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkgParams {
    /// Identifier shared by every participant of the ceremony
    pub ceremony_id: SessionId,
    /// This participant's ID
    pub participant_id: ParticipantId,
    /// Threshold
    pub threshold: usize,
    /// Total number of participants
    pub total: usize,
}

impl DkgParams {
    pub fn new(
        ceremony_id: SessionId,
        participant_id: ParticipantId,
        threshold: usize,
        total: usize,
    ) -> Result<Self> {
        if threshold < 2 {
            return Err(Error::InvalidConfig("Threshold must be at least 2".into()));
        }
        if threshold > total {
            return Err(Error::InvalidConfig(
                "Threshold cannot exceed number of participants".into(),
            ));
        }
        if participant_id == 0 || participant_id as usize > total {
            return Err(Error::InvalidParticipantId(participant_id));
        }
        Ok(Self {
            ceremony_id,
            participant_id,
            threshold,
            total,
        })
    }

    pub fn from_config(config: &BridgeConfig, ceremony_id: SessionId) -> Result<Self> {
        Self::new(
            ceremony_id,
            config.participant_id,
            config.threshold,
            config.total_participants,
        )
    }

    /// Every participant id of the ceremony
    pub fn participants(&self) -> Vec<ParticipantId> {
        (1..=self.total as ParticipantId).collect()
    }
}

struct VerifiedCommitments {
    message: DkgRound1Message,
    points: Vec<EdwardsPoint>,
}

/// One participant's view of a key generation ceremony
pub struct DkgCeremony {
    params: DkgParams,
    status: DkgStatus,
    coefficients: Vec<Scalar>,
    exchange_secret: ReusableSecret,
    commitments: BTreeMap<ParticipantId, VerifiedCommitments>,
    shares: BTreeMap<ParticipantId, (Vec<u8>, Scalar)>,
    pending_shares: Vec<DkgRound2Message>,
    group_key_reports: BTreeMap<ParticipantId, PublicKey>,
    key_share: Option<KeyShare>,
    failure: Option<String>,
    guard: Option<CeremonyGuard>,
}

impl DkgCeremony {
    /// Claim the node's ceremony slot and deal a fresh polynomial
    pub fn new<R: RngCore + CryptoRng>(
        params: DkgParams,
        slot: &CeremonySlot,
        rng: &mut R,
    ) -> Result<Self> {
        let guard = slot.acquire()?;

        let coefficients: Vec<Scalar> = (0..params.threshold)
            .map(|_| crypto::random_scalar(rng))
            .collect();
        let points: Vec<EdwardsPoint> = coefficients.iter().map(crypto::mul_base).collect();
        let (proof_r, proof_mu) =
            crypto::prove_knowledge(params.participant_id, &coefficients[0], &points[0], rng);
        let exchange_secret = ReusableSecret::random_from_rng(&mut *rng);

        let own = DkgRound1Message {
            ceremony_id: params.ceremony_id,
            from: params.participant_id,
            commitments: points.iter().map(crypto::encode_point).collect(),
            proof_r: crypto::encode_point(&proof_r),
            proof_mu: proof_mu.to_bytes(),
            exchange_key: ExchangeKey::from(&exchange_secret).to_bytes(),
        };

        let mut commitments = BTreeMap::new();
        commitments.insert(
            params.participant_id,
            VerifiedCommitments {
                message: own,
                points,
            },
        );

        Ok(Self {
            params,
            status: DkgStatus::Init,
            coefficients,
            exchange_secret,
            commitments,
            shares: BTreeMap::new(),
            pending_shares: Vec::new(),
            group_key_reports: BTreeMap::new(),
            key_share: None,
            failure: None,
            guard: Some(guard),
        })
    }

    pub fn params(&self) -> &DkgParams {
        &self.params
    }

    pub fn status(&self) -> DkgStatus {
        self.status
    }

    /// Reason the ceremony aborted, if it did
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Round 1 broadcast
    pub fn start(&self) -> Vec<Outbound> {
        let own = &self.commitments[&self.params.participant_id].message;
        vec![Outbound::Broadcast(DkgMessage::Commitments(own.clone()))]
    }

    /// Process one inbound message and return what must be sent next.
    ///
    /// `from` is the sender as authenticated by the transport.
    pub fn handle(&mut self, from: ParticipantId, message: DkgMessage) -> Result<Vec<Outbound>> {
        match self.status {
            DkgStatus::Aborted => {
                return Err(Error::InvalidTransition(format!(
                    "ceremony aborted: {}",
                    self.failure.as_deref().unwrap_or("unknown")
                )))
            }
            DkgStatus::Complete => {
                debug!(from, round = message.round(), "Ignoring message after completion");
                return Ok(Vec::new());
            }
            _ => {}
        }

        if message.ceremony_id() != &self.params.ceremony_id {
            debug!(from, "Ignoring message for another ceremony");
            return Ok(Vec::new());
        }
        if from == 0 || from as usize > self.params.total {
            return Err(Error::InvalidParticipantId(from));
        }
        if message.sender() != from {
            return Err(self.abort(Error::violation(
                from,
                "message sender does not match transport identity",
            )));
        }
        if from == self.params.participant_id {
            return Ok(Vec::new());
        }

        let received = match message {
            DkgMessage::Commitments(m) => self.receive_commitments(m),
            DkgMessage::Share(m) => self.receive_share(m),
            DkgMessage::GroupKey(m) => self.receive_group_key(m),
        };
        if let Err(e) = received {
            return Err(self.abort(e));
        }

        match self.advance() {
            Ok(outbound) => Ok(outbound),
            Err(e) => Err(self.abort(e)),
        }
    }

    /// Move to `Aborted`, release the slot and wipe secret material
    pub fn abort(&mut self, error: Error) -> Error {
        if self.status != DkgStatus::Aborted {
            warn!(
                participant_id = self.params.participant_id,
                culprit = ?error.culprit(),
                error = %error,
                "DKG ceremony aborted"
            );
            self.status = DkgStatus::Aborted;
            self.failure = Some(error.to_string());
            self.guard = None;
            self.wipe();
        }
        error
    }

    /// Key share of a completed ceremony
    pub fn key_share(&self) -> Result<KeyShare> {
        match (&self.status, &self.key_share) {
            (DkgStatus::Complete, Some(share)) => Ok(share.clone()),
            _ => Err(Error::InvalidTransition(format!(
                "ceremony is {:?}, not complete",
                self.status
            ))),
        }
    }

    fn receive_commitments(&mut self, m: DkgRound1Message) -> Result<()> {
        if let Some(existing) = self.commitments.get(&m.from) {
            if existing.message == m {
                return Ok(());
            }
            return Err(Error::violation(m.from, "conflicting round 1 commitments"));
        }

        if m.commitments.len() != self.params.threshold {
            return Err(Error::violation(
                m.from,
                format!(
                    "expected {} commitments, got {}",
                    self.params.threshold,
                    m.commitments.len()
                ),
            ));
        }

        let points = m
            .commitments
            .iter()
            .map(|c| crypto::decode_point(c))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::violation(m.from, format!("invalid commitment: {}", e)))?;
        let r = crypto::decode_point(&m.proof_r)
            .map_err(|e| Error::violation(m.from, format!("invalid proof: {}", e)))?;
        let mu = crypto::decode_scalar(&m.proof_mu)
            .map_err(|e| Error::violation(m.from, format!("invalid proof: {}", e)))?;

        if !crypto::verify_knowledge(m.from, &points[0], &r, &mu) {
            return Err(Error::violation(m.from, "invalid proof of knowledge"));
        }

        debug!(from = m.from, "Verified round 1 commitments");
        self.commitments
            .insert(m.from, VerifiedCommitments { message: m, points });
        Ok(())
    }

    fn receive_share(&mut self, m: DkgRound2Message) -> Result<()> {
        if m.to != self.params.participant_id {
            return Err(Error::violation(
                m.from,
                format!("share addressed to participant {}", m.to),
            ));
        }

        if self.status == DkgStatus::Init {
            if !self.pending_shares.contains(&m) {
                self.pending_shares.push(m);
            }
            return Ok(());
        }

        self.process_share(m)
    }

    fn process_share(&mut self, m: DkgRound2Message) -> Result<()> {
        if let Some((ciphertext, _)) = self.shares.get(&m.from) {
            if *ciphertext == m.ciphertext {
                return Ok(());
            }
            return Err(Error::violation(m.from, "conflicting round 2 share"));
        }

        let sender = self
            .commitments
            .get(&m.from)
            .ok_or_else(|| Error::Internal(format!("no commitments from {}", m.from)))?;
        let cipher = self.share_cipher(m.from, &sender.message.exchange_key, m.from, m.to)?;

        let mut plaintext = cipher
            .decrypt(&Nonce::default(), m.ciphertext.as_slice())
            .map_err(|_| Error::violation(m.from, "share does not decrypt"))?;
        let share = crypto::decode_scalar(&plaintext);
        plaintext.zeroize();
        let share =
            share.map_err(|_| Error::violation(m.from, "share is not a canonical scalar"))?;

        let x = crypto::identifier(self.params.participant_id)?;
        if crypto::mul_base(&share) != crypto::evaluate_commitment(&sender.points, &x) {
            return Err(Error::violation(m.from, "share fails Feldman verification"));
        }

        debug!(from = m.from, "Verified round 2 share");
        self.shares.insert(m.from, (m.ciphertext, share));
        Ok(())
    }

    fn receive_group_key(&mut self, m: DkgRound3Message) -> Result<()> {
        if let Some(existing) = self.group_key_reports.get(&m.from) {
            if *existing == m.group_public_key {
                return Ok(());
            }
            return Err(Error::violation(m.from, "conflicting group key reports"));
        }
        self.group_key_reports.insert(m.from, m.group_public_key);
        Ok(())
    }

    fn advance(&mut self) -> Result<Vec<Outbound>> {
        let mut outbound = Vec::new();
        let own_id = self.params.participant_id;

        if self.status == DkgStatus::Init && self.commitments.len() == self.params.total {
            self.status = DkgStatus::CommitmentsExchanged;
            debug!(participant_id = own_id, "All round 1 commitments verified");

            for peer in self.params.participants() {
                if peer == own_id {
                    continue;
                }
                let exchange_key = self
                    .commitments
                    .get(&peer)
                    .map(|c| c.message.exchange_key)
                    .ok_or_else(|| Error::Internal(format!("no commitments from {}", peer)))?;
                let cipher = self.share_cipher(peer, &exchange_key, own_id, peer)?;

                let mut share =
                    crypto::evaluate_polynomial(&self.coefficients, &crypto::identifier(peer)?);
                let ciphertext = cipher
                    .encrypt(&Nonce::default(), share.as_bytes().as_slice())
                    .map_err(|_| Error::Internal("share encryption failed".into()));
                share.zeroize();

                outbound.push(Outbound::Direct(
                    peer,
                    DkgMessage::Share(DkgRound2Message {
                        ceremony_id: self.params.ceremony_id,
                        from: own_id,
                        to: peer,
                        ciphertext: ciphertext?,
                    }),
                ));
            }

            for m in std::mem::take(&mut self.pending_shares) {
                self.process_share(m)?;
            }
        }

        if self.status == DkgStatus::CommitmentsExchanged
            && self.shares.len() == self.params.total - 1
        {
            self.status = DkgStatus::SharesExchanged;
            let key_share = self.derive_key_share()?;
            let group_public_key = key_share.group_public_key;

            self.status = DkgStatus::Verified;
            self.key_share = Some(key_share);
            self.group_key_reports.insert(own_id, group_public_key);
            debug!(
                participant_id = own_id,
                group_public_key = %hex::encode(group_public_key),
                "Derived key share"
            );

            outbound.push(Outbound::Broadcast(DkgMessage::GroupKey(DkgRound3Message {
                ceremony_id: self.params.ceremony_id,
                from: own_id,
                group_public_key,
            })));
        }

        if self.status == DkgStatus::Verified {
            let own_key = self.group_key_reports[&own_id];
            if let Some((id, _)) = self
                .group_key_reports
                .iter()
                .find(|(_, key)| **key != own_key)
            {
                return Err(Error::FatalInvariant(format!(
                    "participant {} derived a different group public key",
                    id
                )));
            }

            if self.group_key_reports.len() == self.params.total {
                self.status = DkgStatus::Complete;
                self.guard = None;
                self.wipe();
            }
        }

        Ok(outbound)
    }

    fn derive_key_share(&self) -> Result<KeyShare> {
        let own_id = self.params.participant_id;

        let mut secret = crypto::evaluate_polynomial(
            &self.coefficients,
            &crypto::identifier(own_id)?,
        );
        for (_, share) in self.shares.values() {
            secret += share;
        }

        let group_key = self
            .commitments
            .values()
            .fold(EdwardsPoint::identity(), |acc, c| acc + c.points[0]);

        let mut verifying_shares = BTreeMap::new();
        for id in self.params.participants() {
            let x = crypto::identifier(id)?;
            let share = self
                .commitments
                .values()
                .fold(EdwardsPoint::identity(), |acc, c| {
                    acc + crypto::evaluate_commitment(&c.points, &x)
                });
            verifying_shares.insert(id, crypto::encode_point(&share));
        }

        let key_share = KeyShare {
            participant_id: own_id,
            threshold: self.params.threshold,
            total: self.params.total,
            secret_share: secret,
            group_public_key: crypto::encode_point(&group_key),
            verifying_shares,
        };

        key_share
            .group_key_point()
            .map_err(|e| Error::FatalInvariant(format!("degenerate group key: {}", e)))?;
        key_share.check_consistency()?;
        Ok(key_share)
    }

    fn share_cipher(
        &self,
        peer: ParticipantId,
        peer_exchange_key: &[u8; 32],
        from: ParticipantId,
        to: ParticipantId,
    ) -> Result<ChaCha20Poly1305> {
        let shared = self
            .exchange_secret
            .diffie_hellman(&ExchangeKey::from(*peer_exchange_key));
        if !shared.was_contributory() {
            return Err(Error::violation(peer, "low-order exchange key"));
        }

        let mut info = Vec::with_capacity(SHARE_ENCRYPTION_DOMAIN.len() + 4);
        info.extend_from_slice(SHARE_ENCRYPTION_DOMAIN);
        info.extend_from_slice(&from.to_be_bytes());
        info.extend_from_slice(&to.to_be_bytes());

        let hkdf = Hkdf::<Sha256>::new(Some(self.params.ceremony_id.as_slice()), shared.as_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(&info, &mut key)
            .map_err(|_| Error::Internal("share key expansion failed".into()))?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Ok(cipher)
    }

    fn wipe(&mut self) {
        self.coefficients.zeroize();
        for (_, share) in self.shares.values_mut() {
            share.zeroize();
        }
    }
}

impl Drop for DkgCeremony {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::collections::VecDeque;

    const CEREMONY: SessionId = [7u8; 32];

    fn ceremonies(
        threshold: usize,
        total: usize,
        rng: &mut ChaCha20Rng,
    ) -> (Vec<CeremonySlot>, Vec<DkgCeremony>) {
        let slots: Vec<CeremonySlot> = (0..total).map(|_| CeremonySlot::new()).collect();
        let ceremonies = (1..=total as ParticipantId)
            .map(|id| {
                let params = DkgParams::new(CEREMONY, id, threshold, total).unwrap();
                DkgCeremony::new(params, &slots[id as usize - 1], rng).unwrap()
            })
            .collect();
        (slots, ceremonies)
    }

    /// Deliver messages until quiet; returns the first (recipient, error)
    fn run(
        ceremonies: &mut [DkgCeremony],
        mut tamper: impl FnMut(ParticipantId, ParticipantId, &mut DkgMessage),
    ) -> Option<(ParticipantId, Error)> {
        let total = ceremonies.len() as ParticipantId;
        let mut queue: VecDeque<(ParticipantId, ParticipantId, DkgMessage)> = VecDeque::new();

        let enqueue = |queue: &mut VecDeque<(ParticipantId, ParticipantId, DkgMessage)>,
                       from: ParticipantId,
                       outbound: Vec<Outbound>| {
            for item in outbound {
                match item {
                    Outbound::Broadcast(m) => {
                        for to in 1..=total {
                            if to != from {
                                queue.push_back((from, to, m.clone()));
                            }
                        }
                    }
                    Outbound::Direct(to, m) => queue.push_back((from, to, m)),
                }
            }
        };

        for c in ceremonies.iter() {
            enqueue(&mut queue, c.params().participant_id, c.start());
        }

        while let Some((from, to, mut message)) = queue.pop_front() {
            tamper(from, to, &mut message);
            match ceremonies[to as usize - 1].handle(from, message) {
                Ok(outbound) => enqueue(&mut queue, to, outbound),
                Err(e) => return Some((to, e)),
            }
        }
        None
    }

    #[test]
    fn test_ceremony_converges() {
        let mut rng = ChaCha20Rng::seed_from_u64(31);
        let (slots, mut ceremonies) = ceremonies(2, 3, &mut rng);

        assert!(run(&mut ceremonies, |_, _, _| {}).is_none());

        let shares: Vec<KeyShare> = ceremonies.iter().map(|c| c.key_share().unwrap()).collect();
        for share in &shares {
            assert_eq!(share.group_public_key, shares[0].group_public_key);
            assert_eq!(share.verifying_shares, shares[0].verifying_shares);
        }
        assert!(slots.iter().all(|s| !s.is_busy()));

        // Any two shares interpolate to the group secret
        let signers = [1u16, 3];
        let secret = signers.iter().fold(Scalar::ZERO, |acc, id| {
            let lambda = crypto::lagrange_coefficient(*id, &signers).unwrap();
            acc + lambda * shares[*id as usize - 1].signing_share()
        });
        assert_eq!(
            crypto::encode_point(&crypto::mul_base(&secret)),
            shares[0].group_public_key
        );
    }

    #[test]
    fn test_ceremony_is_not_reentrant() {
        let mut rng = ChaCha20Rng::seed_from_u64(32);
        let slot = CeremonySlot::new();
        let params = DkgParams::new(CEREMONY, 1, 2, 3).unwrap();

        let first = DkgCeremony::new(params.clone(), &slot, &mut rng).unwrap();
        assert!(matches!(
            DkgCeremony::new(params.clone(), &slot, &mut rng),
            Err(Error::CeremonyInProgress)
        ));

        drop(first);
        assert!(DkgCeremony::new(params, &slot, &mut rng).is_ok());
    }

    #[test]
    fn test_tampered_share_aborts_naming_sender() {
        let mut rng = ChaCha20Rng::seed_from_u64(33);
        let (slots, mut ceremonies) = ceremonies(2, 3, &mut rng);

        let (recipient, err) = run(&mut ceremonies, |from, to, message| {
            if let DkgMessage::Share(m) = message {
                if from == 1 && to == 2 {
                    m.ciphertext[0] ^= 0x01;
                }
            }
        })
        .unwrap();

        assert_eq!(recipient, 2);
        assert_eq!(err.culprit(), Some(1));
        assert_eq!(ceremonies[1].status(), DkgStatus::Aborted);
        assert!(!slots[1].is_busy());
    }

    #[test]
    fn test_divergent_group_key_is_fatal() {
        let mut rng = ChaCha20Rng::seed_from_u64(34);
        let bogus = crypto::encode_point(&crypto::mul_base(&crypto::random_scalar(&mut rng)));
        let (_slots, mut ceremonies) = ceremonies(2, 3, &mut rng);

        let (recipient, err) = run(&mut ceremonies, |from, to, message| {
            if let DkgMessage::GroupKey(m) = message {
                if from == 3 && to == 1 {
                    m.group_public_key = bogus;
                }
            }
        })
        .unwrap();

        assert_eq!(recipient, 1);
        assert!(matches!(err, Error::FatalInvariant(_)));
        assert_eq!(ceremonies[0].status(), DkgStatus::Aborted);
    }

    #[test]
    fn test_duplicate_and_stale_messages() {
        let mut rng = ChaCha20Rng::seed_from_u64(35);
        let (_slots, mut ceremonies) = ceremonies(2, 3, &mut rng);

        let round1 = match ceremonies[1].start().remove(0) {
            Outbound::Broadcast(m) => m,
            other => panic!("unexpected {:?}", other),
        };

        assert!(ceremonies[0].handle(2, round1.clone()).unwrap().is_empty());
        assert!(ceremonies[0].handle(2, round1.clone()).unwrap().is_empty());

        let mut stale = round1.clone();
        if let DkgMessage::Commitments(m) = &mut stale {
            m.ceremony_id = [9u8; 32];
        }
        assert!(ceremonies[0].handle(2, stale).unwrap().is_empty());

        let mut conflicting = round1;
        if let DkgMessage::Commitments(m) = &mut conflicting {
            m.commitments.swap(0, 1);
        }
        let err = ceremonies[0].handle(2, conflicting).unwrap_err();
        assert_eq!(err.culprit(), Some(2));
    }

    #[test]
    fn test_spoofed_sender_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(36);
        let (_slots, mut ceremonies) = ceremonies(2, 3, &mut rng);

        let round1 = match ceremonies[1].start().remove(0) {
            Outbound::Broadcast(m) => m,
            other => panic!("unexpected {:?}", other),
        };

        let err = ceremonies[0].handle(3, round1).unwrap_err();
        assert_eq!(err.culprit(), Some(3));
    }
}
