//! Participant registry
//!
//! Static map of participant id to public verification material. Built
//! append-only while bootstrapping, sealed, then key material from DKG is
//! installed exactly once. After that it is shared read-only behind an `Arc`.

use crate::config::BridgeConfig;
use crate::{crypto, Error, KeyShare, ParticipantId, PublicKey, Result};
use curve25519_dalek::edwards::EdwardsPoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Index in 1..=N, stable for the bridge lifetime
    pub id: ParticipantId,
    /// Verifying share `s_i·G` published through DKG
    #[serde(with = "crate::types::hex_option", default)]
    pub public_share_commitment: Option<PublicKey>,
    /// Transport handle (hex Ed25519 verifying key)
    pub network_identity: String,
}

/// Registry of the fixed participant set
#[derive(Debug, Clone)]
pub struct ParticipantRegistry {
    threshold: usize,
    total: usize,
    participants: BTreeMap<ParticipantId, Participant>,
    group_public_key: Option<PublicKey>,
    sealed: bool,
}

impl ParticipantRegistry {
    /// Create an empty registry for a T-of-N group
    pub fn new(threshold: usize, total: usize) -> Result<Self> {
        if threshold < 2 {
            return Err(Error::InvalidConfig("Threshold must be at least 2".into()));
        }
        if threshold > total {
            return Err(Error::InvalidConfig(
                "Threshold cannot exceed number of participants".into(),
            ));
        }
        Ok(Self {
            threshold,
            total,
            participants: BTreeMap::new(),
            group_public_key: None,
            sealed: false,
        })
    }

    /// Build and seal a registry from the peer table of a configuration.
    ///
    /// Without a peer table, participants are registered with empty identities.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let mut registry = Self::new(config.threshold, config.total_participants)?;
        if config.peers.is_empty() {
            for id in config.participant_ids() {
                registry.register(id, format!("participant-{}", id))?;
            }
        } else {
            for peer in &config.peers {
                registry.register(peer.id, peer.network_identity.clone())?;
            }
        }
        registry.seal()?;
        Ok(registry)
    }

    /// Add a participant during bootstrap
    pub fn register(&mut self, id: ParticipantId, network_identity: String) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidTransition("registry is sealed".into()));
        }
        if id == 0 || id as usize > self.total {
            return Err(Error::InvalidParticipantId(id));
        }
        if self.participants.contains_key(&id) {
            return Err(Error::InvalidConfig(format!("participant {} already registered", id)));
        }
        if self
            .participants
            .values()
            .any(|p| p.network_identity == network_identity)
        {
            return Err(Error::InvalidConfig(format!(
                "network identity of participant {} is already in use",
                id
            )));
        }

        self.participants.insert(
            id,
            Participant {
                id,
                public_share_commitment: None,
                network_identity,
            },
        );
        Ok(())
    }

    /// Close bootstrap; every index in 1..=N must be present
    pub fn seal(&mut self) -> Result<()> {
        if self.participants.len() != self.total {
            return Err(Error::InvalidConfig(format!(
                "expected {} participants, registered {}",
                self.total,
                self.participants.len()
            )));
        }
        self.sealed = true;
        Ok(())
    }

    /// Install the group key and verifying shares produced by DKG.
    ///
    /// Re-installing identical material is a no-op; anything else after the
    /// first install would mutate a fixed group key.
    pub fn install_key_material(
        &mut self,
        group_public_key: PublicKey,
        verifying_shares: &BTreeMap<ParticipantId, PublicKey>,
    ) -> Result<()> {
        if !self.sealed {
            return Err(Error::InvalidTransition(
                "registry must be sealed before installing key material".into(),
            ));
        }

        if let Some(existing) = self.group_public_key {
            let same_shares = self
                .participants
                .values()
                .all(|p| p.public_share_commitment.as_ref() == verifying_shares.get(&p.id));
            if existing == group_public_key && same_shares {
                return Ok(());
            }
            return Err(Error::FatalInvariant(
                "attempt to replace the installed group public key".into(),
            ));
        }

        crypto::decode_point(&group_public_key)?;
        if verifying_shares.len() != self.total {
            return Err(Error::InvalidConfig(format!(
                "expected {} verifying shares, got {}",
                self.total,
                verifying_shares.len()
            )));
        }
        for (id, share) in verifying_shares {
            if !self.participants.contains_key(id) {
                return Err(Error::InvalidParticipantId(*id));
            }
            crypto::decode_point(share)?;
        }

        for (id, share) in verifying_shares {
            if let Some(participant) = self.participants.get_mut(id) {
                participant.public_share_commitment = Some(*share);
            }
        }
        self.group_public_key = Some(group_public_key);
        Ok(())
    }

    /// Install the public material carried by a key share
    pub fn install_key_share(&mut self, key_share: &KeyShare) -> Result<()> {
        if key_share.threshold != self.threshold || key_share.total != self.total {
            return Err(Error::InvalidConfig(format!(
                "key share is {}-of-{}, registry is {}-of-{}",
                key_share.threshold, key_share.total, self.threshold, self.total
            )));
        }
        self.install_key_material(key_share.group_public_key, &key_share.verifying_shares)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// All participants in id order
    pub fn roster(&self) -> Vec<&Participant> {
        self.participants.values().collect()
    }

    /// All participant ids in ascending order
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().copied().collect()
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.participants.contains_key(&id)
    }

    pub fn participant(&self, id: ParticipantId) -> Result<&Participant> {
        self.participants
            .get(&id)
            .ok_or(Error::InvalidParticipantId(id))
    }

    /// Look up the participant owning a transport identity
    pub fn find_by_identity(&self, network_identity: &str) -> Option<ParticipantId> {
        self.participants
            .values()
            .find(|p| p.network_identity == network_identity)
            .map(|p| p.id)
    }

    /// Verifying share of a participant
    pub fn verifying_share(&self, id: ParticipantId) -> Result<EdwardsPoint> {
        let bytes = self
            .participant(id)?
            .public_share_commitment
            .ok_or_else(|| Error::InvalidTransition("key material not installed".into()))?;
        crypto::decode_point(&bytes)
    }

    /// Group public key bytes
    pub fn group_public_key(&self) -> Result<PublicKey> {
        self.group_public_key
            .ok_or_else(|| Error::InvalidTransition("key material not installed".into()))
    }

    /// Group public key as a curve point
    pub fn group_key_point(&self) -> Result<EdwardsPoint> {
        crypto::decode_point(&self.group_public_key()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn random_point(rng: &mut ChaCha20Rng) -> PublicKey {
        crypto::encode_point(&crypto::mul_base(&crypto::random_scalar(rng)))
    }

    fn sealed_registry() -> ParticipantRegistry {
        let mut registry = ParticipantRegistry::new(2, 3).unwrap();
        for id in 1..=3 {
            registry.register(id, format!("node-{}", id)).unwrap();
        }
        registry.seal().unwrap();
        registry
    }

    #[test]
    fn test_registration_rules() {
        let mut registry = ParticipantRegistry::new(2, 3).unwrap();
        registry.register(1, "a".into()).unwrap();
        assert!(registry.register(1, "b".into()).is_err());
        assert!(registry.register(2, "a".into()).is_err());
        assert!(registry.register(4, "d".into()).is_err());
        assert!(registry.seal().is_err());

        registry.register(2, "b".into()).unwrap();
        registry.register(3, "c".into()).unwrap();
        registry.seal().unwrap();
        assert!(registry.register(3, "x".into()).is_err());
        assert_eq!(registry.find_by_identity("b"), Some(2));
    }

    #[test]
    fn test_install_key_material_once() {
        let mut rng = ChaCha20Rng::seed_from_u64(21);
        let mut registry = sealed_registry();
        let group_key = random_point(&mut rng);
        let shares: BTreeMap<_, _> = (1..=3).map(|id| (id, random_point(&mut rng))).collect();

        assert!(registry.group_public_key().is_err());
        registry.install_key_material(group_key, &shares).unwrap();
        registry.install_key_material(group_key, &shares).unwrap();
        assert_eq!(registry.group_public_key().unwrap(), group_key);
        assert!(registry.verifying_share(2).is_ok());

        let other_key = random_point(&mut rng);
        let err = registry.install_key_material(other_key, &shares).unwrap_err();
        assert!(matches!(err, Error::FatalInvariant(_)));
        assert_eq!(registry.group_public_key().unwrap(), group_key);
    }

    #[test]
    fn test_install_requires_complete_shares() {
        let mut rng = ChaCha20Rng::seed_from_u64(22);
        let mut registry = sealed_registry();
        let shares: BTreeMap<_, _> = (1..=2).map(|id| (id, random_point(&mut rng))).collect();
        assert!(registry
            .install_key_material(random_point(&mut rng), &shares)
            .is_err());
    }

    #[test]
    fn test_rejects_low_threshold() {
        assert!(ParticipantRegistry::new(1, 3).is_err());
        assert!(ParticipantRegistry::new(4, 3).is_err());
    }
}
