//! Core types for the threshold signing protocol

use crate::{crypto, Error, Result};
use curve25519_dalek::{edwards::EdwardsPoint, scalar::Scalar};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Identifier of a participant, in `1..=N`
pub type ParticipantId = u16;

/// Unique identifier for a signing session or key generation ceremony
pub type SessionId = [u8; 32];

/// Compressed Ed25519 point bytes
pub type PublicKey = [u8; 32];

/// Short hex prefix of a session id for log fields
pub fn session_label(id: &SessionId) -> String {
    hex::encode(&id[..8])
}

/// Parse a 32-byte value from hex
pub fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value).map_err(|e| Error::Deserialization(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::Deserialization("expected 32 bytes".into()))
}

/// Ed25519 signature (R, s) produced by aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Group commitment R
    #[serde(with = "hex")]
    pub r: [u8; 32],
    /// Response scalar s
    #[serde(with = "hex")]
    pub s: [u8; 32],
}

impl Signature {
    /// Create a new signature
    pub fn new(r: [u8; 32], s: [u8; 32]) -> Self {
        Self { r, s }
    }

    /// Convert to bytes (R || s)
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }

    /// Parse from the 64-byte Ed25519 encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(Error::Deserialization(format!(
                "signature must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(Self { r, s })
    }

    /// Verify as a standard Ed25519 signature under `public_key`
    pub fn verify(&self, public_key: &PublicKey, message: &[u8]) -> Result<()> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(public_key)
            .map_err(|e| Error::InvalidPoint(e.to_string()))?;
        let signature = ed25519_dalek::Signature::from_bytes(&self.to_bytes());
        key.verify_strict(message, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// Key share held by a participant after DKG
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    /// This participant's ID
    pub participant_id: ParticipantId,

    /// Threshold
    pub threshold: usize,

    /// Total number of participants
    pub total: usize,

    /// Secret signing share s_i
    #[serde(with = "scalar_serde")]
    pub(crate) secret_share: Scalar,

    /// Group public key, identical for every participant
    #[zeroize(skip)]
    #[serde(with = "hex")]
    pub group_public_key: PublicKey,

    /// Public verifying shares Y_j = s_j·G of every participant
    #[zeroize(skip)]
    #[serde(with = "hex_map")]
    pub verifying_shares: BTreeMap<ParticipantId, PublicKey>,
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyShare")
            .field("participant_id", &self.participant_id)
            .field("threshold", &self.threshold)
            .field("total", &self.total)
            .field("secret_share", &"<redacted>")
            .field("group_public_key", &hex::encode(self.group_public_key))
            .finish()
    }
}

impl KeyShare {
    /// Group public key as a curve point
    pub fn group_key_point(&self) -> Result<EdwardsPoint> {
        crypto::decode_point(&self.group_public_key)
    }

    /// Verifying share of a participant as a curve point
    pub fn verifying_share(&self, id: ParticipantId) -> Result<EdwardsPoint> {
        let bytes = self
            .verifying_shares
            .get(&id)
            .ok_or(Error::InvalidParticipantId(id))?;
        crypto::decode_point(bytes)
    }

    pub(crate) fn signing_share(&self) -> &Scalar {
        &self.secret_share
    }

    /// Check that the secret share matches the published verifying share
    pub fn check_consistency(&self) -> Result<()> {
        let expected = self.verifying_share(self.participant_id)?;
        if crypto::mul_base(&self.secret_share) != expected {
            return Err(Error::FatalInvariant(
                "secret share does not match its verifying share".into(),
            ));
        }
        if self.verifying_shares.len() != self.total {
            return Err(Error::InvalidConfig(format!(
                "expected {} verifying shares, found {}",
                self.total,
                self.verifying_shares.len()
            )));
        }
        Ok(())
    }
}

pub(crate) mod scalar_serde {
    use curve25519_dalek::scalar::Scalar;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(scalar.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(encoded).map_err(D::Error::custom)?;
        crate::crypto::decode_scalar(&bytes).map_err(D::Error::custom)
    }
}

pub(crate) mod hex_list {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(items: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items: Vec<String> = Vec::deserialize(deserializer)?;
        items
            .iter()
            .map(|item| crate::types::parse_hex32(item).map_err(D::Error::custom))
            .collect()
    }
}

pub(crate) mod hex_option {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|value| crate::types::parse_hex32(&value).map_err(D::Error::custom))
            .transpose()
    }
}

pub(crate) mod hex_map {
    use crate::ParticipantId;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(
        map: &BTreeMap<ParticipantId, [u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(id, bytes)| (id, hex::encode(bytes))))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<ParticipantId, [u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: BTreeMap<ParticipantId, String> = BTreeMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(id, value)| {
                crate::types::parse_hex32(&value)
                    .map(|bytes| (id, bytes))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_signature_verifies_standard_ed25519() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let signing_key = ed25519_dalek::SigningKey::generate(&mut rng);
        let message = b"bridge transfer";
        let raw = signing_key.sign(message).to_bytes();

        let signature = Signature::from_bytes(&raw).unwrap();
        let public_key = signing_key.verifying_key().to_bytes();
        assert!(signature.verify(&public_key, message).is_ok());
        assert!(signature.verify(&public_key, b"other").is_err());
        assert!(Signature::from_bytes(&raw[..63]).is_err());
    }

    #[test]
    fn test_key_share_serde_and_redaction() {
        let mut rng = ChaCha20Rng::seed_from_u64(12);
        let secret = crypto::random_scalar(&mut rng);
        let public = crypto::encode_point(&crypto::mul_base(&secret));

        let share = KeyShare {
            participant_id: 1,
            threshold: 1,
            total: 1,
            secret_share: secret,
            group_public_key: public,
            verifying_shares: BTreeMap::from([(1, public)]),
        };
        share.check_consistency().unwrap();

        let json = serde_json::to_string(&share).unwrap();
        let decoded: KeyShare = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.signing_share(), share.signing_share());
        assert_eq!(decoded.verifying_shares, share.verifying_shares);

        let debug = format!("{:?}", share);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&hex::encode(secret.as_bytes())));
    }
}
