//! Threshold cryptography primitives over Ed25519
//!
//! Stateless helpers shared by the DKG engine and the signing protocol:
//! point/scalar codecs, polynomial evaluation, Feldman commitments,
//! Lagrange coefficients and the domain-separated hashes of the
//! FROST(Ed25519, SHA-512) ciphersuite.
//!
//! The challenge hash is plain SHA-512 over `R || PK || msg`, so an
//! aggregated signature is an ordinary Ed25519 signature under the group key.

use crate::{Error, ParticipantId, Result};
use curve25519_dalek::{
    constants::ED25519_BASEPOINT_POINT,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
    traits::{Identity, IsIdentity},
};
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha512};
use std::collections::{BTreeMap, BTreeSet};

/// Ciphersuite context string prefixed to every domain-separated hash
pub const CONTEXT_STRING: &[u8] = b"FROST-ED25519-SHA512-v1";

/// Public nonce commitments `(D, E)` published in signing round 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCommitment {
    /// Hiding nonce commitment `D = d·G`
    pub hiding: EdwardsPoint,
    /// Binding nonce commitment `E = e·G`
    pub binding: EdwardsPoint,
}

impl NonceCommitment {
    /// Encode as `D || E`
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&encode_point(&self.hiding));
        bytes[32..].copy_from_slice(&encode_point(&self.binding));
        bytes
    }

    /// Decode and validate both points
    pub fn from_parts(hiding: &[u8], binding: &[u8]) -> Result<Self> {
        Ok(Self {
            hiding: decode_point(hiding)?,
            binding: decode_point(binding)?,
        })
    }
}

/// Base point multiplication
pub fn mul_base(scalar: &Scalar) -> EdwardsPoint {
    ED25519_BASEPOINT_POINT * scalar
}

/// Canonical compressed encoding of a point
pub fn encode_point(point: &EdwardsPoint) -> [u8; 32] {
    point.compress().to_bytes()
}

/// Decode a point, rejecting anything that is not a canonical,
/// non-identity element of the prime-order subgroup.
pub fn decode_point(bytes: &[u8]) -> Result<EdwardsPoint> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidPoint(format!("expected 32 bytes, got {}", bytes.len())))?;

    let point = CompressedEdwardsY(array)
        .decompress()
        .ok_or_else(|| Error::InvalidPoint("not a curve point".into()))?;

    if point.compress().to_bytes() != array {
        return Err(Error::InvalidPoint("non-canonical encoding".into()));
    }
    if point.is_identity() {
        return Err(Error::InvalidPoint("identity element".into()));
    }
    if !point.is_torsion_free() {
        return Err(Error::InvalidPoint("point has a torsion component".into()));
    }

    Ok(point)
}

/// Decode a canonical scalar
pub fn decode_scalar(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidScalar(format!("expected 32 bytes, got {}", bytes.len())))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(array))
        .ok_or_else(|| Error::InvalidScalar("not reduced modulo the group order".into()))
}

/// Sample a uniformly random scalar
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    Scalar::random(rng)
}

/// Scalar used as the x-coordinate of a participant on the sharing polynomial
pub fn identifier(id: ParticipantId) -> Result<Scalar> {
    if id == 0 {
        return Err(Error::InvalidParticipantId(id));
    }
    Ok(Scalar::from(id as u64))
}

/// Evaluate `f(x) = a_0 + a_1·x + ... + a_{t-1}·x^{t-1}`
pub fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

/// Evaluate a Feldman commitment vector at `x`, i.e. `f(x)·G`
pub fn evaluate_commitment(commitments: &[EdwardsPoint], x: &Scalar) -> EdwardsPoint {
    commitments
        .iter()
        .rev()
        .fold(EdwardsPoint::identity(), |acc, commitment| acc * x + commitment)
}

/// Lagrange coefficient at zero for `id` within the signer set
pub fn lagrange_coefficient(id: ParticipantId, signers: &[ParticipantId]) -> Result<Scalar> {
    if signers.is_empty() {
        return Err(Error::ThresholdNotMet {
            required: 1,
            actual: 0,
        });
    }

    let unique: BTreeSet<ParticipantId> = signers.iter().copied().collect();
    if unique.len() != signers.len() {
        return Err(Error::InvalidConfig("duplicate participant in signer set".into()));
    }
    if !unique.contains(&id) {
        return Err(Error::InvalidParticipantId(id));
    }

    let x_i = identifier(id)?;
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &other in &unique {
        if other == id {
            continue;
        }
        let x_j = identifier(other)?;
        numerator *= x_j;
        denominator *= x_j - x_i;
    }

    Ok(numerator * denominator.invert())
}

fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    Scalar::from_hash(hasher)
}

fn hash_to_bytes(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// H1: binding factor hash
pub fn h1(input: &[u8]) -> Scalar {
    hash_to_scalar(&[CONTEXT_STRING, b"rho", input])
}

/// H2: signature challenge hash (no domain prefix, Ed25519-compatible)
pub fn h2(input: &[u8]) -> Scalar {
    hash_to_scalar(&[input])
}

/// H3: nonce derivation hash
pub fn h3(input: &[u8]) -> Scalar {
    hash_to_scalar(&[CONTEXT_STRING, b"nonce", input])
}

/// H4: message digest used inside the binding factor input
pub fn h4(input: &[u8]) -> [u8; 64] {
    hash_to_bytes(&[CONTEXT_STRING, b"msg", input])
}

/// H5: commitment list digest used inside the binding factor input
pub fn h5(input: &[u8]) -> [u8; 64] {
    hash_to_bytes(&[CONTEXT_STRING, b"com", input])
}

/// Derive a fresh nonce from 32 random bytes and the signing share.
///
/// Mixing the secret share in keeps nonces unpredictable even under a weak RNG.
pub fn generate_nonce<R: RngCore + CryptoRng>(secret: &Scalar, rng: &mut R) -> Scalar {
    let mut random_bytes = [0u8; 32];
    rng.fill_bytes(&mut random_bytes);
    let mut input = [0u8; 64];
    input[..32].copy_from_slice(&random_bytes);
    input[32..].copy_from_slice(secret.as_bytes());
    h3(&input)
}

/// Serialize the commitment list in identifier order
pub fn encode_commitment_list(commitments: &BTreeMap<ParticipantId, NonceCommitment>) -> Vec<u8> {
    let mut out = Vec::with_capacity(commitments.len() * 96);
    for (id, commitment) in commitments {
        out.extend_from_slice(Scalar::from(*id as u64).as_bytes());
        out.extend_from_slice(&commitment.to_bytes());
    }
    out
}

/// Per-participant binding factors `ρ_i` binding each share to the whole
/// session context (group key, message and every commitment).
pub fn binding_factors(
    group_public_key: &EdwardsPoint,
    message: &[u8],
    commitments: &BTreeMap<ParticipantId, NonceCommitment>,
) -> BTreeMap<ParticipantId, Scalar> {
    let mut prefix = Vec::with_capacity(32 + 64 + 64);
    prefix.extend_from_slice(&encode_point(group_public_key));
    prefix.extend_from_slice(&h4(message));
    prefix.extend_from_slice(&h5(&encode_commitment_list(commitments)));

    commitments
        .keys()
        .map(|id| {
            let mut input = prefix.clone();
            input.extend_from_slice(Scalar::from(*id as u64).as_bytes());
            (*id, h1(&input))
        })
        .collect()
}

/// Group commitment `R = Σ (D_i + ρ_i·E_i)`
pub fn group_commitment(
    commitments: &BTreeMap<ParticipantId, NonceCommitment>,
    binding_factors: &BTreeMap<ParticipantId, Scalar>,
) -> Result<EdwardsPoint> {
    let mut r = EdwardsPoint::identity();
    for (id, commitment) in commitments {
        let rho = binding_factors
            .get(id)
            .ok_or_else(|| Error::Internal(format!("missing binding factor for {}", id)))?;
        r += commitment.hiding + commitment.binding * rho;
    }
    Ok(r)
}

/// Schnorr challenge `c = H2(R || PK || msg)`
pub fn challenge(r: &EdwardsPoint, group_public_key: &EdwardsPoint, message: &[u8]) -> Scalar {
    let mut input = Vec::with_capacity(64 + message.len());
    input.extend_from_slice(&encode_point(r));
    input.extend_from_slice(&encode_point(group_public_key));
    input.extend_from_slice(message);
    h2(&input)
}

fn dkg_challenge(id: ParticipantId, constant_commitment: &EdwardsPoint, r: &EdwardsPoint) -> Scalar {
    hash_to_scalar(&[
        CONTEXT_STRING,
        b"dkg",
        Scalar::from(id as u64).as_bytes(),
        &encode_point(constant_commitment),
        &encode_point(r),
    ])
}

/// Proof of knowledge of the constant term of a DKG polynomial
pub fn prove_knowledge<R: RngCore + CryptoRng>(
    id: ParticipantId,
    secret: &Scalar,
    constant_commitment: &EdwardsPoint,
    rng: &mut R,
) -> (EdwardsPoint, Scalar) {
    let k = random_scalar(rng);
    let r = mul_base(&k);
    let c = dkg_challenge(id, constant_commitment, &r);
    (r, k + secret * c)
}

/// Verify a proof produced by [`prove_knowledge`]
pub fn verify_knowledge(
    id: ParticipantId,
    constant_commitment: &EdwardsPoint,
    r: &EdwardsPoint,
    mu: &Scalar,
) -> bool {
    let c = dkg_challenge(id, constant_commitment, r);
    mul_base(mu) - constant_commitment * c == *r
}
