//! Message Relay Library
//!
//! Store-and-forward mailbox for participant traffic. Every message is a
//! [`SignedEnvelope`] sealed with the sender's Ed25519 transport key, so the
//! relay itself is untrusted: it can drop or delay messages but cannot forge
//! or alter them. Messages are kept per recipient with increasing sequence
//! numbers and read back with a cursor, which lets temporarily offline
//! participants catch up.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Participant index as used by the bridge, in `1..=N`
pub type PartyId = u16;

/// Domain separation for envelope signatures
const ENVELOPE_DOMAIN: &[u8] = b"xmr-bridge/relay-envelope/v1";

/// Largest payload the relay accepts
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Invalid transport key: {0}")]
    InvalidKey(String),
    #[error("Envelope signature from {0} does not verify")]
    BadSignature(PartyId),
    #[error("Payload of {0} bytes exceeds the relay limit")]
    TooLarge(usize),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Authenticated point-to-point message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub from: PartyId,
    pub to: PartyId,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(with = "hex")]
    pub signature: [u8; 64],
}

impl SignedEnvelope {
    fn signing_bytes(from: PartyId, to: PartyId, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENVELOPE_DOMAIN.len() + 12 + payload.len());
        bytes.extend_from_slice(ENVELOPE_DOMAIN);
        bytes.extend_from_slice(&from.to_be_bytes());
        bytes.extend_from_slice(&to.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Sign a payload for one recipient
    pub fn seal(key: &SigningKey, from: PartyId, to: PartyId, payload: Vec<u8>) -> Self {
        let signature = key.sign(&Self::signing_bytes(from, to, &payload));
        Self {
            from,
            to,
            payload,
            signature: signature.to_bytes(),
        }
    }

    /// Check the signature against the sender's transport identity
    pub fn open(&self, sender: &VerifyingKey) -> Result<&[u8]> {
        let signature = ed25519_dalek::Signature::from_bytes(&self.signature);
        sender
            .verify(
                &Self::signing_bytes(self.from, self.to, &self.payload),
                &signature,
            )
            .map_err(|_| RelayError::BadSignature(self.from))?;
        Ok(&self.payload)
    }

    /// Content digest used to drop resubmissions
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&Self::signing_bytes(self.from, self.to, &self.payload));
        hasher.update(&self.signature);
        hasher.finalize().to_hex().to_string()
    }

    /// Shape checks applied before storing
    pub fn validate(&self) -> Result<()> {
        if self.from == 0 || self.to == 0 {
            return Err(RelayError::InvalidFormat("participant ids start at 1".into()));
        }
        if self.from == self.to {
            return Err(RelayError::InvalidFormat("sender and recipient are equal".into()));
        }
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(RelayError::TooLarge(self.payload.len()));
        }
        Ok(())
    }
}

/// Parse a hex Ed25519 verifying key, as published in the peer table
pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim())
        .map_err(|e| RelayError::InvalidKey(e.to_string()))?
        .try_into()
        .map_err(|_| RelayError::InvalidKey("expected 32 bytes".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| RelayError::InvalidKey(e.to_string()))
}

/// Parse a hex Ed25519 signing key seed
pub fn parse_signing_key(hex_key: &str) -> Result<SigningKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim())
        .map_err(|e| RelayError::InvalidKey(e.to_string()))?
        .try_into()
        .map_err(|_| RelayError::InvalidKey("expected 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Position in the recipient's mailbox, starting at 1
    pub seq: u64,
    pub envelope: SignedEnvelope,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReceipt {
    pub seq: u64,
    /// The envelope was already stored
    pub duplicate: bool,
}

#[derive(Default)]
struct Mailbox {
    next_seq: u64,
    messages: Vec<StoredMessage>,
}

/// Message relay store
#[derive(Clone)]
pub struct MessageStore {
    /// Mailboxes indexed by recipient
    mailboxes: Arc<DashMap<PartyId, Mailbox>>,
    /// Envelope digest to (recipient, seq)
    seen: Arc<DashMap<String, (PartyId, u64)>>,
    /// Default TTL in seconds
    ttl_seconds: i64,
}

impl MessageStore {
    /// Create a new message store
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            mailboxes: Arc::new(DashMap::new()),
            seen: Arc::new(DashMap::new()),
            ttl_seconds,
        }
    }

    /// Store an envelope for its recipient; resubmissions return the
    /// original sequence number
    pub fn put(&self, envelope: SignedEnvelope) -> Result<PutReceipt> {
        envelope.validate()?;
        let digest = envelope.digest();
        if let Some(existing) = self.seen.get(&digest) {
            return Ok(PutReceipt {
                seq: existing.1,
                duplicate: true,
            });
        }

        let now = Utc::now();
        let to = envelope.to;
        let mut mailbox = self.mailboxes.entry(to).or_default();
        mailbox.next_seq += 1;
        let seq = mailbox.next_seq;
        mailbox.messages.push(StoredMessage {
            seq,
            envelope,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.ttl_seconds),
        });
        drop(mailbox);

        self.seen.insert(digest, (to, seq));
        Ok(PutReceipt {
            seq,
            duplicate: false,
        })
    }

    /// Messages for `to` with a sequence number above `after`, oldest first
    pub fn fetch(&self, to: PartyId, after: u64, limit: usize) -> Vec<StoredMessage> {
        let now = Utc::now();
        self.mailboxes
            .get(&to)
            .map(|mailbox| {
                mailbox
                    .messages
                    .iter()
                    .filter(|m| m.seq > after && m.expires_at > now)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest sequence number issued for a recipient
    pub fn head(&self, to: PartyId) -> u64 {
        self.mailboxes.get(&to).map(|m| m.next_seq).unwrap_or(0)
    }

    /// Remove expired messages, returning how many were dropped
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for mut mailbox in self.mailboxes.iter_mut() {
            let before = mailbox.messages.len();
            mailbox.messages.retain(|m| m.expires_at > now);
            removed += before - mailbox.messages.len();
        }
        let live: std::collections::HashSet<(PartyId, u64)> = self
            .mailboxes
            .iter()
            .flat_map(|m| {
                let to = *m.key();
                m.messages.iter().map(move |s| (to, s.seq)).collect::<Vec<_>>()
            })
            .collect();
        self.seen.retain(|_, at| live.contains(at));
        removed
    }

    /// Number of stored messages
    pub fn len(&self) -> usize {
        self.mailboxes.iter().map(|m| m.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(3600) // 1 hour default TTL
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_seal_and_open() {
        let envelope = SignedEnvelope::seal(&key(1), 1, 2, b"commit".to_vec());
        assert_eq!(envelope.open(&key(1).verifying_key()).unwrap(), b"commit");
        assert!(matches!(
            envelope.open(&key(2).verifying_key()),
            Err(RelayError::BadSignature(1))
        ));

        let mut redirected = envelope.clone();
        redirected.to = 3;
        assert!(redirected.open(&key(1).verifying_key()).is_err());

        let mut tampered = envelope;
        tampered.payload[0] ^= 1;
        assert!(tampered.open(&key(1).verifying_key()).is_err());
    }

    #[test]
    fn test_wire_format() {
        let envelope = SignedEnvelope::seal(&key(1), 1, 2, vec![0, 1, 2]);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"], "AAEC");
        assert_eq!(json["signature"].as_str().unwrap().len(), 128);
        let back: SignedEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = MessageStore::new(3600);
        let envelope = SignedEnvelope::seal(&key(1), 1, 2, vec![7]);

        let first = store.put(envelope.clone()).unwrap();
        let again = store.put(envelope).unwrap();
        assert_eq!(first.seq, 1);
        assert!(!first.duplicate);
        assert_eq!(again.seq, 1);
        assert!(again.duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cursor_reads() {
        let store = MessageStore::new(3600);
        for i in 0..3u8 {
            store
                .put(SignedEnvelope::seal(&key(1), 1, 2, vec![i]))
                .unwrap();
        }
        store
            .put(SignedEnvelope::seal(&key(3), 3, 1, vec![9]))
            .unwrap();

        let all = store.fetch(2, 0, 100);
        assert_eq!(all.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.fetch(2, 2, 100).len(), 1);
        assert_eq!(store.fetch(2, 0, 2).len(), 2);
        assert_eq!(store.head(2), 3);
        assert_eq!(store.fetch(1, 0, 100)[0].envelope.from, 3);
        assert!(store.fetch(4, 0, 100).is_empty());
    }

    #[test]
    fn test_cleanup_drops_expired() {
        let store = MessageStore::new(-1);
        let envelope = SignedEnvelope::seal(&key(1), 1, 2, vec![1]);
        store.put(envelope.clone()).unwrap();
        assert!(store.fetch(2, 0, 10).is_empty());
        assert_eq!(store.cleanup(), 1);
        assert!(store.is_empty());

        // Sequence numbers keep increasing after cleanup
        let receipt = store.put(envelope).unwrap();
        assert_eq!(receipt.seq, 2);
        assert!(!receipt.duplicate);
    }

    #[test]
    fn test_rejects_malformed() {
        let store = MessageStore::default();
        assert!(store
            .put(SignedEnvelope::seal(&key(1), 1, 1, vec![]))
            .is_err());
        assert!(matches!(
            store.put(SignedEnvelope::seal(&key(1), 1, 2, vec![0; MAX_PAYLOAD_BYTES + 1])),
            Err(RelayError::TooLarge(_))
        ));
    }

    #[test]
    fn test_parse_keys() {
        let signing = key(5);
        let hex_pub = hex::encode(signing.verifying_key().to_bytes());
        assert_eq!(parse_verifying_key(&hex_pub).unwrap(), signing.verifying_key());
        assert_eq!(
            parse_signing_key(&hex::encode([5u8; 32])).unwrap().to_bytes(),
            signing.to_bytes()
        );
        assert!(parse_verifying_key("abcd").is_err());
    }
}
