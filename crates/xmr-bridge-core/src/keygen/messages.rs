//! DKG message types

use crate::{ParticipantId, PublicKey, SessionId};
use serde::{Deserialize, Serialize};

/// Round 1 message: Feldman commitments and proof of knowledge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgRound1Message {
    /// Ceremony this message belongs to
    #[serde(with = "hex")]
    pub ceremony_id: SessionId,
    /// Sender participant ID
    pub from: ParticipantId,
    /// Commitments `a_k·G` to the polynomial coefficients
    #[serde(with = "crate::types::hex_list")]
    pub commitments: Vec<PublicKey>,
    /// Proof of knowledge of `a_0`: nonce commitment R
    #[serde(with = "hex")]
    pub proof_r: PublicKey,
    /// Proof of knowledge of `a_0`: response mu
    #[serde(with = "hex")]
    pub proof_mu: [u8; 32],
    /// X25519 key used to encrypt round 2 shares to this sender
    #[serde(with = "hex")]
    pub exchange_key: [u8; 32],
}

/// Round 2 message: encrypted polynomial evaluation for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgRound2Message {
    #[serde(with = "hex")]
    pub ceremony_id: SessionId,
    /// Sender participant ID
    pub from: ParticipantId,
    /// Receiver participant ID
    pub to: ParticipantId,
    /// Encrypted secret share `f_from(to)`
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
}

/// Round 3 message: the group key the sender computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgRound3Message {
    #[serde(with = "hex")]
    pub ceremony_id: SessionId,
    /// Sender participant ID
    pub from: ParticipantId,
    #[serde(with = "hex")]
    pub group_public_key: PublicKey,
}

/// Any key generation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
pub enum DkgMessage {
    Commitments(DkgRound1Message),
    Share(DkgRound2Message),
    GroupKey(DkgRound3Message),
}

impl DkgMessage {
    /// Participant claiming to have sent the message
    pub fn sender(&self) -> ParticipantId {
        match self {
            DkgMessage::Commitments(m) => m.from,
            DkgMessage::Share(m) => m.from,
            DkgMessage::GroupKey(m) => m.from,
        }
    }

    pub fn ceremony_id(&self) -> &SessionId {
        match self {
            DkgMessage::Commitments(m) => &m.ceremony_id,
            DkgMessage::Share(m) => &m.ceremony_id,
            DkgMessage::GroupKey(m) => &m.ceremony_id,
        }
    }

    /// Round number (1, 2 or 3)
    pub fn round(&self) -> u8 {
        match self {
            DkgMessage::Commitments(_) => 1,
            DkgMessage::Share(_) => 2,
            DkgMessage::GroupKey(_) => 3,
        }
    }
}

/// Message produced by the ceremony for the driver to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send to every other participant
    Broadcast(DkgMessage),
    /// Send to one participant
    Direct(ParticipantId, DkgMessage),
}
