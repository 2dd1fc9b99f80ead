//! External collaborators: deposit monitor, burn watcher, broadcaster
//!
//! Chain clients live outside the core. They feed observations in through
//! these traits and receive signed transactions back.

use crate::request::{RequestKind, TransactionRequest};
use crate::{Result, Signature};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

const DIGEST_DOMAIN: &[u8] = b"xmr-bridge/transaction/v1";

/// Incoming transfer reported by the deposit monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositObservation {
    /// Source-chain transaction id
    pub chain_reference: String,
    /// Amount in atomic units
    pub amount: u64,
    /// Subaddress or account the transfer was paid to
    pub destination: String,
    /// Confirmations observed so far
    pub confirmations: u32,
}

/// Burn of wrapped funds requesting a Monero payout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnEvent {
    /// Burn event id on the wrapped-asset chain
    pub chain_reference: String,
    /// Amount in atomic units
    pub amount: u64,
    /// Monero address to pay out to
    pub destination_address: String,
}

/// A request together with its aggregated signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub chain_reference: String,
    pub kind: RequestKind,
    pub amount: u64,
    pub counterparty_address: String,
    #[serde(with = "hex")]
    pub message: Vec<u8>,
    pub signature: Signature,
}

impl SignedTransaction {
    pub fn new(request: &TransactionRequest, signature: Signature) -> Self {
        Self {
            chain_reference: request.chain_reference.clone(),
            kind: request.kind,
            amount: request.amount,
            counterparty_address: request.counterparty_address.clone(),
            message: transaction_digest(request).to_vec(),
            signature,
        }
    }
}

/// Chain client acknowledgement of a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReceipt {
    pub txid: String,
    /// Already confirmed at the time of the receipt
    #[serde(default)]
    pub confirmed: bool,
}

/// Broadcast failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    /// Chain client unreachable; retry later
    #[error("chain client unavailable: {0}")]
    Unavailable(String),

    /// Chain refused the transaction
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// Restartable source of deposit observations
#[async_trait]
pub trait DepositMonitor: Send + Sync {
    /// Observations since the previous poll; the same transfer may be
    /// reported again with a higher confirmation count
    async fn poll(&self) -> Result<Vec<DepositObservation>>;
}

/// Restartable source of burn events
#[async_trait]
pub trait BurnWatcher: Send + Sync {
    async fn poll(&self) -> Result<Vec<BurnEvent>>;
}

/// Chain client that publishes signed transactions
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(
        &self,
        transaction: &SignedTransaction,
    ) -> std::result::Result<BroadcastReceipt, BroadcastError>;

    /// Whether a previously broadcast transaction reached finality
    async fn is_confirmed(&self, txid: &str) -> std::result::Result<bool, BroadcastError>;
}

/// Canonical message signed for a request
pub fn transaction_digest(request: &TransactionRequest) -> [u8; 64] {
    let kind: &[u8] = match request.kind {
        RequestKind::Deposit => b"deposit",
        RequestKind::Withdrawal => b"withdrawal",
    };

    let mut hasher = Sha512::new();
    hasher.update(DIGEST_DOMAIN);
    for field in [
        kind,
        request.chain_reference.as_bytes(),
        request.counterparty_address.as_bytes(),
    ] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hasher.update(request.amount.to_be_bytes());
    hasher.finalize().into()
}
