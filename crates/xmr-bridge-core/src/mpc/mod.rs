//! Message transport boundary
//!
//! The core needs only point-to-point delivery with authenticated sender
//! attribution. Delivery may be at-least-once; every handler above this
//! layer treats re-delivery of an identical message as a no-op.

use crate::keygen::DkgMessage;
use crate::sign::SigningMessage;
use crate::{Error, ParticipantId, Result};
use serde::{Deserialize, Serialize};

pub use ::async_trait::async_trait;

/// An inbound message with its authenticated sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender as attributed by the transport
    pub from: ParticipantId,
    /// Encoded [`ProtocolMessage`]
    pub payload: Vec<u8>,
}

/// Point-to-point transport between participants
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Participant this endpoint belongs to
    fn local_id(&self) -> ParticipantId;

    /// Send bytes to one participant
    async fn send(&self, to: ParticipantId, payload: Vec<u8>) -> Result<()>;

    /// Wait for the next inbound message
    async fn recv(&self) -> Result<Envelope>;
}

/// Send the same payload to every recipient except ourselves.
///
/// Every recipient is attempted; the first failure is returned.
pub async fn broadcast<T: Transport + ?Sized>(
    transport: &T,
    recipients: &[ParticipantId],
    payload: &[u8],
) -> Result<()> {
    let mut first_error = None;
    for &to in recipients {
        if to == transport.local_id() {
            continue;
        }
        if let Err(e) = transport.send(to, payload.to_vec()).await {
            tracing::warn!(to, error = %e, "Broadcast delivery failed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Every message exchanged between participants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "body", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Key generation ceremony traffic
    Dkg(DkgMessage),
    /// Signing session traffic
    Signing(SigningMessage),
}

impl ProtocolMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// In-memory transport for testing
pub mod memory;

pub use memory::{MemoryNetwork, MemoryTransport};
