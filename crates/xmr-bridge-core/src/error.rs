//! Error types for bridge signing operations

use crate::ParticipantId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A participant sent something provably wrong
    ProtocolViolation,
    /// Not enough participants answered in time
    Liveness,
    /// Transport, chain RPC or broadcaster failure
    External,
    /// Signing for the affected key must stop
    FatalInvariant,
    /// Malformed local input or configuration
    Input,
    /// Bug or unexpected local state
    Internal,
}

/// Errors that can occur while running the bridge protocols
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Unknown or out-of-range participant
    #[error("Invalid participant ID: {0}")]
    InvalidParticipantId(ParticipantId),

    /// Curve point failed to decode or is not in the prime-order subgroup
    #[error("Invalid point encoding: {0}")]
    InvalidPoint(String),

    /// Scalar encoding is not canonical
    #[error("Invalid scalar encoding: {0}")]
    InvalidScalar(String),

    /// A participant sent an invalid commitment, share or proof
    #[error("Protocol violation by participant {participant}: {reason}")]
    ProtocolViolation {
        participant: ParticipantId,
        reason: String,
    },

    /// A commitment or nonce pair was presented for a second time
    #[error("Nonce reuse detected for participant {0}")]
    NonceReuse(ParticipantId),

    /// A round deadline fired before threshold participation
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Network/transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Chain collaborator error
    #[error("Chain error: {0}")]
    Chain(String),

    /// Self-verification of an aggregate or group key agreement failed
    #[error("Fatal invariant violation: {0}")]
    FatalInvariant(String),

    /// A DKG ceremony is already running on this node
    #[error("A key generation ceremony is already in progress")]
    CeremonyInProgress,

    /// Operation is not valid in the current ceremony/session/request state
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Transaction request not found
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    /// Request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Signing has been halted for this key
    #[error("Signing halted: {0}")]
    SigningHalted(String),

    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// Encrypted key storage error
    #[error("Keystore error: {0}")]
    Keystore(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a protocol violation naming the offending participant
    pub fn violation(participant: ParticipantId, reason: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            participant,
            reason: reason.into(),
        }
    }

    /// Classify the error according to the failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProtocolViolation { .. } | Error::NonceReuse(_) | Error::InvalidSignature => {
                ErrorKind::ProtocolViolation
            }
            Error::Timeout(_) | Error::ThresholdNotMet { .. } => ErrorKind::Liveness,
            Error::Transport(_) | Error::Chain(_) | Error::Io(_) => ErrorKind::External,
            Error::FatalInvariant(_) | Error::SigningHalted(_) => ErrorKind::FatalInvariant,
            Error::InvalidConfig(_)
            | Error::InvalidParticipantId(_)
            | Error::InvalidPoint(_)
            | Error::InvalidScalar(_)
            | Error::Keystore(_)
            | Error::InvalidRequest(_)
            | Error::Deserialization(_) => ErrorKind::Input,
            Error::CeremonyInProgress
            | Error::InvalidTransition(_)
            | Error::SessionNotFound(_)
            | Error::RequestNotFound(_)
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a fresh attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Liveness | ErrorKind::External)
    }

    /// The participant to flag for operator review, if any
    pub fn culprit(&self) -> Option<ParticipantId> {
        match self {
            Error::ProtocolViolation { participant, .. } => Some(*participant),
            Error::NonceReuse(participant) => Some(*participant),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert_eq!(Error::violation(2, "bad share").kind(), ErrorKind::ProtocolViolation);
        assert_eq!(Error::Timeout("round 1".into()).kind(), ErrorKind::Liveness);
        assert_eq!(Error::FatalInvariant("x".into()).kind(), ErrorKind::FatalInvariant);
        assert_eq!(Error::Transport("down".into()).kind(), ErrorKind::External);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Timeout("round 2".into()).is_retryable());
        assert!(Error::Transport("relay unreachable".into()).is_retryable());
        assert!(!Error::violation(1, "bad commitment").is_retryable());
        assert!(!Error::FatalInvariant("aggregate".into()).is_retryable());
    }

    #[test]
    fn test_culprit() {
        assert_eq!(Error::NonceReuse(3).culprit(), Some(3));
        assert_eq!(Error::violation(2, "x").culprit(), Some(2));
        assert_eq!(Error::InvalidSignature.culprit(), None);
    }
}
