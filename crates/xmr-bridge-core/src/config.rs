//! Participant configuration
//!
//! Loaded once from TOML at start-up, validated, then shared immutably.

use crate::{Error, ParticipantId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Monero network the bridge pays out on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoneroNetwork {
    Mainnet,
    Stagenet,
    Testnet,
}

impl MoneroNetwork {
    /// Leading base58 characters of standard, subaddress and integrated addresses
    pub fn address_prefixes(&self) -> &'static [char] {
        match self {
            MoneroNetwork::Mainnet => &['4', '8'],
            MoneroNetwork::Stagenet => &['5', '7'],
            MoneroNetwork::Testnet => &['9', 'A', 'B'],
        }
    }
}

impl FromStr for MoneroNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(MoneroNetwork::Mainnet),
            "stagenet" | "stage" => Ok(MoneroNetwork::Stagenet),
            "testnet" | "test" => Ok(MoneroNetwork::Testnet),
            _ => Err(Error::InvalidConfig(format!("unknown monero network: {}", s))),
        }
    }
}

impl fmt::Display for MoneroNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoneroNetwork::Mainnet => write!(f, "mainnet"),
            MoneroNetwork::Stagenet => write!(f, "stagenet"),
            MoneroNetwork::Testnet => write!(f, "testnet"),
        }
    }
}

/// Entry in the static participant table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Participant index in 1..=N
    pub id: ParticipantId,
    /// Hex Ed25519 verifying key authenticating this participant on the transport
    pub network_identity: String,
}

/// Configuration of one bridge participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// This participant's ID
    pub participant_id: ParticipantId,

    /// Signers required (T)
    pub threshold: usize,

    /// Total participants (N)
    pub total_participants: usize,

    /// Confirmations a deposit needs before it may be signed
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,

    /// Per-round deadline for DKG and signing
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// Signing sessions attempted per request before aborting
    #[serde(default = "default_max_signing_attempts")]
    pub max_signing_attempts: u32,

    /// Base retry delay
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// How long finished sessions are kept before pruning
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,

    /// Capacity of the external event queue
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Interval of the request scheduling loop
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Largest withdrawal accepted, in atomic units
    #[serde(default = "default_max_withdrawal_amount")]
    pub max_withdrawal_amount: u64,

    /// Network withdrawal addresses must belong to
    #[serde(default = "default_monero_network")]
    pub monero_network: MoneroNetwork,

    /// Message relay base URL
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Encrypted key share location
    #[serde(default = "default_keystore_path")]
    pub keystore_path: PathBuf,

    /// Append-only record of completed and aborted requests
    #[serde(default = "default_processed_path")]
    pub processed_path: PathBuf,

    /// Ed25519 transport signing key location
    #[serde(default = "default_transport_key_path")]
    pub transport_key_path: PathBuf,

    /// Listen address of the status/event API
    #[serde(default = "default_api_listen")]
    pub api_listen: String,

    /// Chain client endpoint receiving signed transactions
    #[serde(default)]
    pub broadcaster_url: Option<String>,

    /// Static participant table
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_min_confirmations() -> u32 {
    10
}

fn default_round_timeout_ms() -> u64 {
    10_000
}

fn default_max_signing_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_max_retry_backoff_ms() -> u64 {
    60_000
}

fn default_session_retention_secs() -> u64 {
    3_600
}

fn default_event_queue_capacity() -> usize {
    1_024
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_max_withdrawal_amount() -> u64 {
    u64::MAX
}

fn default_monero_network() -> MoneroNetwork {
    MoneroNetwork::Stagenet
}

fn default_keystore_path() -> PathBuf {
    PathBuf::from("keyshare.json")
}

fn default_processed_path() -> PathBuf {
    PathBuf::from("processed.jsonl")
}

fn default_transport_key_path() -> PathBuf {
    PathBuf::from("transport.key")
}

fn default_api_listen() -> String {
    "127.0.0.1:8090".to_string()
}

impl BridgeConfig {
    /// Minimal configuration with defaults, for a participant of a T-of-N group
    pub fn new(participant_id: ParticipantId, threshold: usize, total_participants: usize) -> Self {
        Self {
            participant_id,
            threshold,
            total_participants,
            min_confirmations: default_min_confirmations(),
            round_timeout_ms: default_round_timeout_ms(),
            max_signing_attempts: default_max_signing_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            session_retention_secs: default_session_retention_secs(),
            event_queue_capacity: default_event_queue_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            max_withdrawal_amount: default_max_withdrawal_amount(),
            monero_network: default_monero_network(),
            relay_url: None,
            keystore_path: default_keystore_path(),
            processed_path: default_processed_path(),
            transport_key_path: default_transport_key_path(),
            api_listen: default_api_listen(),
            broadcaster_url: None,
            peers: Vec::new(),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(raw).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations the protocols cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.threshold < 2 {
            return Err(Error::InvalidConfig("Threshold must be at least 2".into()));
        }
        if self.threshold > self.total_participants {
            return Err(Error::InvalidConfig(
                "Threshold cannot exceed number of participants".into(),
            ));
        }
        if self.total_participants > ParticipantId::MAX as usize {
            return Err(Error::InvalidConfig("Too many participants".into()));
        }
        if self.participant_id == 0 || self.participant_id as usize > self.total_participants {
            return Err(Error::InvalidParticipantId(self.participant_id));
        }
        if self.min_confirmations < 1 {
            return Err(Error::InvalidConfig(
                "min_confirmations must be at least 1".into(),
            ));
        }
        if self.round_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.max_signing_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_signing_attempts must be at least 1".into(),
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_queue_capacity must be non-zero".into(),
            ));
        }
        if self.max_retry_backoff_ms < self.retry_backoff_ms {
            return Err(Error::InvalidConfig(
                "max_retry_backoff_ms must not be below retry_backoff_ms".into(),
            ));
        }

        if !self.peers.is_empty() {
            let ids: HashSet<ParticipantId> = self.peers.iter().map(|p| p.id).collect();
            let expected: HashSet<ParticipantId> =
                (1..=self.total_participants as ParticipantId).collect();
            if ids != expected || self.peers.len() != self.total_participants {
                return Err(Error::InvalidConfig(format!(
                    "peer table must list participants 1..={} exactly once",
                    self.total_participants
                )));
            }

            let identities: HashSet<&str> =
                self.peers.iter().map(|p| p.network_identity.as_str()).collect();
            if identities.len() != self.peers.len() {
                return Err(Error::InvalidConfig(
                    "duplicate network identity in peer table".into(),
                ));
            }
        }

        Ok(())
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    /// Delay before retry number `attempt` (1-based): `base · 2^(attempt-1)`, capped
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(delay)
    }

    /// Every participant id of the group, ascending
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        (1..=self.total_participants as ParticipantId).collect()
    }
}
