//! Transaction request lifecycle
//!
//! ```text
//! Detected → Confirming → SigningRequired ⇄ Signing → Signed → Broadcasting → Completed
//!     └──────────────────────────┴───────────────┴─────────┴────────────┴──→ Aborted
//! ```
//!
//! Withdrawals skip `Confirming`. `Completed` and `Aborted` are terminal.

use crate::chain::{transaction_digest, BurnEvent, DepositObservation};
use crate::config::{BridgeConfig, MoneroNetwork};
use crate::ledger::{ProcessedLedger, ProcessedRecord};
use crate::sign::ApprovalPolicy;
use crate::types::session_label;
use crate::{Error, ErrorKind, ParticipantId, Result, SessionId, Signature};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const MONERO_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const STANDARD_ADDRESS_LEN: usize = 95;
const INTEGRATED_ADDRESS_LEN: usize = 106;
const EVENT_CAPACITY: usize = 256;

/// Direction of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// XMR received; mint on the wrapped side
    Deposit,
    /// Wrapped funds burned; pay out XMR
    Withdrawal,
}

/// Request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Detected,
    Confirming,
    SigningRequired,
    Signing,
    Signed,
    Broadcasting,
    Completed,
    Aborted,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Aborted)
    }

    /// Allowed transitions
    pub fn can_transition(&self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        if to == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Detected, Confirming)
                | (Detected, SigningRequired)
                | (Confirming, SigningRequired)
                | (SigningRequired, Signing)
                | (SigningRequired, Signed)
                | (Signing, SigningRequired)
                | (Signing, Signed)
                | (Signed, Broadcasting)
                | (Broadcasting, Completed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Detected => "detected",
            RequestStatus::Confirming => "confirming",
            RequestStatus::SigningRequired => "signing_required",
            RequestStatus::Signing => "signing",
            RequestStatus::Signed => "signed",
            RequestStatus::Broadcasting => "broadcasting",
            RequestStatus::Completed => "completed",
            RequestStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Why a request was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    ProtocolViolation,
    LivenessExhausted,
    ExternalRejection,
    InvalidRequest,
    FatalInvariant,
}

/// A deposit or withdrawal that needs a threshold signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub kind: RequestKind,
    /// Source-chain tx id or burn event id
    pub chain_reference: String,
    pub amount: u64,
    pub counterparty_address: String,
    pub status: RequestStatus,
    pub confirmations: u32,
    /// Deposits only
    pub required_confirmations: Option<u32>,
    #[serde(with = "crate::types::hex_option")]
    pub linked_session_id: Option<SessionId>,
    /// Coordinator of the linked session
    pub coordinator: Option<ParticipantId>,
    pub signing_attempts: u32,
    pub last_failure: Option<ErrorKind>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub signature: Option<Signature>,
    pub broadcast_attempts: u32,
    pub broadcast_txid: Option<String>,
    /// Last external failure while waiting on a collaborator
    pub degraded: Option<String>,
    pub abort_reason: Option<AbortReason>,
    pub abort_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRequest {
    pub fn deposit(observation: &DepositObservation, required_confirmations: u32) -> Self {
        let mut request = Self::detected(
            RequestKind::Deposit,
            &observation.chain_reference,
            observation.amount,
            &observation.destination,
        );
        request.confirmations = observation.confirmations;
        request.required_confirmations = Some(required_confirmations);
        request
    }

    pub fn withdrawal(event: &BurnEvent) -> Self {
        Self::detected(
            RequestKind::Withdrawal,
            &event.chain_reference,
            event.amount,
            &event.destination_address,
        )
    }

    fn detected(kind: RequestKind, reference: &str, amount: u64, counterparty: &str) -> Self {
        let now = Utc::now();
        Self {
            kind,
            chain_reference: reference.to_string(),
            amount,
            counterparty_address: counterparty.to_string(),
            status: RequestStatus::Detected,
            confirmations: 0,
            required_confirmations: None,
            linked_session_id: None,
            coordinator: None,
            signing_attempts: 0,
            last_failure: None,
            next_attempt_at: None,
            signature: None,
            broadcast_attempts: 0,
            broadcast_txid: None,
            degraded: None,
            abort_reason: None,
            abort_detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Message the group signs for this request
    pub fn message(&self) -> Vec<u8> {
        transaction_digest(self).to_vec()
    }

    /// Terminal request restored from the processed ledger
    pub fn restored(record: &ProcessedRecord) -> Self {
        let mut request = Self::detected(
            record.kind,
            &record.chain_reference,
            record.amount,
            &record.counterparty_address,
        );
        request.status = record.status;
        request.broadcast_txid = record.broadcast_txid.clone();
        request.abort_reason = record.abort_reason;
        request.created_at = record.processed_at;
        request.updated_at = record.processed_at;
        request
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    fn same_transfer(&self, kind: RequestKind, amount: u64, counterparty: &str) -> bool {
        self.kind == kind && self.amount == amount && self.counterparty_address == counterparty
    }
}

/// Pushed on every request state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub chain_reference: String,
    pub kind: RequestKind,
    pub status: RequestStatus,
    pub confirmations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Check a Monero address against the configured network
pub fn validate_monero_address(address: &str, network: MoneroNetwork) -> Result<()> {
    if address.len() != STANDARD_ADDRESS_LEN && address.len() != INTEGRATED_ADDRESS_LEN {
        return Err(Error::InvalidRequest(format!(
            "address length {} is not a Monero address",
            address.len()
        )));
    }
    if let Some(bad) = address.chars().find(|c| !MONERO_ALPHABET.contains(*c)) {
        return Err(Error::InvalidRequest(format!(
            "character {:?} outside the base58 alphabet",
            bad
        )));
    }
    let prefix = address.chars().next().unwrap_or_default();
    if !network.address_prefixes().contains(&prefix) {
        return Err(Error::InvalidRequest(format!(
            "address is not a {} address",
            network
        )));
    }
    Ok(())
}

fn millis(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

/// All requests known to this participant, keyed by chain reference
pub struct RequestBook {
    requests: DashMap<String, TransactionRequest>,
    events: broadcast::Sender<RequestEvent>,
    config: BridgeConfig,
    ledger: Option<ProcessedLedger>,
}

impl RequestBook {
    /// In-memory book; finished requests are forgotten on restart
    pub fn new(config: &BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            requests: DashMap::new(),
            events,
            config: config.clone(),
            ledger: None,
        }
    }

    /// Book backed by the ledger at `config.processed_path`, seeded with
    /// every request that already finished
    pub fn open(config: &BridgeConfig) -> Result<Self> {
        let (ledger, records) = ProcessedLedger::open(&config.processed_path)?;
        let book = Self::new(config);
        for record in &records {
            book.requests
                .insert(record.chain_reference.clone(), TransactionRequest::restored(record));
        }
        info!(
            path = %ledger.path().display(),
            finished = book.requests.len(),
            "Request book restored"
        );
        Ok(Self {
            ledger: Some(ledger),
            ..book
        })
    }

    /// Receive every subsequent state change
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, chain_reference: &str) -> Option<TransactionRequest> {
        self.requests.get(chain_reference).map(|r| r.value().clone())
    }

    pub fn status(&self, chain_reference: &str) -> Result<RequestStatus> {
        self.requests
            .get(chain_reference)
            .map(|r| r.status)
            .ok_or_else(|| Error::RequestNotFound(chain_reference.to_string()))
    }

    pub fn list(&self) -> Vec<TransactionRequest> {
        let mut all: Vec<_> = self.requests.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Record a deposit observation.
    ///
    /// Re-observing a transfer only ever raises its confirmation count; once
    /// past `Confirming` the observation is a no-op.
    pub fn observe_deposit(&self, observation: &DepositObservation) -> Result<RequestStatus> {
        if observation.amount == 0 {
            return Err(Error::InvalidRequest("zero-amount deposit".into()));
        }

        match self.requests.entry(observation.chain_reference.clone()) {
            Entry::Occupied(mut entry) => {
                let request = entry.get_mut();
                if request.status.is_terminal() {
                    debug!(chain_reference = %request.chain_reference, status = %request.status, "Deposit already handled");
                    return Ok(request.status);
                }
                if !request.same_transfer(
                    RequestKind::Deposit,
                    observation.amount,
                    &observation.destination,
                ) {
                    return Err(Error::InvalidRequest(format!(
                        "conflicting observation for {}",
                        observation.chain_reference
                    )));
                }
                if matches!(
                    request.status,
                    RequestStatus::Detected | RequestStatus::Confirming
                ) && observation.confirmations > request.confirmations
                {
                    request.confirmations = observation.confirmations;
                    request.updated_at = Utc::now();
                    self.settle_confirmations(request)?;
                }
                Ok(request.status)
            }
            Entry::Vacant(entry) => {
                let mut request =
                    TransactionRequest::deposit(observation, self.config.min_confirmations);
                info!(
                    chain_reference = %request.chain_reference,
                    amount = request.amount,
                    confirmations = request.confirmations,
                    "Deposit detected"
                );
                self.emit(&request, None);
                self.settle_confirmations(&mut request)?;
                let status = request.status;
                entry.insert(request);
                Ok(status)
            }
        }
    }

    fn settle_confirmations(&self, request: &mut TransactionRequest) -> Result<()> {
        let required = request
            .required_confirmations
            .unwrap_or(self.config.min_confirmations);
        if request.confirmations >= required {
            return self.transition(request, RequestStatus::SigningRequired, None);
        }
        let progress = format!("{}/{} confirmations", request.confirmations, required);
        if request.status == RequestStatus::Detected {
            self.transition(request, RequestStatus::Confirming, Some(progress))
        } else {
            self.emit(request, Some(progress));
            Ok(())
        }
    }

    /// Record a burn event; invalid withdrawals are aborted immediately
    pub fn observe_burn(&self, event: &BurnEvent) -> Result<RequestStatus> {
        match self.requests.entry(event.chain_reference.clone()) {
            Entry::Occupied(entry) => {
                let request = entry.get();
                if request.status.is_terminal() {
                    debug!(chain_reference = %request.chain_reference, status = %request.status, "Burn already handled");
                    return Ok(request.status);
                }
                if !request.same_transfer(
                    RequestKind::Withdrawal,
                    event.amount,
                    &event.destination_address,
                ) {
                    return Err(Error::InvalidRequest(format!(
                        "conflicting burn event for {}",
                        event.chain_reference
                    )));
                }
                Ok(request.status)
            }
            Entry::Vacant(entry) => {
                let mut request = TransactionRequest::withdrawal(event);
                info!(
                    chain_reference = %request.chain_reference,
                    amount = request.amount,
                    "Burn detected"
                );
                self.emit(&request, None);

                match self.validate_withdrawal(&request) {
                    Ok(()) => self.transition(&mut request, RequestStatus::SigningRequired, None)?,
                    Err(e) => {
                        warn!(chain_reference = %request.chain_reference, error = %e, "Rejecting withdrawal");
                        self.abort_request(&mut request, AbortReason::InvalidRequest, e.to_string())?;
                    }
                }
                let status = request.status;
                entry.insert(request);
                Ok(status)
            }
        }
    }

    fn validate_withdrawal(&self, request: &TransactionRequest) -> Result<()> {
        if request.amount == 0 || request.amount > self.config.max_withdrawal_amount {
            return Err(Error::InvalidRequest(format!(
                "amount {} outside 1..={}",
                request.amount, self.config.max_withdrawal_amount
            )));
        }
        validate_monero_address(&request.counterparty_address, self.config.monero_network)
    }

    /// Requests waiting for a signing attempt
    pub fn due_for_signing(&self, now: DateTime<Utc>) -> Vec<TransactionRequest> {
        self.select(|r| r.status == RequestStatus::SigningRequired && r.is_due(now))
    }

    /// Remote signing sessions whose coordinator stayed silent past the deadline
    pub fn overdue_remote_sessions(&self, now: DateTime<Utc>) -> Vec<TransactionRequest> {
        self.select(|r| {
            r.status == RequestStatus::Signing && r.next_attempt_at.map_or(false, |at| at <= now)
        })
    }

    /// Signed requests waiting for (another) broadcast attempt
    pub fn due_for_broadcast(&self, now: DateTime<Utc>) -> Vec<TransactionRequest> {
        self.select(|r| r.status == RequestStatus::Signed && r.is_due(now))
    }

    /// Broadcast requests waiting for chain finality
    pub fn broadcasting(&self) -> Vec<TransactionRequest> {
        self.select(|r| r.status == RequestStatus::Broadcasting)
    }

    fn select(&self, predicate: impl Fn(&TransactionRequest) -> bool) -> Vec<TransactionRequest> {
        self.requests
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Attempt number for the next signing session, or `None` when the
    /// request has used up its attempts and was aborted.
    pub fn next_attempt(&self, chain_reference: &str) -> Result<Option<u32>> {
        self.update(chain_reference, |book, request| {
            if request.status != RequestStatus::SigningRequired {
                return Err(Error::InvalidTransition(format!(
                    "{} is {}, not signing_required",
                    chain_reference, request.status
                )));
            }
            if request.signing_attempts < book.config.max_signing_attempts {
                return Ok(Some(request.signing_attempts));
            }
            let reason = match request.last_failure {
                Some(ErrorKind::ProtocolViolation) => AbortReason::ProtocolViolation,
                _ => AbortReason::LivenessExhausted,
            };
            let detail = format!("{} signing attempts failed", request.signing_attempts);
            book.abort_request(request, reason, detail)?;
            Ok(None)
        })
    }

    /// Bind a locally coordinated session
    pub fn begin_signing(
        &self,
        chain_reference: &str,
        attempt: u32,
        session_id: SessionId,
        coordinator: ParticipantId,
    ) -> Result<()> {
        self.update(chain_reference, |book, request| {
            request.linked_session_id = Some(session_id);
            request.coordinator = Some(coordinator);
            request.signing_attempts = request.signing_attempts.max(attempt + 1);
            request.next_attempt_at = None;
            book.transition(
                request,
                RequestStatus::Signing,
                Some(format!("session {}", session_label(&session_id))),
            )
        })
    }

    /// Leave attempt `attempt` to a remote coordinator until `wait` elapses
    pub fn defer_to_remote(
        &self,
        chain_reference: &str,
        attempt: u32,
        coordinator: ParticipantId,
        wait: Duration,
    ) -> Result<()> {
        self.update(chain_reference, |book, request| {
            if request.status != RequestStatus::SigningRequired {
                return Ok(());
            }
            request.signing_attempts = request.signing_attempts.max(attempt + 1);
            request.coordinator = Some(coordinator);
            request.last_failure = Some(ErrorKind::Liveness);
            request.next_attempt_at = Some(Utc::now() + millis(wait));
            request.updated_at = Utc::now();
            book.emit(request, Some(format!("awaiting coordinator {}", coordinator)));
            Ok(())
        })
    }

    /// Bind a session opened by a remote coordinator
    pub fn join_remote_session(
        &self,
        chain_reference: &str,
        attempt: u32,
        session_id: SessionId,
        coordinator: ParticipantId,
        wait: Duration,
    ) -> Result<()> {
        self.update(chain_reference, |book, request| {
            if request.linked_session_id == Some(session_id) {
                return Ok(());
            }
            request.linked_session_id = Some(session_id);
            request.coordinator = Some(coordinator);
            request.signing_attempts = request.signing_attempts.max(attempt + 1);
            request.next_attempt_at = Some(Utc::now() + millis(wait));
            request.updated_at = Utc::now();
            match request.status {
                RequestStatus::SigningRequired => book.transition(
                    request,
                    RequestStatus::Signing,
                    Some(format!("session {}", session_label(&session_id))),
                ),
                RequestStatus::Signing => Ok(()),
                other => Err(Error::InvalidTransition(format!(
                    "{} is {}, cannot join a session",
                    chain_reference, other
                ))),
            }
        })
    }

    /// A linked session failed or expired; retry with backoff or abort
    pub fn signing_failed(
        &self,
        chain_reference: &str,
        session_id: &SessionId,
        error: &Error,
    ) -> Result<RequestStatus> {
        self.update(chain_reference, |book, request| {
            if request.status != RequestStatus::Signing
                || request.linked_session_id.as_ref() != Some(session_id)
            {
                return Err(Error::InvalidTransition(format!(
                    "session {} is not the active session of {}",
                    session_label(session_id),
                    chain_reference
                )));
            }
            request.linked_session_id = None;
            request.last_failure = Some(error.kind());

            if error.kind() == ErrorKind::FatalInvariant {
                book.abort_request(request, AbortReason::FatalInvariant, error.to_string())?;
                return Ok(request.status);
            }
            if request.signing_attempts >= book.config.max_signing_attempts {
                let reason = if error.kind() == ErrorKind::ProtocolViolation {
                    AbortReason::ProtocolViolation
                } else {
                    AbortReason::LivenessExhausted
                };
                book.abort_request(request, reason, error.to_string())?;
                return Ok(request.status);
            }

            let backoff = book.config.retry_backoff(request.signing_attempts);
            request.next_attempt_at = Some(Utc::now() + millis(backoff));
            let detail = format!("attempt {} failed: {}", request.signing_attempts, error);
            book.transition(request, RequestStatus::SigningRequired, Some(detail))?;
            Ok(request.status)
        })
    }

    /// Attach a verified aggregate signature. Callers verify it first.
    ///
    /// Returns `false` when the request was already signed.
    pub fn mark_signed(&self, chain_reference: &str, signature: Signature) -> Result<bool> {
        self.update(chain_reference, |book, request| {
            match request.status {
                RequestStatus::Signed | RequestStatus::Broadcasting | RequestStatus::Completed => {
                    return Ok(false)
                }
                _ => {}
            }
            request.signature = Some(signature);
            request.next_attempt_at = None;
            request.degraded = None;
            book.transition(request, RequestStatus::Signed, None)?;
            Ok(true)
        })
    }

    /// The chain client accepted the broadcast
    pub fn mark_broadcast(&self, chain_reference: &str, txid: &str) -> Result<()> {
        self.update(chain_reference, |book, request| {
            if request.status == RequestStatus::Broadcasting
                && request.broadcast_txid.as_deref() == Some(txid)
            {
                return Ok(());
            }
            request.broadcast_txid = Some(txid.to_string());
            request.degraded = None;
            request.next_attempt_at = None;
            book.transition(request, RequestStatus::Broadcasting, Some(format!("txid {}", txid)))
        })
    }

    /// The chain client could not be reached; stay `Signed` and retry later
    pub fn broadcast_unavailable(&self, chain_reference: &str, reason: &str) -> Result<()> {
        self.update(chain_reference, |book, request| {
            if request.status != RequestStatus::Signed {
                return Err(Error::InvalidTransition(format!(
                    "{} is {}, not signed",
                    chain_reference, request.status
                )));
            }
            request.broadcast_attempts += 1;
            request.degraded = Some(reason.to_string());
            let backoff = book.config.retry_backoff(request.broadcast_attempts);
            request.next_attempt_at = Some(Utc::now() + millis(backoff));
            request.updated_at = Utc::now();
            book.emit(request, Some(format!("degraded: {}", reason)));
            Ok(())
        })
    }

    /// The broadcast transaction reached finality
    pub fn mark_completed(&self, chain_reference: &str) -> Result<()> {
        self.update(chain_reference, |book, request| {
            if request.status == RequestStatus::Completed {
                return Ok(());
            }
            book.transition(request, RequestStatus::Completed, None)
        })
    }

    /// Abort a request with a reason code
    pub fn abort(&self, chain_reference: &str, reason: AbortReason, detail: &str) -> Result<()> {
        self.update(chain_reference, |book, request| {
            book.abort_request(request, reason, detail.to_string())
        })
    }

    fn update<R>(
        &self,
        chain_reference: &str,
        f: impl FnOnce(&Self, &mut TransactionRequest) -> Result<R>,
    ) -> Result<R> {
        let mut entry = self
            .requests
            .get_mut(chain_reference)
            .ok_or_else(|| Error::RequestNotFound(chain_reference.to_string()))?;
        f(self, entry.value_mut())
    }

    fn abort_request(
        &self,
        request: &mut TransactionRequest,
        reason: AbortReason,
        detail: String,
    ) -> Result<()> {
        if request.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "{} is already {}",
                request.chain_reference, request.status
            )));
        }
        request.abort_reason = Some(reason);
        request.abort_detail = Some(detail.clone());
        if let Err(e) = self.transition(request, RequestStatus::Aborted, Some(detail)) {
            request.abort_reason = None;
            request.abort_detail = None;
            return Err(e);
        }
        request.linked_session_id = None;
        request.next_attempt_at = None;
        Ok(())
    }

    fn transition(
        &self,
        request: &mut TransactionRequest,
        to: RequestStatus,
        detail: Option<String>,
    ) -> Result<()> {
        if !request.status.can_transition(to) {
            return Err(Error::InvalidTransition(format!(
                "{}: {} -> {}",
                request.chain_reference, request.status, to
            )));
        }
        if to.is_terminal() {
            if let Some(ledger) = &self.ledger {
                ledger.append(&ProcessedRecord::new(request, to))?;
            }
        }
        debug!(
            chain_reference = %request.chain_reference,
            from = %request.status,
            to = %to,
            "Request transition"
        );
        request.status = to;
        request.updated_at = Utc::now();
        self.emit(request, detail);
        Ok(())
    }

    fn emit(&self, request: &TransactionRequest, detail: Option<String>) {
        // No subscribers is fine
        let _ = self.events.send(RequestEvent {
            chain_reference: request.chain_reference.clone(),
            kind: request.kind,
            status: request.status,
            confirmations: request.confirmations,
            detail,
            at: Utc::now(),
        });
    }
}

/// Only sign what this participant observed itself and still wants signed
impl ApprovalPolicy for RequestBook {
    fn approve(&self, chain_reference: &str, message: &[u8]) -> Result<()> {
        let request = self
            .requests
            .get(chain_reference)
            .ok_or_else(|| Error::RequestNotFound(chain_reference.to_string()))?;
        if !matches!(
            request.status,
            RequestStatus::SigningRequired | RequestStatus::Signing
        ) {
            return Err(Error::InvalidTransition(format!(
                "{} is {}, not awaiting a signature",
                chain_reference, request.status
            )));
        }
        if transaction_digest(&request)[..] != *message {
            return Err(Error::InvalidRequest(format!(
                "message does not match the observed request {}",
                chain_reference
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::new(1, 2, 3);
        config.min_confirmations = 10;
        config.max_signing_attempts = 2;
        config.max_withdrawal_amount = 1_000;
        config
    }

    fn stagenet_address() -> String {
        format!("5{}", "A".repeat(94))
    }

    fn deposit(reference: &str, confirmations: u32) -> DepositObservation {
        DepositObservation {
            chain_reference: reference.into(),
            amount: 500,
            destination: "subaddress-0/3".into(),
            confirmations,
        }
    }

    fn burn(reference: &str, amount: u64, address: String) -> BurnEvent {
        BurnEvent {
            chain_reference: reference.into(),
            amount,
            destination_address: address,
        }
    }

    #[test]
    fn test_deposit_waits_for_confirmations() {
        let book = RequestBook::new(&config());
        for confirmations in [1, 3, 3, 9] {
            assert_eq!(
                book.observe_deposit(&deposit("d1", confirmations)).unwrap(),
                RequestStatus::Confirming
            );
        }
        assert!(book.due_for_signing(Utc::now()).is_empty());

        assert_eq!(
            book.observe_deposit(&deposit("d1", 10)).unwrap(),
            RequestStatus::SigningRequired
        );
        // Replaying the confirming observation changes nothing
        assert_eq!(
            book.observe_deposit(&deposit("d1", 12)).unwrap(),
            RequestStatus::SigningRequired
        );
        assert_eq!(book.due_for_signing(Utc::now()).len(), 1);
        assert_eq!(book.get("d1").unwrap().confirmations, 10);
    }

    #[test]
    fn test_conflicting_observation_rejected() {
        let book = RequestBook::new(&config());
        book.observe_deposit(&deposit("d2", 1)).unwrap();
        let mut other = deposit("d2", 2);
        other.amount = 501;
        assert!(matches!(
            book.observe_deposit(&other),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_withdrawal_validation() {
        let book = RequestBook::new(&config());
        assert_eq!(
            book.observe_burn(&burn("w1", 100, stagenet_address())).unwrap(),
            RequestStatus::SigningRequired
        );

        let mainnet = format!("4{}", "A".repeat(94));
        assert_eq!(
            book.observe_burn(&burn("w2", 100, mainnet)).unwrap(),
            RequestStatus::Aborted
        );
        assert_eq!(
            book.get("w2").unwrap().abort_reason,
            Some(AbortReason::InvalidRequest)
        );
        assert_eq!(
            book.observe_burn(&burn("w3", 1_001, stagenet_address())).unwrap(),
            RequestStatus::Aborted
        );
    }

    #[test]
    fn test_address_format() {
        let network = MoneroNetwork::Stagenet;
        assert!(validate_monero_address(&stagenet_address(), network).is_ok());
        assert!(validate_monero_address(&format!("7{}", "b".repeat(105)), network).is_ok());
        assert!(validate_monero_address(&format!("5{}", "0".repeat(94)), network).is_err());
        assert!(validate_monero_address("5short", network).is_err());
    }

    #[test]
    fn test_signing_retries_then_aborts() {
        let book = RequestBook::new(&config());
        book.observe_burn(&burn("w4", 10, stagenet_address())).unwrap();

        let attempt = book.next_attempt("w4").unwrap().unwrap();
        assert_eq!(attempt, 0);
        book.begin_signing("w4", attempt, [1; 32], 1).unwrap();
        let status = book
            .signing_failed("w4", &[1; 32], &Error::Timeout("round 1".into()))
            .unwrap();
        assert_eq!(status, RequestStatus::SigningRequired);
        // Backoff keeps it out of the due list for now
        assert!(book.due_for_signing(Utc::now()).is_empty());

        // A stale session cannot fail the request
        assert!(book
            .signing_failed("w4", &[1; 32], &Error::Timeout("late".into()))
            .is_err());

        let attempt = book.next_attempt("w4").unwrap().unwrap();
        book.begin_signing("w4", attempt, [2; 32], 1).unwrap();
        let status = book
            .signing_failed("w4", &[2; 32], &Error::violation(3, "bad share"))
            .unwrap();
        assert_eq!(status, RequestStatus::Aborted);
        assert_eq!(
            book.get("w4").unwrap().abort_reason,
            Some(AbortReason::ProtocolViolation)
        );
    }

    #[test]
    fn test_happy_path_and_terminal_completion() {
        let book = RequestBook::new(&config());
        let mut events = book.subscribe();
        book.observe_burn(&burn("w5", 10, stagenet_address())).unwrap();
        book.begin_signing("w5", 0, [5; 32], 2).unwrap();

        let signature = Signature::new([1; 32], [2; 32]);
        assert!(book.mark_signed("w5", signature).unwrap());
        assert!(!book.mark_signed("w5", signature).unwrap());

        book.broadcast_unavailable("w5", "connection refused").unwrap();
        assert_eq!(
            book.get("w5").unwrap().degraded.as_deref(),
            Some("connection refused")
        );
        book.mark_broadcast("w5", "abcd").unwrap();
        book.mark_completed("w5").unwrap();
        book.mark_completed("w5").unwrap();

        assert!(book.abort("w5", AbortReason::ExternalRejection, "late").is_err());
        assert!(book.observe_burn(&burn("w5", 10, stagenet_address())).unwrap().is_terminal());

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            statuses.push(event.status);
        }
        assert_eq!(statuses.first(), Some(&RequestStatus::Detected));
        assert_eq!(statuses.last(), Some(&RequestStatus::Completed));
    }

    #[test]
    fn test_approval_requires_observed_request() {
        let book = RequestBook::new(&config());
        assert!(book.approve("w6", b"anything").is_err());

        book.observe_burn(&burn("w6", 10, stagenet_address())).unwrap();
        let message = book.get("w6").unwrap().message();
        assert!(book.approve("w6", &message).is_ok());
        assert!(book.approve("w6", b"forged").is_err());

        book.observe_deposit(&deposit("d7", 1)).unwrap();
        let message = book.get("d7").unwrap().message();
        assert!(book.approve("d7", &message).is_err());
    }

    #[test]
    fn test_remote_session_tracking() {
        let book = RequestBook::new(&config());
        book.observe_burn(&burn("w8", 10, stagenet_address())).unwrap();

        book.join_remote_session("w8", 0, [8; 32], 3, Duration::ZERO).unwrap();
        assert_eq!(book.status("w8").unwrap(), RequestStatus::Signing);
        assert_eq!(book.overdue_remote_sessions(Utc::now()).len(), 1);

        book.signing_failed("w8", &[8; 32], &Error::Timeout("silent".into()))
            .unwrap();
        assert_eq!(book.get("w8").unwrap().signing_attempts, 1);
    }

    #[test]
    fn test_finished_requests_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.processed_path = dir.path().join("processed.jsonl");

        let book = RequestBook::open(&config).unwrap();
        book.observe_deposit(&deposit("d9", 10)).unwrap();
        book.begin_signing("d9", 0, [9; 32], 1).unwrap();
        book.mark_signed("d9", Signature::new([1; 32], [2; 32])).unwrap();
        book.mark_broadcast("d9", "feed").unwrap();
        book.mark_completed("d9").unwrap();
        book.observe_burn(&burn("w9", 10, "not-an-address".into())).unwrap();
        book.observe_deposit(&deposit("d10", 10)).unwrap();
        drop(book);

        let book = RequestBook::open(&config).unwrap();
        assert_eq!(book.len(), 2);
        let restored = book.get("d9").unwrap();
        assert_eq!(restored.status, RequestStatus::Completed);
        assert_eq!(restored.broadcast_txid.as_deref(), Some("feed"));
        assert_eq!(
            book.get("w9").unwrap().abort_reason,
            Some(AbortReason::InvalidRequest)
        );

        // Replays of finished requests are no-ops and never become due again
        assert_eq!(
            book.observe_deposit(&deposit("d9", 12)).unwrap(),
            RequestStatus::Completed
        );
        assert!(book
            .observe_burn(&burn("w9", 10, "not-an-address".into()))
            .unwrap()
            .is_terminal());
        assert!(book.due_for_signing(Utc::now()).is_empty());
        assert!(book.approve("d9", &restored.message()).is_err());

        // Unfinished work is not persisted and is observed afresh
        assert!(book.get("d10").is_none());
    }
}
