//! Bridge orchestration
//!
//! [`ParticipantNode`] owns everything one participant needs to take part in
//! signing and dispatches inbound protocol traffic. [`BridgeService`] drives
//! the request lifecycle: it drains the bounded external event queue, opens
//! sessions for requests this node coordinates, and hands signed
//! transactions to the broadcaster.

use crate::chain::{
    BroadcastError, BroadcastReceipt, Broadcaster, BurnEvent, BurnWatcher, DepositMonitor,
    DepositObservation, SignedTransaction,
};
use crate::config::BridgeConfig;
use crate::mpc::{Envelope, ProtocolMessage, Transport};
use crate::registry::ParticipantRegistry;
use crate::request::{AbortReason, RequestBook, RequestStatus};
use crate::sign::{
    coordinator_for, respond, ApprovalPolicy, Coordinator, Responder, SessionManager,
    SigningMessage, SigningPayload,
};
use crate::types::session_label;
use crate::{Error, ErrorKind, KeyShare, ParticipantId, Result, SessionId, Signature};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const OUTCOME_CAPACITY: usize = 64;

/// Input from external collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalEvent {
    Deposit(DepositObservation),
    Burn(BurnEvent),
    /// A broadcast transaction reached finality
    Confirmed { chain_reference: String },
}

/// A verified aggregate announced for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningOutcome {
    pub session_id: SessionId,
    pub chain_reference: String,
    pub message: Vec<u8>,
    pub signature: Signature,
}

/// One participant: key material, roles and request view
pub struct ParticipantNode<T: Transport + ?Sized> {
    config: Arc<BridgeConfig>,
    registry: Arc<ParticipantRegistry>,
    key_share: Arc<KeyShare>,
    transport: Arc<T>,
    responder: Arc<Responder>,
    sessions: Arc<SessionManager>,
    requests: Arc<RequestBook>,
    approval: Arc<dyn ApprovalPolicy>,
    coordinator: Coordinator<T>,
    outcomes: broadcast::Sender<SigningOutcome>,
    halted: OnceLock<String>,
}

impl<T: Transport + ?Sized> ParticipantNode<T> {
    /// Assemble a node that only signs requests it observed itself
    pub fn new(
        config: BridgeConfig,
        registry: ParticipantRegistry,
        key_share: KeyShare,
        transport: Arc<T>,
    ) -> Result<Self> {
        let requests = Arc::new(RequestBook::new(&config));
        let approval: Arc<dyn ApprovalPolicy> = requests.clone();
        Self::assemble(config, registry, key_share, transport, requests, approval)
    }

    /// Assemble a node around an existing request book, such as one restored
    /// from the processed ledger
    pub fn with_request_book(
        config: BridgeConfig,
        registry: ParticipantRegistry,
        key_share: KeyShare,
        transport: Arc<T>,
        requests: Arc<RequestBook>,
    ) -> Result<Self> {
        let approval: Arc<dyn ApprovalPolicy> = requests.clone();
        Self::assemble(config, registry, key_share, transport, requests, approval)
    }

    /// Assemble a node with a custom approval policy
    pub fn with_approval(
        config: BridgeConfig,
        registry: ParticipantRegistry,
        key_share: KeyShare,
        transport: Arc<T>,
        approval: Arc<dyn ApprovalPolicy>,
    ) -> Result<Self> {
        let requests = Arc::new(RequestBook::new(&config));
        Self::assemble(config, registry, key_share, transport, requests, approval)
    }

    fn assemble(
        config: BridgeConfig,
        mut registry: ParticipantRegistry,
        key_share: KeyShare,
        transport: Arc<T>,
        requests: Arc<RequestBook>,
        approval: Arc<dyn ApprovalPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        let me = config.participant_id;
        if transport.local_id() != me || key_share.participant_id != me {
            return Err(Error::InvalidConfig(format!(
                "participant {} has transport {} and key share {}",
                me,
                transport.local_id(),
                key_share.participant_id
            )));
        }
        registry.install_key_share(&key_share)?;

        let registry = Arc::new(registry);
        let key_share = Arc::new(key_share);
        let responder = Arc::new(Responder::new(Arc::clone(&key_share)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            config.session_retention(),
        ));
        let coordinator = Coordinator::new(
            Arc::clone(&transport),
            Arc::clone(&responder),
            Arc::clone(&sessions),
            config.round_timeout(),
        );
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);

        Ok(Self {
            config: Arc::new(config),
            registry,
            key_share,
            transport,
            responder,
            sessions,
            requests,
            approval,
            coordinator,
            outcomes,
            halted: OnceLock::new(),
        })
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.config.participant_id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ParticipantRegistry> {
        &self.registry
    }

    pub fn group_public_key(&self) -> [u8; 32] {
        self.key_share.group_public_key
    }

    pub fn requests(&self) -> &Arc<RequestBook> {
        &self.requests
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn coordinator(&self) -> &Coordinator<T> {
        &self.coordinator
    }

    /// Verified outcomes of sessions coordinated elsewhere or locally
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<SigningOutcome> {
        self.outcomes.subscribe()
    }

    /// Stop all signing for this key; there is no way back without a restart
    pub fn halt(&self, reason: &str) {
        if self.halted.set(reason.to_string()).is_ok() {
            error!(
                participant_id = self.participant_id(),
                reason, "Signing halted after fatal invariant violation"
            );
        }
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.get().map(String::as_str)
    }

    /// How long a peer waits on a remote coordinator before rotating
    pub fn remote_wait(&self) -> Duration {
        self.config.round_timeout() * 3
    }

    /// Coordinator for a request attempt
    pub fn coordinator_for(&self, chain_reference: &str, attempt: u32) -> Result<ParticipantId> {
        coordinator_for(&self.registry.ids(), chain_reference, attempt)
    }

    /// Receive and dispatch inbound traffic until the transport closes
    pub async fn run_inbound(self: Arc<Self>) {
        loop {
            let envelope = match self.transport.recv().await {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Transport closed; inbound loop stopping");
                    return;
                }
            };
            let from = envelope.from;
            if let Err(e) = self.handle_envelope(envelope).await {
                match e.culprit() {
                    Some(culprit) => warn!(
                        from,
                        culprit,
                        error = %e,
                        "Protocol violation flagged for operator review"
                    ),
                    None => debug!(from, error = %e, "Inbound message not applied"),
                }
            }
        }
    }

    /// Apply one inbound envelope
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        let message = match ProtocolMessage::decode(&envelope.payload)? {
            ProtocolMessage::Signing(message) => message,
            ProtocolMessage::Dkg(message) => {
                debug!(
                    from = envelope.from,
                    round = message.round(),
                    "Ignoring DKG message outside a ceremony"
                );
                return Ok(());
            }
        };

        if message.sender != envelope.from {
            return Err(Error::violation(
                envelope.from,
                format!("claims to be participant {}", message.sender),
            ));
        }
        message.check_round()?;
        let from = envelope.from;
        let session_id = message.session_id;

        match &message.payload {
            SigningPayload::CommitRequest {
                chain_reference,
                attempt,
                ..
            } => {
                let chain_reference = chain_reference.clone();
                let attempt = *attempt;
                let reply = self.answer_commit_request(from, &message, &chain_reference, attempt);
                if matches!(reply.payload, SigningPayload::Commitment(_)) {
                    if let Err(e) = self.requests.join_remote_session(
                        &chain_reference,
                        attempt,
                        session_id,
                        from,
                        self.remote_wait(),
                    ) {
                        debug!(chain_reference = %chain_reference, error = %e, "Session not linked to a request");
                    }
                }
                self.reply(from, reply).await
            }
            SigningPayload::SignRequest(_) => {
                let reply = match self.halted() {
                    Some(reason) => Some(SigningMessage::decline(
                        session_id,
                        self.participant_id(),
                        message.round,
                        format!("signing halted: {}", reason),
                    )),
                    None => respond(&self.responder, from, &message, |_, _| Ok(())),
                };
                match reply {
                    Some(reply) => self.reply(from, reply).await,
                    None => Ok(()),
                }
            }
            SigningPayload::Commitment(pair) => {
                self.sessions.record_commitment(&session_id, from, *pair).await
            }
            SigningPayload::Share { share } => {
                self.sessions.record_share(&session_id, from, *share).await
            }
            SigningPayload::Decline { reason } => {
                info!(from, session_id = %session_label(&session_id), reason = %reason, "Participant declined");
                self.sessions
                    .record_decline(&session_id, from, reason.clone())
                    .await
            }
            SigningPayload::Outcome {
                chain_reference,
                message: signed,
                signature,
            } => self.accept_outcome(from, session_id, chain_reference, signed, *signature),
        }
    }

    fn answer_commit_request(
        &self,
        from: ParticipantId,
        message: &SigningMessage,
        chain_reference: &str,
        attempt: u32,
    ) -> SigningMessage {
        let me = self.participant_id();
        let decline = |reason: String| {
            SigningMessage::decline(message.session_id, me, message.round, reason)
        };

        if let Some(reason) = self.halted() {
            return decline(format!("signing halted: {}", reason));
        }
        match self.coordinator_for(chain_reference, attempt) {
            Ok(expected) if expected == from => {}
            Ok(expected) => {
                warn!(from, expected, chain_reference, attempt, "Commit request from unexpected coordinator");
                return decline(format!(
                    "participant {} does not coordinate attempt {}",
                    from, attempt
                ));
            }
            Err(e) => return decline(e.to_string()),
        }

        let approval = Arc::clone(&self.approval);
        respond(&self.responder, from, message, |reference, body| {
            approval.approve(reference, body)
        })
        .unwrap_or_else(|| decline("not selected for this session".into()))
    }

    fn accept_outcome(
        &self,
        from: ParticipantId,
        session_id: SessionId,
        chain_reference: &str,
        message: &[u8],
        signature: Signature,
    ) -> Result<()> {
        self.responder
            .verify_outcome(message, &signature)
            .map_err(|_| Error::violation(from, "announced signature does not verify"))?;

        if let Some(request) = self.requests.get(chain_reference) {
            if request.message() != message {
                return Err(Error::violation(
                    from,
                    format!("outcome for {} signs a different message", chain_reference),
                ));
            }
            if self.requests.mark_signed(chain_reference, signature)? {
                info!(
                    chain_reference,
                    coordinator = from,
                    "Request signed by remote coordinator"
                );
            }
        }

        // Nobody listening is fine
        let _ = self.outcomes.send(SigningOutcome {
            session_id,
            chain_reference: chain_reference.to_string(),
            message: message.to_vec(),
            signature,
        });
        Ok(())
    }

    async fn reply(&self, to: ParticipantId, message: SigningMessage) -> Result<()> {
        let bytes = ProtocolMessage::Signing(message).encode()?;
        self.transport.send(to, bytes).await
    }

    /// Drop finished sessions and stale responder state
    pub async fn prune(&self) {
        let sessions = self.sessions.prune().await;
        let nonces = self.responder.prune(self.config.session_retention());
        if sessions + nonces > 0 {
            debug!(sessions, nonces, "Pruned signing state");
        }
    }
}

enum TaskOutcome {
    Signing {
        chain_reference: String,
        session_id: SessionId,
        result: Result<Signature>,
    },
    Broadcast {
        chain_reference: String,
        result: std::result::Result<BroadcastReceipt, BroadcastError>,
    },
    Confirmation {
        chain_reference: String,
        result: std::result::Result<bool, BroadcastError>,
    },
}

impl TaskOutcome {
    fn chain_reference(&self) -> &str {
        match self {
            TaskOutcome::Signing {
                chain_reference, ..
            }
            | TaskOutcome::Broadcast {
                chain_reference, ..
            }
            | TaskOutcome::Confirmation {
                chain_reference, ..
            } => chain_reference,
        }
    }
}

/// What a spawned task works on, kept until it reports back
struct PendingTask {
    chain_reference: String,
    session_id: Option<SessionId>,
}

/// Event loop driving requests to completion
pub struct BridgeService<T: Transport + ?Sized> {
    node: Arc<ParticipantNode<T>>,
    broadcaster: Arc<dyn Broadcaster>,
    events_tx: mpsc::Sender<ExternalEvent>,
    events_rx: mpsc::Receiver<ExternalEvent>,
    tasks: JoinSet<TaskOutcome>,
    pending: HashMap<task::Id, PendingTask>,
    in_flight: HashSet<String>,
}

impl<T: Transport + ?Sized> BridgeService<T> {
    pub fn new(node: Arc<ParticipantNode<T>>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(node.config().event_queue_capacity);
        Self {
            node,
            broadcaster,
            events_tx,
            events_rx,
            tasks: JoinSet::new(),
            pending: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Handle for external collaborators feeding the queue
    pub fn sender(&self) -> mpsc::Sender<ExternalEvent> {
        self.events_tx.clone()
    }

    pub fn node(&self) -> &Arc<ParticipantNode<T>> {
        &self.node
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            participant_id = self.node.participant_id(),
            group_public_key = %hex::encode(self.node.group_public_key()),
            "Bridge service started"
        );

        let inbound: JoinHandle<()> = tokio::spawn(Arc::clone(&self.node).run_inbound());
        let mut tick = tokio::time::interval(self.node.config().tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => self.apply_event(event),
                _ = tick.tick() => self.tick().await,
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.finish(joined).await;
                }
            }
        }

        info!("Bridge service stopping");
        self.tasks.abort_all();
        self.node.sessions().expire_all("shutdown").await;
        inbound.abort();
        Ok(())
    }

    /// Apply one external event to the request book
    pub fn apply_event(&mut self, event: ExternalEvent) {
        let requests = self.node.requests();
        let result = match &event {
            ExternalEvent::Deposit(observation) => requests.observe_deposit(observation).map(|_| ()),
            ExternalEvent::Burn(burn) => requests.observe_burn(burn).map(|_| ()),
            ExternalEvent::Confirmed { chain_reference } => {
                requests.mark_completed(chain_reference)
            }
        };
        if let Err(e) = result {
            warn!(?event, error = %e, "External event rejected");
        }
    }

    /// One scheduling pass over the request book
    pub async fn tick(&mut self) {
        let now = Utc::now();
        let me = self.node.participant_id();
        let requests = Arc::clone(self.node.requests());

        for request in requests.overdue_remote_sessions(now) {
            let (Some(session_id), Some(coordinator)) =
                (request.linked_session_id, request.coordinator)
            else {
                continue;
            };
            if coordinator == me || self.in_flight.contains(&request.chain_reference) {
                continue;
            }
            let err = Error::Timeout(format!("coordinator {} produced no outcome", coordinator));
            if let Err(e) = requests.signing_failed(&request.chain_reference, &session_id, &err) {
                debug!(chain_reference = %request.chain_reference, error = %e, "Remote session already settled");
            }
        }

        if self.node.halted().is_none() {
            for request in requests.due_for_signing(now) {
                if !self.in_flight.contains(&request.chain_reference) {
                    self.start_signing(&request.chain_reference);
                }
            }
        }

        for request in requests.due_for_broadcast(now) {
            let Some(signature) = request.signature else {
                continue;
            };
            if !self.in_flight.insert(request.chain_reference.clone()) {
                continue;
            }
            let transaction = SignedTransaction::new(&request, signature);
            let broadcaster = Arc::clone(&self.broadcaster);
            self.spawn_task(&request.chain_reference, None, async move {
                TaskOutcome::Broadcast {
                    chain_reference: transaction.chain_reference.clone(),
                    result: broadcaster.broadcast(&transaction).await,
                }
            });
        }

        for request in requests.broadcasting() {
            let Some(txid) = request.broadcast_txid else {
                continue;
            };
            if !self.in_flight.insert(request.chain_reference.clone()) {
                continue;
            }
            let broadcaster = Arc::clone(&self.broadcaster);
            let chain_reference = request.chain_reference.clone();
            self.spawn_task(&request.chain_reference, None, async move {
                TaskOutcome::Confirmation {
                    result: broadcaster.is_confirmed(&txid).await,
                    chain_reference,
                }
            });
        }

        self.node.prune().await;
    }

    fn start_signing(&mut self, chain_reference: &str) {
        let node = &self.node;
        let requests = node.requests();
        let attempt = match requests.next_attempt(chain_reference) {
            Ok(Some(attempt)) => attempt,
            Ok(None) => {
                warn!(chain_reference, "Signing attempts exhausted; request aborted");
                return;
            }
            Err(e) => {
                debug!(chain_reference, error = %e, "Request not ready for signing");
                return;
            }
        };

        let coordinator = match node.coordinator_for(chain_reference, attempt) {
            Ok(coordinator) => coordinator,
            Err(e) => {
                error!(chain_reference, error = %e, "Cannot select a coordinator");
                return;
            }
        };
        if coordinator != node.participant_id() {
            debug!(chain_reference, attempt, coordinator, "Waiting for remote coordinator");
            if let Err(e) =
                requests.defer_to_remote(chain_reference, attempt, coordinator, node.remote_wait())
            {
                warn!(chain_reference, error = %e, "Could not defer request");
            }
            return;
        }

        let Some(request) = requests.get(chain_reference) else {
            return;
        };
        let message = request.message();
        let signers = node.registry().ids();
        let session_id = match node
            .coordinator()
            .open(chain_reference, attempt, &message, &signers)
            .and_then(|session_id| {
                requests
                    .begin_signing(chain_reference, attempt, session_id, coordinator)
                    .map(|_| session_id)
            }) {
            Ok(session_id) => session_id,
            Err(e) => {
                warn!(chain_reference, error = %e, "Could not open signing session");
                return;
            }
        };

        info!(
            chain_reference,
            attempt,
            session_id = %session_label(&session_id),
            "Coordinating signing session"
        );
        self.in_flight.insert(chain_reference.to_string());
        let driver = node.coordinator().clone();
        let reference = chain_reference.to_string();
        self.spawn_task(chain_reference, Some(session_id), async move {
            TaskOutcome::Signing {
                result: driver.drive(session_id).await,
                chain_reference: reference,
                session_id,
            }
        });
    }

    fn spawn_task<F>(&mut self, chain_reference: &str, session_id: Option<SessionId>, task: F)
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.pending.insert(
            handle.id(),
            PendingTask {
                chain_reference: chain_reference.to_string(),
                session_id,
            },
        );
    }

    async fn finish(&mut self, joined: std::result::Result<(task::Id, TaskOutcome), JoinError>) {
        let outcome = match joined {
            Ok((id, outcome)) => {
                self.pending.remove(&id);
                outcome
            }
            Err(e) => {
                self.recover(e).await;
                return;
            }
        };
        self.in_flight.remove(outcome.chain_reference());
        let requests = Arc::clone(self.node.requests());

        let result = match outcome {
            TaskOutcome::Signing {
                chain_reference,
                session_id,
                result: Ok(signature),
            } => {
                debug!(chain_reference = %chain_reference, session_id = %session_label(&session_id), "Session aggregated");
                requests.mark_signed(&chain_reference, signature).map(|_| ())
            }
            TaskOutcome::Signing {
                chain_reference,
                session_id,
                result: Err(e),
            } => {
                if let Some(culprit) = e.culprit() {
                    warn!(chain_reference = %chain_reference, culprit, error = %e, "Participant flagged for operator review");
                }
                if e.kind() == ErrorKind::FatalInvariant {
                    self.node.halt(&e.to_string());
                    self.node.sessions().expire_all("signing halted").await;
                }
                requests
                    .signing_failed(&chain_reference, &session_id, &e)
                    .map(|status| {
                        info!(chain_reference = %chain_reference, %status, error = %e, "Signing attempt failed");
                    })
            }
            TaskOutcome::Broadcast {
                chain_reference,
                result,
            } => match result {
                Ok(receipt) => requests
                    .mark_broadcast(&chain_reference, &receipt.txid)
                    .and_then(|_| {
                        if receipt.confirmed {
                            requests.mark_completed(&chain_reference)
                        } else {
                            Ok(())
                        }
                    }),
                Err(BroadcastError::Unavailable(reason)) => {
                    warn!(chain_reference = %chain_reference, reason = %reason, "Broadcaster unavailable; will retry");
                    requests.broadcast_unavailable(&chain_reference, &reason)
                }
                Err(BroadcastError::Rejected(reason)) => {
                    requests.abort(&chain_reference, AbortReason::ExternalRejection, &reason)
                }
            },
            TaskOutcome::Confirmation {
                chain_reference,
                result,
            } => match result {
                Ok(true) => requests.mark_completed(&chain_reference),
                Ok(false) => Ok(()),
                Err(BroadcastError::Unavailable(reason)) => {
                    debug!(chain_reference = %chain_reference, reason = %reason, "Confirmation check deferred");
                    Ok(())
                }
                Err(BroadcastError::Rejected(reason)) => {
                    requests.abort(&chain_reference, AbortReason::ExternalRejection, &reason)
                }
            },
        };

        if let Err(e) = result {
            warn!(error = %e, "Task result not applied");
        }
    }

    /// A task panicked or was cancelled before reporting back. Release its
    /// request; a lost signing attempt counts as a failed one.
    async fn recover(&mut self, failure: JoinError) {
        let Some(task) = self.pending.remove(&failure.id()) else {
            error!(error = %failure, "Untracked background task failed");
            return;
        };
        self.in_flight.remove(&task.chain_reference);
        error!(chain_reference = %task.chain_reference, error = %failure, "Background task failed");

        let Some(session_id) = task.session_id else {
            return;
        };
        if let Err(e) = self
            .node
            .coordinator()
            .cancel(&session_id, "signing task failed")
            .await
        {
            debug!(session_id = %session_label(&session_id), error = %e, "No session to expire");
        }
        let err = Error::Internal(format!("signing task failed: {}", failure));
        match self
            .node
            .requests()
            .signing_failed(&task.chain_reference, &session_id, &err)
        {
            Ok(status) => info!(chain_reference = %task.chain_reference, %status, "Signing attempt lost"),
            Err(e) => warn!(chain_reference = %task.chain_reference, error = %e, "Lost signing attempt not recorded"),
        }
    }

    /// Status of a request, for callers holding only the service
    pub fn request_status(&self, chain_reference: &str) -> Result<RequestStatus> {
        self.node.requests().status(chain_reference)
    }
}

/// Poll a deposit monitor forever, feeding the event queue.
///
/// Monitor errors are logged and retried on the next poll; returns when the
/// queue is closed.
pub async fn pump_deposits<M: DepositMonitor + ?Sized>(
    monitor: &M,
    queue: mpsc::Sender<ExternalEvent>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match monitor.poll().await {
            Ok(observations) => {
                for observation in observations {
                    if queue.send(ExternalEvent::Deposit(observation)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Deposit monitor poll failed"),
        }
    }
}

/// Poll a burn watcher forever, feeding the event queue
pub async fn pump_burns<W: BurnWatcher + ?Sized>(
    watcher: &W,
    queue: mpsc::Sender<ExternalEvent>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match watcher.poll().await {
            Ok(events) => {
                for event in events {
                    if queue.send(ExternalEvent::Burn(event)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Burn watcher poll failed"),
        }
    }
}
