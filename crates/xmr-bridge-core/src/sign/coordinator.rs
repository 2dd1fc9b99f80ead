//! Coordinator role: drive one signing session to an aggregate signature

use super::{
    Responder, SessionHandle, SessionManager, SigningMessage, SigningPayload,
    SigningSession, ROUND_COMMIT, ROUND_SHARE,
};
use crate::mpc::{broadcast, ProtocolMessage, Transport};
use crate::types::session_label;
use crate::{Error, ParticipantId, Result, SessionId, Signature};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

/// Runs signing sessions on behalf of this participant
pub struct Coordinator<T: Transport + ?Sized> {
    transport: Arc<T>,
    responder: Arc<Responder>,
    sessions: Arc<SessionManager>,
    round_timeout: Duration,
}

impl<T: Transport + ?Sized> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            responder: Arc::clone(&self.responder),
            sessions: Arc::clone(&self.sessions),
            round_timeout: self.round_timeout,
        }
    }
}

impl<T: Transport + ?Sized> Coordinator<T> {
    pub fn new(
        transport: Arc<T>,
        responder: Arc<Responder>,
        sessions: Arc<SessionManager>,
        round_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            responder,
            sessions,
            round_timeout,
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.transport.local_id()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Open a session for `message` with the given candidate signers
    pub fn open(
        &self,
        chain_reference: &str,
        attempt: u32,
        message: &[u8],
        signers: &[ParticipantId],
    ) -> Result<SessionId> {
        let registry = self.sessions.registry();
        if let Some(unknown) = signers.iter().find(|id| !registry.contains(**id)) {
            return Err(Error::InvalidParticipantId(*unknown));
        }

        let session_id = super::new_session_id(chain_reference, attempt);
        let session = SigningSession::new(
            session_id,
            chain_reference,
            attempt,
            message.to_vec(),
            self.participant_id(),
            registry.threshold(),
            signers.iter().copied(),
        )?;
        self.sessions.insert(session)?;

        debug!(
            session_id = %session_label(&session_id),
            chain_reference,
            attempt,
            "Opened signing session"
        );
        Ok(session_id)
    }

    /// Open a session with every registered participant and drive it
    pub async fn sign(
        &self,
        chain_reference: &str,
        attempt: u32,
        message: &[u8],
    ) -> Result<(SessionId, Signature)> {
        let signers = self.sessions.registry().ids();
        let session_id = self.open(chain_reference, attempt, message, &signers)?;
        let signature = self.drive(session_id).await?;
        Ok((session_id, signature))
    }

    /// Run both FROST rounds for an open session and announce the outcome
    #[instrument(skip(self, session_id), fields(participant_id = self.participant_id(), session_id = %session_label(&session_id)))]
    pub async fn drive(&self, session_id: SessionId) -> Result<Signature> {
        let me = self.participant_id();
        let handle = self.sessions.handle(&session_id)?;
        let (chain_reference, attempt, message, signers) = {
            let mut session = handle.lock().await;
            session.begin()?;
            (
                session.chain_reference().to_string(),
                session.attempt(),
                session.message().to_vec(),
                session.signers(),
            )
        };

        info!(?signers, "Round 1: requesting commitments");
        let request = ProtocolMessage::Signing(SigningMessage::new(
            session_id,
            me,
            SigningPayload::CommitRequest {
                chain_reference: chain_reference.clone(),
                attempt,
                message: message.clone(),
                signers: signers.clone(),
            },
        ))
        .encode()?;

        for &signer in &signers {
            if signer == me {
                match self.responder.commit(session_id, me, &message) {
                    Ok(pair) => self.sessions.record_commitment(&session_id, me, pair).await?,
                    Err(e) => {
                        self.sessions
                            .record_decline(&session_id, me, e.to_string())
                            .await?
                    }
                }
            } else if let Err(e) = self.transport.send(signer, request.clone()).await {
                warn!(to = signer, error = %e, "Commit request not delivered");
            }
        }

        let deadline = Instant::now() + self.round_timeout;
        self.wait_until(&handle, deadline, |s| {
            s.round1_settled() || s.status().is_terminal()
        })
        .await;

        let package = {
            let mut session = handle.lock().await;
            if let Some(failure) = session.failure() {
                return Err(failure.to_error());
            }
            let group_key = self.sessions.registry().group_key_point()?;
            session.close_commitments(&group_key, self.sessions.consumed())?
        };

        info!(signers = ?package.signers(), "Round 2: requesting signature shares");
        let request = ProtocolMessage::Signing(SigningMessage::new(
            session_id,
            me,
            SigningPayload::SignRequest(package.clone()),
        ))
        .encode()?;

        for signer in package.signers() {
            if signer == me {
                let share = match self.responder.sign(session_id, me, &package) {
                    Ok(share) => share,
                    Err(e) => {
                        handle.lock().await.fail(&e);
                        return Err(e);
                    }
                };
                self.sessions.record_share(&session_id, me, share).await?;
            } else if let Err(e) = self.transport.send(signer, request.clone()).await {
                warn!(to = signer, error = %e, "Sign request not delivered");
            }
        }

        let deadline = Instant::now() + self.round_timeout;
        self.wait_until(&handle, deadline, |s| {
            s.shares_complete() || s.status().is_terminal()
        })
        .await;

        let signature = {
            let mut session = handle.lock().await;
            if let Some(failure) = session.failure() {
                return Err(failure.to_error());
            }
            if !session.shares_complete() {
                let missing: Vec<ParticipantId> = session
                    .participants_committed()
                    .difference(&session.participants_shared())
                    .copied()
                    .collect();
                let err = Error::Timeout(format!("round 2 missing shares from {:?}", missing));
                session.fail(&err);
                return Err(err);
            }
            let group_public_key = self.sessions.registry().group_public_key()?;
            session.aggregate(&group_public_key)?
        };
        handle.notify();

        info!(
            signature = %hex::encode(signature.to_bytes()),
            "Aggregated signature verified"
        );

        let outcome = ProtocolMessage::Signing(SigningMessage::new(
            session_id,
            me,
            SigningPayload::Outcome {
                chain_reference,
                message,
                signature,
            },
        ))
        .encode()?;
        if let Err(e) = broadcast(self.transport.as_ref(), &self.sessions.registry().ids(), &outcome).await {
            warn!(error = %e, "Outcome announcement incomplete");
        }

        Ok(signature)
    }

    /// Abandon a running session
    pub async fn cancel(&self, session_id: &SessionId, reason: &str) -> Result<()> {
        let handle = self.sessions.handle(session_id)?;
        handle.lock().await.expire(reason);
        handle.notify();
        Ok(())
    }

    async fn wait_until<F>(&self, handle: &SessionHandle, deadline: Instant, done: F)
    where
        F: Fn(&SigningSession) -> bool,
    {
        let mut changes = handle.subscribe();
        loop {
            if done(&*handle.lock().await) {
                return;
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = sleep_until(deadline) => return,
            }
        }
    }
}

/// Answer a coordinator's request on behalf of the local responder.
///
/// Returns the reply to send back, which is a decline when the request
/// cannot be honoured.
pub fn respond(
    responder: &Responder,
    coordinator: ParticipantId,
    message: &SigningMessage,
    approve: impl FnOnce(&str, &[u8]) -> Result<()>,
) -> Option<SigningMessage> {
    let me = responder.participant_id();
    let session_id = message.session_id;

    let reply = match &message.payload {
        SigningPayload::CommitRequest {
            chain_reference,
            message: body,
            signers,
            ..
        } => {
            if !signers.contains(&me) {
                return None;
            }
            approve(chain_reference, body)
                .and_then(|_| responder.commit(session_id, coordinator, body))
                .map(SigningPayload::Commitment)
                .map_err(|e| (ROUND_COMMIT, e))
        }
        SigningPayload::SignRequest(package) => responder
            .sign(session_id, coordinator, package)
            .map(|share| SigningPayload::Share { share })
            .map_err(|e| (ROUND_SHARE, e)),
        _ => return None,
    };

    Some(match reply {
        Ok(payload) => SigningMessage::new(session_id, me, payload),
        Err((round, e)) => {
            warn!(
                participant_id = me,
                coordinator,
                session_id = %session_label(&session_id),
                error = %e,
                "Declining signing request"
            );
            SigningMessage::decline(session_id, me, round, e.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::{MemoryNetwork, MemoryTransport};
    use crate::registry::ParticipantRegistry;
    use crate::sign::{ApprovalPolicy, FixedMessage};
    use crate::test_support::dealer_shares;
    use crate::KeyShare;

    fn registry(share: &KeyShare) -> Arc<ParticipantRegistry> {
        let mut registry = ParticipantRegistry::new(share.threshold, share.total).unwrap();
        for id in 1..=share.total as ParticipantId {
            registry.register(id, format!("node-{}", id)).unwrap();
        }
        registry.seal().unwrap();
        registry.install_key_share(share).unwrap();
        Arc::new(registry)
    }

    /// Minimal remote responder loop
    fn spawn_peer(transport: MemoryTransport, share: KeyShare, approved: Vec<u8>) {
        let responder = Responder::new(Arc::new(share));
        let policy = FixedMessage(approved);
        tokio::spawn(async move {
            while let Ok(envelope) = transport.recv().await {
                let Ok(ProtocolMessage::Signing(message)) =
                    ProtocolMessage::decode(&envelope.payload)
                else {
                    continue;
                };
                if let Some(reply) = respond(&responder, envelope.from, &message, |r, m| {
                    policy.approve(r, m)
                }) {
                    let bytes = ProtocolMessage::Signing(reply).encode().unwrap();
                    let _ = transport.send(envelope.from, bytes).await;
                }
            }
        });
    }

    /// Coordinator-side inbound loop feeding the session manager
    fn spawn_inbox(transport: Arc<MemoryTransport>, sessions: Arc<SessionManager>) {
        tokio::spawn(async move {
            while let Ok(envelope) = transport.recv().await {
                let Ok(ProtocolMessage::Signing(message)) =
                    ProtocolMessage::decode(&envelope.payload)
                else {
                    continue;
                };
                let id = message.session_id;
                let _ = match message.payload {
                    SigningPayload::Commitment(pair) => {
                        sessions.record_commitment(&id, envelope.from, pair).await
                    }
                    SigningPayload::Share { share } => {
                        sessions.record_share(&id, envelope.from, share).await
                    }
                    SigningPayload::Decline { reason } => {
                        sessions.record_decline(&id, envelope.from, reason).await
                    }
                    _ => Ok(()),
                };
            }
        });
    }

    fn coordinator(
        network: &MemoryNetwork,
        shares: &[KeyShare],
        timeout: Duration,
    ) -> Coordinator<MemoryTransport> {
        let transport = Arc::new(network.endpoint(1));
        let sessions = Arc::new(SessionManager::new(
            registry(&shares[0]),
            Duration::from_secs(60),
        ));
        spawn_inbox(Arc::clone(&transport), Arc::clone(&sessions));
        Coordinator::new(
            transport,
            Arc::new(Responder::new(Arc::new(shares[0].clone()))),
            sessions,
            timeout,
        )
    }

    #[tokio::test]
    async fn test_two_of_three_with_one_offline() {
        let network = MemoryNetwork::new();
        let shares = dealer_shares(2, 3, 61);
        let message = b"withdrawal digest".to_vec();

        let coordinator = coordinator(&network, &shares, Duration::from_millis(500));
        spawn_peer(network.endpoint(2), shares[1].clone(), message.clone());
        let _offline = network.endpoint(3);
        network.set_offline(3, true);

        let (_, signature) = coordinator.sign("tx-1", 0, &message).await.unwrap();
        signature
            .verify(&shares[0].group_public_key, &message)
            .unwrap();
    }

    #[tokio::test]
    async fn test_below_threshold_session_fails() {
        let network = MemoryNetwork::new();
        let shares = dealer_shares(2, 3, 62);

        let coordinator = coordinator(&network, &shares, Duration::from_millis(200));
        for id in [2, 3] {
            let _ = network.endpoint(id);
            network.set_offline(id, true);
        }

        let err = coordinator.sign("tx-2", 0, b"m").await.unwrap_err();
        assert!(matches!(err, Error::ThresholdNotMet { .. }));
    }

    #[tokio::test]
    async fn test_unapproved_message_is_declined() {
        let network = MemoryNetwork::new();
        let shares = dealer_shares(2, 3, 63);

        let coordinator = coordinator(&network, &shares, Duration::from_secs(5));
        spawn_peer(network.endpoint(2), shares[1].clone(), b"other".to_vec());
        spawn_peer(network.endpoint(3), shares[2].clone(), b"other".to_vec());

        // Both peers decline promptly, so round 1 settles before the deadline
        let started = Instant::now();
        let err = coordinator.sign("tx-3", 0, b"unobserved").await.unwrap_err();
        assert!(matches!(err, Error::ThresholdNotMet { actual: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
