//! Message Relay Client
//!
//! [`RelayTransport`] carries participant traffic through the relay service.
//! Outbound payloads are sealed with this participant's Ed25519 transport
//! key; a background poller pulls the mailbox, checks every envelope against
//! the sender's registered identity and feeds the survivors to `recv`.

use ed25519_dalek::{SigningKey, VerifyingKey};
use msg_relay::{SignedEnvelope, StoredMessage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use xmr_bridge_core::mpc::{async_trait, Envelope, Transport};
use xmr_bridge_core::registry::ParticipantRegistry;
use xmr_bridge_core::{Error, ParticipantId, Result};

/// Inbound messages buffered ahead of `recv`
const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct FetchResponse {
    messages: Vec<StoredMessage>,
    head: u64,
}

/// Relay connection settings
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Pause between mailbox polls when nothing arrived
    pub poll_interval: Duration,
    /// Per-request HTTP timeout
    pub timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Transport identities of every participant
pub type PeerKeys = BTreeMap<ParticipantId, VerifyingKey>;

/// Collect transport identities from a registry's `network_identity` fields
pub fn peer_keys(registry: &ParticipantRegistry) -> Result<PeerKeys> {
    registry
        .roster()
        .into_iter()
        .map(|p| {
            msg_relay::parse_verifying_key(&p.network_identity)
                .map(|key| (p.id, key))
                .map_err(|e| {
                    Error::InvalidConfig(format!("participant {}: {}", p.id, e))
                })
        })
        .collect()
}

/// Check an envelope pulled from our mailbox
fn accept(
    local_id: ParticipantId,
    peers: &PeerKeys,
    envelope: SignedEnvelope,
) -> Result<Envelope> {
    if envelope.to != local_id {
        return Err(Error::Transport(format!(
            "envelope addressed to {} in mailbox of {}",
            envelope.to, local_id
        )));
    }
    let key = peers
        .get(&envelope.from)
        .ok_or(Error::InvalidParticipantId(envelope.from))?;
    envelope
        .open(key)
        .map_err(|e| Error::violation(envelope.from, e.to_string()))?;
    Ok(Envelope {
        from: envelope.from,
        payload: envelope.payload,
    })
}

/// HTTP transport over the message relay
pub struct RelayTransport {
    client: Client,
    url: String,
    local_id: ParticipantId,
    signing_key: SigningKey,
    timeout: Duration,
    inbox: Mutex<mpsc::Receiver<Envelope>>,
    poller: JoinHandle<()>,
}

impl RelayTransport {
    /// Connect and start polling. Must be called inside a tokio runtime.
    pub fn connect(
        url: &str,
        local_id: ParticipantId,
        signing_key: SigningKey,
        peers: PeerKeys,
        options: RelayOptions,
    ) -> Result<Self> {
        match peers.get(&local_id) {
            Some(own) if *own == signing_key.verifying_key() => {}
            Some(_) => {
                return Err(Error::InvalidConfig(format!(
                    "transport key does not match the registered identity of participant {}",
                    local_id
                )))
            }
            None => return Err(Error::InvalidParticipantId(local_id)),
        }

        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let url = url.trim_end_matches('/').to_string();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        let poller = tokio::spawn(poll_mailbox(
            client.clone(),
            url.clone(),
            local_id,
            Arc::new(peers),
            options.poll_interval,
            tx,
        ));

        Ok(Self {
            client,
            url,
            local_id,
            signing_key,
            timeout: options.timeout,
            inbox: Mutex::new(rx),
            poller,
        })
    }

    /// Relay base URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn fetch(client: &Client, url: &str, me: ParticipantId, after: u64) -> Result<FetchResponse> {
    let response = client
        .get(format!("{}/v1/msg/{}", url, me))
        .query(&[("after", after)])
        .send()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "GET failed with status: {}",
            response.status()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Deserialization(e.to_string()))
}

async fn poll_mailbox(
    client: Client,
    url: String,
    me: ParticipantId,
    peers: Arc<PeerKeys>,
    interval: Duration,
    inbox: mpsc::Sender<Envelope>,
) {
    let mut cursor = 0u64;
    loop {
        match fetch(&client, &url, me, cursor).await {
            Ok(batch) => {
                // Relay restarted with an empty store
                if batch.head < cursor {
                    warn!(participant_id = me, cursor, head = batch.head, "Relay mailbox reset");
                    cursor = 0;
                    continue;
                }
                let received = batch.messages.len();
                for message in batch.messages {
                    cursor = cursor.max(message.seq);
                    match accept(me, &peers, message.envelope) {
                        Ok(envelope) => {
                            if inbox.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(participant_id = me, seq = message.seq, error = %e, "Dropping relay message"),
                    }
                }
                if received > 0 {
                    continue;
                }
            }
            Err(e) => debug!(participant_id = me, error = %e, "Relay poll failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    #[instrument(skip(self, payload), fields(from = self.local_id))]
    async fn send(&self, to: ParticipantId, payload: Vec<u8>) -> Result<()> {
        let envelope = SignedEnvelope::seal(&self.signing_key, self.local_id, to, payload);

        let response = self
            .client
            .post(format!("{}/v1/msg", self.url))
            .json(&envelope)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "POST failed with status: {}",
                response.status()
            )));
        }

        debug!(to, "Message posted");
        Ok(())
    }

    async fn recv(&self) -> Result<Envelope> {
        let mut inbox = self.inbox.lock().await;
        inbox
            .recv()
            .await
            .ok_or_else(|| Error::Transport("relay poller stopped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use msg_relay::MessageStore;
    use std::collections::HashMap;

    fn key(id: ParticipantId) -> SigningKey {
        SigningKey::from_bytes(&[id as u8; 32])
    }

    fn peers(n: ParticipantId) -> PeerKeys {
        (1..=n).map(|id| (id, key(id).verifying_key())).collect()
    }

    #[test]
    fn test_accept_checks_sender_identity() {
        let peers = peers(3);
        let good = SignedEnvelope::seal(&key(2), 2, 1, b"hi".to_vec());
        assert_eq!(accept(1, &peers, good).unwrap().from, 2);

        // Participant 3 signing as participant 2
        let forged = SignedEnvelope::seal(&key(3), 2, 1, b"hi".to_vec());
        assert!(matches!(
            accept(1, &peers, forged),
            Err(Error::ProtocolViolation { participant: 2, .. })
        ));

        let stranger = SignedEnvelope::seal(&key(9), 9, 1, vec![]);
        assert!(matches!(
            accept(1, &peers, stranger),
            Err(Error::InvalidParticipantId(9))
        ));

        let misrouted = SignedEnvelope::seal(&key(2), 2, 3, vec![]);
        assert!(accept(1, &peers, misrouted).is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_foreign_key() {
        let err = RelayTransport::connect(
            "http://127.0.0.1:9",
            1,
            key(2),
            peers(3),
            RelayOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    async fn serve_relay() -> String {
        async fn put(
            State(store): State<MessageStore>,
            Json(envelope): Json<SignedEnvelope>,
        ) -> Json<serde_json::Value> {
            let receipt = store.put(envelope).unwrap();
            Json(serde_json::json!({ "seq": receipt.seq, "duplicate": receipt.duplicate }))
        }
        async fn list(
            State(store): State<MessageStore>,
            Path(to): Path<ParticipantId>,
            Query(query): Query<HashMap<String, u64>>,
        ) -> Json<FetchResponse> {
            let after = query.get("after").copied().unwrap_or(0);
            Json(FetchResponse {
                messages: store.fetch(to, after, 256),
                head: store.head(to),
            })
        }

        let app = Router::new()
            .route("/v1/msg", post(put))
            .route("/v1/msg/:to", get(list))
            .with_state(MessageStore::new(3600));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_round_trip_through_relay() {
        let url = serve_relay().await;
        let options = RelayOptions {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let a = RelayTransport::connect(&url, 1, key(1), peers(2), options.clone()).unwrap();
        let b = RelayTransport::connect(&url, 2, key(2), peers(2), options).unwrap();

        a.send(2, b"first".to_vec()).await.unwrap();
        a.send(2, b"second".to_vec()).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), b.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.from, 1);
        assert_eq!(first.payload, b"first");
        assert_eq!(second.payload, b"second");
    }
}
