//! In-memory transport implementation for testing

use super::{async_trait, Envelope, Transport};
use crate::{Error, ParticipantId, Result};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct NetworkInner {
    /// Mailbox of every attached participant
    mailboxes: DashMap<ParticipantId, mpsc::UnboundedSender<Envelope>>,
    /// Participants whose traffic is dropped in both directions
    offline: DashSet<ParticipantId>,
    /// Deliver every message twice
    duplicate: AtomicBool,
    /// Messages handed to a mailbox
    delivered: AtomicU64,
}

/// Shared in-memory network connecting local participants
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                mailboxes: DashMap::new(),
                offline: DashSet::new(),
                duplicate: AtomicBool::new(false),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a participant and return its endpoint
    pub fn endpoint(&self, id: ParticipantId) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.mailboxes.insert(id, tx);
        MemoryTransport {
            id,
            network: Arc::clone(&self.inner),
            inbox: Mutex::new(rx),
        }
    }

    /// Take a participant off the network (or bring it back)
    pub fn set_offline(&self, id: ParticipantId, offline: bool) {
        if offline {
            self.inner.offline.insert(id);
        } else {
            self.inner.offline.remove(&id);
        }
    }

    /// Duplicate every delivery to exercise at-least-once handling
    pub fn set_duplicate(&self, duplicate: bool) {
        self.inner.duplicate.store(duplicate, Ordering::SeqCst);
    }

    /// Number of messages delivered so far
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    id: ParticipantId,
    network: Arc<NetworkInner>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> ParticipantId {
        self.id
    }

    async fn send(&self, to: ParticipantId, payload: Vec<u8>) -> Result<()> {
        let mailbox = self
            .network
            .mailboxes
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Transport(format!("unknown participant {}", to)))?;

        if self.network.offline.contains(&self.id) || self.network.offline.contains(&to) {
            return Ok(());
        }

        let copies = if self.network.duplicate.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            mailbox
                .send(Envelope {
                    from: self.id,
                    payload: payload.clone(),
                })
                .map_err(|_| Error::Transport(format!("mailbox of {} closed", to)))?;
            self.network.delivered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Envelope> {
        let mut inbox = self.inbox.lock().await;
        inbox
            .recv()
            .await
            .ok_or_else(|| Error::Transport("network closed".into()))
    }
}
