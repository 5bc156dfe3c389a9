//! Fan-out of envelopes to every registered client.

use std::{io, sync::Arc};

use chrono::Local;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::{
    protocol::Envelope,
    registry::{ClientRegistry, Connection, ConnectionId},
    store::{ActiveMessageStore, ActiveMessages},
};

/// A client request that still needs a server timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Message {
        sender: String,
        priority: i64,
        body: String,
    },
    Retire {
        sender: String,
        timestamp: String,
    },
}

impl Outgoing {
    fn into_envelope(self, timestamp: String) -> Envelope {
        match self {
            Outgoing::Message {
                sender,
                priority,
                body,
            } => Envelope::message(sender, priority, body, timestamp),
            Outgoing::Retire {
                sender,
                timestamp: target,
            } => Envelope::retire(sender, &target, timestamp),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub envelope: Envelope,
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
    store: Arc<ActiveMessageStore>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ClientRegistry>, store: Arc<ActiveMessageStore>) -> Self {
        Self { registry, store }
    }

    /// Stamps `outgoing` with the current time and delivers it.
    pub async fn publish(&self, outgoing: Outgoing) -> DeliveryReport {
        let mut active = self.store.lock().await;
        let timestamp = active.stamp(Local::now().time());
        let envelope = outgoing.into_envelope(timestamp);
        self.deliver_locked(&mut active, envelope).await
    }

    /// Writes `envelope` to every registered client, then appends it to the
    /// active store, or retires the entries it references.
    ///
    /// Clients whose write fails are unregistered and closed; the others still
    /// get the envelope.
    pub async fn deliver(&self, envelope: Envelope) -> DeliveryReport {
        let mut active = self.store.lock().await;
        self.deliver_locked(&mut active, envelope).await
    }

    /// Registers a freshly joined client and replays the active store to it.
    ///
    /// Both happen under the store lock, so every envelope reaches the client
    /// exactly once: in the replay or live, not both.
    pub async fn join(&self, connection: &Connection, name: &str) -> io::Result<usize> {
        let active = self.store.lock().await;
        let backlog = active.snapshot();

        self.registry
            .register(connection.clone(), name.to_string())
            .await;

        if backlog.is_empty() {
            return Ok(0);
        }

        let payload: String = backlog.iter().map(Envelope::encode).collect();
        if let Err(err) = connection.send(payload.as_bytes()).await {
            self.evict(connection.id()).await;
            return Err(err);
        }
        Ok(backlog.len())
    }

    async fn deliver_locked(
        &self,
        active: &mut ActiveMessages,
        envelope: Envelope,
    ) -> DeliveryReport {
        let payload = envelope.encode();
        let recipients = self.registry.entries().await;

        let results = join_all(recipients.iter().map(|entry| {
            let payload = payload.as_bytes();
            async move { (entry, entry.connection.send(payload).await) }
        }))
        .await;

        let mut delivered = 0;
        let mut evicted = Vec::new();
        for (entry, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        connection = entry.connection.id(),
                        name = %entry.name,
                        error = %err,
                        "dropping client after failed delivery"
                    );
                    if self.evict(entry.connection.id()).await {
                        evicted.push(entry.connection.id());
                    }
                }
            }
        }

        info!(
            sender = %envelope.sender(),
            prefix = %envelope.prefix(),
            timestamp = %envelope.timestamp(),
            delivered,
            "broadcast: {}",
            envelope.body()
        );

        match envelope.retired_timestamp() {
            Some(target) => {
                let removed = active.remove(target);
                debug!(retired = target, removed, "retired active messages");
            }
            None => {
                if !active.append(envelope.clone()) {
                    warn!(
                        sender = %envelope.sender(),
                        timestamp = %envelope.timestamp(),
                        "active message with this sender and timestamp already exists"
                    );
                }
            }
        }

        DeliveryReport {
            envelope,
            delivered,
            evicted,
        }
    }

    /// Unregisters and closes `id`. Returns `false` if someone else got there
    /// first.
    async fn evict(&self, id: ConnectionId) -> bool {
        match self.registry.unregister(id).await {
            Some(entry) => {
                entry.connection.close().await;
                true
            }
            None => false,
        }
    }
}
