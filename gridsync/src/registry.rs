//! Per-server connection bookkeeping.
//!
//! ```text
//!            ┌──────────────── ConnectionRegistry ────────────────┐
//!  Bus ────► │ relay task per file ──► deliver() ──► outbound tx  │ ──► sockets
//!            │ files: fileId → {conn}   users: userId → conn      │
//!            └────────────────────────────────────────────────────┘
//! ```
//!
//! The first local subscriber of a file starts a relay task that holds this
//! server's bus subscription for that file. When the last local subscriber
//! leaves, the relay is stopped and the channel is pruned.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::Bus;
use crate::protocol::BusMessage;

/// Identity of one socket connection, unique across server instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Text frames queued for a socket.
pub type Outbound = mpsc::Sender<Arc<str>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Result of removing a connection from one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub file_id: String,
    /// No local connection is left on the file.
    pub now_empty: bool,
}

struct Entry {
    outbound: Outbound,
    user_id: Option<String>,
    files: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    files: HashMap<String, HashSet<ConnectionId>>,
    users: HashMap<String, ConnectionId>,
    connections: HashMap<ConnectionId, Entry>,
    relays: HashMap<String, JoinHandle<()>>,
}

pub struct ConnectionRegistry {
    bus: Arc<Bus>,
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(bus: Arc<Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: RwLock::new(RegistryState::default()),
        })
    }

    pub async fn register(&self, id: ConnectionId, outbound: Outbound) {
        self.state.write().await.connections.insert(
            id,
            Entry {
                outbound,
                user_id: None,
                files: HashSet::new(),
            },
        );
    }

    /// Record that `id` belongs to `user_id`. The latest connection of a
    /// user wins the reverse mapping; the previous one is returned.
    pub async fn identify(
        &self,
        user_id: &str,
        id: ConnectionId,
    ) -> Result<Option<ConnectionId>, RegistryError> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        let old_user = entry.user_id.replace(user_id.to_string());

        if let Some(old_user) = old_user.filter(|u| u != user_id) {
            if state.users.get(&old_user) == Some(&id) {
                state.users.remove(&old_user);
            }
        }
        Ok(state
            .users
            .insert(user_id.to_string(), id)
            .filter(|prev| *prev != id))
    }

    /// Add `id` to the file's local set. Returns `false` if it was already
    /// there. The bus subscription is live before this returns.
    pub async fn subscribe(
        self: &Arc<Self>,
        file_id: &str,
        id: ConnectionId,
    ) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        if !entry.files.insert(file_id.to_string()) {
            return Ok(false);
        }
        state
            .files
            .entry(file_id.to_string())
            .or_default()
            .insert(id);

        if !state.relays.contains_key(file_id) {
            let rx = self.bus.subscribe(file_id).await;
            let relay = tokio::spawn(relay(Arc::downgrade(self), file_id.to_string(), rx));
            state.relays.insert(file_id.to_string(), relay);
            log::debug!("Subscribed to bus channel {file_id}");
        }
        Ok(true)
    }

    /// Forget a connection entirely. Reports, per file it was in, whether
    /// the file has no local connections left.
    pub async fn unsubscribe(&self, id: ConnectionId) -> Vec<Release> {
        let mut releases = Vec::new();
        let mut stopped = Vec::new();
        {
            let mut state = self.state.write().await;
            let Some(entry) = state.connections.remove(&id) else {
                return releases;
            };
            if let Some(user_id) = &entry.user_id {
                if state.users.get(user_id) == Some(&id) {
                    state.users.remove(user_id);
                }
            }
            for file_id in entry.files {
                let now_empty = match state.files.get_mut(&file_id) {
                    Some(members) => {
                        members.remove(&id);
                        members.is_empty()
                    }
                    None => true,
                };
                if now_empty {
                    state.files.remove(&file_id);
                    if let Some(relay) = state.relays.remove(&file_id) {
                        relay.abort();
                        stopped.push((file_id.clone(), relay));
                    }
                }
                releases.push(Release { file_id, now_empty });
            }
        }

        // The relay owns the bus receiver; wait for it to drop before pruning.
        for (file_id, relay) in stopped {
            let _ = relay.await;
            if self.bus.prune(&file_id).await {
                log::debug!("Released bus channel {file_id}");
            }
        }
        releases
    }

    pub async fn local_count(&self, file_id: &str) -> usize {
        self.state
            .read()
            .await
            .files
            .get(file_id)
            .map_or(0, HashSet::len)
    }

    pub async fn connection_for_user(&self, user_id: &str) -> Option<ConnectionId> {
        self.state.read().await.users.get(user_id).copied()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn has_relay(&self, file_id: &str) -> bool {
        self.state.read().await.relays.contains_key(file_id)
    }

    /// Queue a bus message on every local socket subscribed to its channel
    /// except the one it came from. Returns the number of sockets reached.
    pub async fn deliver(&self, message: &BusMessage) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.files.get(&message.channel) else {
            return 0;
        };
        let excluded = message.origin.or_else(|| {
            message
                .sender_id
                .as_deref()
                .and_then(|user_id| state.users.get(user_id).copied())
        });

        let mut sent = 0;
        for id in members {
            if Some(*id) == excluded {
                continue;
            }
            let Some(entry) = state.connections.get(id) else {
                continue;
            };
            match entry.outbound.try_send(message.body.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "Outbound queue full for connection {id}, dropping message on {}",
                        message.channel
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        sent
    }
}

async fn relay(
    registry: Weak<ConnectionRegistry>,
    file_id: String,
    mut rx: broadcast::Receiver<Arc<BusMessage>>,
) {
    loop {
        let message = rx.recv().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        match message {
            Ok(message) => {
                registry.deliver(&message).await;
            }
            Err(RecvError::Lagged(n)) => {
                log::warn!("Relay for {file_id} lagged, skipped {n} messages");
                registry.bus.record_lag(n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
