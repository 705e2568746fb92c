use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::topic::Topic;
use crate::websocket::OutboundMessage;

use super::index::SubscriptionIndex;
use super::stats::{ConnectionInfo, RegistryStats};
use super::types::{Connection, ConnectionId};

/// Result of a subscribe or unsubscribe directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// The subscription set changed
    Applied,
    /// Already in the requested state
    Unchanged,
    /// The connection is no longer registered
    UnknownConnection,
}

/// A connection removed from the registry, with the topics it held
#[derive(Debug)]
pub struct RemovedConnection {
    pub connection: Arc<Connection>,
    pub subscriptions: HashSet<Topic>,
}

struct Entry {
    connection: Arc<Connection>,
    subscriptions: HashSet<Topic>,
}

#[derive(Default)]
struct RegistryInner {
    /// connection_id -> connection + its subscriptions
    connections: HashMap<ConnectionId, Entry>,
    /// topic -> Set<connection_id>
    index: SubscriptionIndex,
}

/// Source of truth for who is connected and what they subscribe to.
///
/// The connection map and the subscription index share a single lock, so
/// `index[topic] ∋ id ⇔ connections[id].subscriptions ∋ topic` holds for
/// every reader.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Create and register a connection around an outbound channel
    pub fn register(&self, sender: mpsc::Sender<OutboundMessage>) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(sender));
        self.insert(connection.clone());
        connection
    }

    /// Register an existing connection handle
    pub fn insert(&self, connection: Arc<Connection>) -> ConnectionId {
        let id = connection.id;
        self.write().connections.insert(
            id,
            Entry {
                connection,
                subscriptions: HashSet::new(),
            },
        );

        tracing::info!(connection_id = %id, "Connection registered");
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.read()
            .connections
            .get(&id)
            .map(|entry| entry.connection.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().connections.contains_key(&id)
    }

    /// Remove a connection and every index entry referencing it.
    /// Removing an unknown id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<RemovedConnection> {
        let mut inner = self.write();
        let entry = inner.connections.remove(&id)?;
        inner
            .index
            .remove_connection(id, entry.subscriptions.iter().copied());
        drop(inner);

        tracing::info!(
            connection_id = %id,
            subscriptions = entry.subscriptions.len(),
            "Connection unregistered"
        );

        Some(RemovedConnection {
            connection: entry.connection,
            subscriptions: entry.subscriptions,
        })
    }

    /// Subscribe a connection to a topic
    pub fn subscribe(&self, id: ConnectionId, topic: Topic) -> SubscriptionChange {
        let mut inner = self.write();
        let RegistryInner { connections, index } = &mut *inner;

        let Some(entry) = connections.get_mut(&id) else {
            return SubscriptionChange::UnknownConnection;
        };

        if entry.subscriptions.insert(topic) {
            index.subscribe(id, topic);
            tracing::debug!(connection_id = %id, topic = %topic, "Subscribed to topic");
            SubscriptionChange::Applied
        } else {
            SubscriptionChange::Unchanged
        }
    }

    /// Unsubscribe a connection from a topic
    pub fn unsubscribe(&self, id: ConnectionId, topic: Topic) -> SubscriptionChange {
        let mut inner = self.write();
        let RegistryInner { connections, index } = &mut *inner;

        let Some(entry) = connections.get_mut(&id) else {
            return SubscriptionChange::UnknownConnection;
        };

        if entry.subscriptions.remove(&topic) {
            index.unsubscribe(id, topic);
            tracing::debug!(connection_id = %id, topic = %topic, "Unsubscribed from topic");
            SubscriptionChange::Applied
        } else {
            SubscriptionChange::Unchanged
        }
    }

    /// Owned copy of a topic's subscriber ids
    pub fn subscribers_of(&self, topic: Topic) -> HashSet<ConnectionId> {
        self.read().index.subscribers_of(topic)
    }

    /// Live connections that should receive a publish on `topic`:
    /// subscribers of the topic plus subscribers of `all`, each once.
    pub fn fan_out_targets(&self, topic: Topic) -> Vec<Arc<Connection>> {
        let inner = self.read();
        inner
            .index
            .fan_out(topic)
            .into_iter()
            .filter_map(|id| inner.connections.get(&id).map(|e| e.connection.clone()))
            .collect()
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Option<HashSet<Topic>> {
        self.read()
            .connections
            .get(&id)
            .map(|entry| entry.subscriptions.clone())
    }

    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.read()
            .connections
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    /// Remove every connection, returning them for teardown
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.write();
        inner.index = SubscriptionIndex::new();
        inner
            .connections
            .drain()
            .map(|(_, entry)| entry.connection)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.read();
        RegistryStats {
            total_connections: inner.connections.len(),
            total_subscriptions: inner.index.total_subscriptions(),
            topics: inner
                .index
                .topic_counts()
                .into_iter()
                .map(|(topic, count)| (topic.to_string(), count))
                .collect(),
        }
    }

    /// Per-connection listing, ordered by connect time
    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        let inner = self.read();
        let mut infos: Vec<ConnectionInfo> = inner
            .connections
            .values()
            .map(|entry| {
                let mut subscriptions: Vec<String> =
                    entry.subscriptions.iter().map(Topic::to_string).collect();
                subscriptions.sort();
                ConnectionInfo {
                    id: entry.connection.id,
                    connected_at: entry.connection.connected_at,
                    subscriptions,
                    last_heartbeat_at: entry.connection.last_heartbeat_at(),
                    message_count: entry.connection.messages_received(),
                    missed_beats: entry.connection.missed_beats(),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    /// Check index/registry agreement; used by tests and debug assertions
    pub fn is_consistent(&self) -> bool {
        let inner = self.read();

        let forward = inner.connections.iter().all(|(id, entry)| {
            entry
                .subscriptions
                .iter()
                .all(|topic| inner.index.is_subscribed(*id, *topic))
        });

        let backward = inner.index.topic_counts().into_iter().all(|(topic, count)| {
            let holders = inner
                .connections
                .values()
                .filter(|entry| entry.subscriptions.contains(&topic))
                .count();
            count > 0 && holders == count
        });

        forward && backward
    }

    // A poisoned lock means a panic mid-mutation; the hub cannot continue.
    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("connection registry lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("connection registry lock poisoned")
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
