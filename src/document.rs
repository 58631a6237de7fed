//! Server-side state of one shared document: replica, presence and attached sessions.
//!
//! `Document` is plain data driven by the document actor, so every mutation here is
//! already serialized.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::trace;

use crate::awareness::{Awareness, AwarenessChange, ClientId};
use crate::codec::ProtocolError;
use crate::config::Configuration;
use crate::hooks::{Context, RequestInfo};
use crate::protocol::OutgoingMessage;
use crate::replica::{Origin, Replica, ReplicaError};
use crate::transport::Outbox;

/// A session attached to the document.
pub(crate) struct Connection {
    pub outbox: Outbox,
    pub read_only: bool,
    pub context: Context,
    pub request: Arc<RequestInfo>,
    /// Presence ids announced over this session.
    pub clients: HashSet<ClientId>,
}

impl Connection {
    pub fn new(outbox: Outbox, read_only: bool, context: Context, request: Arc<RequestInfo>) -> Self {
        Self { outbox, read_only, context, request, clients: HashSet::new() }
    }
}

pub(crate) struct Document {
    name: Arc<str>,
    replica: Replica,
    awareness: Awareness,
    connections: HashMap<Arc<str>, Connection>,
    direct_connections: usize,
    loading: bool,
    /// Sessions whose transport refused a frame since the last drain.
    dead: Vec<Arc<str>>,
}

impl Document {
    pub fn new(name: Arc<str>, configuration: &Configuration) -> Self {
        // presence ids are 32-bit on the wire in practice
        let local_id = uuid::Uuid::new_v4().as_u64_pair().0 & u64::from(u32::MAX);
        Self {
            name,
            replica: Replica::new(&configuration.replica),
            awareness: Awareness::new(local_id, configuration.awareness_timeout),
            connections: HashMap::new(),
            direct_connections: 0,
            loading: true,
            dead: Vec::new(),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_loaded(&mut self) {
        self.loading = false;
    }

    pub fn connection(&self, socket_id: &str) -> Option<&Connection> {
        self.connections.get(socket_id)
    }

    pub fn has_connection(&self, socket_id: &str) -> bool {
        self.connections.contains_key(socket_id)
    }

    pub fn socket_ids(&self) -> Vec<Arc<str>> {
        self.connections.keys().cloned().collect()
    }

    pub fn sessions_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections_count(&self) -> usize {
        self.connections.len() + self.direct_connections
    }

    /// Attaches a session and sends it the current presence, if any.
    pub fn add_connection(&mut self, socket_id: Arc<str>, connection: Connection) -> usize {
        let snapshot = self.awareness.has_states().then(|| OutgoingMessage::new(&self.name).awareness_update(&self.awareness, None));
        self.connections.insert(Arc::clone(&socket_id), connection);
        if let Some(message) = snapshot {
            self.send(&socket_id, message);
        }
        self.connections_count()
    }

    /// Detaches a session and drops the presence it announced.
    pub fn remove_connection(&mut self, socket_id: &str, now: Instant) -> AwarenessChange {
        let Some(connection) = self.connections.remove(socket_id) else {
            return AwarenessChange::default();
        };
        let clients: Vec<ClientId> = connection.clients.into_iter().collect();
        let change = self.awareness.remove_states(&clients, now);
        if !change.removed.is_empty() {
            let message = OutgoingMessage::new(&self.name).awareness_update(&self.awareness, Some(&change.removed));
            self.broadcast(message, None);
        }
        change
    }

    pub fn add_direct_connection(&mut self) -> usize {
        self.direct_connections += 1;
        self.connections_count()
    }

    pub fn remove_direct_connection(&mut self) -> usize {
        self.direct_connections = self.direct_connections.saturating_sub(1);
        self.connections_count()
    }

    /// Returns false when the session is unknown or its transport is gone.
    pub fn send(&mut self, socket_id: &str, message: OutgoingMessage) -> bool {
        let Some((id, connection)) = self.connections.get_key_value(socket_id) else {
            return false;
        };
        trace!(document = %self.name, socket = socket_id, direction = "out", category = message.category());
        if connection.outbox.send(message.into_bytes()) {
            return true;
        }
        self.dead.push(Arc::clone(id));
        false
    }

    /// Encodes once and fans out to every session except `except`.
    pub fn broadcast(&mut self, message: OutgoingMessage, except: Option<&str>) {
        trace!(document = %self.name, direction = "out", category = message.category(), "broadcast");
        let data = message.into_bytes();
        for (id, connection) in &self.connections {
            if except.is_some_and(|e| e == id.as_ref()) {
                continue;
            }
            if !connection.outbox.send(data.clone()) {
                self.dead.push(Arc::clone(id));
            }
        }
    }

    /// Sessions whose transport refused a frame.
    pub fn take_dead(&mut self) -> Vec<Arc<str>> {
        std::mem::take(&mut self.dead)
    }

    /// Applies an update and relays it to every session but the originating one.
    pub fn apply_update(&mut self, update: &[u8], origin: Origin<'_>) -> Result<bool, ReplicaError> {
        let changed = self.replica.apply_update(update, origin)?;
        if changed {
            let except = match origin {
                Origin::Session(id) => Some(id),
                Origin::Hook | Origin::Local => None,
            };
            self.broadcast(OutgoingMessage::new(&self.name).sync_update(update), except);
        }
        Ok(changed)
    }

    /// Runs `f` on the replica and relays the resulting update to every session.
    pub fn transact<F>(&mut self, f: F) -> Option<Vec<u8>>
    where
        F: FnOnce(&yrs::Doc),
    {
        let update = self.replica.transact(f)?;
        self.broadcast(OutgoingMessage::new(&self.name).sync_update(&update), None);
        Some(update)
    }

    /// Merges presence from `socket_id` and relays the changed clients to every session.
    pub fn apply_awareness_update(&mut self, update: &[u8], socket_id: Option<&str>, now: Instant) -> Result<AwarenessChange, ProtocolError> {
        let change = self.awareness.apply_update(update, now)?;
        if let Some(connection) = socket_id.and_then(|id| self.connections.get_mut(id)) {
            connection.clients.extend(change.added.iter().copied());
            for id in &change.removed {
                connection.clients.remove(id);
            }
        }
        self.broadcast_awareness(&change);
        Ok(change)
    }

    /// Evicts outdated presence and relays the result.
    pub fn sweep_awareness(&mut self, now: Instant) -> AwarenessChange {
        let change = self.awareness.sweep(now);
        for connection in self.connections.values_mut() {
            for id in &change.removed {
                connection.clients.remove(id);
            }
        }
        self.broadcast_awareness(&change);
        change
    }

    fn broadcast_awareness(&mut self, change: &AwarenessChange) {
        let changed = change.changed_clients();
        if changed.is_empty() {
            return;
        }
        let message = OutgoingMessage::new(&self.name).awareness_update(&self.awareness, Some(&changed));
        self.broadcast(message, None);
    }

    /// Relays as a plain stateless message; providers only listen for that type.
    pub fn broadcast_stateless(&mut self, payload: &str, except: Option<&str>) {
        self.broadcast(OutgoingMessage::new(&self.name).stateless(payload), except);
    }
}
