//! Presence registry: per-client ephemeral state with clock-based last-writer-wins.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::codec::{Decoder, Encoder, ProtocolError};

pub type ClientId = u64;

/// Default time after which a silent client is considered gone.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMeta {
    pub clock: u64,
    pub last_updated: Instant,
}

/// Clients touched by one operation. `updated` includes clock-only renewals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn changed_clients(&self) -> Vec<ClientId> {
        self.added.iter().chain(&self.updated).chain(&self.removed).copied().collect()
    }
}

#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
    outdated_timeout: Duration,
}

impl Awareness {
    pub fn new(client_id: ClientId, outdated_timeout: Duration) -> Self {
        Self { client_id, states: HashMap::new(), meta: HashMap::new(), outdated_timeout }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn outdated_timeout(&self) -> Duration {
        self.outdated_timeout
    }

    /// Interval at which [`Awareness::sweep`] should run.
    pub fn check_interval(&self) -> Duration {
        self.outdated_timeout / 10
    }

    pub fn states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    pub fn state(&self, client: ClientId) -> Option<&Value> {
        self.states.get(&client)
    }

    pub fn meta(&self, client: ClientId) -> Option<&ClientMeta> {
        self.meta.get(&client)
    }

    pub fn has_states(&self) -> bool {
        !self.states.is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.states.keys().copied().collect()
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id)
    }

    pub fn set_local_state(&mut self, state: Option<Value>, now: Instant) -> AwarenessChange {
        let id = self.client_id;
        let clock = self.meta.get(&id).map_or(0, |m| m.clock + 1);
        let prev = match state {
            Some(state) => self.states.insert(id, state),
            None => self.states.remove(&id),
        };
        self.meta.insert(id, ClientMeta { clock, last_updated: now });

        let mut change = AwarenessChange::default();
        match (prev.is_some(), self.states.contains_key(&id)) {
            (false, true) => change.added.push(id),
            (true, false) => change.removed.push(id),
            (true, true) => change.updated.push(id),
            (false, false) => {}
        }
        change
    }

    /// Merges an encoded update from a remote peer.
    pub fn apply_update(&mut self, update: &[u8], now: Instant) -> Result<AwarenessChange, ProtocolError> {
        let mut decoder = Decoder::new(update);
        let len = decoder.read_var_uint()?;
        let mut change = AwarenessChange::default();

        for _ in 0..len {
            let client = decoder.read_var_uint()?;
            let mut clock = decoder.read_var_uint()?;
            let raw = decoder.read_var_string()?;
            let state: Value = serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidAwarenessState(e.to_string()))?;

            let known = self.meta.get(&client).copied();
            let current_clock = known.map_or(0, |m| m.clock);
            let removal = state.is_null();
            let accept = current_clock < clock || (current_clock == clock && removal && self.states.contains_key(&client));
            if !accept {
                continue;
            }

            let prev = self.states.get(&client).cloned();
            if removal {
                if client == self.client_id && prev.is_some() {
                    // never drop our own entry because a peer says so; reassert instead
                    clock += 1;
                } else {
                    self.states.remove(&client);
                }
            } else {
                self.states.insert(client, state);
            }
            self.meta.insert(client, ClientMeta { clock, last_updated: now });

            let present = self.states.contains_key(&client);
            match (known.is_some(), present) {
                (false, true) => change.added.push(client),
                (true, false) => change.removed.push(client),
                (_, true) => change.updated.push(client),
                (false, false) => {}
            }
        }
        Ok(change)
    }

    /// Drops the given clients. Removing the local client bumps its clock.
    pub fn remove_states(&mut self, clients: &[ClientId], now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for &client in clients {
            if self.states.remove(&client).is_none() {
                continue;
            }
            if client == self.client_id {
                let clock = self.meta.get(&client).map_or(0, |m| m.clock + 1);
                self.meta.insert(client, ClientMeta { clock, last_updated: now });
            }
            change.removed.push(client);
        }
        change
    }

    /// Evicts outdated remote clients and renews the local entry.
    pub fn sweep(&mut self, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        let local = self.client_id;

        if let Some(state) = self.states.get(&local).cloned() {
            let stale = self.meta.get(&local).is_none_or(|m| now.duration_since(m.last_updated) >= self.outdated_timeout / 2);
            if stale {
                change = self.set_local_state(Some(state), now);
            }
        }

        let outdated: Vec<ClientId> = self
            .meta
            .iter()
            .filter(|(id, m)| **id != local && now.duration_since(m.last_updated) >= self.outdated_timeout && self.states.contains_key(id))
            .map(|(id, _)| *id)
            .collect();
        for client in outdated {
            self.states.remove(&client);
            change.removed.push(client);
        }
        change
    }

    /// Encodes `clients` that have metadata; unknown ids are skipped.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let known: Vec<(ClientId, u64)> = clients.iter().filter_map(|id| self.meta.get(id).map(|m| (*id, m.clock))).collect();
        let mut encoder = Encoder::new();
        encoder.write_var_uint(known.len() as u64);
        for (client, clock) in known {
            encoder.write_var_uint(client);
            encoder.write_var_uint(clock);
            let json = self.states.get(&client).map_or_else(|| "null".to_owned(), Value::to_string);
            encoder.write_var_string(&json);
        }
        encoder.into_vec()
    }
}
