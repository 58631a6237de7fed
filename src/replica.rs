//! Thin contract over the yrs document: everything the server needs from a CRDT engine.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, Snapshot, StateVector, Transact, Update};

use crate::config::ReplicaOptions;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

/// Where an applied update came from. Broadcasts skip the originating session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin<'a> {
    /// A connected session, identified by its socket id.
    Session(&'a str),
    /// State supplied by an extension (load hooks).
    Hook,
    /// Server-side code: direct connections and the server handle.
    Local,
}

impl Origin<'_> {
    fn label(&self) -> &str {
        match self {
            Origin::Session(id) => id,
            Origin::Hook => "hook",
            Origin::Local => "local",
        }
    }
}

/// Clones share the underlying document.
#[derive(Clone)]
pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new(options: &ReplicaOptions) -> Self {
        let doc = Doc::with_options(Options { skip_gc: !options.gc, ..Options::default() });
        Self { doc }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Full state as a v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Update bringing a peer at `state_vector` up to date.
    pub fn diff_update(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    pub fn snapshot(&self) -> Snapshot {
        self.doc.transact().snapshot()
    }

    /// Applies `update`; returns whether the document changed.
    pub fn apply_update(&self, update: &[u8], origin: Origin<'_>) -> Result<bool, ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let before = self.snapshot();
        {
            let mut txn = self.doc.transact_mut_with(origin.label());
            txn.apply_update(update).map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        Ok(self.snapshot() != before)
    }

    /// Whether `update` carries nothing the current state lacks.
    pub fn snapshot_contains_update(&self, update: &[u8]) -> Result<bool, ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let scratch = Doc::with_options(Options { skip_gc: true, ..Options::default() });
        let current = Update::decode_v1(&self.encode_state()).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        {
            let mut txn = scratch.transact_mut();
            txn.apply_update(current).map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        let before = scratch.transact().snapshot();
        {
            let mut txn = scratch.transact_mut();
            txn.apply_update(update).map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        Ok(scratch.transact().snapshot() == before)
    }

    /// Runs `f` against the document and returns the resulting update if anything changed.
    pub fn transact<F>(&self, f: F) -> Option<Vec<u8>>
    where
        F: FnOnce(&Doc),
    {
        let before_sv = self.doc.transact().state_vector();
        let before = self.snapshot();
        f(&self.doc);
        if self.snapshot() == before {
            return None;
        }
        Some(self.doc.transact().encode_state_as_update_v1(&before_sv))
    }
}
