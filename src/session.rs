//! One client's participation in one document.

use crate::hooks::{ConnectionConfig, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Alive since the last check; a new ping should go out.
    Ping,
    /// No pong since the last ping.
    TimedOut,
    Closed,
}

#[derive(Debug)]
pub struct Session<D> {
    pub document: D,
    pub context: Context,
    pub connection: ConnectionConfig,
    state: SessionState,
    pong_received: bool,
}

impl<D> Session<D> {
    pub fn new(document: D, context: Context, connection: ConnectionConfig) -> Self {
        Self { document, context, connection, state: SessionState::Open, pong_received: true }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn read_only(&self) -> bool {
        self.connection.read_only
    }

    pub fn pong(&mut self) {
        self.pong_received = true;
    }

    pub fn check(&mut self) -> Liveness {
        if self.state != SessionState::Open {
            return Liveness::Closed;
        }
        if !self.pong_received {
            return Liveness::TimedOut;
        }
        self.pong_received = false;
        Liveness::Ping
    }

    /// Returns false if the session was already closing; close runs at most once.
    pub fn begin_close(&mut self) -> bool {
        if self.state != SessionState::Open {
            return false;
        }
        self.state = SessionState::Closing;
        true
    }

    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
    }
}
