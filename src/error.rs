use crate::codec::ProtocolError;
use crate::config::ConfigError;
use crate::hooks::HookError;
use crate::replica::ReplicaError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("document `{0}` was unloaded")]
    DocumentUnloaded(String),
    #[error("document `{0}` is still loading")]
    DocumentLoading(String),
    #[error("direct connection was closed")]
    DirectConnectionClosed,
    #[error("server is not running")]
    ServerStopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
