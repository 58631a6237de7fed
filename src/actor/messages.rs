use bytes::Bytes;
use kameo::actor::{ActorId, ActorRef};
use kameo::error::Infallible;
use kameo::reply::{Reply, ReplyError};
use std::sync::{Arc, OnceLock};
use yrs::Doc;

use crate::actor::client::ClientActor;
use crate::actor::document::DocActor;
use crate::hooks::{ConnectionConfig, Context, HookError, HookResult, RequestInfo};
use crate::transport::{CloseEvent, Outbox, Transport};

// ============================================================================
// Root
// ============================================================================

pub struct CreateClient {
    pub transport: Transport,
    pub request: RequestInfo,
    pub context: Context,
}

/// Get-or-create; a new document starts loading with `load` as the hook payload.
pub struct RequestDocument {
    pub name: Arc<str>,
    pub load: LoadContext,
}

/// Reply to [`RequestDocument`]: the actor plus the outcome of its load.
#[derive(Clone)]
pub struct DocumentEntry {
    pub actor: ActorRef<DocActor>,
    pub failure: Arc<OnceLock<HookError>>,
}

impl DocumentEntry {
    /// Set once the load hooks rejected the document.
    pub fn failure(&self) -> Option<HookError> {
        self.failure.get().cloned()
    }
}

impl Reply for DocumentEntry {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> { Ok(self) }
    fn into_any_err(self) -> Option<Box<dyn ReplyError>> { None }
    fn into_value(self) -> Self::Value { self }
}

pub struct GetDocument(pub Arc<str>);

pub struct ListDocuments;

pub struct ListClients;

pub struct DocumentUnloaded {
    pub name: Arc<str>,
    pub id: ActorId,
}

// ============================================================================
// Document
// ============================================================================

/// Who triggered a load; forwarded to the load hooks.
#[derive(Clone)]
pub struct LoadContext {
    pub socket_id: Arc<str>,
    pub request: Arc<RequestInfo>,
    pub connection: ConnectionConfig,
    pub context: Context,
}

/// Who triggered a store; forwarded to the store hooks.
#[derive(Clone)]
pub struct StoreContext {
    pub socket_id: Arc<str>,
    pub context: Context,
}

pub struct LoadDocument(pub LoadContext);

/// The load hooks returned; sent by the task running them.
pub struct LoadFinished {
    pub load: LoadContext,
    pub result: HookResult,
}

pub struct AttachClient {
    pub client: ActorRef<ClientActor>,
    pub socket_id: Arc<str>,
    pub outbox: Outbox,
    pub read_only: bool,
    pub context: Context,
    pub request: Arc<RequestInfo>,
}

pub struct DetachClient {
    pub socket_id: Arc<str>,
    pub client: ActorRef<ClientActor>,
}

/// Sent after a session closed; stores or unloads once nothing is attached.
pub struct ReleaseDocument(pub StoreContext);

pub struct AttachDirect;

pub struct DetachDirect(pub StoreContext);

pub type Transaction = Box<dyn FnOnce(&Doc) + Send>;

pub struct Transact {
    pub transaction: Transaction,
    pub context: Context,
}

pub struct IncomingData {
    pub socket_id: Arc<str>,
    pub data: Bytes,
}

/// Headless dispatch; replies are returned instead of sent.
pub struct ReceiveMessage(pub Bytes);

pub struct StoreDocument(pub StoreContext);

pub struct CloseConnections(pub CloseEvent);

pub struct BroadcastStateless(pub String);

pub struct SweepAwareness;

pub struct IdleShutdown;

pub struct GetConnectionsCount;

pub struct EncodeState;

// ============================================================================
// Client
// ============================================================================

/// `event: None` closes without a close frame payload.
pub struct CloseSession {
    pub document_name: Arc<str>,
    pub event: Option<CloseEvent>,
}

pub struct CloseTransport(pub Option<CloseEvent>);

pub struct IdleTimeout;

pub struct CheckLiveness;
