use async_trait::async_trait;
use axum::response::Response;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use yrs::Doc;

use crate::awareness::ClientId;
use crate::config::Configuration;
use crate::transport::CloseEvent;

pub type HookResult = Result<(), HookError>;

pub const DEFAULT_PRIORITY: i32 = 100;

/// Rejection raised by a hook.
///
/// `message` is logged; `code` and `reason` pick the close frame sent to the client.
/// An error without a message is a silent "stop here" signal and is not logged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookError {
    pub message: Option<String>,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: Some(message.into()), ..Self::default() }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_silent(&self) -> bool {
        self.message.is_none()
    }

    /// Close frame for this rejection, filling gaps from `fallback`.
    pub fn close_event(&self, fallback: CloseEvent) -> CloseEvent {
        CloseEvent::new(
            self.code.unwrap_or(fallback.code),
            self.reason.clone().map_or(fallback.reason, Into::into),
        )
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.reason) {
            (Some(message), _) => f.write_str(message),
            (None, Some(reason)) => f.write_str(reason),
            (None, None) => f.write_str("rejected"),
        }
    }
}

impl std::error::Error for HookError {}

impl From<&str> for HookError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HookError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Connection-scoped state shared between hooks.
#[derive(Default, Clone)]
pub struct Context(HashMap<TypeId, Arc<dyn Any + Send + Sync>>);

impl Context {
    pub fn insert<T: Send + Sync + 'static>(&mut self, val: T) {
        self.0.insert(TypeId::of::<T>(), Arc::new(val));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.0.get(&TypeId::of::<T>()).and_then(|arc| arc.downcast_ref())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.0.contains_key(&TypeId::of::<T>())
    }

    /// Entries of `other` win over existing ones.
    pub fn extend(&mut self, other: Context) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("entries", &self.0.len()).finish()
    }
}

/// HTTP request info captured at upgrade time.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
}

impl RequestInfo {
    pub fn new(headers: HashMap<String, String>, parameters: HashMap<String, String>) -> Self {
        Self { method: "GET".to_owned(), path: "/".to_owned(), headers, parameters }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

/// Per-session connection flags. Hooks may flip `read_only`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub read_only: bool,
    pub requires_authentication: bool,
    pub is_authenticated: bool,
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Clone, Copy)]
pub struct OnConfigurePayload<'a> {
    pub configuration: &'a Configuration,
    pub version: &'static str,
}

#[derive(Clone, Copy)]
pub struct OnListenPayload<'a> {
    pub configuration: &'a Configuration,
    pub port: u16,
}

#[derive(Clone, Copy)]
pub struct OnUpgradePayload<'a> {
    pub request: &'a RequestInfo,
}

/// Set `response` to answer the request yourself.
pub struct OnRequestPayload<'a> {
    pub request: &'a RequestInfo,
    pub response: &'a mut Option<Response>,
}

pub struct OnConnectPayload<'a> {
    pub document_name: &'a str,
    pub socket_id: &'a str,
    pub request: &'a RequestInfo,
    pub connection: &'a mut ConnectionConfig,
    pub context: &'a mut Context,
}

pub struct OnAuthenticatePayload<'a> {
    pub token: &'a str,
    pub document_name: &'a str,
    pub socket_id: &'a str,
    pub request: &'a RequestInfo,
    pub connection: &'a mut ConnectionConfig,
    pub context: &'a mut Context,
}

#[derive(Clone, Copy)]
pub struct ConnectedPayload<'a> {
    pub document_name: &'a str,
    pub socket_id: &'a str,
    pub request: &'a RequestInfo,
    pub connection: &'a ConnectionConfig,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct OnLoadDocumentPayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Doc,
    pub socket_id: &'a str,
    pub request: &'a RequestInfo,
    pub connection: &'a ConnectionConfig,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct AfterLoadDocumentPayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Doc,
    pub socket_id: &'a str,
    pub request: &'a RequestInfo,
    pub connection: &'a ConnectionConfig,
    pub context: &'a Context,
}

#[derive(Clone, Copy)]
pub struct BeforeHandleMessagePayload<'a> {
    pub document_name: &'a str,
    pub socket_id: &'a str,
    pub request: &'a RequestInfo,
    pub connection: &'a ConnectionConfig,
    pub context: &'a Context,
    pub update: &'a [u8],
}

/// Strings pushed to `responses` are sent back to the sender as stateless messages.
pub struct OnStatelessPayload<'a> {
    pub document_name: &'a str,
    pub socket_id: &'a str,
    pub context: &'a Context,
    pub payload: &'a str,
    pub responses: &'a mut Vec<String>,
}

#[derive(Clone, Copy)]
pub struct BeforeBroadcastStatelessPayload<'a> {
    pub document_name: &'a str,
    pub payload: &'a str,
}

#[derive(Clone, Copy)]
pub struct OnChangePayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Doc,
    /// `None` when the change came from server-side code or a load hook.
    pub socket_id: Option<&'a str>,
    pub context: &'a Context,
    pub update: &'a [u8],
    pub clients_count: usize,
}

#[derive(Clone, Copy)]
pub struct OnStoreDocumentPayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Doc,
    pub state: &'a [u8],
    pub socket_id: &'a str,
    pub context: &'a Context,
    pub clients_count: usize,
}

#[derive(Clone, Copy)]
pub struct AfterStoreDocumentPayload<'a> {
    pub document_name: &'a str,
    pub document: &'a Doc,
    pub socket_id: &'a str,
    pub context: &'a Context,
    pub clients_count: usize,
}

#[derive(Clone, Copy)]
pub struct OnAwarenessUpdatePayload<'a> {
    pub document_name: &'a str,
    pub added: &'a [ClientId],
    pub updated: &'a [ClientId],
    pub removed: &'a [ClientId],
    pub states: &'a HashMap<ClientId, Value>,
}

#[derive(Clone, Copy)]
pub struct OnDisconnectPayload<'a> {
    pub document_name: &'a str,
    pub socket_id: &'a str,
    pub request: &'a RequestInfo,
    pub context: &'a Context,
    pub clients_count: usize,
}

#[derive(Clone, Copy)]
pub struct AfterUnloadDocumentPayload<'a> {
    pub document_name: &'a str,
}

#[derive(Clone, Copy)]
pub struct OnDestroyPayload<'a> {
    pub configuration: &'a Configuration,
}

// ============================================================================
// Extension traits
// ============================================================================

#[async_trait]
pub trait Extension: Send + Sync {
    /// Higher runs first. Ties keep registration order.
    fn priority(&self) -> i32 { DEFAULT_PRIORITY }

    /// Return `Some(self)` to gate connections on [`Authenticate::on_authenticate`].
    fn authenticator(&self) -> Option<&dyn Authenticate> { None }

    async fn on_configure(&self, _payload: OnConfigurePayload<'_>) -> HookResult { Ok(()) }

    async fn on_listen(&self, _payload: OnListenPayload<'_>) -> HookResult { Ok(()) }

    /// Reject to refuse the WebSocket upgrade.
    async fn on_upgrade(&self, _payload: OnUpgradePayload<'_>) -> HookResult { Ok(()) }

    /// Plain HTTP requests. Reject silently after filling `response` to stop the chain.
    async fn on_request(&self, _payload: OnRequestPayload<'_>) -> HookResult { Ok(()) }

    /// First message for a document on a connection.
    async fn on_connect(&self, _payload: OnConnectPayload<'_>) -> HookResult { Ok(()) }

    /// Session established; queued messages were already replayed.
    async fn connected(&self, _payload: ConnectedPayload<'_>) -> HookResult { Ok(()) }

    /// Return `Some(update)` to merge persisted state into the fresh document.
    async fn on_load_document(&self, _payload: OnLoadDocumentPayload<'_>) -> Result<Option<Vec<u8>>, HookError> { Ok(None) }

    async fn after_load_document(&self, _payload: AfterLoadDocumentPayload<'_>) -> HookResult { Ok(()) }

    /// Runs before every message of an established session. Reject to close the session.
    async fn before_handle_message(&self, _payload: BeforeHandleMessagePayload<'_>) -> HookResult { Ok(()) }

    async fn before_broadcast_stateless(&self, _payload: BeforeBroadcastStatelessPayload<'_>) -> HookResult { Ok(()) }

    async fn on_stateless(&self, _payload: OnStatelessPayload<'_>) -> HookResult { Ok(()) }

    async fn on_change(&self, _payload: OnChangePayload<'_>) -> HookResult { Ok(()) }

    async fn on_store_document(&self, _payload: OnStoreDocumentPayload<'_>) -> HookResult { Ok(()) }

    async fn after_store_document(&self, _payload: AfterStoreDocumentPayload<'_>) -> HookResult { Ok(()) }

    async fn on_awareness_update(&self, _payload: OnAwarenessUpdatePayload<'_>) -> HookResult { Ok(()) }

    async fn on_disconnect(&self, _payload: OnDisconnectPayload<'_>) -> HookResult { Ok(()) }

    async fn after_unload_document(&self, _payload: AfterUnloadDocumentPayload<'_>) -> HookResult { Ok(()) }

    async fn on_destroy(&self, _payload: OnDestroyPayload<'_>) -> HookResult { Ok(()) }
}

/// Token check for a document. Use `context.insert()` to store user info.
#[async_trait]
pub trait Authenticate: Send + Sync {
    async fn on_authenticate(&self, payload: OnAuthenticatePayload<'_>) -> HookResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_event_fallbacks() {
        let e = HookError::new("nope");
        assert_eq!(e.close_event(CloseEvent::FORBIDDEN), CloseEvent::FORBIDDEN);

        let e = HookError::silent().with_code(4000).with_reason("custom");
        assert_eq!(e.close_event(CloseEvent::FORBIDDEN), CloseEvent::new(4000, "custom"));
        assert!(e.is_silent());
        assert_eq!(e.to_string(), "custom");
    }

    #[test]
    fn test_context_extend_overwrites() {
        #[derive(Debug, PartialEq)]
        struct User(&'static str);

        let mut base = Context::default();
        base.insert(User("anon"));
        base.insert(7u32);
        let mut extra = Context::default();
        extra.insert(User("ada"));
        base.extend(extra);

        assert_eq!(base.get::<User>(), Some(&User("ada")));
        assert_eq!(base.get::<u32>(), Some(&7));
        assert_eq!(base.len(), 2);
        assert!(!base.contains::<String>());
    }

    #[test]
    fn test_request_header_lookup_is_case_insensitive() {
        let headers = HashMap::from([("x-user".to_owned(), "ada".to_owned())]);
        let request = RequestInfo::new(headers, HashMap::new());
        assert_eq!(request.header("X-User"), Some("ada"));
        assert_eq!(request.parameter("token"), None);
    }
}
