//! Ordered hook pipeline.
//!
//! Extensions run one after another, highest priority first. The first rejection stops
//! the chain and is returned to the caller; rejections carrying a message are logged.

use axum::response::Response;
use std::sync::Arc;
use tracing::error;

use crate::config::Configuration;
use crate::hooks::*;
use crate::replica::{Origin, Replica};

#[derive(Clone, Default)]
pub struct Extensions {
    list: Vec<Arc<dyn Extension>>,
}

fn report(hook: &'static str, err: HookError) -> HookError {
    if let Some(message) = &err.message {
        error!(hook, "{message}");
    }
    err
}

impl Extensions {
    pub fn new(mut list: Vec<Arc<dyn Extension>>) -> Self {
        // stable: equal priorities keep registration order
        list.sort_by_key(|ext| std::cmp::Reverse(ext.priority()));
        Self { list }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn requires_authentication(&self) -> bool {
        self.list.iter().any(|ext| ext.authenticator().is_some())
    }

    pub async fn configure(&self, configuration: &Configuration) -> HookResult {
        for ext in &self.list {
            ext.on_configure(OnConfigurePayload { configuration, version: env!("CARGO_PKG_VERSION") })
                .await
                .map_err(|e| report("onConfigure", e))?;
        }
        Ok(())
    }

    pub async fn listen(&self, configuration: &Configuration, port: u16) -> HookResult {
        for ext in &self.list {
            ext.on_listen(OnListenPayload { configuration, port }).await.map_err(|e| report("onListen", e))?;
        }
        Ok(())
    }

    pub async fn upgrade(&self, request: &RequestInfo) -> HookResult {
        for ext in &self.list {
            ext.on_upgrade(OnUpgradePayload { request }).await.map_err(|e| report("onUpgrade", e))?;
        }
        Ok(())
    }

    pub async fn request(&self, request: &RequestInfo, response: &mut Option<Response>) -> HookResult {
        for ext in &self.list {
            ext.on_request(OnRequestPayload { request, response: &mut *response }).await.map_err(|e| report("onRequest", e))?;
        }
        Ok(())
    }

    pub async fn connect(
        &self,
        document_name: &str,
        socket_id: &str,
        request: &RequestInfo,
        connection: &mut ConnectionConfig,
        context: &mut Context,
    ) -> HookResult {
        for ext in &self.list {
            let payload = OnConnectPayload { document_name, socket_id, request, connection: &mut *connection, context: &mut *context };
            ext.on_connect(payload).await.map_err(|e| report("onConnect", e))?;
        }
        Ok(())
    }

    /// Runs every extension that exposes an authenticator.
    pub async fn authenticate(
        &self,
        token: &str,
        document_name: &str,
        socket_id: &str,
        request: &RequestInfo,
        connection: &mut ConnectionConfig,
        context: &mut Context,
    ) -> HookResult {
        for ext in &self.list {
            let Some(auth) = ext.authenticator() else { continue };
            let payload = OnAuthenticatePayload { token, document_name, socket_id, request, connection: &mut *connection, context: &mut *context };
            auth.on_authenticate(payload).await.map_err(|e| report("onAuthenticate", e))?;
        }
        Ok(())
    }

    pub async fn connected(&self, payload: ConnectedPayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.connected(payload).await.map_err(|e| report("connected", e))?;
        }
        Ok(())
    }

    /// Applies every state returned by a load hook before calling the next one.
    pub async fn load_document(&self, payload: OnLoadDocumentPayload<'_>, replica: &Replica) -> HookResult {
        for ext in &self.list {
            let state = ext.on_load_document(payload).await.map_err(|e| report("onLoadDocument", e))?;
            if let Some(state) = state {
                replica
                    .apply_update(&state, Origin::Hook)
                    .map_err(|e| report("onLoadDocument", HookError::new(format!("loaded state for `{}` was rejected: {e}", payload.document_name))))?;
            }
        }
        Ok(())
    }

    pub async fn after_load_document(&self, payload: AfterLoadDocumentPayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.after_load_document(payload).await.map_err(|e| report("afterLoadDocument", e))?;
        }
        Ok(())
    }

    pub async fn before_handle_message(&self, payload: BeforeHandleMessagePayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.before_handle_message(payload).await.map_err(|e| report("beforeHandleMessage", e))?;
        }
        Ok(())
    }

    pub async fn before_broadcast_stateless(&self, payload: BeforeBroadcastStatelessPayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.before_broadcast_stateless(payload).await.map_err(|e| report("beforeBroadcastStateless", e))?;
        }
        Ok(())
    }

    /// Returns the responses collected from every extension.
    pub async fn stateless(&self, document_name: &str, socket_id: &str, context: &Context, payload: &str) -> Result<Vec<String>, HookError> {
        let mut responses = Vec::new();
        for ext in &self.list {
            let hook = OnStatelessPayload { document_name, socket_id, context, payload, responses: &mut responses };
            ext.on_stateless(hook).await.map_err(|e| report("onStateless", e))?;
        }
        Ok(responses)
    }

    pub async fn change(&self, payload: OnChangePayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.on_change(payload).await.map_err(|e| report("onChange", e))?;
        }
        Ok(())
    }

    pub async fn store_document(&self, payload: OnStoreDocumentPayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.on_store_document(payload).await.map_err(|e| report("onStoreDocument", e))?;
        }
        Ok(())
    }

    pub async fn after_store_document(&self, payload: AfterStoreDocumentPayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.after_store_document(payload).await.map_err(|e| report("afterStoreDocument", e))?;
        }
        Ok(())
    }

    pub async fn awareness_update(&self, payload: OnAwarenessUpdatePayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.on_awareness_update(payload).await.map_err(|e| report("onAwarenessUpdate", e))?;
        }
        Ok(())
    }

    pub async fn disconnect(&self, payload: OnDisconnectPayload<'_>) -> HookResult {
        for ext in &self.list {
            ext.on_disconnect(payload).await.map_err(|e| report("onDisconnect", e))?;
        }
        Ok(())
    }

    pub async fn after_unload_document(&self, document_name: &str) -> HookResult {
        for ext in &self.list {
            ext.after_unload_document(AfterUnloadDocumentPayload { document_name }).await.map_err(|e| report("afterUnloadDocument", e))?;
        }
        Ok(())
    }

    pub async fn destroy(&self, configuration: &Configuration) -> HookResult {
        for ext in &self.list {
            ext.on_destroy(OnDestroyPayload { configuration }).await.map_err(|e| report("onDestroy", e))?;
        }
        Ok(())
    }
}
