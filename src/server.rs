use axum::{
    Router,
    extract::{OriginalUri, Query, State, ws::WebSocketUpgrade},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use kameo::actor::{ActorRef, Spawn};
use kameo::error::SendError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::actor::{
    BroadcastStateless, CloseConnections, CloseTransport, CreateClient, EncodeState, GetConnectionsCount, GetDocument, ListClients,
    ListDocuments, ReceiveMessage, Root, RootArgs, SERVER_SOCKET_ID, StoreContext, StoreDocument,
};
use crate::config::Configuration;
use crate::direct::DirectConnection;
use crate::error::{Error, Result};
use crate::extensions::Extensions;
use crate::hooks::{Context, Extension, RequestInfo};
use crate::protocol::IncomingMessage;
use crate::transport::{CloseEvent, Transport};

/// Collaborative sync server.
///
/// # Flexible mounting
/// ```no_run
/// use collab_sync::{Configuration, Server};
/// use axum::Router;
///
/// # async fn run() {
/// // Option 1: default router, WebSocket on `/`
/// let app = Server::new(Configuration::default()).into_router();
///
/// // Option 2: custom path
/// let app = Server::new(Configuration::default()).into_router_at("/sync");
///
/// // Option 3: compose with other routes
/// let server = Server::new(Configuration::default());
/// let handle = server.handle();
/// let app = Router::new()
///     .merge(server.into_router_at("/collab"))
///     .route("/api/save/{doc}", axum::routing::post(move |path: axum::extract::Path<String>| {
///         let h = handle.clone();
///         async move { h.persist_document(&path).await; "ok" }
///     }));
/// # }
/// ```
pub struct Server {
    handle: Handle,
}

/// Cheap, clonable access to a running server from HTTP handlers or background tasks.
#[derive(Clone)]
pub struct Handle {
    root: ActorRef<Root>,
    extensions: Arc<Extensions>,
    configuration: Arc<Configuration>,
}

impl Handle {
    async fn documents(&self) -> Vec<ActorRef<crate::actor::DocActor>> {
        self.root.ask(ListDocuments).send().await.unwrap_or_default()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Number of loaded documents.
    pub async fn documents_count(&self) -> usize {
        self.documents().await.len()
    }

    /// Sessions plus direct connections across every loaded document.
    pub async fn connections_count(&self) -> usize {
        let mut total = 0;
        for doc in self.documents().await {
            total += doc.ask(GetConnectionsCount).send().await.unwrap_or(0);
        }
        total
    }

    /// Closes every session of `document_name`, or of all documents, with `ResetConnection`.
    pub async fn close_connections(&self, document_name: Option<&str>) {
        let documents: Vec<_> = match document_name {
            Some(name) => self.root.ask(GetDocument(name.into())).send().await.ok().flatten().into_iter().collect(),
            None => self.documents().await,
        };
        for doc in documents {
            let _ = doc.tell(CloseConnections(CloseEvent::RESET_CONNECTION)).send().await;
        }
    }

    /// Sends a stateless payload to every session of a loaded document. Returns false if it is not loaded.
    pub async fn broadcast_stateless(&self, document_name: &str, payload: impl Into<String>) -> bool {
        let Some(doc) = self.root.ask(GetDocument(document_name.into())).send().await.ok().flatten() else {
            return false;
        };
        doc.tell(BroadcastStateless(payload.into())).send().await.is_ok()
    }

    /// Full state of a loaded document as a v1 update.
    pub async fn document_state(&self, document_name: &str) -> Option<Vec<u8>> {
        let doc = self.root.ask(GetDocument(document_name.into())).send().await.ok().flatten()?;
        doc.ask(EncodeState).send().await.ok()
    }

    /// Stores a loaded document now; it unloads afterwards if nothing is attached.
    pub async fn persist_document(&self, document_name: &str) -> bool {
        let Some(doc) = self.root.ask(GetDocument(document_name.into())).send().await.ok().flatten() else {
            return false;
        };
        let store = StoreContext { socket_id: SERVER_SOCKET_ID.into(), context: Context::default() };
        doc.ask(StoreDocument(store)).send().await.is_ok()
    }

    /// Dispatches a protocol message to a loaded document without a session.
    ///
    /// Replies the document would send back (sync step 2, presence) are returned.
    pub async fn receive_message(&self, data: impl Into<Bytes>) -> Result<Vec<Bytes>> {
        let data = data.into();
        let name = IncomingMessage::decode(&data)?.document_name().to_owned();
        let doc = self
            .root
            .ask(GetDocument(name.as_str().into()))
            .send()
            .await
            .map_err(|_| Error::ServerStopped)?
            .ok_or_else(|| Error::DocumentUnloaded(name.clone()))?;
        match doc.ask(ReceiveMessage(data)).send().await {
            Ok(replies) => Ok(replies),
            Err(SendError::HandlerError(e)) => Err(e),
            Err(_) => Err(Error::DocumentUnloaded(name)),
        }
    }

    /// Serves a transport that did not come through the built-in router.
    pub async fn handle_connection(&self, transport: Transport, request: RequestInfo, context: Context) -> Result<()> {
        self.root.ask(CreateClient { transport, request, context }).send().await.map_err(|_| Error::ServerStopped)?;
        Ok(())
    }

    /// Loads `document_name` if needed and keeps it loaded until the connection disconnects.
    pub async fn open_direct_connection(&self, document_name: &str, context: Context) -> Result<DirectConnection> {
        DirectConnection::open(&self.root, document_name.into(), context).await
    }

    /// Closes every transport, then runs `onDestroy`.
    pub async fn destroy(&self) {
        let clients = self.root.ask(ListClients).send().await.unwrap_or_default();
        for client in clients {
            let _ = client.tell(CloseTransport(Some(CloseEvent::RESET_CONNECTION))).send().await;
        }
        let _ = self.extensions.destroy(&self.configuration).await;
    }
}

impl Server {
    /// A server without extensions.
    pub fn new(configuration: Configuration) -> Self {
        Self::spawn(configuration, Extensions::default())
    }

    /// Registers `extensions` in priority order and runs their `onConfigure` hooks.
    pub async fn with_extensions(configuration: Configuration, extensions: Vec<Arc<dyn Extension>>) -> Result<Self> {
        let extensions = Extensions::new(extensions);
        extensions.configure(&configuration).await?;
        Ok(Self::spawn(configuration, extensions))
    }

    fn spawn(configuration: Configuration, extensions: Extensions) -> Self {
        let extensions = Arc::new(extensions);
        let configuration = Arc::new(configuration);
        let root = Root::spawn(RootArgs { extensions: Arc::clone(&extensions), configuration: Arc::clone(&configuration) });
        Self { handle: Handle { root, extensions, configuration } }
    }

    /// Get a handle for use in other HTTP handlers
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Router with the WebSocket endpoint at `/`; other requests go to `onRequest`.
    pub fn into_router(self) -> Router {
        self.into_router_at("/")
    }

    /// Router with the WebSocket endpoint at a custom path
    pub fn into_router_at(self, path: &str) -> Router {
        Router::new().route(path, get(ws_handler)).fallback(request_handler).with_state(self.handle)
    }

    /// Binds `address:port`, runs `onListen` and serves until the listener fails.
    pub async fn listen(self) -> Result<()> {
        let configuration = Arc::clone(&self.handle.configuration);
        let extensions = Arc::clone(&self.handle.extensions);
        let listener = tokio::net::TcpListener::bind(configuration.socket_addr()).await?;
        let port = listener.local_addr()?.port();
        extensions.listen(&configuration, port).await?;
        if !configuration.quiet {
            info!(name = configuration.name.as_deref().unwrap_or("collab-sync"), address = %configuration.address, port, "listening");
        }
        axum::serve(listener, self.into_router()).await?;
        Ok(())
    }
}

fn request_info(method: &Method, uri: &OriginalUri, headers: &HeaderMap, parameters: HashMap<String, String>) -> RequestInfo {
    let headers = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
        .collect();
    RequestInfo { method: method.to_string(), path: uri.0.path().to_owned(), headers, parameters }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(handle): State<Handle>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    Query(parameters): Query<HashMap<String, String>>,
) -> Response {
    let request = request_info(&method, &uri, &headers, parameters);
    if handle.extensions.upgrade(&request).await.is_err() {
        debug!(path = %request.path, "upgrade rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let _ = handle.handle_connection(Transport::from_websocket(socket), request, Context::default()).await;
    })
}

async fn request_handler(
    State(handle): State<Handle>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    Query(parameters): Query<HashMap<String, String>>,
) -> Response {
    let request = request_info(&method, &uri, &headers, parameters);
    let mut response = None;
    // a rejecting hook may still have supplied the response
    let _ = handle.extensions.request(&request, &mut response).await;
    response.unwrap_or_else(|| (StatusCode::OK, "OK").into_response())
}
