//! # collab-sync
//!
//! Multi-document Yjs sync server speaking the Hocuspocus wire protocol, with a
//! hook pipeline for authentication, persistence and custom messaging.
//!
//! ## Quick Start
//!
//! ```no_run
//! use collab_sync::{Configuration, Server};
//!
//! #[tokio::main]
//! async fn main() -> collab_sync::Result<()> {
//!     let configuration = Configuration::from_env()?;
//!     Server::new(configuration).listen().await
//! }
//! ```
//!
//! ## Custom Path
//!
//! ```no_run
//! use collab_sync::{Configuration, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Server::new(Configuration::default()).into_router_at("/sync");
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! ## With Persistence and Authentication
//!
//! ```no_run
//! use collab_sync::{
//!     Authenticate, Configuration, Extension, HookError, HookResult, OnAuthenticatePayload,
//!     OnLoadDocumentPayload, OnStoreDocumentPayload, Server, async_trait,
//! };
//! use std::sync::Arc;
//!
//! struct User(String);
//!
//! struct MyStorage;
//!
//! #[async_trait]
//! impl Extension for MyStorage {
//!     fn authenticator(&self) -> Option<&dyn Authenticate> {
//!         Some(self)
//!     }
//!
//!     async fn on_load_document(&self, p: OnLoadDocumentPayload<'_>) -> Result<Option<Vec<u8>>, HookError> {
//!         Ok(None) // load p.document_name from your storage
//!     }
//!
//!     async fn on_store_document(&self, p: OnStoreDocumentPayload<'_>) -> HookResult {
//!         println!("saving {} ({} bytes)", p.document_name, p.state.len());
//!         Ok(())
//!     }
//! }
//!
//! #[async_trait]
//! impl Authenticate for MyStorage {
//!     async fn on_authenticate(&self, p: OnAuthenticatePayload<'_>) -> HookResult {
//!         if p.token != "secret" {
//!             return Err(HookError::new("bad token").with_reason("invalid-token"));
//!         }
//!         p.context.insert(User("alice".into()));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> collab_sync::Result<()> {
//!     Server::with_extensions(Configuration::default(), vec![Arc::new(MyStorage)])
//!         .await?
//!         .listen()
//!         .await
//! }
//! ```
//!
//! ## Composing with Axum
//!
//! ```no_run
//! use collab_sync::{Configuration, Server};
//! use axum::{Router, routing::get};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(Configuration::default());
//!     let handle = server.handle();
//!
//!     let app = Router::new()
//!         .merge(server.into_router_at("/collab"))
//!         .route("/health", get(move || async move { format!("{} documents", handle.documents_count().await) }));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

mod actor;
pub mod awareness;
pub mod codec;
pub mod config;
mod debounce;
mod direct;
mod document;
mod error;
mod extensions;
mod hooks;
pub mod protocol;
mod receiver;
pub mod replica;
mod server;
mod session;
pub mod transport;

// Public API
pub use server::{Server, Handle};
pub use direct::DirectConnection;
pub use error::{Error, Result};
pub use config::{ConfigError, Configuration, ReplicaOptions};
pub use transport::{CloseEvent, Frame, Transport, TransportError};
pub use protocol::{IncomingMessage, MessageType, OutgoingMessage};
pub use hooks::{
    Authenticate, Extension, HookResult, HookError, Context, RequestInfo, ConnectionConfig, DEFAULT_PRIORITY,
    OnConfigurePayload, OnListenPayload, OnUpgradePayload, OnRequestPayload,
    OnConnectPayload, OnAuthenticatePayload, ConnectedPayload,
    OnLoadDocumentPayload, AfterLoadDocumentPayload,
    BeforeHandleMessagePayload, OnStatelessPayload, BeforeBroadcastStatelessPayload,
    OnChangePayload, OnStoreDocumentPayload, AfterStoreDocumentPayload,
    OnAwarenessUpdatePayload, OnDisconnectPayload, AfterUnloadDocumentPayload, OnDestroyPayload,
};

pub use axum;
pub use async_trait::async_trait;
pub use yrs;
