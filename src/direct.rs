//! Server-side sessions that edit a document without a transport.

use kameo::actor::ActorRef;
use kameo::error::SendError;
use std::sync::Arc;
use yrs::Doc;

use crate::actor::{AttachDirect, DetachDirect, DocActor, LoadContext, RequestDocument, Root, StoreContext, Transact};
use crate::actor::SERVER_SOCKET_ID;
use crate::error::{Error, Result};
use crate::hooks::{ConnectionConfig, Context, RequestInfo};

const ATTACH_ATTEMPTS: usize = 3;

/// Holds a document loaded for as long as it is connected.
///
/// Every [`transact`](Self::transact) stores the document right away; the
/// reference is released by [`disconnect`](Self::disconnect).
///
/// ```no_run
/// # async fn run(handle: collab_sync::Handle) -> collab_sync::Result<()> {
/// use yrs::{Text, Transact};
///
/// let mut connection = handle.open_direct_connection("notes", Default::default()).await?;
/// connection
///     .transact(|doc| {
///         let text = doc.get_or_insert_text("body");
///         text.push(&mut doc.transact_mut(), "appended by the server");
///     })
///     .await?;
/// connection.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct DirectConnection {
    document_name: Arc<str>,
    document: Option<ActorRef<DocActor>>,
    context: Context,
}

impl DirectConnection {
    pub(crate) async fn open(root: &ActorRef<Root>, document_name: Arc<str>, context: Context) -> Result<Self> {
        let mut last = Error::DocumentUnloaded(document_name.to_string());
        for _ in 0..ATTACH_ATTEMPTS {
            let load = LoadContext {
                socket_id: SERVER_SOCKET_ID.into(),
                request: Arc::new(RequestInfo::default()),
                connection: ConnectionConfig::default(),
                context: context.clone(),
            };
            let entry = root
                .ask(RequestDocument { name: Arc::clone(&document_name), load })
                .send()
                .await
                .map_err(|_| Error::ServerStopped)?;

            match entry.actor.ask(AttachDirect).send().await {
                Ok(_) => return Ok(Self { document_name, document: Some(entry.actor), context }),
                Err(SendError::HandlerError(e @ Error::DocumentUnloaded(_))) => last = e,
                Err(SendError::HandlerError(e)) => return Err(e),
                // a stopped actor is only worth replacing if its load went through
                Err(_) => {
                    if let Some(failure) = entry.failure() {
                        return Err(Error::Hook(failure));
                    }
                }
            }
        }
        Err(last)
    }

    pub fn document_name(&self) -> &str {
        &self.document_name
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_connected(&self) -> bool {
        self.document.is_some()
    }

    /// Runs `f` against the live document, relays the change to every session and stores it.
    pub async fn transact<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Doc) + Send + 'static,
    {
        let document = self.document.as_ref().ok_or(Error::DirectConnectionClosed)?;
        let msg = Transact { transaction: Box::new(f), context: self.context.clone() };
        match document.ask(msg).send().await {
            Ok(()) => Ok(()),
            Err(SendError::HandlerError(e)) => Err(e),
            Err(_) => Err(Error::DocumentUnloaded(self.document_name.to_string())),
        }
    }

    /// Releases the document. Calling it again does nothing.
    pub async fn disconnect(&mut self) {
        let Some(document) = self.document.take() else { return };
        let store = StoreContext { socket_id: SERVER_SOCKET_ID.into(), context: self.context.clone() };
        let _ = document.tell(DetachDirect(store)).send().await;
    }
}
