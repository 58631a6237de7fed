use kameo::{
    actor::{Actor, ActorId, ActorRef, WeakActorRef},
    error::{ActorStopReason, Infallible, SendError},
    message::{Context as KameoContext, Message, StreamMessage},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, warn};

use crate::actor::document::DocActor;
use crate::actor::messages::{
    AttachClient, CheckLiveness, CloseSession, CloseTransport, DetachClient, IdleTimeout, IncomingData, LoadContext, ReleaseDocument,
    RequestDocument, StoreContext,
};
use crate::actor::root::Root;
use crate::codec::ProtocolError;
use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::extensions::Extensions;
use crate::hooks::{BeforeHandleMessagePayload, ConnectedPayload, ConnectionConfig, Context, OnDisconnectPayload, RequestInfo};
use crate::protocol::{IncomingMessage, MessageType, OutgoingMessage};
use crate::session::{Liveness, Session};
use crate::transport::{CloseEvent, Frame, Outbox, Transport, TransportError};

/// A document can unload between lookup and attach; ask the root again this many times.
const ATTACH_ATTEMPTS: usize = 3;

/// Hook state for a document whose handshake has not finished.
struct Pending {
    queue: Vec<Bytes>,
    context: Context,
    connection: ConnectionConfig,
}

enum Slot {
    Pending(Pending),
    /// Handshake done; waiting for the document to load and accept the session.
    Attaching(Pending),
    Established(Session<ActorRef<DocActor>>),
    /// Authentication failed; further messages for the name are dropped.
    Denied,
}

pub struct ClientActorArgs {
    pub transport: Transport,
    pub request: Arc<RequestInfo>,
    pub default_context: Context,
    pub root: ActorRef<Root>,
    pub extensions: Arc<Extensions>,
    pub configuration: Arc<Configuration>,
}

/// One transport, multiplexing any number of document sessions.
pub struct ClientActor {
    socket_id: Arc<str>,
    outbox: Outbox,
    documents: HashMap<Arc<str>, Slot>,
    established_once: bool,
    closing: bool,
    root: ActorRef<Root>,
    extensions: Arc<Extensions>,
    request: Arc<RequestInfo>,
    default_context: Context,
    idle_timer: Option<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
}

/// A linked document stopped; its sessions are gone.
struct DocumentGone(ActorId);

/// Outcome of the attach started by `establish`.
struct Attached {
    name: Arc<str>,
    result: Result<ActorRef<DocActor>>,
}

fn read_token(data: &[u8]) -> Result<String, ProtocolError> {
    let mut message = IncomingMessage::decode(data)?;
    message.message_type()?;
    Ok(message.read_token()?.to_owned())
}

/// Looks the document up and joins it. A document can unload between lookup and attach.
async fn attach(root: ActorRef<Root>, name: Arc<str>, load: LoadContext, client: ActorRef<ClientActor>, outbox: Outbox) -> Result<ActorRef<DocActor>> {
    let mut last = Error::DocumentUnloaded(name.to_string());
    for _ in 0..ATTACH_ATTEMPTS {
        let entry = root
            .ask(RequestDocument { name: Arc::clone(&name), load: load.clone() })
            .send()
            .await
            .map_err(|_| Error::ServerStopped)?;

        let msg = AttachClient {
            client: client.clone(),
            socket_id: Arc::clone(&load.socket_id),
            outbox: outbox.clone(),
            read_only: load.connection.read_only,
            context: load.context.clone(),
            request: Arc::clone(&load.request),
        };
        match entry.actor.ask(msg).send().await {
            Ok(_) => return Ok(entry.actor),
            Err(SendError::HandlerError(e @ Error::DocumentUnloaded(_))) => last = e,
            Err(SendError::HandlerError(e)) => return Err(e),
            // stopped between lookup and attach; a rejected load is final
            Err(_) => {
                if let Some(failure) = entry.failure() {
                    return Err(Error::Hook(failure));
                }
            }
        }
    }
    Err(last)
}

impl ClientActor {
    fn has_established(&self) -> bool {
        self.documents.values().any(|slot| matches!(slot, Slot::Established(_)))
    }

    fn stop_timers(&mut self) {
        for timer in [self.idle_timer.take(), self.liveness.take()].into_iter().flatten() {
            timer.abort();
        }
    }

    async fn receive(&mut self, data: Bytes, me: &ActorRef<Self>) {
        let (name, is_auth) = match IncomingMessage::decode(&data) {
            Ok(message) => (Arc::<str>::from(message.document_name()), message.raw_type() == MessageType::Auth as u64),
            Err(e) => {
                warn!(socket = %self.socket_id, "undecodable frame: {e}");
                self.close_transport(Some(CloseEvent::UNAUTHORIZED), me).await;
                return;
            }
        };

        match self.documents.get_mut(&name) {
            Some(Slot::Established(_)) => self.dispatch(name, data, me).await,
            Some(Slot::Pending(_)) if is_auth => self.authenticate(name, data, me).await,
            Some(Slot::Pending(pending) | Slot::Attaching(pending)) => pending.queue.push(data),
            Some(Slot::Denied) => {}
            None => self.open_document(name, data, is_auth, me).await,
        }
    }

    /// First message for a document: run `onConnect`, then wait for a token if one is needed.
    async fn open_document(&mut self, name: Arc<str>, data: Bytes, is_auth: bool, me: &ActorRef<Self>) {
        let mut connection = ConnectionConfig { requires_authentication: self.extensions.requires_authentication(), ..ConnectionConfig::default() };
        let mut context = self.default_context.clone();
        if let Err(e) = self.extensions.connect(&name, &self.socket_id, &self.request, &mut connection, &mut context).await {
            debug!(document = %name, socket = %self.socket_id, "connection rejected");
            self.close_transport(Some(e.close_event(CloseEvent::FORBIDDEN)), me).await;
            return;
        }

        let requires_authentication = connection.requires_authentication;
        self.documents.insert(Arc::clone(&name), Slot::Pending(Pending { queue: Vec::new(), context, connection }));
        if is_auth {
            self.authenticate(name, data, me).await;
            return;
        }
        if let Some(Slot::Pending(pending)) = self.documents.get_mut(&name) {
            pending.queue.push(data);
        }
        if !requires_authentication {
            self.establish(name, me);
        }
    }

    async fn authenticate(&mut self, name: Arc<str>, data: Bytes, me: &ActorRef<Self>) {
        let token = match read_token(&data) {
            Ok(token) => token,
            Err(e) => {
                warn!(document = %name, socket = %self.socket_id, "bad auth message: {e}");
                self.close_transport(Some(CloseEvent::UNAUTHORIZED), me).await;
                return;
            }
        };
        let Some(Slot::Pending(pending)) = self.documents.get_mut(&name) else { return };

        let result = self
            .extensions
            .authenticate(&token, &name, &self.socket_id, &self.request, &mut pending.connection, &mut pending.context)
            .await;

        match result {
            Ok(()) => {
                pending.connection.is_authenticated = true;
                let read_only = pending.connection.read_only;
                self.outbox.send(OutgoingMessage::new(&name).authenticated(read_only).into_bytes());
                self.establish(name, me);
            }
            Err(e) => {
                debug!(document = %name, socket = %self.socket_id, "authentication failed");
                let reason = e.reason.as_deref().unwrap_or("permission-denied");
                self.outbox.send(OutgoingMessage::new(&name).permission_denied(reason).into_bytes());
                self.documents.insert(name, Slot::Denied);
                if !self.has_established() {
                    self.close_transport(Some(e.close_event(CloseEvent::FORBIDDEN)), me).await;
                }
            }
        }
    }

    /// Starts attaching in the background so the transport stays responsive while the document loads.
    fn establish(&mut self, name: Arc<str>, me: &ActorRef<Self>) {
        let Some(Slot::Pending(pending)) = self.documents.remove(&name) else { return };
        self.established_once = true;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }

        let load = LoadContext {
            socket_id: Arc::clone(&self.socket_id),
            request: Arc::clone(&self.request),
            connection: pending.connection,
            context: pending.context.clone(),
        };
        let attaching = attach(self.root.clone(), Arc::clone(&name), load, me.clone(), self.outbox.clone());
        let me = me.clone();
        let document = Arc::clone(&name);
        tokio::spawn(async move {
            let result = attaching.await;
            let _ = me.tell(Attached { name: document, result }).send().await;
        });
        self.documents.insert(name, Slot::Attaching(pending));
    }

    async fn dispatch(&mut self, name: Arc<str>, data: Bytes, me: &ActorRef<Self>) {
        let Some(Slot::Established(session)) = self.documents.get(&name) else { return };
        if !session.is_open() {
            return;
        }
        let payload = BeforeHandleMessagePayload {
            document_name: &name,
            socket_id: &self.socket_id,
            request: &self.request,
            connection: &session.connection,
            context: &session.context,
            update: &data,
        };
        if let Err(e) = self.extensions.before_handle_message(payload).await {
            self.close_session(name, Some(e.close_event(CloseEvent::FORBIDDEN)), me).await;
            return;
        }
        let doc = session.document.clone();
        let _ = doc.tell(IncomingData { socket_id: Arc::clone(&self.socket_id), data }).send().await;
    }

    /// Detaches one established session. Returns false if there was none to close.
    async fn end_session(&mut self, name: &Arc<str>, me: &ActorRef<Self>) -> bool {
        if !matches!(self.documents.get(name), Some(Slot::Established(_))) {
            return false;
        }
        let Some(Slot::Established(mut session)) = self.documents.remove(name) else { return false };
        if !session.begin_close() {
            return false;
        }

        let detach = DetachClient { socket_id: Arc::clone(&self.socket_id), client: me.clone() };
        let clients_count = session.document.ask(detach).send().await.unwrap_or(0);
        let payload = OnDisconnectPayload {
            document_name: name,
            socket_id: &self.socket_id,
            request: &self.request,
            context: &session.context,
            clients_count,
        };
        let _ = self.extensions.disconnect(payload).await;
        let store = StoreContext { socket_id: Arc::clone(&self.socket_id), context: session.context.clone() };
        let _ = session.document.tell(ReleaseDocument(store)).send().await;
        session.finish_close();
        debug!(document = %name, socket = %self.socket_id, "session closed");
        true
    }

    /// Closes one session; the transport follows once no other session is established.
    async fn close_session(&mut self, name: Arc<str>, event: Option<CloseEvent>, me: &ActorRef<Self>) {
        if self.end_session(&name, me).await && !self.closing && !self.has_established() {
            self.close_transport(event, me).await;
        }
    }

    async fn close_transport(&mut self, event: Option<CloseEvent>, me: &ActorRef<Self>) {
        if self.closing {
            return;
        }
        self.closing = true;
        let names: Vec<Arc<str>> = self.documents.keys().cloned().collect();
        for name in &names {
            self.end_session(name, me).await;
        }
        self.documents.clear();
        self.stop_timers();
        self.outbox.close(event);
        me.kill();
    }
}

impl Actor for ClientActor {
    type Args = ClientActorArgs;
    type Error = Infallible;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let (sink, stream) = args.transport.into_parts();
        let outbox = Outbox::spawn(sink);
        actor_ref.attach_stream(stream, (), "transport");

        let timeout = args.configuration.timeout;
        let weak = actor_ref.downgrade();
        let idle_timer = tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(me) = weak.upgrade() {
                let _ = me.tell(IdleTimeout).send().await;
            }
        });

        let weak = actor_ref.downgrade();
        let liveness = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + timeout, timeout);
            loop {
                ticker.tick().await;
                let Some(me) = weak.upgrade() else { break };
                if me.tell(CheckLiveness).send().await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            socket_id: uuid::Uuid::new_v4().to_string().into(),
            outbox,
            documents: HashMap::new(),
            established_once: false,
            closing: false,
            root: args.root,
            extensions: args.extensions,
            request: args.request,
            default_context: args.default_context,
            idle_timer: Some(idle_timer),
            liveness: Some(liveness),
        })
    }

    fn on_link_died(&mut self, actor_ref: WeakActorRef<Self>, id: ActorId, _: ActorStopReason) -> impl Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send {
        let attached = self.documents.values().any(|slot| matches!(slot, Slot::Established(s) if s.document.id() == id));
        async move {
            if let (true, Some(me)) = (attached, actor_ref.upgrade()) {
                tokio::spawn(async move {
                    let _ = me.tell(DocumentGone(id)).send().await;
                });
            }
            Ok(ControlFlow::Continue(()))
        }
    }
}

impl Message<StreamMessage<Result<Frame, TransportError>, (), &'static str>> for ClientActor {
    type Reply = ();

    async fn handle(&mut self, msg: StreamMessage<Result<Frame, TransportError>, (), &'static str>, ctx: &mut KameoContext<Self, Self::Reply>) {
        match msg {
            StreamMessage::Next(Ok(Frame::Binary(data))) => self.receive(data, ctx.actor_ref()).await,
            StreamMessage::Next(Ok(Frame::Ping(data))) => {
                if !self.outbox.pong(data) {
                    self.close_transport(None, ctx.actor_ref()).await;
                }
            }
            StreamMessage::Next(Ok(Frame::Pong(_))) => {
                for slot in self.documents.values_mut() {
                    if let Slot::Established(session) = slot {
                        session.pong();
                    }
                }
            }
            StreamMessage::Next(Ok(Frame::Close(_))) | StreamMessage::Finished(_) => self.close_transport(None, ctx.actor_ref()).await,
            StreamMessage::Next(Err(e)) => {
                debug!(socket = %self.socket_id, "{e}");
                self.close_transport(None, ctx.actor_ref()).await;
            }
            StreamMessage::Started(()) => {}
        }
    }
}

impl Message<Attached> for ClientActor {
    type Reply = ();

    async fn handle(&mut self, Attached { name, result }: Attached, ctx: &mut KameoContext<Self, Self::Reply>) {
        let Some(Slot::Attaching(pending)) = self.documents.remove(&name) else { return };
        let me = ctx.actor_ref();
        let doc = match result {
            Ok(doc) => doc,
            Err(e) => {
                warn!(document = %name, socket = %self.socket_id, "could not open document: {e}");
                let event = match &e {
                    Error::Hook(hook) => hook.close_event(CloseEvent::FORBIDDEN),
                    _ => CloseEvent::FORBIDDEN,
                };
                if !self.has_established() {
                    self.close_transport(Some(event), me).await;
                }
                return;
            }
        };
        debug!(document = %name, socket = %self.socket_id, "session established");

        let Pending { queue, context, connection } = pending;
        self.documents.insert(Arc::clone(&name), Slot::Established(Session::new(doc, context, connection)));
        for data in queue {
            self.dispatch(Arc::clone(&name), data, me).await;
        }

        let Some(Slot::Established(session)) = self.documents.get(&name) else { return };
        let payload = ConnectedPayload {
            document_name: &name,
            socket_id: &self.socket_id,
            request: &self.request,
            connection: &session.connection,
            context: &session.context,
        };
        let _ = self.extensions.connected(payload).await;
    }
}

impl Message<CloseSession> for ClientActor {
    type Reply = ();

    async fn handle(&mut self, msg: CloseSession, ctx: &mut KameoContext<Self, Self::Reply>) {
        self.close_session(msg.document_name, msg.event, ctx.actor_ref()).await;
    }
}

impl Message<CloseTransport> for ClientActor {
    type Reply = ();

    async fn handle(&mut self, CloseTransport(event): CloseTransport, ctx: &mut KameoContext<Self, Self::Reply>) {
        self.close_transport(event, ctx.actor_ref()).await;
    }
}

impl Message<DocumentGone> for ClientActor {
    type Reply = ();

    async fn handle(&mut self, DocumentGone(id): DocumentGone, ctx: &mut KameoContext<Self, Self::Reply>) {
        let names: Vec<Arc<str>> = self
            .documents
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Established(session) if session.document.id() == id => Some(Arc::clone(name)),
                _ => None,
            })
            .collect();
        for name in names {
            self.close_session(name, Some(CloseEvent::RESET_CONNECTION), ctx.actor_ref()).await;
        }
    }
}

impl Message<IdleTimeout> for ClientActor {
    type Reply = ();

    async fn handle(&mut self, _: IdleTimeout, ctx: &mut KameoContext<Self, Self::Reply>) {
        if !self.established_once {
            debug!(socket = %self.socket_id, "no document opened in time");
            self.close_transport(Some(CloseEvent::UNAUTHORIZED), ctx.actor_ref()).await;
        }
    }
}

impl Message<CheckLiveness> for ClientActor {
    type Reply = ();

    async fn handle(&mut self, _: CheckLiveness, ctx: &mut KameoContext<Self, Self::Reply>) {
        let mut ping = false;
        let mut timed_out = Vec::new();
        for (name, slot) in &mut self.documents {
            let Slot::Established(session) = slot else { continue };
            match session.check() {
                Liveness::Ping => ping = true,
                Liveness::TimedOut => timed_out.push(Arc::clone(name)),
                Liveness::Closed => {}
            }
        }
        for name in timed_out {
            debug!(document = %name, socket = %self.socket_id, "no pong received");
            self.close_session(name, Some(CloseEvent::CONNECTION_TIMEOUT), ctx.actor_ref()).await;
        }
        if ping && !self.closing && !self.outbox.ping() {
            self.close_transport(None, ctx.actor_ref()).await;
        }
    }
}
