use kameo::{
    actor::{Actor, ActorId, ActorRef, WeakActorRef},
    error::{ActorStopReason, Infallible},
    message::{Context as KameoContext, Message},
    reply::{DelegatedReply, ReplySender},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, warn};

use crate::actor::client::ClientActor;
use crate::actor::messages::{
    AttachClient, AttachDirect, BroadcastStateless, CloseConnections, CloseSession, CloseTransport, DetachClient, DetachDirect, DocumentUnloaded,
    EncodeState, GetConnectionsCount, IdleShutdown, IncomingData, LoadDocument, LoadFinished, ReceiveMessage, ReleaseDocument, StoreContext,
    StoreDocument, SweepAwareness, Transact,
};
use crate::actor::root::Root;
use crate::awareness::AwarenessChange;
use crate::codec::ProtocolError;
use crate::config::Configuration;
use crate::debounce::Debouncer;
use crate::document::{Connection, Document};
use crate::error::{Error, Result};
use crate::extensions::Extensions;
use crate::hooks::{
    AfterLoadDocumentPayload, AfterStoreDocumentPayload, BeforeBroadcastStatelessPayload, Context, HookError, OnAwarenessUpdatePayload,
    OnChangePayload, OnDisconnectPayload, OnLoadDocumentPayload, OnStoreDocumentPayload,
};
use crate::protocol::{IncomingMessage, OutgoingMessage};
use crate::receiver::{self, Effect};
use crate::transport::CloseEvent;

/// Socket id reported to store hooks for changes made by server-side code.
pub(crate) const SERVER_SOCKET_ID: &str = "server";

enum Phase {
    Loading,
    Ready,
    Failed(HookError),
}

/// An attach that arrived while the load hooks were running.
struct Waiter {
    /// `None` for direct connections.
    socket_id: Option<Arc<str>>,
    reply: ReplySender<Result<usize>>,
}

pub struct DocActor {
    document: Document,
    phase: Phase,
    failure: Arc<OnceLock<HookError>>,
    waiting: Vec<Waiter>,
    unloaded: bool,
    clients: HashMap<Arc<str>, ActorRef<ClientActor>>,
    root: ActorRef<Root>,
    extensions: Arc<Extensions>,
    configuration: Arc<Configuration>,
    debouncer: Arc<Debouncer>,
    sweeper: Option<JoinHandle<()>>,
}

pub struct DocActorArgs {
    pub name: Arc<str>,
    pub root: ActorRef<Root>,
    pub extensions: Arc<Extensions>,
    pub configuration: Arc<Configuration>,
    pub debouncer: Arc<Debouncer>,
    pub failure: Arc<OnceLock<HookError>>,
}

/// A linked client stopped without detaching.
struct ClientGone(Arc<str>);

fn tell_later<M>(client: &ActorRef<ClientActor>, msg: M)
where
    ClientActor: Message<M>,
    M: Send + 'static,
{
    let client = client.clone();
    tokio::spawn(async move {
        let _ = client.tell(msg).send().await;
    });
}

impl DocActor {
    fn name(&self) -> Arc<str> {
        Arc::clone(self.document.name())
    }

    fn check_available(&self) -> Result<()> {
        if let Phase::Failed(err) = &self.phase {
            return Err(Error::Hook(err.clone()));
        }
        if self.unloaded {
            return Err(Error::DocumentUnloaded(self.document.name().to_string()));
        }
        Ok(())
    }

    fn check_loaded(&self) -> Result<()> {
        self.check_available()?;
        if self.document.is_loading() {
            return Err(Error::DocumentLoading(self.document.name().to_string()));
        }
        Ok(())
    }

    /// Replies now once loaded, otherwise when the load hooks return.
    fn reply_attached(&mut self, socket_id: Option<Arc<str>>, count: usize, ctx: &mut KameoContext<Self, DelegatedReply<Result<usize>>>) -> DelegatedReply<Result<usize>> {
        if !matches!(self.phase, Phase::Loading) {
            return ctx.reply(Ok(count));
        }
        let (delegated, reply) = ctx.reply_sender();
        if let Some(reply) = reply {
            self.waiting.push(Waiter { socket_id, reply });
        }
        delegated
    }

    /// Closes sessions whose transport refused a frame.
    fn reap(&mut self) {
        for socket_id in self.document.take_dead() {
            if let Some(client) = self.clients.get(&socket_id) {
                tell_later(client, CloseSession { document_name: self.name(), event: None });
            }
        }
    }

    fn close_connections(&self, event: CloseEvent) {
        for client in self.clients.values() {
            tell_later(client, CloseSession { document_name: self.name(), event: Some(event.clone()) });
        }
    }

    async fn awareness_hooks(&self, change: &AwarenessChange) {
        if change.is_empty() {
            return;
        }
        let payload = OnAwarenessUpdatePayload {
            document_name: self.document.name(),
            added: &change.added,
            updated: &change.updated,
            removed: &change.removed,
            states: self.document.awareness().states(),
        };
        let _ = self.extensions.awareness_update(payload).await;
    }

    async fn change_hooks(&self, update: &[u8], socket_id: Option<&str>, context: &Context) {
        let payload = OnChangePayload {
            document_name: self.document.name(),
            document: self.document.replica().doc(),
            socket_id,
            context,
            update,
            clients_count: self.document.connections_count(),
        };
        let _ = self.extensions.change(payload).await;
    }

    async fn broadcast_stateless(&mut self, payload: &str, except: Option<&str>) {
        let hook = BeforeBroadcastStatelessPayload { document_name: self.document.name(), payload };
        if self.extensions.before_broadcast_stateless(hook).await.is_err() {
            return;
        }
        self.document.broadcast_stateless(payload, except);
        self.reap();
    }

    /// Runs the store chain; `afterStoreDocument` only runs when storing succeeded.
    async fn store(&self, store: &StoreContext) {
        let state = self.document.replica().encode_state();
        let payload = OnStoreDocumentPayload {
            document_name: self.document.name(),
            document: self.document.replica().doc(),
            state: &state,
            socket_id: &store.socket_id,
            context: &store.context,
            clients_count: self.document.connections_count(),
        };
        if self.extensions.store_document(payload).await.is_err() {
            return;
        }
        let payload = AfterStoreDocumentPayload {
            document_name: self.document.name(),
            document: self.document.replica().doc(),
            socket_id: &store.socket_id,
            context: &store.context,
            clients_count: self.document.connections_count(),
        };
        let _ = self.extensions.after_store_document(payload).await;
    }

    fn schedule_store(&self, store: StoreContext, immediately: bool, me: &ActorRef<Self>) {
        let me = me.clone();
        let task = async move {
            let _ = me.tell(StoreDocument(store)).send().await;
        };
        self.debouncer.schedule(self.document.name(), task, immediately);
    }

    /// The last session or direct connection went away.
    async fn release(&mut self, store: StoreContext, me: &ActorRef<Self>) {
        if self.unloaded || self.document.connections_count() > 0 {
            return;
        }
        if self.document.is_loading() {
            // never persist a document whose load did not finish
            self.unload(me).await;
        } else {
            self.schedule_store(store, true, me);
        }
    }

    async fn unload(&mut self, me: &ActorRef<Self>) {
        if self.unloaded {
            return;
        }
        self.unloaded = true;
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.debouncer.cancel(self.document.name());
        let _ = self.root.tell(DocumentUnloaded { name: self.name(), id: me.id() }).send().await;
        // drains what is already queued, so late attaches get a clear error
        let me = me.clone();
        tokio::spawn(async move {
            let _ = me.stop_gracefully().await;
        });
    }

    async fn finish(&mut self, effect: Effect, socket_id: &Arc<str>, me: &ActorRef<Self>) {
        let context = self.document.connection(socket_id).map(|c| c.context.clone()).unwrap_or_default();
        match effect {
            Effect::None => {}
            Effect::Changed { update } => {
                self.change_hooks(&update, Some(&**socket_id), &context).await;
                self.schedule_store(StoreContext { socket_id: Arc::clone(socket_id), context }, false, me);
            }
            Effect::Awareness(change) => self.awareness_hooks(&change).await,
            Effect::Stateless(payload) => {
                let Ok(responses) = self.extensions.stateless(self.document.name(), socket_id, &context, &payload).await else {
                    return;
                };
                for response in responses {
                    let message = OutgoingMessage::new(self.document.name()).stateless(&response);
                    self.document.send(socket_id, message);
                }
                self.reap();
            }
            Effect::BroadcastStateless(payload) => self.broadcast_stateless(&payload, Some(&**socket_id)).await,
            Effect::Close => {
                if let Some(client) = self.clients.get(socket_id) {
                    tell_later(client, CloseSession { document_name: self.name(), event: Some(CloseEvent::NORMAL) });
                }
            }
        }
    }
}

impl Actor for DocActor {
    type Args = DocActorArgs;
    type Error = Infallible;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        let document = Document::new(args.name, &args.configuration);

        let period = document.awareness().check_interval();
        let weak = actor_ref.downgrade();
        let sweeper = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(me) = weak.upgrade() else { break };
                if me.tell(SweepAwareness).send().await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            document,
            phase: Phase::Loading,
            failure: args.failure,
            waiting: Vec::new(),
            unloaded: false,
            clients: HashMap::new(),
            root: args.root,
            extensions: args.extensions,
            configuration: args.configuration,
            debouncer: args.debouncer,
            sweeper: Some(sweeper),
        })
    }

    fn on_link_died(&mut self, actor_ref: WeakActorRef<Self>, id: ActorId, _: ActorStopReason) -> impl Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send {
        let socket_id = self.clients.iter().find(|(_, c)| c.id() == id).map(|(s, _)| Arc::clone(s));
        async move {
            if let (Some(socket_id), Some(me)) = (socket_id, actor_ref.upgrade()) {
                tokio::spawn(async move {
                    let _ = me.tell(ClientGone(socket_id)).send().await;
                });
            }
            Ok(ControlFlow::Continue(()))
        }
    }
}

impl Message<LoadDocument> for DocActor {
    type Reply = ();

    async fn handle(&mut self, LoadDocument(load): LoadDocument, ctx: &mut KameoContext<Self, Self::Reply>) {
        let name = self.name();
        let replica = self.document.replica().clone();
        let extensions = Arc::clone(&self.extensions);
        let me = ctx.actor_ref().downgrade();
        // off the mailbox, so sessions can attach and leave while the hooks run
        tokio::spawn(async move {
            let payload = OnLoadDocumentPayload {
                document_name: &name,
                document: replica.doc(),
                socket_id: &load.socket_id,
                request: &load.request,
                connection: &load.connection,
                context: &load.context,
            };
            let result = extensions.load_document(payload, &replica).await;
            if let Some(me) = me.upgrade() {
                let _ = me.tell(LoadFinished { load, result }).send().await;
            }
        });
    }
}

impl Message<LoadFinished> for DocActor {
    type Reply = ();

    async fn handle(&mut self, LoadFinished { load, mut result }: LoadFinished, ctx: &mut KameoContext<Self, Self::Reply>) {
        if self.unloaded {
            return;
        }
        let name = self.name();
        if result.is_ok() {
            self.document.set_loaded();
            let payload = AfterLoadDocumentPayload {
                document_name: &name,
                document: self.document.replica().doc(),
                socket_id: &load.socket_id,
                request: &load.request,
                connection: &load.connection,
                context: &load.context,
            };
            result = self.extensions.after_load_document(payload).await;
        }

        match result {
            Ok(()) => {
                debug!(document = %name, "document loaded");
                self.phase = Phase::Ready;
                let count = self.document.connections_count();
                for waiter in self.waiting.drain(..) {
                    waiter.reply.send(Ok(count));
                }
                let weak = ctx.actor_ref().downgrade();
                let timeout = self.configuration.timeout;
                tokio::spawn(async move {
                    sleep(timeout).await;
                    if let Some(me) = weak.upgrade() {
                        let _ = me.tell(IdleShutdown).send().await;
                    }
                });
            }
            Err(err) => {
                warn!(document = %name, "loading failed: {err}");
                let _ = self.failure.set(err.clone());
                self.phase = Phase::Failed(err.clone());
                // waiting sessions learn about it from the reply, not a reset
                for waiter in self.waiting.drain(..) {
                    if let Some(socket_id) = &waiter.socket_id {
                        self.clients.remove(socket_id);
                    }
                    waiter.reply.send(Err(Error::Hook(err.clone())));
                }
                self.close_connections(CloseEvent::RESET_CONNECTION);
                self.unload(ctx.actor_ref()).await;
            }
        }
    }
}

impl Message<AttachClient> for DocActor {
    type Reply = DelegatedReply<Result<usize>>;

    async fn handle(&mut self, msg: AttachClient, ctx: &mut KameoContext<Self, Self::Reply>) -> Self::Reply {
        if let Err(e) = self.check_available() {
            return ctx.reply(Err(e));
        }
        if !msg.client.is_alive() {
            // the transport went away before its attach got here
            let store = StoreContext { socket_id: msg.socket_id, context: msg.context };
            self.release(store, ctx.actor_ref()).await;
            return ctx.reply(Err(Error::DocumentUnloaded(self.document.name().to_string())));
        }
        ctx.actor_ref().link(&msg.client).await;
        self.clients.insert(Arc::clone(&msg.socket_id), msg.client);
        let connection = Connection::new(msg.outbox, msg.read_only, msg.context, msg.request);
        let count = self.document.add_connection(Arc::clone(&msg.socket_id), connection);
        self.reap();
        self.reply_attached(Some(msg.socket_id), count, ctx)
    }
}

impl Message<DetachClient> for DocActor {
    type Reply = usize;

    async fn handle(&mut self, msg: DetachClient, ctx: &mut KameoContext<Self, Self::Reply>) -> Self::Reply {
        ctx.actor_ref().unlink(&msg.client).await;
        self.clients.remove(&msg.socket_id);
        let change = self.document.remove_connection(&msg.socket_id, Instant::now());
        self.reap();
        self.awareness_hooks(&change).await;
        self.document.connections_count()
    }
}

impl Message<ClientGone> for DocActor {
    type Reply = ();

    async fn handle(&mut self, ClientGone(socket_id): ClientGone, ctx: &mut KameoContext<Self, Self::Reply>) {
        self.clients.remove(&socket_id);
        self.waiting.retain(|waiter| waiter.socket_id.as_ref() != Some(&socket_id));
        let Some((context, request)) = self.document.connection(&socket_id).map(|c| (c.context.clone(), Arc::clone(&c.request))) else {
            return;
        };
        debug!(document = %self.document.name(), socket = %socket_id, "client stopped without detaching");
        let change = self.document.remove_connection(&socket_id, Instant::now());
        self.reap();
        self.awareness_hooks(&change).await;
        let payload = OnDisconnectPayload {
            document_name: self.document.name(),
            socket_id: &socket_id,
            request: &request,
            context: &context,
            clients_count: self.document.connections_count(),
        };
        let _ = self.extensions.disconnect(payload).await;
        self.release(StoreContext { socket_id, context }, ctx.actor_ref()).await;
    }
}

impl Message<ReleaseDocument> for DocActor {
    type Reply = ();

    async fn handle(&mut self, ReleaseDocument(store): ReleaseDocument, ctx: &mut KameoContext<Self, Self::Reply>) {
        self.release(store, ctx.actor_ref()).await;
    }
}

impl Message<AttachDirect> for DocActor {
    type Reply = DelegatedReply<Result<usize>>;

    async fn handle(&mut self, _: AttachDirect, ctx: &mut KameoContext<Self, Self::Reply>) -> Self::Reply {
        if let Err(e) = self.check_available() {
            return ctx.reply(Err(e));
        }
        let count = self.document.add_direct_connection();
        self.reply_attached(None, count, ctx)
    }
}

impl Message<DetachDirect> for DocActor {
    type Reply = ();

    async fn handle(&mut self, DetachDirect(store): DetachDirect, ctx: &mut KameoContext<Self, Self::Reply>) {
        self.document.remove_direct_connection();
        self.release(store, ctx.actor_ref()).await;
    }
}

impl Message<Transact> for DocActor {
    type Reply = Result<()>;

    async fn handle(&mut self, msg: Transact, _: &mut KameoContext<Self, Self::Reply>) -> Self::Reply {
        self.check_loaded()?;
        let update = self.document.transact(msg.transaction);
        self.reap();
        if let Some(update) = update {
            self.change_hooks(&update, None, &msg.context).await;
        }
        self.store(&StoreContext { socket_id: SERVER_SOCKET_ID.into(), context: msg.context }).await;
        Ok(())
    }
}

impl Message<IncomingData> for DocActor {
    type Reply = ();

    async fn handle(&mut self, msg: IncomingData, ctx: &mut KameoContext<Self, Self::Reply>) {
        if self.unloaded || !self.document.has_connection(&msg.socket_id) {
            return;
        }
        let result = IncomingMessage::decode(&msg.data)
            .map_err(Error::from)
            .and_then(|mut message| receiver::apply(&mut self.document, &mut message, Some(&*msg.socket_id), None, Instant::now()));
        self.reap();
        match result {
            Ok(effect) => self.finish(effect, &msg.socket_id, ctx.actor_ref()).await,
            Err(Error::Protocol(ProtocolError::Unhandled(kind))) => {
                warn!(document = %self.document.name(), socket = %msg.socket_id, "no handler for message type {kind}");
            }
            Err(e) => {
                warn!(document = %self.document.name(), socket = %msg.socket_id, "malformed message: {e}");
                if let Some(client) = self.clients.get(&msg.socket_id) {
                    tell_later(client, CloseTransport(Some(CloseEvent::UNAUTHORIZED)));
                }
            }
        }
    }
}

impl Message<ReceiveMessage> for DocActor {
    type Reply = Result<Vec<Bytes>>;

    async fn handle(&mut self, ReceiveMessage(data): ReceiveMessage, _: &mut KameoContext<Self, Self::Reply>) -> Self::Reply {
        self.check_loaded()?;
        let mut reply = Vec::new();
        let effect = {
            let mut message = IncomingMessage::decode(&data)?;
            receiver::apply(&mut self.document, &mut message, None, Some(&mut reply), Instant::now())?
        };
        self.reap();
        match effect {
            Effect::Changed { update } => self.change_hooks(&update, None, &Context::default()).await,
            Effect::Awareness(change) => self.awareness_hooks(&change).await,
            Effect::BroadcastStateless(payload) => self.broadcast_stateless(&payload, None).await,
            Effect::None | Effect::Stateless(_) | Effect::Close => {}
        }
        Ok(reply)
    }
}

impl Message<StoreDocument> for DocActor {
    type Reply = ();

    async fn handle(&mut self, StoreDocument(store): StoreDocument, ctx: &mut KameoContext<Self, Self::Reply>) {
        if self.unloaded || self.document.is_loading() {
            return;
        }
        self.store(&store).await;
        if self.document.connections_count() == 0 {
            self.unload(ctx.actor_ref()).await;
        }
    }
}

impl Message<CloseConnections> for DocActor {
    type Reply = ();

    async fn handle(&mut self, CloseConnections(event): CloseConnections, _: &mut KameoContext<Self, Self::Reply>) {
        self.close_connections(event);
    }
}

impl Message<BroadcastStateless> for DocActor {
    type Reply = ();

    async fn handle(&mut self, BroadcastStateless(payload): BroadcastStateless, _: &mut KameoContext<Self, Self::Reply>) {
        self.broadcast_stateless(&payload, None).await;
    }
}

impl Message<SweepAwareness> for DocActor {
    type Reply = ();

    async fn handle(&mut self, _: SweepAwareness, _: &mut KameoContext<Self, Self::Reply>) {
        let change = self.document.sweep_awareness(Instant::now());
        self.reap();
        self.awareness_hooks(&change).await;
    }
}

impl Message<IdleShutdown> for DocActor {
    type Reply = ();

    async fn handle(&mut self, _: IdleShutdown, ctx: &mut KameoContext<Self, Self::Reply>) {
        if self.unloaded || self.document.connections_count() > 0 || self.debouncer.is_pending(self.document.name()) {
            return;
        }
        debug!(document = %self.document.name(), "no session attached, unloading");
        self.store(&StoreContext { socket_id: SERVER_SOCKET_ID.into(), context: Context::default() }).await;
        self.unload(ctx.actor_ref()).await;
    }
}

impl Message<GetConnectionsCount> for DocActor {
    type Reply = usize;

    async fn handle(&mut self, _: GetConnectionsCount, _: &mut KameoContext<Self, Self::Reply>) -> Self::Reply {
        self.document.connections_count()
    }
}

impl Message<EncodeState> for DocActor {
    type Reply = Vec<u8>;

    async fn handle(&mut self, _: EncodeState, _: &mut KameoContext<Self, Self::Reply>) -> Self::Reply {
        self.document.replica().encode_state()
    }
}
