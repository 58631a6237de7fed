use crate::actor::client::{ClientActor, ClientActorArgs};
use crate::actor::document::{DocActor, DocActorArgs};
use crate::actor::messages::{CreateClient, DocumentEntry, DocumentUnloaded, GetDocument, ListClients, ListDocuments, LoadDocument, RequestDocument};
use crate::config::Configuration;
use crate::debounce::Debouncer;
use crate::extensions::Extensions;
use kameo::{
    actor::{Actor, ActorId, ActorRef, Spawn, WeakActorRef},
    error::{ActorStopReason, Infallible},
    message::{Context, Message},
};
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Registry of live documents and transports. Never awaits document work.
pub struct Root {
    extensions: Arc<Extensions>,
    configuration: Arc<Configuration>,
    debouncer: Arc<Debouncer>,
    documents: HashMap<Arc<str>, DocumentEntry>,
    clients: HashMap<ActorId, ActorRef<ClientActor>>,
}

pub struct RootArgs {
    pub extensions: Arc<Extensions>,
    pub configuration: Arc<Configuration>,
}

impl Root {
    fn after_unload(&self, name: Arc<str>) {
        let extensions = Arc::clone(&self.extensions);
        tokio::spawn(async move {
            let _ = extensions.after_unload_document(&name).await;
        });
    }
}

impl Actor for Root {
    type Args = RootArgs;
    type Error = Infallible;

    async fn on_start(args: Self::Args, _: ActorRef<Self>) -> Result<Self, Self::Error> {
        let debouncer = Arc::new(Debouncer::new(args.configuration.debounce, args.configuration.max_debounce));
        Ok(Self { extensions: args.extensions, configuration: args.configuration, debouncer, documents: HashMap::new(), clients: HashMap::new() })
    }

    fn on_link_died(&mut self, _: WeakActorRef<Self>, id: ActorId, reason: ActorStopReason) -> impl Future<Output = Result<ControlFlow<ActorStopReason>, Self::Error>> + Send {
        // a document that stopped without announcing it is still registered
        let name = self.documents.iter().find(|(_, entry)| entry.actor.id() == id).map(|(d, _)| Arc::clone(d));
        if let Some(name) = name {
            debug!(document = %name, ?reason, "document actor died");
            self.documents.remove(&name);
            self.after_unload(name);
        }
        self.clients.remove(&id);
        async { Ok(ControlFlow::Continue(())) }
    }
}

impl Message<RequestDocument> for Root {
    type Reply = DocumentEntry;

    async fn handle(&mut self, msg: RequestDocument, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if let Some(entry) = self.documents.get(&msg.name) {
            return entry.clone();
        }
        let failure = Arc::new(OnceLock::new());
        let args = DocActorArgs {
            name: Arc::clone(&msg.name),
            root: ctx.actor_ref().clone(),
            extensions: Arc::clone(&self.extensions),
            configuration: Arc::clone(&self.configuration),
            debouncer: Arc::clone(&self.debouncer),
            failure: Arc::clone(&failure),
        };
        let actor = DocActor::spawn_link(ctx.actor_ref(), args).await;
        // queued ahead of anything a caller sends
        let _ = actor.tell(LoadDocument(msg.load)).send().await;
        let entry = DocumentEntry { actor, failure };
        self.documents.insert(msg.name, entry.clone());
        entry
    }
}

impl Message<GetDocument> for Root {
    type Reply = Option<ActorRef<DocActor>>;

    async fn handle(&mut self, GetDocument(name): GetDocument, _: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.documents.get(&name).map(|entry| entry.actor.clone())
    }
}

impl Message<ListDocuments> for Root {
    type Reply = Vec<ActorRef<DocActor>>;

    async fn handle(&mut self, _: ListDocuments, _: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.documents.values().map(|entry| entry.actor.clone()).collect()
    }
}

impl Message<ListClients> for Root {
    type Reply = Vec<ActorRef<ClientActor>>;

    async fn handle(&mut self, _: ListClients, _: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.clients.values().cloned().collect()
    }
}

impl Message<DocumentUnloaded> for Root {
    type Reply = ();

    async fn handle(&mut self, msg: DocumentUnloaded, _: &mut Context<Self, Self::Reply>) {
        // a newer actor may already own the name
        if self.documents.get(&msg.name).is_some_and(|entry| entry.actor.id() == msg.id) {
            self.documents.remove(&msg.name);
            debug!(document = %msg.name, "document unloaded");
            self.after_unload(msg.name);
        }
    }
}

impl Message<CreateClient> for Root {
    type Reply = ActorRef<ClientActor>;

    async fn handle(&mut self, msg: CreateClient, ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let args = ClientActorArgs {
            transport: msg.transport,
            request: Arc::new(msg.request),
            default_context: msg.context,
            root: ctx.actor_ref().clone(),
            extensions: Arc::clone(&self.extensions),
            configuration: Arc::clone(&self.configuration),
        };
        let client = ClientActor::spawn_link(ctx.actor_ref(), args).await;
        self.clients.insert(client.id(), client.clone());
        client
    }
}
