#![allow(dead_code)]

use collab_sync::{
    AfterLoadDocumentPayload, AfterStoreDocumentPayload, AfterUnloadDocumentPayload, Authenticate, CloseEvent, Configuration,
    ConnectedPayload, Context, Extension, Frame, Handle, HookError, HookResult, IncomingMessage, MessageType, OnAuthenticatePayload,
    OnChangePayload, OnConnectPayload, OnDisconnectPayload, OnLoadDocumentPayload, OnStatelessPayload, OnStoreDocumentPayload,
    OutgoingMessage, RequestInfo, Server, Transport, TransportError, async_trait,
};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn configuration() -> Configuration {
    Configuration { debounce: Duration::from_millis(50), max_debounce: Duration::from_millis(500), quiet: true, ..Configuration::default() }
}

// ============================================================================
// Recording extension
// ============================================================================

/// Records every hook call as `"<hook>:<document>"` and persists stored state in memory.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    pub storage: Mutex<HashMap<String, Vec<u8>>>,
    pub token: Option<&'static str>,
    pub read_only_token: Option<&'static str>,
    pub reject_connect: Option<HookError>,
    pub reject_load: Option<HookError>,
    pub load_delay: Option<Duration>,
}

impl Recorder {
    pub fn with_token(token: &'static str) -> Self {
        Self { token: Some(token), ..Self::default() }
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn stored(&self, document: &str) -> Option<Vec<u8>> {
        self.storage.lock().unwrap().get(document).cloned()
    }

    /// Polls until `prefix` was recorded `n` times.
    pub async fn wait_for(&self, prefix: &str, n: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.count(prefix) < n {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {prefix} x{n}, got {:?}", self.events());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Extension for Recorder {
    fn authenticator(&self) -> Option<&dyn Authenticate> {
        self.token.map(|_| self as &dyn Authenticate)
    }

    async fn on_connect(&self, p: OnConnectPayload<'_>) -> HookResult {
        self.record(format!("onConnect:{}", p.document_name));
        match &self.reject_connect {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn connected(&self, p: ConnectedPayload<'_>) -> HookResult {
        self.record(format!("connected:{}", p.document_name));
        Ok(())
    }

    async fn on_load_document(&self, p: OnLoadDocumentPayload<'_>) -> Result<Option<Vec<u8>>, HookError> {
        self.record(format!("onLoadDocument:{}", p.document_name));
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.reject_load {
            return Err(err.clone());
        }
        Ok(self.stored(p.document_name))
    }

    async fn after_load_document(&self, p: AfterLoadDocumentPayload<'_>) -> HookResult {
        self.record(format!("afterLoadDocument:{}", p.document_name));
        Ok(())
    }

    async fn on_stateless(&self, p: OnStatelessPayload<'_>) -> HookResult {
        self.record(format!("onStateless:{}", p.document_name));
        p.responses.push(format!("echo:{}", p.payload));
        Ok(())
    }

    async fn on_change(&self, p: OnChangePayload<'_>) -> HookResult {
        self.record(format!("onChange:{}:{}", p.document_name, p.socket_id.unwrap_or("-")));
        Ok(())
    }

    async fn on_store_document(&self, p: OnStoreDocumentPayload<'_>) -> HookResult {
        self.record(format!("onStoreDocument:{}:{}", p.document_name, p.socket_id));
        self.storage.lock().unwrap().insert(p.document_name.to_owned(), p.state.to_vec());
        Ok(())
    }

    async fn after_store_document(&self, p: AfterStoreDocumentPayload<'_>) -> HookResult {
        self.record(format!("afterStoreDocument:{}", p.document_name));
        Ok(())
    }

    async fn on_disconnect(&self, p: OnDisconnectPayload<'_>) -> HookResult {
        self.record(format!("onDisconnect:{}:{}", p.document_name, p.clients_count));
        Ok(())
    }

    async fn after_unload_document(&self, p: AfterUnloadDocumentPayload<'_>) -> HookResult {
        self.record(format!("afterUnloadDocument:{}", p.document_name));
        Ok(())
    }
}

#[async_trait]
impl Authenticate for Recorder {
    async fn on_authenticate(&self, p: OnAuthenticatePayload<'_>) -> HookResult {
        self.record(format!("onAuthenticate:{}", p.document_name));
        if Some(p.token) == self.read_only_token {
            p.connection.read_only = true;
            return Ok(());
        }
        if Some(p.token) == self.token {
            return Ok(());
        }
        Err(HookError::new("invalid token").with_reason("invalid-token"))
    }
}

pub async fn server(recorder: Recorder) -> (Handle, Arc<Recorder>) {
    server_with(configuration(), recorder).await
}

pub async fn server_with(configuration: Configuration, recorder: Recorder) -> (Handle, Arc<Recorder>) {
    let recorder = Arc::new(recorder);
    let extension: Arc<dyn Extension> = recorder.clone();
    let server = Server::with_extensions(configuration, vec![extension]).await.unwrap();
    (server.handle(), recorder)
}

/// Polls until the server holds `n` documents.
pub async fn wait_documents(handle: &Handle, n: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while handle.documents_count().await != n {
        assert!(tokio::time::Instant::now() < deadline, "expected {n} documents");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// In-memory client
// ============================================================================

/// A server message as seen by a client.
#[derive(Debug)]
pub struct Received {
    pub document: String,
    pub message_type: MessageType,
    pub sub_type: Option<u64>,
    pub data: Vec<u8>,
    pub text: String,
}

fn parse(data: &[u8]) -> Received {
    let mut message = IncomingMessage::decode(data).unwrap();
    let document = message.document_name().to_owned();
    let message_type = message.message_type().unwrap();
    let mut received = Received { document, message_type, sub_type: None, data: Vec::new(), text: String::new() };
    match message_type {
        MessageType::Sync | MessageType::SyncReply => {
            received.sub_type = Some(message.read_var_uint().unwrap());
            received.data = message.read_var_bytes().unwrap().to_vec();
        }
        MessageType::Auth => {
            received.sub_type = Some(message.read_var_uint().unwrap());
            received.text = message.read_var_string().unwrap().to_owned();
        }
        MessageType::SyncStatus => received.sub_type = Some(message.read_var_uint().unwrap()),
        MessageType::Stateless | MessageType::BroadcastStateless => received.text = message.read_var_string().unwrap().to_owned(),
        MessageType::Awareness => received.data = message.read_var_bytes().unwrap().to_vec(),
        MessageType::QueryAwareness | MessageType::Close => {}
    }
    received
}

pub struct TestClient {
    tx: Option<UnboundedSender<Result<Frame, TransportError>>>,
    rx: UnboundedReceiver<Frame>,
}

pub async fn connect(handle: &Handle) -> TestClient {
    let (server_tx, rx) = unbounded::<Frame>();
    let (tx, server_rx) = unbounded::<Result<Frame, TransportError>>();
    let transport = Transport::new(server_tx.sink_map_err(TransportError::new), server_rx);
    handle.handle_connection(transport, RequestInfo::default(), Context::default()).await.unwrap();
    TestClient { tx: Some(tx), rx }
}

impl TestClient {
    pub fn send(&self, message: OutgoingMessage) {
        self.send_raw(&message.into_bytes());
    }

    pub fn send_raw(&self, data: &[u8]) {
        if let Some(tx) = &self.tx {
            let _ = tx.unbounded_send(Ok(Frame::Binary(data.to_vec().into())));
        }
    }

    pub fn send_frame(&self, frame: Frame) {
        if let Some(tx) = &self.tx {
            let _ = tx.unbounded_send(Ok(frame));
        }
    }

    /// Drops the inbound half, as if the peer went away.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, self.rx.next()).await.expect("no frame from server")
    }

    /// Next protocol message, skipping pings.
    pub async fn recv(&mut self) -> Received {
        loop {
            match self.next_frame().await {
                Some(Frame::Binary(data)) => return parse(&data),
                Some(Frame::Ping(_)) => continue,
                other => panic!("expected a message, got {other:?}"),
            }
        }
    }

    /// Skips messages until the server closes; returns the close event.
    pub async fn closed(&mut self) -> Option<CloseEvent> {
        loop {
            match self.next_frame().await {
                Some(Frame::Close(event)) => return event,
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Asserts nothing but pings arrives for `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.next()).await {
                Err(_) => return,
                Ok(Some(Frame::Ping(_))) => continue,
                Ok(other) => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Answers every ping for `wait`; any other frame fails the test.
    pub async fn answer_pings(&mut self, wait: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + wait;
        let mut answered = 0;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.next()).await {
                Err(_) => return answered,
                Ok(Some(Frame::Ping(data))) => {
                    self.send_frame(Frame::Pong(data));
                    answered += 1;
                }
                Ok(other) => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Sends sync step 1 and waits for both halves of the server's answer.
    pub async fn sync(&mut self, document: &str, replica: &Doc) -> Vec<u8> {
        let state_vector = replica.transact().state_vector();
        self.send(OutgoingMessage::new(document).sync().sync_step1(&yrs::updates::encoder::Encode::encode_v1(&state_vector)));
        let step1 = self.recv().await;
        assert_eq!((step1.message_type, step1.sub_type), (MessageType::Sync, Some(0)));
        let step2 = self.recv().await;
        assert_eq!((step2.message_type, step2.sub_type), (MessageType::Sync, Some(1)));
        step2.data
    }
}

// ============================================================================
// Replica helpers
// ============================================================================

/// Appends `content` to the `body` text of `doc`, returning the update.
pub fn edit(doc: &Doc, content: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    let text = doc.get_or_insert_text("body");
    text.push(&mut doc.transact_mut(), content);
    doc.transact().encode_state_as_update_v1(&before)
}

pub fn apply(doc: &Doc, update: &[u8]) {
    doc.transact_mut().apply_update(Update::decode_v1(update).unwrap()).unwrap();
}

pub fn body(doc: &Doc) -> String {
    let text = doc.get_or_insert_text("body");
    text.get_string(&doc.transact())
}

pub fn body_of_state(state: &[u8]) -> String {
    let doc = Doc::new();
    apply(&doc, state);
    body(&doc)
}

pub fn empty_state_vector() -> Vec<u8> {
    yrs::updates::encoder::Encode::encode_v1(&StateVector::default())
}
