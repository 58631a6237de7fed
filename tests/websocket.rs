mod common;

use collab_sync::{Extension, HookError, HookResult, MessageType, OnUpgradePayload, OutgoingMessage, Server, async_trait};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

/// Refuses upgrades without `?token=letmein`.
struct UpgradeGate;

#[async_trait]
impl Extension for UpgradeGate {
    async fn on_upgrade(&self, payload: OnUpgradePayload<'_>) -> HookResult {
        match payload.request.parameter("token") {
            Some("letmein") => Ok(()),
            _ => Err(HookError::silent()),
        }
    }
}

async fn serve() -> SocketAddr {
    let server = Server::with_extensions(common::configuration(), vec![Arc::new(UpgradeGate)]).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server.into_router()).await.unwrap();
    });
    addr
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_sync_over_websocket() {
    let addr = serve().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/?token=letmein")).await.unwrap();

    let step1 = OutgoingMessage::new("doc").sync().sync_step1(&common::empty_state_vector()).into_bytes();
    socket.send(Message::Binary(step1)).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let frame = tokio::time::timeout(common::WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        if let Message::Binary(data) = frame {
            let mut message = collab_sync::IncomingMessage::decode(&data).unwrap();
            assert_eq!(message.document_name(), "doc");
            assert_eq!(message.message_type().unwrap(), MessageType::Sync);
            seen.push(message.read_var_uint().unwrap());
        }
    }
    assert_eq!(seen, [0, 1]);
}

#[tokio::test]
async fn test_upgrade_rejection_is_forbidden() {
    let addr = serve().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        Err(e) => panic!("expected an HTTP error, got {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

#[tokio::test]
async fn test_plain_requests_get_default_response() {
    let addr = serve().await;
    let response = http_get(addr, "/status").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("OK"), "{response}");
}
