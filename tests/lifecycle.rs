mod common;

use collab_sync::codec::Encoder;
use collab_sync::{CloseEvent, Configuration, Context, Error, HookError, MessageType, OutgoingMessage};
use common::{Recorder, apply, body, body_of_state, connect, edit, server, server_with, wait_documents};
use std::time::Duration;
use yrs::{Doc, Text};

fn position(events: &[String], event: &str) -> usize {
    events.iter().position(|e| e == event).unwrap_or_else(|| panic!("{event} missing from {events:?}"))
}

fn presence(client: u64, clock: u64, state: &str) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_uint(1);
    encoder.write_var_uint(client);
    encoder.write_var_uint(clock);
    encoder.write_var_string(state);
    encoder.into_vec()
}

#[tokio::test]
async fn test_updates_reach_other_sessions_only() {
    let (handle, recorder) = server(Recorder::default()).await;
    let mut alice = connect(&handle).await;
    let mut bob = connect(&handle).await;
    let (ra, rb) = (Doc::new(), Doc::new());
    alice.sync("doc", &ra).await;
    bob.sync("doc", &rb).await;

    alice.send(OutgoingMessage::new("doc").sync_update(&edit(&ra, "hello")));

    let status = alice.recv().await;
    assert_eq!((status.message_type, status.sub_type), (MessageType::SyncStatus, Some(1)));
    let relayed = bob.recv().await;
    assert_eq!((relayed.message_type, relayed.sub_type), (MessageType::Sync, Some(2)));
    apply(&rb, &relayed.data);
    assert_eq!(body(&rb), "hello");

    alice.assert_silent(Duration::from_millis(50)).await;
    recorder.wait_for("onChange:doc:", 1).await;
}

#[tokio::test]
async fn test_last_close_stores_then_unloads() {
    let (handle, recorder) = server(Recorder::default()).await;
    let mut client = connect(&handle).await;
    let replica = Doc::new();
    client.sync("doc", &replica).await;
    client.send(OutgoingMessage::new("doc").sync_update(&edit(&replica, "persist me")));
    client.recv().await;

    client.send(OutgoingMessage::new("doc").close());
    assert_eq!(client.closed().await, Some(CloseEvent::NORMAL));

    recorder.wait_for("afterUnloadDocument:doc", 1).await;
    wait_documents(&handle, 0).await;
    let events = recorder.events();
    assert!(events.contains(&"onDisconnect:doc:0".to_owned()));
    let stored = events.iter().rposition(|e| e.starts_with("onStoreDocument:doc")).unwrap();
    assert!(stored < position(&events, "afterStoreDocument:doc"));
    assert!(position(&events, "afterStoreDocument:doc") < position(&events, "afterUnloadDocument:doc"));
    assert_eq!(body_of_state(&recorder.stored("doc").unwrap()), "persist me");

    // a fresh session loads what was stored
    let mut again = connect(&handle).await;
    let fresh = Doc::new();
    let step2 = again.sync("doc", &fresh).await;
    apply(&fresh, &step2);
    assert_eq!(body(&fresh), "persist me");
}

#[tokio::test]
async fn test_dropped_transport_releases_document() {
    let (handle, recorder) = server(Recorder::default()).await;
    let mut client = connect(&handle).await;
    client.sync("doc", &Doc::new()).await;

    client.hang_up();

    recorder.wait_for("onDisconnect:doc:0", 1).await;
    recorder.wait_for("afterUnloadDocument:doc", 1).await;
    assert_eq!(handle.connections_count().await, 0);
}

#[tokio::test]
async fn test_updates_are_stored_debounced() {
    let configuration = Configuration { debounce: Duration::from_millis(100), max_debounce: Duration::from_secs(5), ..common::configuration() };
    let (handle, recorder) = server_with(configuration, Recorder::default()).await;
    let mut client = connect(&handle).await;
    let replica = Doc::new();
    client.sync("doc", &replica).await;

    for word in ["one ", "two ", "three"] {
        client.send(OutgoingMessage::new("doc").sync_update(&edit(&replica, word)));
        client.recv().await;
    }

    recorder.wait_for("onStoreDocument:doc", 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count("onStoreDocument:doc"), 1);
    assert_eq!(body_of_state(&recorder.stored("doc").unwrap()), "one two three");
    // the session is still attached, so nothing unloads
    assert_eq!(handle.documents_count().await, 1);
}

#[tokio::test]
async fn test_failed_load_resets_and_discards() {
    let recorder = Recorder { reject_load: Some(HookError::new("storage offline")), ..Recorder::default() };
    let (handle, recorder) = server(recorder).await;
    let mut client = connect(&handle).await;

    client.send(OutgoingMessage::new("doc").sync().sync_step1(&common::empty_state_vector()));

    assert_eq!(client.closed().await, Some(CloseEvent::FORBIDDEN));
    wait_documents(&handle, 0).await;
    assert_eq!(recorder.count("afterLoadDocument"), 0);
    assert_eq!(recorder.count("connected"), 0);
    assert_eq!(recorder.count("onLoadDocument:doc"), 1);

    // a later request loads again
    let direct = handle.open_direct_connection("doc", Context::default()).await;
    assert!(matches!(direct, Err(Error::Hook(_))));
    assert_eq!(recorder.count("onLoadDocument:doc"), 2);
}

#[tokio::test]
async fn test_sessions_waiting_on_failed_load_are_rejected_once() {
    let recorder = Recorder {
        reject_load: Some(HookError::new("storage offline")),
        load_delay: Some(Duration::from_millis(200)),
        ..Recorder::default()
    };
    let (handle, recorder) = server(recorder).await;
    let mut alice = connect(&handle).await;
    let mut bob = connect(&handle).await;

    alice.send(OutgoingMessage::new("doc").sync().sync_step1(&common::empty_state_vector()));
    bob.send(OutgoingMessage::new("doc").sync().sync_step1(&common::empty_state_vector()));

    assert_eq!(alice.closed().await, Some(CloseEvent::FORBIDDEN));
    assert_eq!(bob.closed().await, Some(CloseEvent::FORBIDDEN));
    wait_documents(&handle, 0).await;
    assert_eq!(recorder.count("onLoadDocument:doc"), 1);
}

#[tokio::test]
async fn test_leaving_during_load_unloads_without_storing() {
    let recorder = Recorder { load_delay: Some(Duration::from_millis(300)), ..Recorder::default() };
    let (handle, recorder) = server(recorder).await;
    let mut client = connect(&handle).await;

    client.send(OutgoingMessage::new("doc").sync().sync_step1(&common::empty_state_vector()));
    recorder.wait_for("onLoadDocument:doc", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.hang_up();

    recorder.wait_for("afterUnloadDocument:doc", 1).await;
    wait_documents(&handle, 0).await;
    // let the abandoned load finish
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(recorder.count("onStoreDocument"), 0);
    assert_eq!(recorder.count("afterLoadDocument"), 0);
    assert_eq!(recorder.count("afterUnloadDocument:doc"), 1);
}

#[tokio::test]
async fn test_direct_connection_edits_and_stores() {
    let (handle, recorder) = server(Recorder::default()).await;
    let mut client = connect(&handle).await;
    let replica = Doc::new();
    client.sync("doc", &replica).await;

    let mut direct = handle.open_direct_connection("doc", Context::default()).await.unwrap();
    assert_eq!(handle.connections_count().await, 2);

    direct
        .transact(|doc| {
            let text = doc.get_or_insert_text("body");
            text.push(&mut yrs::Transact::transact_mut(doc), "from server");
        })
        .await
        .unwrap();

    let relayed = client.recv().await;
    assert_eq!((relayed.message_type, relayed.sub_type), (MessageType::Sync, Some(2)));
    apply(&replica, &relayed.data);
    assert_eq!(body(&replica), "from server");
    recorder.wait_for("onStoreDocument:doc:server", 1).await;
    assert!(recorder.events().contains(&"onChange:doc:-".to_owned()));

    direct.disconnect().await;
    direct.disconnect().await;
    assert!(!direct.is_connected());
    assert!(matches!(direct.transact(|_| {}).await, Err(Error::DirectConnectionClosed)));
    assert_eq!(handle.connections_count().await, 1);
}

#[tokio::test]
async fn test_direct_connection_alone_unloads_on_disconnect() {
    let (handle, recorder) = server(Recorder::default()).await;

    let mut direct = handle.open_direct_connection("notes", Context::default()).await.unwrap();
    direct
        .transact(|doc| {
            let text = doc.get_or_insert_text("body");
            text.push(&mut yrs::Transact::transact_mut(doc), "headless");
        })
        .await
        .unwrap();
    direct.disconnect().await;

    recorder.wait_for("afterUnloadDocument:notes", 1).await;
    wait_documents(&handle, 0).await;
    assert_eq!(body_of_state(&recorder.stored("notes").unwrap()), "headless");
}

#[tokio::test]
async fn test_idle_guard_keeps_directly_held_document() {
    let configuration = Configuration { timeout: Duration::from_millis(100), ..common::configuration() };
    let (handle, recorder) = server_with(configuration, Recorder::default()).await;

    let mut direct = handle.open_direct_connection("notes", Context::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(handle.documents_count().await, 1);
    assert_eq!(recorder.count("onStoreDocument"), 0);
    assert_eq!(recorder.count("afterUnloadDocument"), 0);

    direct.disconnect().await;
    recorder.wait_for("afterUnloadDocument:notes", 1).await;
}

#[tokio::test]
async fn test_stateless_replies_and_broadcasts() {
    let (handle, recorder) = server(Recorder::default()).await;
    let mut alice = connect(&handle).await;
    let mut bob = connect(&handle).await;
    alice.sync("doc", &Doc::new()).await;
    bob.sync("doc", &Doc::new()).await;

    alice.send(OutgoingMessage::new("doc").stateless("ping"));
    let reply = alice.recv().await;
    assert_eq!((reply.message_type, reply.text.as_str()), (MessageType::Stateless, "echo:ping"));
    assert_eq!(recorder.count("onStateless:doc"), 1);

    alice.send(OutgoingMessage::new("doc").broadcast_stateless("to everyone else"));
    let relayed = bob.recv().await;
    assert_eq!((relayed.message_type, relayed.text.as_str()), (MessageType::Stateless, "to everyone else"));
    alice.assert_silent(Duration::from_millis(50)).await;

    assert!(handle.broadcast_stateless("doc", "from server").await);
    for client in [&mut alice, &mut bob] {
        let received = client.recv().await;
        assert_eq!((received.message_type, received.text.as_str()), (MessageType::Stateless, "from server"));
    }
    assert!(!handle.broadcast_stateless("missing", "nobody").await);
}

#[tokio::test]
async fn test_presence_is_relayed_and_cleared() {
    let (handle, _) = server(Recorder::default()).await;
    let mut alice = connect(&handle).await;
    let mut bob = connect(&handle).await;
    alice.sync("doc", &Doc::new()).await;
    bob.sync("doc", &Doc::new()).await;

    alice.send(OutgoingMessage::new("doc").awareness(&presence(7, 1, r#"{"user":"alice"}"#)));
    let relayed = bob.recv().await;
    assert_eq!(relayed.message_type, MessageType::Awareness);
    assert_eq!(relayed.data, presence(7, 1, r#"{"user":"alice"}"#));

    alice.send(OutgoingMessage::new("doc").close());
    let cleared = bob.recv().await;
    assert_eq!(cleared.message_type, MessageType::Awareness);
    assert_eq!(cleared.data, presence(7, 1, "null"));
}

#[tokio::test]
async fn test_unanswered_pings_time_out() {
    let configuration = Configuration { timeout: Duration::from_millis(100), ..common::configuration() };
    let (handle, _) = server_with(configuration, Recorder::default()).await;
    let mut client = connect(&handle).await;
    client.sync("doc", &Doc::new()).await;

    assert_eq!(client.closed().await, Some(CloseEvent::CONNECTION_TIMEOUT));
}

#[tokio::test]
async fn test_answered_pings_keep_session_open() {
    let configuration = Configuration { timeout: Duration::from_millis(100), ..common::configuration() };
    let (handle, _) = server_with(configuration, Recorder::default()).await;
    let mut client = connect(&handle).await;
    client.sync("doc", &Doc::new()).await;

    assert!(client.answer_pings(Duration::from_millis(450)).await >= 3);
    assert_eq!(handle.connections_count().await, 1);
}

#[tokio::test]
async fn test_close_connections_resets_sessions() {
    let (handle, _) = server(Recorder::default()).await;
    let mut client = connect(&handle).await;
    client.sync("doc", &Doc::new()).await;

    handle.close_connections(Some("doc")).await;

    assert_eq!(client.closed().await, Some(CloseEvent::RESET_CONNECTION));
}

#[tokio::test]
async fn test_destroy_closes_every_transport() {
    let (handle, recorder) = server(Recorder::default()).await;
    let mut first = connect(&handle).await;
    let mut second = connect(&handle).await;
    first.sync("a", &Doc::new()).await;
    second.sync("b", &Doc::new()).await;

    handle.destroy().await;

    assert_eq!(first.closed().await, Some(CloseEvent::RESET_CONNECTION));
    assert_eq!(second.closed().await, Some(CloseEvent::RESET_CONNECTION));
    recorder.wait_for("afterUnloadDocument", 2).await;
}

#[tokio::test]
async fn test_headless_messages_return_replies() {
    let (handle, _) = server(Recorder::default()).await;
    let mut direct = handle.open_direct_connection("doc", Context::default()).await.unwrap();

    let replica = Doc::new();
    let update = edit(&replica, "via receive_message");
    let replies = handle.receive_message(OutgoingMessage::new("doc").sync_update(&update).into_bytes()).await.unwrap();
    assert!(replies.is_empty());

    let state = handle.document_state("doc").await.unwrap();
    assert_eq!(body_of_state(&state), "via receive_message");

    let step1 = OutgoingMessage::new("doc").sync().sync_step1(&common::empty_state_vector()).into_bytes();
    let replies = handle.receive_message(step1).await.unwrap();
    assert_eq!(replies.len(), 2);

    assert!(matches!(handle.receive_message(OutgoingMessage::new("missing").close().into_bytes()).await, Err(Error::DocumentUnloaded(_))));
    direct.disconnect().await;
}
