//! End-to-end scenarios exercised over real WebSocket connections against
//! a locally bound server instance.

mod common;

use std::time::Duration;

use chatfabric::store::PersistenceGateway;
use futures::{SinkExt, StreamExt};
use http::Request;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message};

use common::{seed_membership, start_test_server};

fn authed_request(url: &str, token: &str) -> Request<()> {
    let mut request = url.into_client_request().expect("valid ws url");
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}").parse().expect("header value"),
    );
    request
}

type TestSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Wraps a client socket so tests can send/receive logical frames without
/// juggling split halves. The writer opportunistically coalesces multiple
/// already-queued frames into one newline-joined WS text message, so
/// reading "the next frame" buffers and splits rather than assuming one WS
/// message per logical frame.
struct TestClient {
    socket: TestSocket,
    pending: std::collections::VecDeque<String>,
}

impl TestClient {
    fn new(socket: TestSocket) -> Self {
        Self {
            socket,
            pending: std::collections::VecDeque::new(),
        }
    }

    async fn send_text(&mut self, text: &str) {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .expect("send over socket");
    }

    async fn next_frame(&mut self) -> String {
        if let Some(frame) = self.pending.pop_front() {
            return frame;
        }
        loop {
            match timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("frame within deadline")
                .expect("stream not closed")
                .expect("no protocol error")
            {
                Message::Text(text) => {
                    self.pending
                        .extend(text.to_string().split('\n').map(str::to_string));
                    return self.pending.pop_front().expect("at least one frame");
                },
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Raw next-message access for asserting absence/closure, bypassing
    /// frame buffering.
    async fn raw_next(&mut self) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
        self.socket.next().await
    }
}

async fn connect(server: &common::TestServer, room_id: i64, token: &str) -> TestClient {
    let (socket, _) = connect_async(authed_request(
        &server.ws_url(&format!("/api/v1/ws?room_id={room_id}")),
        token,
    ))
    .await
    .unwrap_or_else(|e| panic!("{token} connects: {e}"));
    TestClient::new(socket)
}

/// A message sent by one member is delivered to every other member of the
/// same room, and not to members of other rooms.
#[tokio::test]
async fn basic_delivery_reaches_room_members_only() {
    let server = start_test_server(&[
        ("alice-token", 1, "alice"),
        ("bob-token", 2, "bob"),
        ("carol-token", 3, "carol"),
    ])
    .await;
    seed_membership(&server.store, 1, 1).await;
    seed_membership(&server.store, 1, 2).await;
    seed_membership(&server.store, 2, 3).await;

    let mut alice = connect(&server, 1, "alice-token").await;
    let _ = alice.next_frame().await; // own user_joined
    let _ = alice.next_frame().await; // synthetic online_users

    let mut bob = connect(&server, 1, "bob-token").await;
    let _ = bob.next_frame().await; // bob's own join
    let _ = bob.next_frame().await; // bob's online_users
    let joined_for_alice = alice.next_frame().await;
    assert!(joined_for_alice.contains(r#""type":"user_joined""#));

    let mut carol = connect(&server, 2, "carol-token").await;
    let _ = carol.next_frame().await;
    let _ = carol.next_frame().await;

    alice.send_text(r#"{"type":"message","content":"hello room 1"}"#).await;

    let delivered = bob.next_frame().await;
    assert!(delivered.contains(r#""type":"message""#));
    assert!(delivered.contains("hello room 1"));

    let carol_result = timeout(Duration::from_millis(300), carol.raw_next()).await;
    assert!(carol_result.is_err(), "carol must not observe room 1 traffic");
}

/// A non-member's message is silently dropped: no persistence, no
/// broadcast, and no error surfaced to the sender.
#[tokio::test]
async fn non_member_message_is_dropped_without_error() {
    let server = start_test_server(&[("alice-token", 1, "alice"), ("bob-token", 2, "bob")]).await;
    seed_membership(&server.store, 1, 2).await; // bob is a member, alice is not

    let mut alice = connect(&server, 1, "alice-token").await;
    let _ = alice.next_frame().await;
    let _ = alice.next_frame().await;

    let mut bob = connect(&server, 1, "bob-token").await;
    let _ = bob.next_frame().await;
    let _ = bob.next_frame().await;
    let _ = alice.next_frame().await; // alice sees bob's join

    alice
        .send_text(r#"{"type":"message","content":"i shouldn't be a member"}"#)
        .await;

    let bob_result = timeout(Duration::from_millis(300), bob.raw_next()).await;
    assert!(bob_result.is_err(), "non-member's message must not be broadcast");

    let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM chat_records")
        .fetch_all(&server.store.pool_for_tests())
        .await
        .expect("query chat_records");
    assert!(rows.is_empty(), "non-member's message must not be persisted");
}

/// A second attach for the same user_id evicts the first connection:
/// exactly one survives in the room's online set.
#[tokio::test]
async fn duplicate_attach_evicts_previous_connection() {
    let server = start_test_server(&[("alice-token", 1, "alice")]).await;
    seed_membership(&server.store, 1, 1).await;

    let mut first = connect(&server, 1, "alice-token").await;
    let _ = first.next_frame().await;
    let _ = first.next_frame().await;

    let mut second = connect(&server, 1, "alice-token").await;
    let _ = second.next_frame().await;
    let _ = second.next_frame().await;

    // The first connection's queue was closed by the Hub; its socket should
    // observe a close rather than staying open indefinitely.
    let closed = timeout(Duration::from_secs(5), first.raw_next()).await;
    match closed {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {},
        Ok(Some(Ok(other))) => panic!("expected close, got {other:?}"),
        Ok(Some(Err(_))) => {},
        Err(_) => panic!("first connection was never evicted"),
    }
}

/// Joining a new room upserts membership for that room, and subsequent
/// messages into the new room are delivered normally.
#[tokio::test]
async fn join_room_upserts_membership_and_enables_delivery() {
    let server = start_test_server(&[("alice-token", 1, "alice"), ("bob-token", 2, "bob")]).await;
    seed_membership(&server.store, 1, 1).await;
    seed_membership(&server.store, 2, 2).await;

    let mut alice = connect(&server, 1, "alice-token").await;
    let _ = alice.next_frame().await;
    let _ = alice.next_frame().await;

    let mut bob = connect(&server, 2, "bob-token").await;
    let _ = bob.next_frame().await;
    let _ = bob.next_frame().await;

    assert!(!server.store.is_member(2, 1).await.expect("is_member query"));

    alice.send_text(r#"{"type":"join_room","room_id":2}"#).await;

    let bob_sees_join = bob.next_frame().await;
    assert!(bob_sees_join.contains(r#""type":"user_joined""#));

    assert!(server.store.is_member(2, 1).await.expect("is_member query"));

    alice.send_text(r#"{"type":"message","content":"now in room 2"}"#).await;

    let delivered = bob.next_frame().await;
    assert!(delivered.contains("now in room 2"));
}
