//! End-to-end delivery tests over real sockets.
//!
//! Each test starts the full router on an ephemeral port, connects clients
//! with `tokio-tungstenite` and publishes either over `POST /events` or
//! through the in-process hub handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use unilink_hub::auth::{Claims, TokenValidator};
use unilink_hub::config::Config;
use unilink_hub::directory::{InMemoryDirectory, UserProfile};
use unilink_hub::hub::{Hub, HubConfig, HubHandle};
use unilink_hub::routes::{create_router, AppState, HealthResponse};
use unilink_hub::types::{ChatMessage, Event, FriendRemoved, MessageSender};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-secret";
const SERVICE_TOKEN: &str = "integration-service-token";

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    addr: SocketAddr,
    hub: HubHandle,
    directory: Arc<InMemoryDirectory>,
}

/// Spawns the hub and router on a random available port.
async fn spawn_test_server() -> TestServer {
    let directory = Arc::new(InMemoryDirectory::new());
    for (id, department, semester) in [
        (1, "CS", 4),
        (2, "CS", 4),
        (3, "EE", 2),
        (4, "CS", 2),
    ] {
        directory.insert_user(UserProfile {
            id,
            college_id: 7,
            department: Some(department.to_string()),
            semester: Some(semester),
        });
    }

    let mut config = Config::with_secret(SECRET);
    config.service_token = Some(SERVICE_TOKEN.to_string());

    let (hub, _task) = Hub::spawn(directory.clone(), HubConfig::from(&config));
    let app = create_router(AppState::new(config, hub.clone(), directory.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        hub,
        directory,
    }
}

fn token_for(user_id: u64) -> String {
    TokenValidator::new(SECRET)
        .issue(
            &Claims::new(user_id, 7, format!("user{user_id}@campus.edu"), "student"),
            Duration::from_secs(600),
        )
        .unwrap()
}

async fn connect(server: &TestServer, user_id: u64) -> Client {
    let before = server.hub.stats().connections;
    let url = format!("ws://{}/ws?token={}", server.addr, token_for(user_id));
    let (client, _) = connect_async(url).await.expect("upgrade should succeed");
    wait_for_connections(&server.hub, before + 1).await;
    client
}

async fn wait_for_connections(hub: &HubHandle, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while hub.stats().connections != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {expected} connections, have {:?}", hub.stats()));
}

/// Next event frame, skipping control frames.
async fn next_event(client: &mut Client) -> Value {
    loop {
        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for event")
            .expect("connection ended")
            .expect("websocket error");

        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn publish(server: &TestServer, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{}/events", server.addr))
        .bearer_auth(SERVICE_TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap()
}

fn announcement(department: Option<&str>, semester: Option<u32>) -> Value {
    json!({
        "type": "newAnnouncement",
        "payload": {
            "id": 11,
            "collegeId": 7,
            "title": "Hackathon",
            "content": "Registrations close Friday",
            "priority": "high",
            "department": department,
            "semester": semester,
            "authorName": "Dean",
            "createdAt": "2025-03-01 09:30:00",
            "updatedAt": "2025-03-01 09:30:00"
        }
    })
}

fn chat(conversation_id: &str, sender: u64, content: &str) -> Event {
    Event::NewMessage(ChatMessage {
        id: 1,
        content: content.to_string(),
        message_type: "text".to_string(),
        conversation_type: None,
        conversation_id: conversation_id.to_string(),
        sender: MessageSender {
            id: sender,
            name: format!("User {sender}"),
            profile_picture: None,
        },
        is_read: false,
        created_at: Utc::now(),
    })
}

fn removed(user_id: u64) -> Event {
    Event::FriendRemoved(FriendRemoved {
        id: 5,
        removed_by_id: 9,
        removed_user: user_id,
        remover_name: "Nine".to_string(),
        updated_at: Utc::now(),
    })
}

// ============================================================================
// Connection admission
// ============================================================================

#[tokio::test]
async fn upgrade_without_token_is_rejected() {
    let server = spawn_test_server().await;

    let result = connect_async(format!("ws://{}/ws", server.addr)).await;

    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {other:?}"),
    }
    assert_eq!(server.hub.stats().connections, 0);
}

#[tokio::test]
async fn upgrade_with_foreign_token_is_rejected() {
    let server = spawn_test_server().await;
    let forged = TokenValidator::new("someone-else")
        .issue(
            &Claims::new(1, 7, "user1@campus.edu", "student"),
            Duration::from_secs(600),
        )
        .unwrap();

    let result = connect_async(format!("ws://{}/ws?token={forged}", server.addr)).await;

    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {other:?}"),
    }
}

#[tokio::test]
async fn upgrade_for_unknown_user_is_rejected() {
    let server = spawn_test_server().await;

    let url = format!("ws://{}/ws?token={}", server.addr, token_for(77));
    match connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP 404, got {other:?}"),
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn announcement_reaches_survivor_after_disconnect() {
    let server = spawn_test_server().await;
    let mut a = connect(&server, 1).await;
    let mut b = connect(&server, 2).await;

    let response = publish(&server, announcement(Some("CS"), None)).await;
    assert_eq!(response.status(), 202);

    let event_a = next_event(&mut a).await;
    let event_b = next_event(&mut b).await;
    assert_eq!(event_a["type"], "newAnnouncement");
    assert_eq!(event_a["payload"]["title"], "Hackathon");
    assert_eq!(event_a["payload"]["createdAt"], "2025-03-01 09:30:00");
    assert_eq!(event_a, event_b);

    a.close(None).await.unwrap();
    wait_for_connections(&server.hub, 1).await;

    publish(&server, announcement(Some("CS"), None)).await;
    assert_eq!(next_event(&mut b).await["type"], "newAnnouncement");
}

#[tokio::test]
async fn announcement_scope_is_applied_to_live_sessions() {
    let server = spawn_test_server().await;
    let mut cs4 = connect(&server, 1).await;
    let mut ee2 = connect(&server, 3).await;
    let mut cs2 = connect(&server, 4).await;

    publish(&server, announcement(Some("CS"), Some(4))).await;
    // A later event for every user proves the first one was already routed.
    for user in [1, 3, 4] {
        server.hub.publish(removed(user)).unwrap();
    }

    assert_eq!(next_event(&mut cs4).await["type"], "newAnnouncement");
    assert_eq!(next_event(&mut cs4).await["type"], "friendRemoved");
    assert_eq!(next_event(&mut ee2).await["type"], "friendRemoved");
    assert_eq!(next_event(&mut cs2).await["type"], "friendRemoved");
}

#[tokio::test]
async fn direct_message_reaches_every_tab_of_both_participants() {
    let server = spawn_test_server().await;
    let mut sender_tab1 = connect(&server, 1).await;
    let mut sender_tab2 = connect(&server, 1).await;
    let mut recipient = connect(&server, 2).await;
    let mut bystander = connect(&server, 3).await;

    server.hub.publish(chat("dm_1_2", 1, "hey")).unwrap();
    server.hub.publish(removed(3)).unwrap();

    for client in [&mut sender_tab1, &mut sender_tab2, &mut recipient] {
        let event = next_event(client).await;
        assert_eq!(event["type"], "newMessage");
        assert_eq!(event["payload"]["content"], "hey");
        assert_eq!(event["payload"]["conversationId"], "dm_1_2");
    }
    assert_eq!(next_event(&mut bystander).await["type"], "friendRemoved");
}

#[tokio::test]
async fn group_message_skips_sender() {
    let server = spawn_test_server().await;
    server.directory.set_group_members(12, [1, 2, 3]);

    let mut sender = connect(&server, 1).await;
    let mut member = connect(&server, 2).await;
    let mut outsider = connect(&server, 4).await;

    server.hub.publish(chat("group_12", 1, "standup?")).unwrap();

    let event = next_event(&mut member).await;
    assert_eq!(event["payload"]["conversationId"], "group_12");

    // A resolved group frame is offered to every member in one pass, so an
    // echo to the sender would already sit ahead of this event in its queue.
    server.hub.publish(removed(1)).unwrap();
    server.hub.publish(removed(4)).unwrap();
    assert_eq!(next_event(&mut sender).await["type"], "friendRemoved");
    assert_eq!(next_event(&mut outsider).await["type"], "friendRemoved");
}

#[tokio::test]
async fn client_messages_are_ignored() {
    let server = spawn_test_server().await;
    let mut client = connect(&server, 1).await;

    client
        .send(Message::Text("{\"type\":\"typing\"}".into()))
        .await
        .unwrap();
    client
        .send(Message::Text("x".repeat(4096).into()))
        .await
        .unwrap();

    server.hub.publish(removed(1)).unwrap();
    assert_eq!(next_event(&mut client).await["type"], "friendRemoved");
    assert_eq!(server.hub.stats().connections, 1);
}

#[tokio::test]
async fn client_frame_above_buffer_limit_ends_session() {
    let server = spawn_test_server().await;
    let mut client = connect(&server, 1).await;

    client
        .send(Message::Text("x".repeat(128 * 1024).into()))
        .await
        .unwrap();

    wait_for_connections(&server.hub, 0).await;
}

#[tokio::test]
async fn health_reports_live_sessions() {
    let server = spawn_test_server().await;
    let _a = connect(&server, 1).await;
    let _b = connect(&server, 1).await;
    let _c = connect(&server, 2).await;

    let health: HealthResponse = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health.status, "ok");
    assert_eq!(health.connections, 3);
    assert_eq!(health.users, 2);
}

#[tokio::test]
async fn hub_shutdown_closes_client_connections() {
    let server = spawn_test_server().await;
    let mut client = connect(&server, 1).await;

    server.hub.shutdown();

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client should see the connection close");
}
