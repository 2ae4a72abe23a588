// Integration tests for the real-time channel client against a local websocket server

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tokio::time::timeout;

use common::{setup_logging, spawn_server};
use gigchat::chat::presence::fetch_online_users;
use gigchat::chat::window::confirm_read;
use gigchat::chat::{
    ChannelEvent, ChannelHandle, ChannelOptions, ConversationWindow, EventFilter, RealtimeChannel, Subscription,
};
use gigchat::models::wire::ChatDto;
use gigchat::models::PresenceStatus;
use gigchat::{ChatError, Session};

const TOKEN: &str = "token-abc";

fn fast_options() -> ChannelOptions {
    ChannelOptions {
        request_timeout: Duration::from_secs(2),
        reconnect_min: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
    }
}

async fn next_event(subscription: &mut Subscription) -> ChannelEvent {
    timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for a channel event")
        .expect("subscription closed")
}

async fn send(socket: &mut WebSocket, value: Value) {
    let _ = socket.send(WsMessage::Text(value.to_string())).await;
}

async fn chat_handler(ws: WebSocketUpgrade, headers: HeaderMap) -> Response {
    let bearer = format!("Bearer {}", TOKEN);
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(bearer.as_str()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(serve_chat)
}

// Minimal chat namespace: greets with a presence event, acknowledges requests,
// and answers joinChat with one message for another chat and one for the joined one.
async fn serve_chat(mut socket: WebSocket) {
    send(
        &mut socket,
        json!({"event": "userPresence", "data": {"userId": 9, "status": "online"}}),
    )
    .await;

    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let frame: Value = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let event = frame["event"].as_str().unwrap_or_default().to_string();

        if let Some(ack) = frame.get("ack").and_then(Value::as_u64) {
            let data = match event.as_str() {
                "getOnlineUsers" => json!([{"userId": 9, "lastSeen": "2024-05-01T10:00:00Z"}, "8"]),
                _ => json!({"ok": true}),
            };
            send(&mut socket, json!({"event": "ack", "ack": ack, "data": data})).await;
        }

        if event == "joinChat" {
            let chat_id = frame["data"]["chatId"].clone();
            send(
                &mut socket,
                json!({"event": "newMessage", "data": {"id": 1, "chat_id": 999, "sender_id": 9, "message": "elsewhere"}}),
            )
            .await;
            send(
                &mut socket,
                json!({"event": "newMessage", "data": {"id": 2, "chat_id": chat_id, "sender_id": 9, "message": "welcome"}}),
            )
            .await;
            send(
                &mut socket,
                json!({"event": "latestMessage", "data": {"chat_id": chat_id, "sender_id": 9, "message": "welcome"}}),
            )
            .await;
        }
    }
}

#[tokio::test]
async fn test_events_requests_and_scoped_subscription() {
    setup_logging();
    let (addr, _server) = spawn_server(Router::new().route("/chat", get(chat_handler)));
    let session = Session::new(TOKEN, "100", "DJ Lux");
    let channel = RealtimeChannel::start(&format!("ws://{}/chat", addr), &session, fast_options()).unwrap();
    let mut sidebar = channel.subscribe(EventFilter::Sidebar);

    assert_eq!(next_event(&mut sidebar).await, ChannelEvent::Connected);
    match next_event(&mut sidebar).await {
        ChannelEvent::UserPresence(presence) => {
            assert_eq!(presence.user_id, "9");
            assert_eq!(presence.status(), PresenceStatus::Online);
        }
        other => panic!("expected presence, got {:?}", other),
    }
    assert!(channel.is_connected());

    let online = fetch_online_users(&channel, Duration::from_millis(0)).await.unwrap();
    let ids: Vec<&str> = online.iter().map(|r| r.user_id.as_str()).collect();
    assert_eq!(ids, vec!["9", "8"]);
    assert!(online[0].last_seen.is_some());

    let conversation = serde_json::from_value::<ChatDto>(json!({"id": 5, "other_user": {"id": 9, "name": "Ann"}}))
        .unwrap()
        .into_conversation();
    let mut window = ConversationWindow::new("100", 20, 5);
    window.switch_to(&conversation, &channel);

    let mut delivered = Vec::new();
    for _ in 0..100 {
        delivered.extend(window.pending_events());
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, "2");
    assert_eq!(delivered[0].chat_id, "5");
    assert!(!delivered[0].is_mine());

    match next_event(&mut sidebar).await {
        ChannelEvent::LatestMessage(latest) => assert_eq!(latest.chat_id, "5"),
        other => panic!("expected latest message, got {:?}", other),
    }

    confirm_read(&channel, "5").await.unwrap();
    channel.close();
}

#[tokio::test]
async fn test_rejected_token_never_connects() {
    setup_logging();
    let (addr, _server) = spawn_server(Router::new().route("/chat", get(chat_handler)));
    let session = Session::new("wrong", "100", "DJ Lux");
    let channel = RealtimeChannel::start(&format!("ws://{}/chat", addr), &session, fast_options()).unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!channel.is_connected());
    assert!(matches!(
        channel.emit("joinChat", json!({"chatId": "5"})),
        Err(ChatError::NotConnected)
    ));
    assert!(matches!(
        channel.request("markAsRead", json!({"chatId": "5"})).await,
        Err(ChatError::NotConnected)
    ));
    channel.close();
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    setup_logging();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let app = Router::new().route(
        "/chat",
        get(move |ws: WebSocketUpgrade| {
            let counter = counter.clone();
            async move {
                ws.on_upgrade(move |mut socket: WebSocket| async move {
                    // the first connection is dropped straight away
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        let _ = socket.close().await;
                        return;
                    }
                    while let Some(Ok(_)) = socket.recv().await {}
                })
            }
        }),
    );
    let (addr, _server) = spawn_server(app);
    let session = Session::new(TOKEN, "100", "DJ Lux");
    let channel = RealtimeChannel::start(&format!("ws://{}/chat", addr), &session, fast_options()).unwrap();
    let mut sidebar = channel.subscribe(EventFilter::All);

    assert_eq!(next_event(&mut sidebar).await, ChannelEvent::Connected);
    assert_eq!(next_event(&mut sidebar).await, ChannelEvent::Disconnected);
    assert_eq!(next_event(&mut sidebar).await, ChannelEvent::Connected);
    assert!(channel.is_connected());
    assert!(connections.load(Ordering::SeqCst) >= 1);

    channel.close();
    assert_eq!(next_event(&mut sidebar).await, ChannelEvent::Disconnected);
}
