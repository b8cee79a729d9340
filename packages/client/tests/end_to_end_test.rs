//! End-to-end scenarios: real server, real managed connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use renraku_client::config::ConnectionConfig;
use renraku_client::connection::{ManagedConnection, SendOutcome};
use renraku_client::events::ClientEvent;
use renraku_server::config::ServerConfig;
use renraku_server::persistence::NoopPersistence;
use renraku_server::state::AppState;
use renraku_shared::envelope::{Envelope, PresenceStatus};
use renraku_shared::ids::{RoomId, UserId};
use tokio::sync::broadcast;

async fn spawn_app(config: ServerConfig) -> SocketAddr {
    let state = Arc::new(AppState::new(Arc::new(NoopPersistence), config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, renraku_server::app(state))
            .await
            .unwrap();
    });
    addr
}

fn client_config(addr: SocketAddr) -> ConnectionConfig {
    ConnectionConfig::new(format!("ws://{}/ws", addr))
}

fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

fn room(id: &str) -> RoomId {
    RoomId::new(id).unwrap()
}

/// Wait for the first envelope matching the predicate, skipping everything
/// else (state changes, presence noise, receipts).
async fn wait_for_envelope(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut predicate: impl FnMut(&Envelope) -> bool,
) -> Envelope {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("event stream closed");
        if let ClientEvent::Envelope(envelope) = event {
            if predicate(&envelope) {
                return envelope;
            }
        }
    }
}

#[tokio::test]
async fn test_message_queued_offline_reaches_recipient_after_connect() {
    // User 42 writes to user 99 before their connection is up; the envelope
    // is queued, flushed on authentication, and fanned out to 99.
    let addr = spawn_app(ServerConfig::default()).await;

    let recipient = ManagedConnection::new(user("99"), client_config(addr));
    let mut recipient_events = recipient.subscribe();
    recipient.connect().await.unwrap();

    let sender = ManagedConnection::new(user("42"), client_config(addr));
    let mut sender_events = sender.subscribe();
    let (outcome, message_id) = sender.send_chat_to_user(user("99"), "hi").await;
    assert_eq!(outcome, SendOutcome::Queued);

    sender.connect().await.unwrap();

    let delivered = wait_for_envelope(&mut recipient_events, |envelope| {
        matches!(envelope, Envelope::NewMessage { .. })
    })
    .await;
    match delivered {
        Envelope::NewMessage {
            sender_id,
            recipient_id,
            content,
            message_id: delivered_id,
            ..
        } => {
            assert_eq!(sender_id, user("42"));
            assert_eq!(recipient_id, Some(user("99")));
            assert_eq!(content, "hi");
            assert_eq!(delivered_id, message_id);
        }
        other => panic!("expected new_message, got {:?}", other),
    }

    // the sender hears back about acceptance and delivery
    let sent = wait_for_envelope(&mut sender_events, |envelope| {
        matches!(envelope, Envelope::MessageSent { .. })
    })
    .await;
    assert!(matches!(
        sent,
        Envelope::MessageSent { message_id: id, .. } if id == message_id
    ));
    let delivered_ack = wait_for_envelope(&mut sender_events, |envelope| {
        matches!(envelope, Envelope::MessageDelivered { .. })
    })
    .await;
    assert!(matches!(
        delivered_ack,
        Envelope::MessageDelivered { recipient_id, .. } if recipient_id == user("99")
    ));

    sender.disconnect().await;
    recipient.disconnect().await;
}

#[tokio::test]
async fn test_room_chat_typing_and_leave_flow() {
    // Two workers share a job room: join announcements, room chat, a typing
    // indicator that expires on its own, and a leave announcement.
    let config = ServerConfig {
        typing_ttl: Duration::from_millis(300),
        ..ServerConfig::default()
    };
    let addr = spawn_app(config).await;
    let job = room("job-7");

    let alpha = ManagedConnection::new(user("alpha"), client_config(addr));
    let mut alpha_events = alpha.subscribe();
    alpha.connect().await.unwrap();
    alpha.join_room(job.clone()).await;
    wait_for_envelope(&mut alpha_events, |envelope| {
        matches!(envelope, Envelope::RoomJoined { .. })
    })
    .await;

    let beta = ManagedConnection::new(user("beta"), client_config(addr));
    let mut beta_events = beta.subscribe();
    beta.connect().await.unwrap();
    beta.join_room(job.clone()).await;

    let joined = wait_for_envelope(&mut beta_events, |envelope| {
        matches!(envelope, Envelope::RoomJoined { .. })
    })
    .await;
    assert_eq!(
        joined,
        Envelope::RoomJoined {
            room_id: job.clone(),
            members: vec![user("alpha"), user("beta")],
        }
    );
    let announced = wait_for_envelope(&mut alpha_events, |envelope| {
        matches!(envelope, Envelope::UserJoinedRoom { .. })
    })
    .await;
    assert!(matches!(
        announced,
        Envelope::UserJoinedRoom { user_id, .. } if user_id == user("beta")
    ));

    // room chat reaches the other member, not the sender
    let (outcome, _) = alpha.send_chat_to_room(job.clone(), "found the part").await;
    assert_eq!(outcome, SendOutcome::Sent);
    let chat = wait_for_envelope(&mut beta_events, |envelope| {
        matches!(envelope, Envelope::NewMessage { .. })
    })
    .await;
    assert!(matches!(
        chat,
        Envelope::NewMessage { sender_id, content, .. }
            if sender_id == user("alpha") && content == "found the part"
    ));

    // typing indicator appears, then expires without a stop_typing
    alpha.typing(job.clone()).await;
    wait_for_envelope(&mut beta_events, |envelope| {
        matches!(envelope, Envelope::UserTyping { .. })
    })
    .await;
    let stopped = wait_for_envelope(&mut beta_events, |envelope| {
        matches!(envelope, Envelope::UserStoppedTyping { .. })
    })
    .await;
    assert!(matches!(
        stopped,
        Envelope::UserStoppedTyping { user_id, .. } if user_id == user("alpha")
    ));

    // leaving is announced to the remaining member
    alpha.leave_room(job.clone()).await;
    let left = wait_for_envelope(&mut beta_events, |envelope| {
        matches!(envelope, Envelope::UserLeftRoom { .. })
    })
    .await;
    assert!(matches!(
        left,
        Envelope::UserLeftRoom { user_id, .. } if user_id == user("alpha")
    ));

    alpha.disconnect().await;
    beta.disconnect().await;
}

#[tokio::test]
async fn test_presence_follows_connection_lifecycle() {
    // An observer sees a user come online when they authenticate and go
    // offline when their last connection closes.
    let addr = spawn_app(ServerConfig::default()).await;

    let observer = ManagedConnection::new(user("observer"), client_config(addr));
    let mut observer_events = observer.subscribe();
    observer.connect().await.unwrap();

    let gamma = ManagedConnection::new(user("gamma"), client_config(addr));
    gamma.connect().await.unwrap();

    let online = wait_for_envelope(&mut observer_events, |envelope| {
        matches!(
            envelope,
            Envelope::UserStatusChange { user_id, .. } if user_id == &user("gamma")
        )
    })
    .await;
    assert!(matches!(
        online,
        Envelope::UserStatusChange { status: PresenceStatus::Online, .. }
    ));

    gamma.disconnect().await;

    let offline = wait_for_envelope(&mut observer_events, |envelope| {
        matches!(
            envelope,
            Envelope::UserStatusChange {
                user_id,
                status: PresenceStatus::Offline,
                ..
            } if user_id == &user("gamma")
        )
    })
    .await;
    assert!(matches!(
        offline,
        Envelope::UserStatusChange { status: PresenceStatus::Offline, .. }
    ));

    observer.disconnect().await;
}

#[tokio::test]
async fn test_operational_endpoints_report_rooms_and_health() {
    let addr = spawn_app(ServerConfig::default()).await;

    let worker = ManagedConnection::new(user("worker-1"), client_config(addr));
    let mut worker_events = worker.subscribe();
    worker.connect().await.unwrap();
    worker.join_room(room("job-9")).await;
    wait_for_envelope(&mut worker_events, |envelope| {
        matches!(envelope, Envelope::RoomJoined { .. })
    })
    .await;

    let health: serde_json::Value = reqwest::get(format!("http://{}/api/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, serde_json::json!({"status": "ok"}));

    let rooms: serde_json::Value = reqwest::get(format!("http://{}/api/rooms", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rooms = rooms.as_array().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["room_id"], "job-9");
    assert_eq!(rooms[0]["member_count"], 1);
    assert_eq!(rooms[0]["members"][0]["user_id"], "worker-1");
    assert_eq!(rooms[0]["members"][0]["status"], "online");

    worker.disconnect().await;
}
