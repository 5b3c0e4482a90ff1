use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use shared::domain::{MessageId, UserId};
use tokio::{net::TcpListener, time::timeout};

const GOOD_TOKEN: &str = "staff-token";

#[derive(Clone, Default)]
struct ServerBehavior {
    drop_first_connection: bool,
    drop_all_connections: bool,
    close_immediately: bool,
    reject_send_with: Option<String>,
}

#[derive(Clone)]
struct WsServerState {
    behavior: ServerBehavior,
    pushes: broadcast::Sender<ServerEvent>,
    connections: Arc<AtomicUsize>,
}

struct RealtimeServer {
    url: String,
    pushes: broadcast::Sender<ServerEvent>,
    connections: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl RealtimeServer {
    /// Pushes an event once a websocket subscriber is attached.
    async fn push(&self, event: ServerEvent) {
        for _ in 0..200 {
            if self.pushes.send(event.clone()).is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no websocket subscriber became ready");
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn shut_down(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn ws_route(
    State(state): State<WsServerState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.get("token").map(String::as_str) != Some(GOOD_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsServerState) {
    let index = state.connections.fetch_add(1, Ordering::SeqCst);
    if state.behavior.drop_all_connections
        || (state.behavior.drop_first_connection && index == 0)
    {
        // Drop the TCP stream without a close handshake.
        return;
    }
    if state.behavior.close_immediately {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }

    let mut pushes = state.pushes.subscribe();
    loop {
        tokio::select! {
            event = pushes.recv() => {
                let Ok(event) = event else { break };
                let text =
                    serde_json::to_string(&ServerFrame::Event(event)).expect("serialize event");
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(WsMessage::Text(text))) = incoming else { break };
                let frame: ClientFrame = serde_json::from_str(&text).expect("client frame");
                let ack = acknowledge(&state.behavior, frame);
                let text = serde_json::to_string(&ServerFrame::Ack(ack)).expect("serialize ack");
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn acknowledge(behavior: &ServerBehavior, frame: ClientFrame) -> AckPayload {
    match frame.request {
        ClientRequest::SendMessage { room_id, content } => {
            if let Some(reason) = &behavior.reject_send_with {
                AckPayload {
                    request_id: frame.request_id,
                    ok: false,
                    message: None,
                    error: Some(reason.clone()),
                }
            } else {
                AckPayload {
                    request_id: frame.request_id,
                    ok: true,
                    message: Some(MessagePayload {
                        message_id: MessageId(1),
                        room_id,
                        sender_id: UserId(1),
                        sender: None,
                        content,
                        created_at: Utc::now(),
                    }),
                    error: None,
                }
            }
        }
        ClientRequest::JoinRoom { .. } | ClientRequest::LeaveRoom { .. } => AckPayload {
            request_id: frame.request_id,
            ok: true,
            message: None,
            error: None,
        },
    }
}

async fn spawn_realtime_server(behavior: ServerBehavior) -> RealtimeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (pushes, _) = broadcast::channel(64);
    let connections = Arc::new(AtomicUsize::new(0));
    let state = WsServerState {
        behavior,
        pushes: pushes.clone(),
        connections: Arc::clone(&connections),
    };
    let app = Router::new().route("/ws", get(ws_route)).with_state(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    RealtimeServer {
        url: format!("http://{addr}"),
        pushes,
        connections,
        shutdown: Some(shutdown_tx),
    }
}

fn test_config(server_url: &str) -> ClientConfig {
    ClientConfig {
        server_url: server_url.to_string(),
        reconnect_base_delay: Duration::from_millis(25),
        max_reconnect_attempts: 5,
        ready_settle_delay: Duration::from_millis(10),
        ack_timeout: Duration::from_secs(2),
    }
}

async fn wait_for_status(
    client: &Arc<RealtimeClient>,
    predicate: impl FnMut(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    let mut status = client.subscribe_status();
    let value = timeout(Duration::from_secs(5), status.wait_for(predicate))
        .await
        .expect("status change within deadline")
        .expect("status channel open");
    value.clone()
}

#[test]
fn backoff_delays_double_per_attempt() {
    let base = Duration::from_millis(100);
    let expected = [100u64, 200, 400, 800, 1600];
    for (attempt, millis) in (1..=5u32).zip(expected) {
        assert_eq!(backoff_delay(base, attempt), Duration::from_millis(millis));
    }
}

#[tokio::test]
async fn connect_reports_connected_and_delivers_pushed_events() {
    let server = spawn_realtime_server(ServerBehavior::default()).await;
    let client = RealtimeClient::new(test_config(&server.url));

    client.connect(GOOD_TOKEN).await.expect("connect");
    wait_for_status(&client, |s| *s == ConnectionStatus::Connected).await;

    let mut events = client.subscribe_events();
    server
        .push(ServerEvent::MessageNew {
            message: MessagePayload {
                message_id: MessageId(10),
                room_id: RoomId(3),
                sender_id: UserId(5),
                sender: None,
                content: "pushed".to_string(),
                created_at: Utc::now(),
            },
        })
        .await;

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open");
    match event {
        ClientEvent::Server(ServerEvent::MessageNew { message }) => {
            assert_eq!(message.room_id, RoomId(3));
            assert_eq!(message.content, "pushed");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn send_message_returns_the_server_confirmed_message() {
    let server = spawn_realtime_server(ServerBehavior::default()).await;
    let client = RealtimeClient::new(test_config(&server.url));

    client.connect(GOOD_TOKEN).await.expect("connect");
    wait_for_status(&client, |s| *s == ConnectionStatus::Connected).await;

    let confirmed = client
        .send_message(RoomId(4), "status update")
        .await
        .expect("send");
    assert_eq!(confirmed.room_id, RoomId(4));
    assert_eq!(confirmed.content, "status update");
}

#[tokio::test]
async fn send_rejection_surfaces_the_server_error_string() {
    let server = spawn_realtime_server(ServerBehavior {
        reject_send_with: Some("room is archived".to_string()),
        ..ServerBehavior::default()
    })
    .await;
    let client = RealtimeClient::new(test_config(&server.url));

    client.connect(GOOD_TOKEN).await.expect("connect");
    wait_for_status(&client, |s| *s == ConnectionStatus::Connected).await;

    let err = client
        .send_message(RoomId(4), "status update")
        .await
        .expect_err("must be rejected");
    match err {
        ClientError::Rejected(reason) => assert_eq!(reason, "room is archived"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn join_and_leave_room_are_acknowledged() {
    let server = spawn_realtime_server(ServerBehavior::default()).await;
    let client = RealtimeClient::new(test_config(&server.url));

    client.connect(GOOD_TOKEN).await.expect("connect");
    wait_for_status(&client, |s| *s == ConnectionStatus::Connected).await;

    client.join_room(RoomId(9)).await.expect("join");
    client.leave_room(RoomId(9)).await.expect("leave");
}

#[tokio::test]
async fn send_while_disconnected_rejects_immediately() {
    // Port 9 is the discard service; nothing is listening and no connect was
    // ever attempted, so the call must fail without any network wait.
    let client = RealtimeClient::new(test_config("http://127.0.0.1:9"));

    let result = timeout(
        Duration::from_millis(100),
        client.send_message(RoomId(1), "hello"),
    )
    .await
    .expect("must not block");
    assert!(matches!(result, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn handshake_rejection_surfaces_through_the_status_observable() {
    let server = spawn_realtime_server(ServerBehavior::default()).await;
    let client = RealtimeClient::new(test_config(&server.url));

    let err = client
        .connect("forged-token")
        .await
        .expect_err("handshake must be rejected");
    assert!(matches!(err, ClientError::Handshake(_)));

    let status = client.subscribe_status().borrow().clone();
    match status {
        ConnectionStatus::Disconnected { error: Some(_) } => {}
        other => panic!("unexpected status: {other:?}"),
    }
}

#[tokio::test]
async fn reconnects_with_backoff_after_unexpected_drop() {
    let server = spawn_realtime_server(ServerBehavior {
        drop_first_connection: true,
        ..ServerBehavior::default()
    })
    .await;
    let client = RealtimeClient::new(test_config(&server.url));

    client.connect(GOOD_TOKEN).await.expect("connect");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.connection_count() < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client never reconnected"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_for_status(&client, |s| *s == ConnectionStatus::Connected).await;

    // The replacement connection is fully usable.
    client.join_room(RoomId(2)).await.expect("join");
}

#[tokio::test]
async fn explicit_server_close_does_not_trigger_reconnect() {
    let server = spawn_realtime_server(ServerBehavior {
        close_immediately: true,
        ..ServerBehavior::default()
    })
    .await;
    let client = RealtimeClient::new(test_config(&server.url));

    let _ = client.connect(GOOD_TOKEN).await;
    wait_for_status(&client, |s| {
        matches!(s, ConnectionStatus::Disconnected { error: None })
    })
    .await;

    // Several backoff periods worth of silence: no new connection attempts.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn exhausting_reconnect_attempts_is_terminal() {
    let mut server = spawn_realtime_server(ServerBehavior {
        drop_all_connections: true,
        ..ServerBehavior::default()
    })
    .await;
    let mut config = test_config(&server.url);
    config.max_reconnect_attempts = 2;
    config.reconnect_base_delay = Duration::from_millis(50);
    let client = RealtimeClient::new(config);

    client.connect(GOOD_TOKEN).await.expect("handshake succeeds");
    // Close the listener so every reconnect attempt is refused.
    server.shut_down();

    let status = wait_for_status(&client, |s| {
        matches!(s, ConnectionStatus::Disconnected { error: Some(_) })
    })
    .await;
    match status {
        ConnectionStatus::Disconnected { error: Some(message) } => {
            assert!(message.contains("2 attempts"), "unexpected: {message}");
        }
        other => panic!("unexpected status: {other:?}"),
    }

    // The cap is final: several further backoff periods pass with no status
    // transition and no new dial reaching the server.
    let mut status = client.subscribe_status();
    let _ = status.borrow_and_update();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!status.has_changed().expect("status channel open"));
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn disconnect_during_reconnect_never_resurrects_the_connection() {
    let server = spawn_realtime_server(ServerBehavior {
        drop_first_connection: true,
        ..ServerBehavior::default()
    })
    .await;
    let client = RealtimeClient::new(test_config(&server.url));

    client.connect(GOOD_TOKEN).await.expect("connect");
    // Land the teardown around the first backoff wakeup, so the retry may be
    // anywhere between its timer firing and installing the new stream.
    tokio::time::sleep(Duration::from_millis(25)).await;
    client.disconnect().await;

    let mut status = client.subscribe_status();
    assert_eq!(
        *status.borrow_and_update(),
        ConnectionStatus::Disconnected { error: None }
    );

    // A retry that slipped past the teardown would flip the status back to
    // Connecting/Connected after its settle delay.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!status.has_changed().expect("status channel open"));
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect_timers() {
    let server = spawn_realtime_server(ServerBehavior {
        drop_all_connections: true,
        ..ServerBehavior::default()
    })
    .await;
    let mut config = test_config(&server.url);
    config.reconnect_base_delay = Duration::from_millis(100);
    let client = RealtimeClient::new(config);

    client.connect(GOOD_TOKEN).await.expect("handshake succeeds");
    let connections_after_connect = server.connection_count();

    // Tear down while the first backoff timer is still pending.
    client.disconnect().await;
    let status = client.subscribe_status().borrow().clone();
    assert_eq!(status, ConnectionStatus::Disconnected { error: None });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), connections_after_connect);
}
