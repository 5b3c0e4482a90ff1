use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use shared::{
    domain::RoomId,
    protocol::{
        AckPayload, ClientFrame, ClientRequest, LoginRequest, LoginResponse, MessagePayload,
        RoomSummary, ServerEvent, ServerFrame,
    },
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

pub mod dedup;
pub mod error;
pub mod reducer;

pub use dedup::DedupWindow;
pub use error::ClientError;
pub use reducer::InboxState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connection lifecycle as observed by consumers. Transitions are driven
/// solely by transport events, never by application logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected { error: Option<String> },
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Server(ServerEvent),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// First reconnect delay; attempt n waits `base * 2^(n-1)`.
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Grace period between the low-level connected event and the connection
    /// being reported ready for sends, so an immediate send cannot race the
    /// handshake completion.
    pub ready_settle_delay: Duration,
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            ready_settle_delay: Duration::from_millis(150),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

fn websocket_url(server_url: &str, token: &str) -> Result<String, ClientError> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ClientError::InvalidServerUrl(format!(
            "{server_url} must start with http:// or https://"
        )));
    };
    Ok(format!("{base}/ws?token={token}"))
}

enum DropReason {
    /// `disconnect()` dropped the writer; status already handled there.
    Local,
    /// Explicit server-initiated close frame. No reconnect.
    ServerClose,
    /// Anything else: transport error or the stream ending without a close
    /// handshake. Triggers the backoff-reconnect policy.
    Transport(String),
}

struct ClientState {
    token: Option<String>,
    writer: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped on every connect/disconnect/install so tasks belonging to a
    /// torn-down connection can detect they are stale and bail out.
    epoch: u64,
    next_request_id: u64,
    pending_acks: HashMap<u64, oneshot::Sender<AckPayload>>,
    reconnect_task: Option<JoinHandle<()>>,
}

/// Owned realtime connection with an explicit lifecycle: construct it,
/// `connect`, observe `subscribe_status`/`subscribe_events`, `disconnect`.
/// There is no global socket; every consumer receives its own client by
/// dependency injection.
pub struct RealtimeClient {
    http: Client,
    config: ClientConfig,
    inner: Mutex<ClientState>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
}

impl RealtimeClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected { error: None });
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            config,
            inner: Mutex::new(ClientState {
                token: None,
                writer: None,
                epoch: 0,
                next_request_id: 0,
                pending_acks: HashMap::new(),
                reconnect_task: None,
            }),
            status,
            events,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Fetches a bearer token from the HTTP auth endpoint. The token fetch is
    /// not retried; a failure is published on the status observable and
    /// returned to the caller.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ClientError> {
        let result: Result<LoginResponse, ClientError> = async {
            let response = self
                .http
                .post(format!("{}/auth/token", self.config.server_url))
                .json(&LoginRequest {
                    username: username.to_string(),
                    password: password.to_string(),
                })
                .send()
                .await
                .map_err(|err| ClientError::TokenRequest(err.to_string()))?
                .error_for_status()
                .map_err(|err| ClientError::TokenRequest(err.to_string()))?;
            let body: LoginResponse = response
                .json()
                .await
                .map_err(|err| ClientError::TokenRequest(err.to_string()))?;
            Ok(body)
        }
        .await;

        match result {
            Ok(body) => {
                self.inner.lock().await.token = Some(body.token.clone());
                Ok(body.token)
            }
            Err(err) => {
                self.set_status(ConnectionStatus::Disconnected {
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    /// Establishes the realtime connection, replacing any existing one. A
    /// handshake rejection is published on the status observable as well as
    /// returned.
    pub async fn connect(self: &Arc<Self>, token: &str) -> Result<(), ClientError> {
        self.teardown().await;
        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.token = Some(token.to_string());
            inner.epoch
        };
        self.set_status(ConnectionStatus::Connecting);

        match self.establish(token).await {
            Ok(stream) => {
                self.install(stream, epoch).await;
                Ok(())
            }
            Err(err) => {
                self.set_status(ConnectionStatus::Disconnected {
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    /// Tears down the connection: drops the writer, fails pending acks,
    /// cancels any scheduled reconnect, and publishes `Disconnected`.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.set_status(ConnectionStatus::Disconnected { error: None });
    }

    /// Sends a message and waits for the server acknowledgement. Resolves
    /// with the server-confirmed message or rejects with the server's error
    /// string; this layer never retries. Rejects immediately when the
    /// connection is not ready.
    pub async fn send_message(
        &self,
        room_id: RoomId,
        content: &str,
    ) -> Result<MessagePayload, ClientError> {
        let ack = self
            .request(ClientRequest::SendMessage {
                room_id,
                content: content.to_string(),
            })
            .await?;
        if ack.ok {
            ack.message
                .ok_or_else(|| ClientError::Payload("ack missing confirmed message".to_string()))
        } else {
            Err(ClientError::Rejected(
                ack.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }

    pub async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        let ack = self.request(ClientRequest::JoinRoom { room_id }).await?;
        ack_to_unit(ack)
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        let ack = self.request(ClientRequest::LeaveRoom { room_id }).await?;
        ack_to_unit(ack)
    }

    /// Full reload of the conversation list, feeding
    /// [`InboxState::load_rooms`].
    pub async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>, ClientError> {
        let token = self.token().await?;
        let rooms = self
            .http
            .get(format!("{}/rooms", self.config.server_url))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(http_error)?
            .error_for_status()
            .map_err(http_error)?
            .json()
            .await
            .map_err(http_error)?;
        Ok(rooms)
    }

    pub async fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let token = self.token().await?;
        let limit = limit.clamp(1, 100);
        let messages = self
            .http
            .get(format!(
                "{}/rooms/{}/messages",
                self.config.server_url, room_id.0
            ))
            .query(&[("limit", limit)])
            .bearer_auth(&token)
            .send()
            .await
            .map_err(http_error)?
            .error_for_status()
            .map_err(http_error)?
            .json()
            .await
            .map_err(http_error)?;
        Ok(messages)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    async fn token(&self) -> Result<String, ClientError> {
        self.inner
            .lock()
            .await
            .token
            .clone()
            .ok_or(ClientError::NotAuthenticated)
    }

    async fn teardown(&self) {
        let reconnect = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.writer = None;
            inner.pending_acks.clear();
            inner.reconnect_task.take()
        };
        if let Some(task) = reconnect {
            task.abort();
        }
    }

    async fn establish(&self, token: &str) -> Result<WsStream, ClientError> {
        let ws_url = websocket_url(&self.config.server_url, token)?;
        let (stream, _) = connect_async(&ws_url)
            .await
            .map_err(|err| ClientError::Handshake(err.to_string()))?;
        Ok(stream)
    }

    /// Installs an established stream: spawns the connection task and, after
    /// the settle delay, reports the connection ready for sends.
    ///
    /// The epoch check and the writer install happen under one lock
    /// acquisition. If the connection was torn down or replaced while the
    /// handshake was in flight, the stream is dropped here, which closes it.
    fn install<'a>(
        self: &'a Arc<Self>,
        stream: WsStream,
        expected_epoch: u64,
    ) -> futures::future::BoxFuture<'a, ()> {
        Box::pin(async move {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let epoch = {
                let mut inner = self.inner.lock().await;
                if inner.epoch != expected_epoch {
                    return;
                }
                inner.epoch += 1;
                inner.writer = Some(out_tx);
                inner.epoch
            };
            tokio::spawn(Arc::clone(self).run_connection(stream, out_rx, epoch));

            tokio::time::sleep(self.config.ready_settle_delay).await;
            let inner = self.inner.lock().await;
            if inner.epoch == epoch && inner.writer.is_some() {
                self.set_status(ConnectionStatus::Connected);
            }
        })
    }

    async fn run_connection(
        self: Arc<Self>,
        stream: WsStream,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
        epoch: u64,
    ) {
        let (mut sink, mut reader) = stream.split();
        let reason = loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(err) = sink.send(frame).await {
                            break DropReason::Transport(err.to_string());
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break DropReason::Local;
                    }
                },
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                    Some(Ok(Message::Close(_))) => break DropReason::ServerClose,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break DropReason::Transport(err.to_string()),
                    None => {
                        break DropReason::Transport(
                            "stream ended without close handshake".to_string(),
                        )
                    }
                },
            }
        };

        // Status updates and the reconnect handle are published under the
        // state lock so a concurrent connect/disconnect cannot interleave.
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return;
        }
        inner.writer = None;
        // Dropping the senders rejects every in-flight request with
        // `ConnectionClosed`.
        inner.pending_acks.clear();

        match reason {
            DropReason::Local => {}
            DropReason::ServerClose => {
                info!("realtime: server closed the connection");
                self.set_status(ConnectionStatus::Disconnected { error: None });
            }
            DropReason::Transport(err) => {
                warn!(error = %err, "realtime: connection dropped, scheduling reconnect");
                self.set_status(ConnectionStatus::Connecting);
                let client = Arc::clone(&self);
                let handle = tokio::spawn(async move { client.reconnect_loop(epoch).await });
                inner.reconnect_task.replace(handle);
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ServerFrame>(text) {
            Ok(ServerFrame::Event(event)) => {
                let _ = self.events.send(ClientEvent::Server(event));
            }
            Ok(ServerFrame::Ack(ack)) => {
                let pending = {
                    let mut inner = self.inner.lock().await;
                    inner.pending_acks.remove(&ack.request_id)
                };
                match pending {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => warn!(
                        request_id = ack.request_id,
                        "realtime: ack for unknown or expired request"
                    ),
                }
            }
            Err(err) => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("invalid server frame: {err}")));
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        let base = self.config.reconnect_base_delay;
        let max_attempts = self.config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            tokio::time::sleep(backoff_delay(base, attempt)).await;

            // Status writes happen under the same lock acquisition as the
            // epoch check, so they cannot land after a concurrent teardown.
            let token = {
                let inner = self.inner.lock().await;
                if inner.epoch != epoch {
                    return;
                }
                let Some(token) = inner.token.clone() else {
                    return;
                };
                self.set_status(ConnectionStatus::Connecting);
                token
            };

            match self.establish(&token).await {
                Ok(stream) => {
                    info!(attempt, "realtime: reconnecting");
                    self.install(stream, epoch).await;
                    return;
                }
                Err(err) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "realtime: reconnect attempt failed"
                    );
                }
            }
        }

        let inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return;
        }
        self.set_status(ConnectionStatus::Disconnected {
            error: Some(format!(
                "reconnect failed after {max_attempts} attempts; call connect to retry"
            )),
        });
    }

    async fn request(&self, request: ClientRequest) -> Result<AckPayload, ClientError> {
        let (request_id, rx) = {
            let mut inner = self.inner.lock().await;
            if *self.status.borrow() != ConnectionStatus::Connected {
                return Err(ClientError::NotConnected);
            }
            let writer = inner.writer.clone().ok_or(ClientError::NotConnected)?;

            inner.next_request_id += 1;
            let request_id = inner.next_request_id;
            let frame = ClientFrame {
                request_id,
                request,
            };
            let text = serde_json::to_string(&frame)
                .map_err(|err| ClientError::Payload(err.to_string()))?;

            let (tx, rx) = oneshot::channel();
            inner.pending_acks.insert(request_id, tx);
            if writer.send(Message::Text(text)).is_err() {
                inner.pending_acks.remove(&request_id);
                return Err(ClientError::NotConnected);
            }
            (request_id, rx)
        };

        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.inner.lock().await.pending_acks.remove(&request_id);
                Err(ClientError::AckTimeout)
            }
        }
    }
}

fn ack_to_unit(ack: AckPayload) -> Result<(), ClientError> {
    if ack.ok {
        Ok(())
    } else {
        Err(ClientError::Rejected(
            ack.error.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}

fn http_error(err: reqwest::Error) -> ClientError {
    ClientError::Http(err.to_string())
}

/// Object-safe seam between the realtime client and presentation code.
/// Subscriptions unsubscribe when the returned receiver is dropped.
#[async_trait]
pub trait RealtimeHandle: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<String, ClientError>;
    async fn connect(&self, token: &str) -> Result<(), ClientError>;
    async fn disconnect(&self);
    async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError>;
    async fn leave_room(&self, room_id: RoomId) -> Result<(), ClientError>;
    async fn send_message(
        &self,
        room_id: RoomId,
        content: &str,
    ) -> Result<MessagePayload, ClientError>;
    async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>, ClientError>;
    async fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, ClientError>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus>;
}

#[async_trait]
impl RealtimeHandle for Arc<RealtimeClient> {
    async fn login(&self, username: &str, password: &str) -> Result<String, ClientError> {
        RealtimeClient::login(self, username, password).await
    }

    async fn connect(&self, token: &str) -> Result<(), ClientError> {
        RealtimeClient::connect(self, token).await
    }

    async fn disconnect(&self) {
        RealtimeClient::disconnect(self).await;
    }

    async fn join_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        RealtimeClient::join_room(self, room_id).await
    }

    async fn leave_room(&self, room_id: RoomId) -> Result<(), ClientError> {
        RealtimeClient::leave_room(self, room_id).await
    }

    async fn send_message(
        &self,
        room_id: RoomId,
        content: &str,
    ) -> Result<MessagePayload, ClientError> {
        RealtimeClient::send_message(self, room_id, content).await
    }

    async fn fetch_rooms(&self) -> Result<Vec<RoomSummary>, ClientError> {
        RealtimeClient::fetch_rooms(self).await
    }

    async fn fetch_messages(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        RealtimeClient::fetch_messages(self, room_id, limit).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        RealtimeClient::subscribe_events(self)
    }

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        RealtimeClient::subscribe_status(self)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
