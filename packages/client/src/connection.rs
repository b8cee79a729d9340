//! The managed connection: one self-healing WebSocket session per client.
//!
//! This is the single canonical connection type; room, typing and read-receipt
//! helpers are thin wrappers over [`ManagedConnection::send`]. One driver task
//! owns the socket, so every state transition, timer and write is serialized
//! with respect to the connection's mutable state.
//!
//! Lifecycle: `Disconnected → Connecting → Authenticating → Connected`, then
//! on abnormal closure `Reconnecting ⇄ Connecting` under exponential backoff,
//! bounded by the circuit breaker and the retry ceiling. `disconnect()` is
//! terminal for the session and cancels all pending work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use renraku_shared::envelope::Envelope;
use renraku_shared::ids::{RoomId, UserId, generate_message_id};
use renraku_shared::time::get_utc_timestamp;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::heartbeat::HeartbeatMonitor;
use crate::queue::{EnqueueOutcome, OutboundQueue};
use crate::reconnect::ReconnectSchedule;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    CircuitOpen,
}

/// What happened to a `send()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live transport
    Sent,
    /// Buffered until the connection is (re)established
    Queued,
    /// Buffered; the oldest queued envelope was evicted to make room
    QueuedDroppingOldest,
}

/// How one socket session ended
enum SessionEnd {
    /// User disconnect or a normal/going-away close from the server
    Clean,
    /// Server rejected `authenticate`; never retried
    AuthRejected(String),
    /// Abnormal closure or transport failure; candidate for reconnection
    Failed(ClientError),
}

struct Shared {
    state: ConnectionState,
    queue: OutboundQueue,
    /// Live write channel into the driver's pump, present only while connected
    writer: Option<mpsc::UnboundedSender<Envelope>>,
    breaker: CircuitBreaker,
    schedule: ReconnectSchedule,
    last_heartbeat_at: Option<Instant>,
    /// Socket handle assigned by the server on the current session
    connection_id: Option<String>,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    config: ConnectionConfig,
    user_id: UserId,
    shared: Mutex<Shared>,
    events: broadcast::Sender<ClientEvent>,
    foreground_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

/// A self-healing client connection.
///
/// Cheap to clone the handle? No — one value per logical session, owned by the
/// caller that created it. All methods take `&self`; internal state is behind
/// a mutex that is never held across a socket await.
pub struct ManagedConnection {
    inner: Arc<Inner>,
}

impl ManagedConnection {
    pub fn new(user_id: UserId, config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (foreground_tx, _) = watch::channel(true);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Shared {
            state: ConnectionState::Disconnected,
            queue: OutboundQueue::new(config.queue_capacity),
            writer: None,
            breaker: CircuitBreaker::new(config.breaker),
            schedule: ReconnectSchedule::new(config.reconnect),
            last_heartbeat_at: None,
            connection_id: None,
            driver: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                user_id,
                shared: Mutex::new(shared),
                events,
                foreground_tx,
                shutdown_tx,
            }),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.shared.lock().await.state
    }

    /// Socket handle assigned by the server, once authenticated.
    pub async fn connection_id(&self) -> Option<String> {
        self.inner.shared.lock().await.connection_id.clone()
    }

    /// Retries scheduled since the last authenticated success.
    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.lock().await.schedule.attempt()
    }

    pub async fn last_heartbeat_at(&self) -> Option<Instant> {
        self.inner.shared.lock().await.last_heartbeat_at
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.shared.lock().await.queue.len()
    }

    /// Subscribe to decoded inbound envelopes and lifecycle events. Dropping
    /// the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Tell the connection whether the host app is in the foreground. While
    /// backgrounded, due retries are held and rescheduled, so a suspended app
    /// does not burn a reconnect storm.
    pub fn set_foreground(&self, active: bool) {
        let _ = self.inner.foreground_tx.send(active);
    }

    /// Open the connection and authenticate as `user_id`.
    ///
    /// Resolves with the outcome of the first attempt: `Ok` once the server
    /// answers `authenticated`, or an error on connect timeout, transport
    /// failure, authentication rejection, or a circuit-open refusal (the last
    /// without opening a socket at all). After a transport failure the retry
    /// loop keeps running in the background; watch [`ClientEvent`]s for the
    /// rest of the story.
    ///
    /// A no-op returning `Ok` while already connecting, connected, or
    /// reconnecting.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut shared = self.inner.shared.lock().await;
            match shared.state {
                ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Connected
                | ConnectionState::Reconnecting => return Ok(()),
                ConnectionState::Disconnected | ConnectionState::CircuitOpen => {}
            }
            if let Err(retry_in) = shared.breaker.try_acquire(Instant::now()) {
                shared.state = ConnectionState::CircuitOpen;
                return Err(ClientError::CircuitOpen { retry_in });
            }
            if let Some(stale) = shared.driver.take() {
                // terminal driver from a previous session; it has already
                // stopped or is about to
                drop(stale);
            }
            self.inner.shutdown_tx.send_replace(false);
            shared.state = ConnectionState::Connecting;
            emit(
                &self.inner,
                ClientEvent::StateChanged(ConnectionState::Connecting),
            );
            let inner = Arc::clone(&self.inner);
            shared.driver = Some(tokio::spawn(drive(inner, first_tx)));
        }
        match first_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Fire-and-forget send: written immediately while connected, otherwise
    /// queued for the next authenticated session. Never an error.
    pub async fn send(&self, envelope: Envelope) -> SendOutcome {
        let mut envelope = envelope;
        let mut shared = self.inner.shared.lock().await;
        if shared.state == ConnectionState::Connected {
            if let Some(writer) = shared.writer.as_ref() {
                match writer.send(envelope) {
                    Ok(()) => return SendOutcome::Sent,
                    // pump is tearing down; fall through to the queue
                    Err(err) => envelope = err.0,
                }
            }
        }
        match shared.queue.enqueue(envelope, get_utc_timestamp()) {
            EnqueueOutcome::Enqueued => SendOutcome::Queued,
            EnqueueOutcome::EnqueuedDroppingOldest(dropped) => {
                tracing::warn!(
                    "outbound queue full; dropped oldest '{}' envelope",
                    dropped.envelope.kind()
                );
                SendOutcome::QueuedDroppingOldest
            }
        }
    }

    /// Tear the session down for good: cancels any pending reconnect and
    /// heartbeat work atomically with the transition to `Disconnected`,
    /// closes the transport with a normal-closure code, and drops the
    /// outbound queue. No auto-reconnect follows; call [`connect`] to start
    /// a fresh session.
    ///
    /// [`connect`]: ManagedConnection::connect
    pub async fn disconnect(&self) {
        let (was, driver) = {
            let mut shared = self.inner.shared.lock().await;
            let was = shared.state;
            shared.state = ConnectionState::Disconnected;
            shared.writer = None;
            shared.connection_id = None;
            shared.queue.clear();
            (was, shared.driver.take())
        };
        let _ = self.inner.shutdown_tx.send(true);
        if was != ConnectionState::Disconnected {
            emit(
                &self.inner,
                ClientEvent::StateChanged(ConnectionState::Disconnected),
            );
        }
        if let Some(driver) = driver {
            // the driver selects on the shutdown signal everywhere it waits,
            // so this resolves promptly
            let _ = driver.await;
        }
    }

    // ---- thin protocol helpers over send() ----

    pub async fn join_room(&self, room_id: RoomId) -> SendOutcome {
        self.send(Envelope::JoinRoom { room_id }).await
    }

    pub async fn leave_room(&self, room_id: RoomId) -> SendOutcome {
        self.send(Envelope::LeaveRoom { room_id }).await
    }

    pub async fn typing(&self, room_id: RoomId) -> SendOutcome {
        self.send(Envelope::Typing {
            room_id,
            user_id: self.inner.user_id.clone(),
        })
        .await
    }

    pub async fn stop_typing(&self, room_id: RoomId) -> SendOutcome {
        self.send(Envelope::StopTyping {
            room_id,
            user_id: self.inner.user_id.clone(),
        })
        .await
    }

    /// Send a chat message to a room. Returns the generated message id for
    /// delivery-status correlation.
    pub async fn send_chat_to_room(
        &self,
        room_id: RoomId,
        content: impl Into<String>,
    ) -> (SendOutcome, String) {
        let message_id = generate_message_id();
        let outcome = self
            .send(Envelope::SendMessage {
                sender_id: self.inner.user_id.clone(),
                recipient_id: None,
                room_id: Some(room_id),
                content: content.into(),
                message_id: message_id.clone(),
                timestamp: get_utc_timestamp(),
            })
            .await;
        (outcome, message_id)
    }

    /// Send a direct chat message to a single user.
    pub async fn send_chat_to_user(
        &self,
        recipient_id: UserId,
        content: impl Into<String>,
    ) -> (SendOutcome, String) {
        let message_id = generate_message_id();
        let outcome = self
            .send(Envelope::SendMessage {
                sender_id: self.inner.user_id.clone(),
                recipient_id: Some(recipient_id),
                room_id: None,
                content: content.into(),
                message_id: message_id.clone(),
                timestamp: get_utc_timestamp(),
            })
            .await;
        (outcome, message_id)
    }

    /// Tell the original sender their message has been read.
    pub async fn mark_read(
        &self,
        message_id: impl Into<String>,
        sender_id: UserId,
    ) -> SendOutcome {
        self.send(Envelope::MarkRead {
            reader_id: self.inner.user_id.clone(),
            sender_id,
            message_id: message_id.into(),
        })
        .await
    }
}

fn emit(inner: &Arc<Inner>, event: ClientEvent) {
    // nobody listening is fine
    let _ = inner.events.send(event);
}

async fn set_state(inner: &Arc<Inner>, state: ConnectionState) {
    {
        let mut shared = inner.shared.lock().await;
        if shared.state == state {
            return;
        }
        shared.state = state;
    }
    emit(inner, ClientEvent::StateChanged(state));
}

/// Resolves once shutdown is requested (or the handle is gone).
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // sender dropped; treat as shutdown
    }
}

async fn send_envelope(sink: &mut WsSink, envelope: &Envelope) -> Result<(), ClientError> {
    let json = envelope
        .encode()
        .map_err(|e| ClientError::Codec(e.to_string()))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))
}

/// The driver: owns the socket across the session's connect/reconnect cycles.
async fn drive(inner: Arc<Inner>, first: oneshot::Sender<Result<(), ClientError>>) {
    let mut first = Some(first);
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        let end = attempt_session(&inner, &mut first, &mut shutdown_rx).await;

        if *shutdown_rx.borrow() {
            set_state(&inner, ConnectionState::Disconnected).await;
            break;
        }

        match end {
            SessionEnd::Clean => {
                set_state(&inner, ConnectionState::Disconnected).await;
                break;
            }
            SessionEnd::AuthRejected(reason) => {
                tracing::error!("authentication rejected for '{}': {}", inner.user_id, reason);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(ClientError::AuthenticationRejected {
                        reason: reason.clone(),
                    }));
                } else {
                    emit(&inner, ClientEvent::AuthenticationFailed { reason });
                }
                set_state(&inner, ConnectionState::Disconnected).await;
                break;
            }
            SessionEnd::Failed(error) => {
                let plan = {
                    let mut shared = inner.shared.lock().await;
                    shared.breaker.record_failure(Instant::now());
                    if matches!(shared.breaker.state(), BreakerState::Open { .. }) {
                        shared.state = ConnectionState::CircuitOpen;
                        RetryPlan::CircuitOpen
                    } else {
                        match shared.schedule.next_delay() {
                            Some(delay) => {
                                shared.state = ConnectionState::Reconnecting;
                                RetryPlan::Retry {
                                    delay,
                                    attempt: shared.schedule.attempt(),
                                }
                            }
                            None => {
                                shared.state = ConnectionState::Disconnected;
                                RetryPlan::Exhausted
                            }
                        }
                    }
                };
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(error.clone()));
                }
                match plan {
                    RetryPlan::CircuitOpen => {
                        tracing::warn!("circuit breaker opened after repeated failures: {}", error);
                        emit(&inner, ClientEvent::StateChanged(ConnectionState::CircuitOpen));
                        emit(&inner, ClientEvent::CircuitOpened);
                        break;
                    }
                    RetryPlan::Exhausted => {
                        tracing::error!("giving up after exhausting reconnect attempts: {}", error);
                        emit(&inner, ClientEvent::StateChanged(ConnectionState::Disconnected));
                        emit(&inner, ClientEvent::ReconnectExhausted);
                        break;
                    }
                    RetryPlan::Retry { delay, attempt } => {
                        tracing::warn!(
                            "connection lost ({}); retry {} in {:?}",
                            error,
                            attempt,
                            delay
                        );
                        emit(&inner, ClientEvent::StateChanged(ConnectionState::Reconnecting));
                        emit(&inner, ClientEvent::ReconnectScheduled { attempt, delay });
                        if !wait_retry(&inner, delay, &mut shutdown_rx).await {
                            set_state(&inner, ConnectionState::Disconnected).await;
                            break;
                        }
                    }
                }
            }
        }
    }
}

enum RetryPlan {
    Retry { delay: Duration, attempt: u32 },
    CircuitOpen,
    Exhausted,
}

/// Sleep out the backoff delay. Held while the app is backgrounded and
/// restarted in full once the foreground is regained. Returns `false` when
/// shutdown was requested while waiting.
async fn wait_retry(
    inner: &Arc<Inner>,
    delay: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let mut foreground_rx = inner.foreground_tx.subscribe();
    loop {
        if !*foreground_rx.borrow() {
            tracing::debug!("backgrounded; holding reconnect until foreground");
            tokio::select! {
                result = foreground_rx.wait_for(|fg| *fg) => {
                    if result.is_err() {
                        return false;
                    }
                }
                _ = wait_shutdown(shutdown_rx) => return false,
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => return true,
            _ = wait_shutdown(shutdown_rx) => return false,
            result = foreground_rx.wait_for(|fg| !*fg) => {
                if result.is_err() {
                    return false;
                }
                // went background mid-wait; reschedule from the top
            }
        }
    }
}

/// One connect → authenticate → pump cycle.
async fn attempt_session(
    inner: &Arc<Inner>,
    first: &mut Option<oneshot::Sender<Result<(), ClientError>>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    set_state(inner, ConnectionState::Connecting).await;

    let ws = tokio::select! {
        result = tokio::time::timeout(inner.config.connect_timeout, connect_async(inner.config.url.as_str())) => {
            match result {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => return SessionEnd::Failed(ClientError::Transport(e.to_string())),
                Err(_) => return SessionEnd::Failed(ClientError::ConnectTimeout(inner.config.connect_timeout)),
            }
        }
        _ = wait_shutdown(shutdown_rx) => return SessionEnd::Clean,
    };

    let (mut sink, mut stream) = ws.split();

    set_state(inner, ConnectionState::Authenticating).await;
    let auth = Envelope::Authenticate {
        user_id: inner.user_id.clone(),
    };
    if let Err(e) = send_envelope(&mut sink, &auth).await {
        return SessionEnd::Failed(e);
    }

    match wait_for_authenticated(inner, &mut sink, &mut stream, shutdown_rx).await {
        AuthWait::Authenticated => {}
        AuthWait::End(end) => return end,
    }

    // Promote to connected: reset the failure machinery, install the live
    // writer, then flush whatever queued up while we were away.
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Envelope>();
    {
        let mut shared = inner.shared.lock().await;
        shared.state = ConnectionState::Connected;
        shared.breaker.record_success();
        shared.schedule.reset();
        shared.writer = Some(writer_tx);
    }
    emit(inner, ClientEvent::StateChanged(ConnectionState::Connected));
    if let Some(tx) = first.take() {
        let _ = tx.send(Ok(()));
    }

    loop {
        let entry = { inner.shared.lock().await.queue.pop_front() };
        let Some(entry) = entry else { break };
        if let Err(e) = send_envelope(&mut sink, &entry.envelope).await {
            // abort the flush with the entry back at the head; order is
            // preserved for the next session
            inner.shared.lock().await.queue.push_front(entry);
            demote(inner, writer_rx).await;
            return SessionEnd::Failed(e);
        }
    }

    let end = pump(inner, &mut sink, &mut stream, &mut writer_rx, shutdown_rx).await;
    demote(inner, writer_rx).await;
    end
}

enum AuthWait {
    Authenticated,
    End(SessionEnd),
}

async fn wait_for_authenticated(
    inner: &Arc<Inner>,
    sink: &mut WsSink,
    stream: &mut WsStream,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> AuthWait {
    let deadline = tokio::time::Instant::now() + inner.config.auth_timeout;
    loop {
        let message = tokio::select! {
            next = tokio::time::timeout_at(deadline, stream.next()) => {
                match next {
                    Ok(Some(Ok(message))) => message,
                    Ok(Some(Err(e))) => {
                        return AuthWait::End(SessionEnd::Failed(ClientError::Transport(e.to_string())));
                    }
                    Ok(None) => return AuthWait::End(SessionEnd::Failed(ClientError::ConnectionClosed)),
                    Err(_) => {
                        return AuthWait::End(SessionEnd::Failed(ClientError::ConnectTimeout(
                            inner.config.auth_timeout,
                        )));
                    }
                }
            }
            _ = wait_shutdown(shutdown_rx) => {
                let _ = sink.send(close_normal()).await;
                return AuthWait::End(SessionEnd::Clean);
            }
        };
        match message {
            Message::Text(text) => match Envelope::decode(text.as_str()) {
                Ok(Envelope::Authenticated { connection_id, .. }) => {
                    inner.shared.lock().await.connection_id = Some(connection_id);
                    return AuthWait::Authenticated;
                }
                Ok(Envelope::ConnectionAck { .. }) => {}
                Ok(Envelope::Error { code, message }) => {
                    tracing::error!("server refused authentication ({}): {}", code, message);
                    return AuthWait::End(SessionEnd::AuthRejected(message));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("undecodable frame during authentication: {}", e),
            },
            Message::Close(_) => {
                return AuthWait::End(SessionEnd::Failed(ClientError::ConnectionClosed));
            }
            _ => {}
        }
    }
}

/// The connected main loop: inbound frames, outbound writes, heartbeats.
async fn pump(
    inner: &Arc<Inner>,
    sink: &mut WsSink,
    stream: &mut WsStream,
    writer_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut monitor = HeartbeatMonitor::new(inner.config.heartbeat);
    let mut probe_interval = tokio::time::interval_at(
        tokio::time::Instant::now() + monitor.interval(),
        monitor.interval(),
    );
    probe_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let ack_deadline = monitor.ack_deadline();
        tokio::select! {
            _ = wait_shutdown(shutdown_rx) => {
                let _ = sink.send(close_normal()).await;
                return SessionEnd::Clean;
            }
            outbound = writer_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        if let Err(e) = send_envelope(sink, &envelope).await {
                            return SessionEnd::Failed(e);
                        }
                    }
                    // writer removed by disconnect()
                    None => {
                        let _ = sink.send(close_normal()).await;
                        return SessionEnd::Clean;
                    }
                }
            }
            _ = probe_interval.tick() => {
                let probe = Envelope::Heartbeat { timestamp: get_utc_timestamp() };
                if let Err(e) = send_envelope(sink, &probe).await {
                    return SessionEnd::Failed(e);
                }
                monitor.on_probe_sent(Instant::now());
            }
            _ = sleep_until_opt(ack_deadline) => {
                tracing::warn!("heartbeat acknowledgement missed; closing proactively");
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Failed(ClientError::HeartbeatTimeout);
            }
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return SessionEnd::Failed(ClientError::Transport(e.to_string())),
                    None => return SessionEnd::Failed(ClientError::ConnectionClosed),
                };
                match message {
                    Message::Text(text) => match Envelope::decode(text.as_str()) {
                        Ok(Envelope::HeartbeatAck { .. }) => {
                            let now = Instant::now();
                            monitor.on_ack(now);
                            inner.shared.lock().await.last_heartbeat_at = Some(now);
                        }
                        Ok(Envelope::Heartbeat { timestamp }) => {
                            // symmetric: answer server-side probes
                            let ack = Envelope::HeartbeatAck { timestamp };
                            if let Err(e) = send_envelope(sink, &ack).await {
                                return SessionEnd::Failed(e);
                            }
                        }
                        Ok(Envelope::Error { code, message }) => {
                            tracing::warn!("protocol error from server ({}): {}", code, message);
                            emit(inner, ClientEvent::ProtocolError { code, message });
                        }
                        Ok(Envelope::Unknown) => {
                            tracing::debug!("ignoring envelope with unknown type");
                        }
                        Ok(envelope) => emit(inner, ClientEvent::Envelope(envelope)),
                        Err(e) => tracing::warn!("undecodable frame: {}", e),
                    },
                    Message::Close(frame) => {
                        let normal = matches!(
                            &frame,
                            Some(f) if f.code == CloseCode::Normal || f.code == CloseCode::Away
                        );
                        if normal {
                            tracing::info!("server closed the connection normally");
                            return SessionEnd::Clean;
                        }
                        tracing::warn!("abnormal close from server: {:?}", frame);
                        return SessionEnd::Failed(ClientError::ConnectionClosed);
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    _ => {}
                }
            }
        }
    }
}

/// Remove the live writer and fold its unsent envelopes back into the queue,
/// behind whatever the aborted flush left there, so FIFO order survives.
async fn demote(inner: &Arc<Inner>, mut writer_rx: mpsc::UnboundedReceiver<Envelope>) {
    let mut shared = inner.shared.lock().await;
    shared.writer = None;
    shared.connection_id = None;
    if *inner.shutdown_tx.borrow() {
        // explicit disconnect: in-flight envelopes die with the queue
        return;
    }
    writer_rx.close();
    let now = get_utc_timestamp();
    while let Ok(envelope) = writer_rx.try_recv() {
        if let EnqueueOutcome::EnqueuedDroppingOldest(dropped) = shared.queue.enqueue(envelope, now)
        {
            tracing::warn!(
                "outbound queue full while demoting; dropped oldest '{}' envelope",
                dropped.envelope.kind()
            );
        }
    }
}

fn close_normal() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "client disconnect".into(),
    }))
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending::<()>().await,
    }
}
