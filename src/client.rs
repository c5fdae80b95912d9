//! Client replica: a full copy of the session document plus the connection
//! machinery that keeps it converged with the hub.
//!
//! Lifecycle:
//! - `connect()` dials the hub, sends `join`, and spawns a supervisor task
//!   that owns the socket.
//! - The document observer forwards every local-origin update to the hub as
//!   a sync step-2 frame while connected; network-origin updates are applied
//!   with the `hub` tag and never re-sent. That single rule prevents loops.
//! - Inbound step 0 is answered with a step-1 diff; the replica also sends
//!   its own step 0 after joining so both sides converge.
//! - A heartbeat control frame goes out every `heartbeat_interval`.
//! - An unexpected close triggers reconnection with exponential backoff
//!   (base × factor^n); after `max_reconnect_attempts` failures the replica
//!   surfaces a terminal disconnect.
//!
//! File operations mirror the server-side session and run against the local
//! document; edits made while offline are folded in by the sync handshake on
//! the next connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::document::{DocError, UpdateScope, WorkspaceDoc};
use crate::protocol::{ControlMessage, Frame, SyncFrame};
use crate::types::{
    Activity, ActivityPatch, FileMeta, OpResult, Operation, SessionStats, WriteMode,
};

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    pub session_id: String,
    pub user_id: String,
    pub heartbeat_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_factor: u32,
    pub max_reconnect_attempts: u32,
}

impl ReplicaConfig {
    pub fn new(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_id: session_id.into(),
            user_id: Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_factor: 2,
            max_reconnect_attempts: 10,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}

/// Connection state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// Stream established and `join` sent.
    Connected,
    /// The hub acknowledged the join.
    Joined { stats: SessionStats },
    /// First step-1 answer applied; the replica has the session state.
    Synced,
    /// Connection lost. `terminal` means reconnection attempts are
    /// exhausted (or the disconnect was requested).
    Disconnected { terminal: bool },
    ParticipantJoined { user_id: String },
    ParticipantLeft { user_id: String },
    ActivityUpdate { user_id: String, activity: Activity },
    /// The local document changed from a network update.
    RemoteUpdate,
    /// Opaque awareness payload from a peer.
    Awareness(Vec<u8>),
    /// The hub reported an error on this stream.
    HubError(String),
}

/// Client errors.
#[derive(Debug)]
pub enum ClientError {
    Connect(String),
    AlreadyConnected,
    Observer(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "failed to connect: {e}"),
            ClientError::AlreadyConnected => write!(f, "replica is already connected"),
            ClientError::Observer(e) => write!(f, "failed to install update observer: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

enum ConnEnd {
    /// `disconnect()` was requested (or the replica was dropped).
    Shutdown,
    /// The stream died underneath us.
    Lost,
}

struct ReplicaInner {
    config: ReplicaConfig,
    doc: WorkspaceDoc,
    state: RwLock<ConnectionState>,
    connected: Arc<AtomicBool>,
    outbox_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_tx: mpsc::Sender<ReplicaEvent>,
    shutdown: Notify,
}

impl ReplicaInner {
    async fn emit(&self, event: ReplicaEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn queue_frame(&self, frame: &Frame) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(bytes) = frame.encode() {
            let _ = self.outbox_tx.send(bytes);
        }
    }
}

/// One client replica of a session.
pub struct Replica {
    inner: Arc<ReplicaInner>,
    event_rx: Option<mpsc::Receiver<ReplicaEvent>>,
    outbox_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    supervisor: Option<JoinHandle<mpsc::UnboundedReceiver<Vec<u8>>>>,
    _doc_sub: yrs::Subscription,
}

impl Replica {
    pub fn new(config: ReplicaConfig) -> Result<Self, ClientError> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let doc = WorkspaceDoc::new();
        let doc_sub = doc
            .observe_updates({
                let outbox = outbox_tx.clone();
                let connected = connected.clone();
                move |update, scope| {
                    // Origin discipline: only local updates go out.
                    if scope == UpdateScope::Local && connected.load(Ordering::SeqCst) {
                        if let Ok(bytes) = Frame::update(update).encode() {
                            let _ = outbox.send(bytes);
                        }
                    }
                }
            })
            .map_err(|e| ClientError::Observer(e.to_string()))?;

        let inner = Arc::new(ReplicaInner {
            config,
            doc,
            state: RwLock::new(ConnectionState::Disconnected),
            connected,
            outbox_tx,
            event_tx,
            shutdown: Notify::new(),
        });

        Ok(Self {
            inner,
            event_rx: Some(event_rx),
            outbox_rx: Some(outbox_rx),
            supervisor: None,
            _doc_sub: doc_sub,
        })
    }

    /// Take the event receiver (once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ReplicaEvent>> {
        self.event_rx.take()
    }

    pub fn user_id(&self) -> &str {
        &self.inner.config.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.config.session_id
    }

    /// The local document, for adapters that need the change notification
    /// or direct reads.
    pub fn doc(&self) -> &WorkspaceDoc {
        &self.inner.doc
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Dial the hub and start the connection supervisor. Callable again
    /// after a disconnect; the replica keeps its document state and the
    /// sync handshake folds in anything missed.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if let Some(handle) = self.supervisor.take() {
            if *self.inner.state.read().await != ConnectionState::Disconnected {
                self.supervisor = Some(handle);
                return Err(ClientError::AlreadyConnected);
            }
            match handle.await {
                Ok(rx) => self.outbox_rx = Some(rx),
                Err(e) => return Err(ClientError::Connect(e.to_string())),
            }
        }
        let outbox_rx = match self.outbox_rx.take() {
            Some(rx) => rx,
            None => return Err(ClientError::AlreadyConnected),
        };

        // Consume any shutdown permit left over from a previous life so the
        // new supervisor does not disconnect on its first poll.
        let _ = tokio::time::timeout(Duration::from_millis(0), self.inner.shutdown.notified())
            .await;

        *self.inner.state.write().await = ConnectionState::Connecting;
        match connect_async(&self.inner.config.url).await {
            Ok((ws, _)) => {
                let inner = self.inner.clone();
                self.supervisor = Some(tokio::spawn(supervisor(inner, ws, outbox_rx)));
                Ok(())
            }
            Err(e) => {
                // Leave the replica reusable after a failed dial.
                self.outbox_rx = Some(outbox_rx);
                *self.inner.state.write().await = ConnectionState::Disconnected;
                Err(ClientError::Connect(e.to_string()))
            }
        }
    }

    /// Leave the session and close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            self.inner.shutdown.notify_one();
            if let Ok(rx) = handle.await {
                self.outbox_rx = Some(rx);
            }
        }
    }

    // ─── File operations (mirror the server-side session) ─────────────

    pub fn write_file(&self, path: &str, content: &str, mode: WriteMode) -> i64 {
        self.inner
            .doc
            .write_file(path, content, &self.inner.config.user_id, mode)
    }

    pub fn write_file_binary(&self, path: &str, bytes: &[u8]) -> i64 {
        self.inner
            .doc
            .write_file_binary(path, bytes, &self.inner.config.user_id)
    }

    pub fn insert_text(&self, path: &str, index: u32, chunk: &str) -> OpResult {
        self.inner
            .doc
            .insert_text(path, index, chunk, &self.inner.config.user_id)
    }

    pub fn delete_range(&self, path: &str, index: u32, len: u32) -> OpResult {
        self.inner
            .doc
            .delete_range(path, index, len, &self.inner.config.user_id)
    }

    pub fn move_file(&self, old: &str, new: &str) -> OpResult {
        self.inner
            .doc
            .move_file(old, new, &self.inner.config.user_id)
    }

    pub fn delete_file(&self, path: &str) -> OpResult {
        self.inner
            .doc
            .delete_file(path, &self.inner.config.user_id)
    }

    pub fn read_file(&self, path: &str) -> Option<String> {
        self.inner.doc.read_file(path)
    }

    pub fn read_file_bytes(&self, path: &str) -> Result<Option<Vec<u8>>, DocError> {
        self.inner.doc.read_file_bytes(path)
    }

    pub fn list_files(&self, prefix: Option<&str>) -> Vec<(String, FileMeta)> {
        self.inner.doc.list_files(prefix)
    }

    pub fn file_meta(&self, path: &str) -> Option<FileMeta> {
        self.inner.doc.file_meta(path)
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.inner.doc.operations()
    }

    /// Update this user's activity in the local document (propagates as a
    /// normal update) and send the immediate presence frame.
    pub fn update_activity(&self, patch: ActivityPatch) -> Activity {
        let merged = self
            .inner
            .doc
            .update_activity(&self.inner.config.user_id, &patch);
        self.inner
            .queue_frame(&Frame::Control(ControlMessage::UpdateActivity {
                user_id: self.inner.config.user_id.clone(),
                session_id: self.inner.config.session_id.clone(),
                activity: patch,
            }));
        merged
    }

    /// Send opaque awareness bytes. Silently dropped while offline.
    pub fn send_awareness(&self, payload: Vec<u8>) {
        self.inner.queue_frame(&Frame::Awareness(payload));
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // Wake the supervisor so it sends `leave` and closes the socket.
        self.inner.shutdown.notify_one();
    }
}

// ─── Connection supervisor ────────────────────────────────────────────

/// Runs connections until a clean shutdown or reconnect exhaustion, then
/// hands the outbox receiver back so a later `connect()` can reuse it.
async fn supervisor(
    inner: Arc<ReplicaInner>,
    first_ws: ClientWs,
    mut outbox_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let mut ws = Some(first_ws);
    while let Some(stream) = ws.take() {
        let end = run_connection(&inner, stream, &mut outbox_rx).await;
        inner.connected.store(false, Ordering::SeqCst);

        match end {
            ConnEnd::Shutdown => {
                *inner.state.write().await = ConnectionState::Disconnected;
                inner.emit(ReplicaEvent::Disconnected { terminal: false }).await;
                break;
            }
            ConnEnd::Lost => {
                *inner.state.write().await = ConnectionState::Reconnecting;
                inner.emit(ReplicaEvent::Disconnected { terminal: false }).await;

                let mut delay = inner.config.reconnect_base;
                for attempt in 1..=inner.config.max_reconnect_attempts {
                    tokio::select! {
                        _ = inner.shutdown.notified() => {
                            *inner.state.write().await = ConnectionState::Disconnected;
                            return outbox_rx;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match connect_async(&inner.config.url).await {
                        Ok((stream, _)) => {
                            log::info!(
                                "reconnected to {} on attempt {attempt}",
                                inner.config.url
                            );
                            ws = Some(stream);
                            break;
                        }
                        Err(e) => {
                            log::warn!("reconnect attempt {attempt} failed: {e}");
                            delay *= inner.config.reconnect_factor;
                        }
                    }
                }
                if ws.is_none() {
                    log::error!(
                        "giving up after {} reconnect attempts",
                        inner.config.max_reconnect_attempts
                    );
                    *inner.state.write().await = ConnectionState::Disconnected;
                    inner.emit(ReplicaEvent::Disconnected { terminal: true }).await;
                }
            }
        }
    }
    outbox_rx
}

async fn run_connection(
    inner: &Arc<ReplicaInner>,
    ws: ClientWs,
    outbox_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> ConnEnd {
    let (mut sender, mut receiver) = ws.split();
    *inner.state.write().await = ConnectionState::Connecting;

    let join = Frame::Control(ControlMessage::Join {
        user_id: inner.config.user_id.clone(),
        session_id: inner.config.session_id.clone(),
    });
    if send_frame(&mut sender, &join).await.is_err() {
        return ConnEnd::Lost;
    }
    inner.connected.store(true, Ordering::SeqCst);

    // Kick off our half of the handshake: ask the hub for what we miss.
    let step0 = Frame::state_vector(inner.doc.state_vector());
    if send_frame(&mut sender, &step0).await.is_err() {
        return ConnEnd::Lost;
    }

    *inner.state.write().await = ConnectionState::Connected;
    inner.emit(ReplicaEvent::Connected).await;

    let mut synced = false;
    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => {
                let leave = Frame::Control(ControlMessage::Leave {
                    user_id: inner.config.user_id.clone(),
                    session_id: inner.config.session_id.clone(),
                });
                let _ = send_frame(&mut sender, &leave).await;
                let _ = sender.close().await;
                return ConnEnd::Shutdown;
            }

            out = outbox_rx.recv() => {
                match out {
                    Some(bytes) => {
                        if sender.send(Message::Binary(bytes.into())).await.is_err() {
                            return ConnEnd::Lost;
                        }
                    }
                    // All senders dropped: the replica is gone.
                    None => return ConnEnd::Shutdown,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match Frame::decode(&bytes) {
                            Ok(frame) => {
                                if !handle_inbound(inner, frame, &mut sender, &mut synced).await {
                                    return ConnEnd::Lost;
                                }
                            }
                            Err(e) => log::warn!("undecodable frame from hub: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            return ConnEnd::Lost;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return ConnEnd::Lost,
                    Some(Err(e)) => {
                        log::warn!("websocket error: {e}");
                        return ConnEnd::Lost;
                    }
                    _ => {}
                }
            }

            _ = heartbeat.tick() => {
                let frame = Frame::Control(ControlMessage::Heartbeat {
                    user_id: inner.config.user_id.clone(),
                    session_id: inner.config.session_id.clone(),
                });
                if send_frame(&mut sender, &frame).await.is_err() {
                    return ConnEnd::Lost;
                }
            }
        }
    }
}

/// Process one frame from the hub. Returns `false` when the connection is
/// unusable.
async fn handle_inbound(
    inner: &Arc<ReplicaInner>,
    frame: Frame,
    sender: &mut futures_util::stream::SplitSink<ClientWs, Message>,
    synced: &mut bool,
) -> bool {
    match frame {
        Frame::Sync(SyncFrame::StateVector(sv)) => match inner.doc.encode_diff(&sv) {
            Ok(diff) => send_frame(sender, &Frame::answer(diff)).await.is_ok(),
            Err(e) => {
                log::warn!("hub sent an undecodable state vector: {e}");
                true
            }
        },
        Frame::Sync(SyncFrame::Answer(update)) => {
            match inner.doc.apply_update(&update, UpdateScope::Hub) {
                Ok(()) => {
                    if !*synced {
                        *synced = true;
                        inner.emit(ReplicaEvent::Synced).await;
                    }
                    inner.emit(ReplicaEvent::RemoteUpdate).await;
                }
                Err(e) => log::error!("failed to apply sync answer: {e}"),
            }
            true
        }
        Frame::Sync(SyncFrame::Update(update)) => {
            match inner.doc.apply_update(&update, UpdateScope::Hub) {
                Ok(()) => inner.emit(ReplicaEvent::RemoteUpdate).await,
                Err(e) => log::error!("failed to apply update: {e}"),
            }
            true
        }
        Frame::Awareness(payload) => {
            inner.emit(ReplicaEvent::Awareness(payload)).await;
            true
        }
        Frame::Control(msg) => {
            match msg {
                ControlMessage::Joined { data } => {
                    inner.emit(ReplicaEvent::Joined { stats: data.stats }).await;
                }
                ControlMessage::ParticipantJoined { data } => {
                    inner
                        .emit(ReplicaEvent::ParticipantJoined {
                            user_id: data.user_id,
                        })
                        .await;
                }
                ControlMessage::ParticipantLeft { data } => {
                    inner
                        .emit(ReplicaEvent::ParticipantLeft {
                            user_id: data.user_id,
                        })
                        .await;
                }
                ControlMessage::ActivityUpdate { data } => {
                    inner
                        .emit(ReplicaEvent::ActivityUpdate {
                            user_id: data.user_id,
                            activity: data.activity,
                        })
                        .await;
                }
                ControlMessage::Error { error } => {
                    log::warn!("hub error: {error}");
                    inner.emit(ReplicaEvent::HubError(error)).await;
                }
                other => log::debug!("ignoring unexpected control message: {other:?}"),
            }
            true
        }
    }
}

async fn send_frame(
    sender: &mut futures_util::stream::SplitSink<ClientWs, Message>,
    frame: &Frame,
) -> Result<(), ()> {
    let bytes = frame.encode().map_err(|_| ())?;
    sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|_| ())
}
