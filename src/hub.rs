//! Central coordination hub: accepts WebSocket connections, routes them to
//! sessions, relays sync/awareness frames, and persists session snapshots.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session (id) ── WorkspaceDoc ── SessionChannel
//! Client B ──┘         │
//!                      ├── SnapshotStore (one file per session)
//!                      │
//!           ┌──────────┼───────────┐
//!           ▼          ▼           ▼
//!        Client A   Client B    Client C
//! ```
//!
//! Every mutation of a session document happens under that session's mutex,
//! and the fan-out enqueue happens under the same lock, so peers receive
//! updates in the exact order they were committed server-side. The
//! `sessions` and `clients` maps are never held across network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{future, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{SessionChannel, SessionFrame, HUB_SENDER};
use crate::document::{DocError, UpdateScope};
use crate::protocol::{
    ActivityUpdateData, ControlMessage, Frame, JoinedData, ParticipantData, SyncFrame,
};
use crate::session::Session;
use crate::snapshot::SnapshotStore;
use crate::types::{ActivityAction, ActivityPatch};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Snapshot directory (None = no persistence).
    pub snapshot_dir: Option<PathBuf>,
    /// Periodic snapshot cadence per session.
    pub snapshot_interval: Duration,
    /// Expected client heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// A stream silent for `liveness_factor × heartbeat_interval` is closed.
    pub liveness_factor: u32,
    /// Fan-out buffer per connection before a laggard is dropped.
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            snapshot_dir: None,
            snapshot_interval: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            liveness_factor: 3,
            broadcast_capacity: 256,
        }
    }
}

/// Hub-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
    pub snapshots_written: u64,
}

/// Hub errors.
#[derive(Debug)]
pub enum HubError {
    Bind(String),
    Accept(String),
    Snapshot(String),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubError::Bind(e) => write!(f, "failed to bind listener: {e}"),
            HubError::Accept(e) => write!(f, "failed to accept connection: {e}"),
            HubError::Snapshot(e) => write!(f, "failed to open snapshot store: {e}"),
        }
    }
}

impl std::error::Error for HubError {}

/// One live session: the document behind its single-writer lock, the
/// fan-out channel, and the observer that pushes hub-originated updates
/// (activity writes) out to every stream.
struct SessionEntry {
    session_id: String,
    session: Mutex<Session>,
    channel: Arc<SessionChannel>,
    _doc_sub: Option<yrs::Subscription>,
}

struct SessionSlot {
    entry: Arc<SessionEntry>,
    snapshot_task: Option<JoinHandle<()>>,
}

struct ClientEntry {
    #[allow(dead_code)]
    user_id: String,
    #[allow(dead_code)]
    session_id: String,
}

/// A connection's binding to a session, established by the join handshake.
struct Registration {
    user_id: String,
    session_id: String,
    entry: Arc<SessionEntry>,
}

/// The coordination hub.
pub struct Hub {
    config: HubConfig,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    clients: RwLock<HashMap<u64, ClientEntry>>,
    stats: RwLock<HubStats>,
    store: Option<Arc<SnapshotStore>>,
    snapshot_counter: Arc<AtomicU64>,
    next_conn_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Result<Arc<Self>, HubError> {
        let store = match &config.snapshot_dir {
            Some(dir) => Some(Arc::new(
                SnapshotStore::open(dir).map_err(|e| HubError::Snapshot(e.to_string()))?,
            )),
            None => None,
        };
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            stats: RwLock::new(HubStats::default()),
            store,
            snapshot_counter: Arc::new(AtomicU64::new(0)),
            // Connection id 0 is reserved for the hub itself.
            next_conn_id: AtomicU64::new(HUB_SENDER + 1),
            shutdown_tx,
        }))
    }

    pub fn with_defaults() -> Result<Arc<Self>, HubError> {
        Self::new(HubConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> HubStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.sessions.read().await.len();
        stats.snapshots_written = self.snapshot_counter.load(Ordering::Relaxed);
        stats
    }

    /// Request a graceful shutdown: stop accepting, snapshot every session,
    /// then let `run` return.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Accept connections until shutdown, then snapshot and tear down every
    /// session. Completes only after all final snapshots returned.
    pub async fn run(self: Arc<Self>) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| HubError::Bind(e.to_string()))?;
        log::info!("hub listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if !*self.shutdown_tx.borrow() {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, addr) = accepted.map_err(|e| HubError::Accept(e.to_string()))?;
                        log::debug!("new TCP connection from {addr}");
                        let hub = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_connection(stream, addr).await {
                                log::warn!("connection from {addr} ended with error: {e}");
                            }
                        });
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }

        drop(listener);
        self.finalize().await;
        Ok(())
    }

    /// `run`, wired to SIGINT/SIGTERM.
    pub async fn run_with_signals(self: Arc<Self>) -> Result<(), HubError> {
        let hub = self.clone();
        tokio::spawn(async move {
            wait_for_termination().await;
            log::info!("termination signal received, shutting down");
            hub.shutdown();
        });
        self.run().await
    }

    // ─── Connection handling ──────────────────────────────────────────

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        log::info!("connection {conn_id} established from {addr}");

        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        let liveness = self.config.heartbeat_interval * self.config.liveness_factor;
        let mut deadline = Instant::now() + liveness;
        let mut registration: Option<Registration> = None;
        let mut fan_rx: Option<broadcast::Receiver<Arc<SessionFrame>>> = None;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            deadline = Instant::now() + liveness;
                            {
                                let mut stats = self.stats.write().await;
                                stats.total_frames += 1;
                                stats.total_bytes += bytes.len() as u64;
                            }
                            let frame = match Frame::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("malformed frame from {addr}: {e}");
                                    let _ = send_frame(
                                        &mut ws_sender,
                                        &Frame::error(format!("malformed frame: {e}")),
                                    )
                                    .await;
                                    break;
                                }
                            };
                            match self
                                .handle_frame(
                                    conn_id,
                                    frame,
                                    bytes,
                                    &mut registration,
                                    &mut fan_rx,
                                    &mut ws_sender,
                                )
                                .await
                            {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(e) => {
                                    log::warn!("connection {conn_id} frame handling failed: {e}");
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {conn_id} closed");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::warn!("websocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = async {
                    match fan_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if frame.sender_id != conn_id
                                && ws_sender
                                    .send(Message::Binary(frame.bytes.clone().into()))
                                    .await
                                    .is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("connection {conn_id} lagged by {n} frames, dropping");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    log::info!("connection {conn_id} missed heartbeats, closing");
                    break;
                }

                _ = shutdown_rx.changed() => break,
            }
        }

        self.cleanup_connection(conn_id, registration).await;
        Ok(())
    }

    /// Handle one decoded frame. Returns `Ok(false)` when the connection
    /// should close.
    async fn handle_frame(
        &self,
        conn_id: u64,
        frame: Frame,
        raw: Vec<u8>,
        registration: &mut Option<Registration>,
        fan_rx: &mut Option<broadcast::Receiver<Arc<SessionFrame>>>,
        ws_sender: &mut WsSink,
    ) -> Result<bool, BoxError> {
        match frame {
            Frame::Control(ControlMessage::Join {
                user_id,
                session_id,
            }) => {
                if registration.is_some() {
                    let _ = send_frame(ws_sender, &Frame::error("already joined")).await;
                    return Ok(false);
                }
                if !SnapshotStore::valid_session_id(&session_id) {
                    let _ =
                        send_frame(ws_sender, &Frame::error("invalid session id")).await;
                    return Ok(false);
                }
                let entry = self.get_or_create_session(&session_id).await;
                let (stats, sv) = {
                    let mut session = entry.session.lock().await;
                    session.add_participant(&user_id);
                    // Subscribe under the session lock: nothing can commit
                    // between the state vector below and this receiver.
                    *fan_rx = Some(entry.channel.subscribe());
                    (session.stats(), session.doc().state_vector())
                };
                self.clients.write().await.insert(
                    conn_id,
                    ClientEntry {
                        user_id: user_id.clone(),
                        session_id: session_id.clone(),
                    },
                );
                send_frame(
                    ws_sender,
                    &Frame::Control(ControlMessage::Joined {
                        data: JoinedData {
                            session_id: session_id.clone(),
                            stats,
                        },
                    }),
                )
                .await?;
                send_frame(ws_sender, &Frame::state_vector(sv)).await?;
                let notify = Frame::Control(ControlMessage::ParticipantJoined {
                    data: ParticipantData {
                        user_id: user_id.clone(),
                    },
                })
                .encode()?;
                entry.channel.send(conn_id, notify);
                log::info!("user {user_id} joined session {session_id}");
                *registration = Some(Registration {
                    user_id,
                    session_id,
                    entry,
                });
                Ok(true)
            }

            Frame::Sync(sync) => {
                let Some(reg) = registration.as_ref() else {
                    log::warn!("sync frame before join on connection {conn_id}");
                    let _ = send_frame(ws_sender, &Frame::error("join required")).await;
                    return Ok(false);
                };
                match sync {
                    SyncFrame::StateVector(sv) => {
                        let diff = {
                            let session = reg.entry.session.lock().await;
                            session.doc().encode_diff(&sv)
                        };
                        match diff {
                            Ok(diff) => {
                                send_frame(ws_sender, &Frame::answer(diff)).await?;
                                Ok(true)
                            }
                            Err(e) => {
                                log::warn!("bad state vector from {}: {e}", reg.user_id);
                                let _ = send_frame(
                                    ws_sender,
                                    &Frame::error("invalid state vector"),
                                )
                                .await;
                                Ok(false)
                            }
                        }
                    }
                    SyncFrame::Answer(update) | SyncFrame::Update(update) => {
                        let session = reg.entry.session.lock().await;
                        match session.doc().apply_update(&update, UpdateScope::Hub) {
                            Ok(()) => {
                                // Relay under the lock so every peer sees
                                // updates in commit order.
                                let relay = Frame::update(update).encode()?;
                                reg.entry.channel.send(conn_id, relay);
                                Ok(true)
                            }
                            Err(DocError::InvalidUpdate(e)) => {
                                drop(session);
                                log::warn!("undecodable update from {}: {e}", reg.user_id);
                                let _ = send_frame(
                                    ws_sender,
                                    &Frame::error("invalid update"),
                                )
                                .await;
                                Ok(false)
                            }
                            Err(e) => {
                                drop(session);
                                log::error!(
                                    "document failure in session {}: {e}",
                                    reg.session_id
                                );
                                self.destroy_session(&reg.session_id, false).await;
                                Ok(false)
                            }
                        }
                    }
                }
            }

            Frame::Awareness(_) => {
                let Some(reg) = registration.as_ref() else {
                    let _ = send_frame(ws_sender, &Frame::error("join required")).await;
                    return Ok(false);
                };
                // Relay the original bytes untouched; awareness is opaque.
                reg.entry.channel.send(conn_id, raw);
                Ok(true)
            }

            Frame::Control(ControlMessage::Leave { .. }) => Ok(false),

            Frame::Control(ControlMessage::Heartbeat { .. }) => {
                if let Some(reg) = registration.as_ref() {
                    let session = reg.entry.session.lock().await;
                    session.update_activity(
                        &reg.user_id,
                        &ActivityPatch {
                            action: ActivityAction::Idle,
                            current_file: None,
                        },
                    );
                }
                Ok(true)
            }

            Frame::Control(ControlMessage::UpdateActivity { activity, .. }) => {
                let Some(reg) = registration.as_ref() else {
                    let _ = send_frame(ws_sender, &Frame::error("join required")).await;
                    return Ok(false);
                };
                let merged = {
                    let session = reg.entry.session.lock().await;
                    session.update_activity(&reg.user_id, &activity)
                };
                let notify = Frame::Control(ControlMessage::ActivityUpdate {
                    data: ActivityUpdateData {
                        user_id: reg.user_id.clone(),
                        activity: merged,
                    },
                })
                .encode()?;
                reg.entry.channel.send(conn_id, notify);
                Ok(true)
            }

            // Server-to-client control kinds have no meaning inbound.
            Frame::Control(other) => {
                log::debug!("ignoring unexpected control message: {other:?}");
                Ok(true)
            }
        }
    }

    async fn cleanup_connection(&self, conn_id: u64, registration: Option<Registration>) {
        self.clients.write().await.remove(&conn_id);

        if let Some(reg) = registration {
            let (was_participant, empty) = {
                let mut session = reg.entry.session.lock().await;
                let removed = session.remove_participant(&reg.user_id);
                (removed, session.is_empty())
            };
            if was_participant {
                if let Ok(notify) = Frame::Control(ControlMessage::ParticipantLeft {
                    data: ParticipantData {
                        user_id: reg.user_id.clone(),
                    },
                })
                .encode()
                {
                    reg.entry.channel.send(conn_id, notify);
                }
                log::info!("user {} left session {}", reg.user_id, reg.session_id);
            }
            if empty {
                self.destroy_session(&reg.session_id, true).await;
            }
        }

        let active_sessions = self.sessions.read().await.len();
        let mut stats = self.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
        stats.active_sessions = active_sessions;
    }

    // ─── Session lifecycle ────────────────────────────────────────────

    async fn get_or_create_session(&self, session_id: &str) -> Arc<SessionEntry> {
        {
            let sessions = self.sessions.read().await;
            if let Some(slot) = sessions.get(session_id) {
                return slot.entry.clone();
            }
        }

        // Build the session (restoring if a snapshot exists) outside the
        // map lock; disk I/O must not block unrelated sessions.
        let session = Session::new(session_id);
        if let Some(store) = &self.store {
            match store.get(session_id) {
                Ok(Some(bytes)) => match session.restore_from(&bytes) {
                    Ok(()) => log::info!(
                        "session {session_id} restored from snapshot ({} bytes)",
                        bytes.len()
                    ),
                    Err(e) => log::warn!(
                        "snapshot for session {session_id} unusable, starting fresh: {e}"
                    ),
                },
                Ok(None) => {}
                Err(e) => log::warn!("snapshot lookup failed for session {session_id}: {e}"),
            }
        }

        let channel = Arc::new(SessionChannel::new(self.config.broadcast_capacity));
        let fan = channel.clone();
        let doc_sub = session
            .doc()
            .observe_updates(move |update, scope| {
                // Hub-local mutations (activity writes) reach peers the same
                // way client updates do.
                if scope == UpdateScope::Local {
                    if let Ok(bytes) = Frame::update(update).encode() {
                        fan.send(HUB_SENDER, bytes);
                    }
                }
            })
            .map_err(|e| log::error!("update observer for session {session_id} failed: {e}"))
            .ok();

        let entry = Arc::new(SessionEntry {
            session_id: session_id.to_string(),
            session: Mutex::new(session),
            channel,
            _doc_sub: doc_sub,
        });

        let mut sessions = self.sessions.write().await;
        if let Some(slot) = sessions.get(session_id) {
            // Lost the creation race; the other entry wins.
            return slot.entry.clone();
        }
        let snapshot_task = self.store.as_ref().map(|store| {
            tokio::spawn(snapshot_loop(
                Arc::downgrade(&entry),
                store.clone(),
                self.config.snapshot_interval,
                self.snapshot_counter.clone(),
            ))
        });
        sessions.insert(
            session_id.to_string(),
            SessionSlot {
                entry: entry.clone(),
                snapshot_task,
            },
        );
        log::info!("session {session_id} created");
        entry
    }

    /// Snapshot a session and remove it from the map. With `only_if_empty`,
    /// the removal is skipped when a participant joined in the meantime.
    async fn destroy_session(&self, session_id: &str, only_if_empty: bool) {
        let entry = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).map(|slot| slot.entry.clone())
        };
        let Some(entry) = entry else { return };

        let bytes = {
            let session = entry.session.lock().await;
            if only_if_empty && !session.is_empty() {
                return;
            }
            session.snapshot_bytes()
        };
        self.persist_snapshot(session_id, &bytes);

        let mut sessions = self.sessions.write().await;
        let remove = match sessions.get(session_id) {
            Some(slot) if only_if_empty => slot.entry.session.lock().await.is_empty(),
            Some(_) => true,
            None => false,
        };
        if remove {
            if let Some(slot) = sessions.remove(session_id) {
                if let Some(task) = slot.snapshot_task {
                    task.abort();
                }
            }
            log::info!("session {session_id} destroyed");
        }
    }

    fn persist_snapshot(&self, session_id: &str, bytes: &[u8]) {
        let Some(store) = &self.store else { return };
        match store.put(session_id, bytes) {
            Ok(()) => {
                self.snapshot_counter.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "snapshot written for session {session_id} ({} bytes)",
                    bytes.len()
                );
            }
            Err(e) => log::error!("snapshot write failed for session {session_id}: {e}"),
        }
    }

    /// Shutdown epilogue: cancel timers and take one final snapshot per
    /// session, in parallel.
    async fn finalize(&self) {
        let slots: Vec<(String, SessionSlot)> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };
        let mut finals = Vec::new();
        for (session_id, slot) in slots {
            if let Some(task) = &slot.snapshot_task {
                task.abort();
            }
            finals.push(async move {
                let bytes = slot.entry.session.lock().await.snapshot_bytes();
                (session_id, slot, bytes)
            });
        }
        for (session_id, _slot, bytes) in future::join_all(finals).await {
            self.persist_snapshot(&session_id, &bytes);
            log::info!("final snapshot taken for session {session_id}");
        }
        log::info!("hub shutdown complete");
    }
}

/// Periodic snapshot writer for one session. Exits when the session entry
/// is dropped; the hub also aborts it on destroy and shutdown.
async fn snapshot_loop(
    entry: Weak<SessionEntry>,
    store: Arc<SnapshotStore>,
    interval: Duration,
    counter: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume the immediate first tick
    loop {
        ticker.tick().await;
        let Some(entry) = entry.upgrade() else { break };
        let bytes = entry.session.lock().await.snapshot_bytes();
        match store.put(&entry.session_id, &bytes) {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "periodic snapshot for session {} ({} bytes)",
                    entry.session_id,
                    bytes.len()
                );
            }
            // Non-fatal; the next tick retries.
            Err(e) => log::warn!(
                "periodic snapshot failed for session {}: {e}",
                entry.session_id
            ),
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<(), BoxError> {
    let bytes = frame.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
