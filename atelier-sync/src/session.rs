//! Transport session and room membership.
//!
//! One [`Session`] owns one WebSocket connection to the workspace server
//! and is the only component that touches it; everything else reaches the
//! wire through the [`EventRouter`] the session binds on connect.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──handshake ok──► Connected
//!      ▲                        │  ▲                        │
//!      │   attempts exhausted   │  │ bounded retry          │ connection lost
//!      └────────────────────────┘  └────────────────────────┘
//!
//! Connecting/Connected ──auth_error──► AuthRejected (terminal)
//! ```
//!
//! The session also tracks room membership: the single project the client
//! has joined. On every successful (re)connect the last known project is
//! rejoined automatically, so membership survives transport churn without
//! the caller doing anything.
//!
//! Reference: Kleppmann, Chapter 8 — Unreliable Networks

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{ClientEvent, ServerEvent};
use crate::router::EventRouter;

type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// The server rejected our credentials. Terminal: only a fresh
    /// [`Session::connect`] with a new token leaves this state.
    AuthRejected,
}

/// Lifecycle events for the surrounding application.
///
/// `AuthRejected` is the signal to navigate to a login surface; no other
/// condition produces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { connection_id: String },
    Disconnected,
    Reconnecting { attempt: u32 },
    AuthRejected,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the workspace server.
    pub server_url: String,
    /// Timeout for one connection attempt.
    pub connect_timeout: Duration,
    /// Failed attempts tolerated before giving up.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090/sync".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 5,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// Session errors. Transient failures are also absorbed into the retry
/// machine; the `Err` from [`Session::connect`] only reports the first
/// attempt.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection attempt timed out")]
    Timeout,
}

struct Shared {
    config: SessionConfig,
    router: Arc<EventRouter>,
    state: RwLock<SessionState>,
    connection_id: RwLock<Option<String>>,
    current_project: RwLock<Option<String>>,
    token: RwLock<Option<String>>,
    attempts: RwLock<u32>,
    /// Connection intent counter. Bumped by connect/disconnect/loss so
    /// tasks from a superseded intent observe staleness and stand down.
    epoch: AtomicU64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// One client's connection to the workspace server.
///
/// Explicitly constructed and explicitly owned — no process-wide singleton.
/// Tests run several independent sessions side by side.
pub struct Session {
    shared: Arc<Shared>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl Session {
    pub fn new(config: SessionConfig, router: Arc<EventRouter>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                router,
                state: RwLock::new(SessionState::Disconnected),
                connection_id: RwLock::new(None),
                current_project: RwLock::new(None),
                token: RwLock::new(None),
                attempts: RwLock::new(0),
                epoch: AtomicU64::new(0),
                events_tx,
                retry_task: Mutex::new(None),
                reader_task: Mutex::new(None),
            }),
            events_rx: Some(events_rx),
        }
    }

    /// Take the lifecycle event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Open the connection, presenting `token` in the handshake.
    ///
    /// No-op when already connected. The returned `Err` reflects only the
    /// first attempt; further attempts continue in the background up to
    /// `max_attempts`, observable through state and lifecycle events.
    pub async fn connect(&self, token: &str) -> Result<(), SessionError> {
        if *self.shared.state.read().await == SessionState::Connected {
            log::debug!("connect while already connected, ignoring");
            return Ok(());
        }

        // A fresh connect intent supersedes any pending retry cycle.
        let epoch = self.shared.bump_epoch().await;
        *self.shared.token.write().await = Some(token.to_string());
        *self.shared.attempts.write().await = 0;
        *self.shared.state.write().await = SessionState::Connecting;

        match Shared::attempt(&self.shared, epoch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                Shared::record_failure(&self.shared, epoch).await;
                Err(e)
            }
        }
    }

    /// Close the connection and leave the room.
    ///
    /// Cancels any pending reconnect timer and clears the current project.
    /// Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.detach_transport().await;
        if let Some(handle) = shared.reader_task.lock().await.take() {
            handle.abort();
        }
        *shared.current_project.write().await = None;

        let mut state = shared.state.write().await;
        if *state != SessionState::Disconnected {
            *state = SessionState::Disconnected;
            drop(state);
            shared.send_event(SessionEvent::Disconnected);
            log::info!("disconnected");
        }
    }

    /// Join a project room. Requires a live connection; otherwise a no-op
    /// and the caller must not assume the join occurred.
    ///
    /// Joining the already-current project re-emits the join request
    /// without changing local state.
    pub async fn join_project(&self, project_id: &str) {
        if !self.is_connected().await {
            log::debug!("join_project({project_id}) while not connected, ignoring");
            return;
        }

        *self.shared.current_project.write().await = Some(project_id.to_string());
        self.shared
            .router
            .emit(ClientEvent::ProjectJoin {
                project_id: project_id.to_string(),
            })
            .await;
        log::info!("joined project {project_id}");
    }

    /// Leave a project room. Emits a leave request only when `project_id`
    /// is the currently joined project; anything else is a no-op, guarding
    /// against stale UI calls after a project switch.
    pub async fn leave_project(&self, project_id: &str) {
        if !self.is_connected().await {
            return;
        }

        let mut current = self.shared.current_project.write().await;
        if current.as_deref() != Some(project_id) {
            log::debug!("leave_project({project_id}) for non-current project, ignoring");
            return;
        }
        *current = None;
        drop(current);

        self.shared
            .router
            .emit(ClientEvent::ProjectLeave {
                project_id: project_id.to_string(),
            })
            .await;
        log::info!("left project {project_id}");
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == SessionState::Connected
    }

    /// Opaque id of the live connection, absent while disconnected.
    pub async fn connection_id(&self) -> Option<String> {
        self.shared.connection_id.read().await.clone()
    }

    pub async fn current_project(&self) -> Option<String> {
        self.shared.current_project.read().await.clone()
    }

    /// Failed attempts in the current connect cycle.
    pub async fn attempts(&self) -> u32 {
        *self.shared.attempts.read().await
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.shared.router
    }
}

impl Shared {
    fn send_event(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn epoch_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Invalidate the previous connection intent and cancel its retry timer.
    async fn bump_epoch(&self) -> u64 {
        if let Some(handle) = self.retry_task.lock().await.take() {
            handle.abort();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Unbind the router and drop connection identity. The writer task ends
    /// when the router drops its sender; the socket closes with it.
    async fn detach_transport(self: &Arc<Self>) {
        let _ = self.bump_epoch().await;
        self.router.unbind().await;
        *self.connection_id.write().await = None;
    }

    /// One connection attempt: dial, wire writer/reader tasks, rejoin.
    async fn attempt(self: &Arc<Self>, epoch: u64) -> Result<(), SessionError> {
        let token = self.token.read().await.clone().unwrap_or_default();
        let url = format!("{}?token={}", self.config.server_url, token);

        let dial = tokio_tungstenite::connect_async(&url);
        let ws_stream = match tokio::time::timeout(self.config.connect_timeout, dial).await {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => return Err(SessionError::Connection(e.to_string())),
            Err(_) => return Err(SessionError::Timeout),
        };

        if !self.epoch_current(epoch) {
            // Superseded by disconnect() or a newer connect while dialing.
            return Err(SessionError::Connection("attempt superseded".into()));
        }

        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                match event.encode() {
                    Ok(frame) => {
                        if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("failed to encode outgoing event: {e}"),
                }
            }
        });

        self.router.bind(out_tx).await;

        let connection_id = Uuid::new_v4().to_string();
        *self.connection_id.write().await = Some(connection_id.clone());
        *self.state.write().await = SessionState::Connected;
        *self.attempts.write().await = 0;
        log::info!("connected ({connection_id})");
        self.send_event(SessionEvent::Connected { connection_id });

        // Rejoin-on-reconnect: membership survives transport churn.
        if let Some(project_id) = self.current_project.read().await.clone() {
            log::info!("rejoining project {project_id}");
            self.router
                .emit(ClientEvent::ProjectJoin { project_id })
                .await;
        }

        let shared = self.clone();
        let handle = tokio::spawn(async move {
            Shared::read_loop(shared, epoch, ws_reader).await;
        });
        *self.reader_task.lock().await = Some(handle);

        Ok(())
    }

    /// Count a failed attempt; retry after the configured delay or give up.
    async fn record_failure(self: &Arc<Self>, epoch: u64) {
        if !self.epoch_current(epoch) {
            return;
        }

        let attempts = {
            let mut attempts = self.attempts.write().await;
            *attempts += 1;
            *attempts
        };

        if attempts >= self.config.max_attempts {
            log::warn!("giving up after {attempts} failed connection attempts");
            *self.state.write().await = SessionState::Disconnected;
            self.send_event(SessionEvent::Disconnected);
            return;
        }

        log::info!(
            "connection attempt {attempts}/{} failed, retrying in {:?}",
            self.config.max_attempts,
            self.config.retry_delay
        );
        self.send_event(SessionEvent::Reconnecting { attempt: attempts });
        self.spawn_retry(epoch).await;
    }

    fn spawn_retry(self: &Arc<Self>, epoch: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let this = self.clone();
        Box::pin(async move {
            let shared = this.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(shared.config.retry_delay).await;
                if !shared.epoch_current(epoch) {
                    return;
                }
                if let Err(_e) = Shared::attempt(&shared, epoch).await {
                    Shared::record_failure(&shared, epoch).await;
                }
            });
            *this.retry_task.lock().await = Some(handle);
        })
    }

    /// Process inbound frames until the connection ends.
    ///
    /// `auth_error` is consumed here — forced disconnect, terminal
    /// `AuthRejected`, no retry. Any other end of stream enters a fresh
    /// bounded reconnect cycle.
    async fn read_loop(shared: Arc<Shared>, epoch: u64, mut reader: WsReader) {
        while let Some(frame) = reader.next().await {
            if !shared.epoch_current(epoch) {
                return;
            }

            match frame {
                Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                    Ok(ServerEvent::AuthError { message }) => {
                        log::warn!(
                            "authentication rejected by server: {}",
                            message.as_deref().unwrap_or("no reason given")
                        );
                        shared.detach_transport().await;
                        *shared.current_project.write().await = None;
                        *shared.state.write().await = SessionState::AuthRejected;
                        shared.send_event(SessionEvent::AuthRejected);
                        return;
                    }
                    Ok(event) => shared.router.dispatch(event).await,
                    Err(e) => log::warn!("undecodable frame dropped: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        if !shared.epoch_current(epoch) {
            return;
        }

        // Unexpected loss: keep membership, re-enter the retry machine.
        log::warn!("connection lost, reconnecting");
        let new_epoch = shared.bump_epoch().await;
        shared.router.unbind().await;
        *shared.connection_id.write().await = None;
        *shared.attempts.write().await = 0;
        *shared.state.write().await = SessionState::Connecting;
        shared.send_event(SessionEvent::Disconnected);
        shared.spawn_retry(new_epoch).await;
    }
}
