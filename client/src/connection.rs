use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use youplace_shared::{
    Cell, ClientMessage, HexColor, LevelUp, RateStatus, RejectReason, ServerMessage, Viewport,
};

use crate::backoff::ResyncRetryState;
use crate::debounce::{DEFAULT_SETTLE_DELAY, ViewportDebouncer};
use crate::observer::Observable;
use crate::reconcile::{DEFAULT_PENDING_TIMEOUT, ReconciliationCache, Rollback};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EXPIRY_TICK: Duration = Duration::from_millis(500);
/// Messages held while the socket is down; the oldest are dropped past this.
const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Live,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:3000/api/ws`.
    pub url: String,
    /// Sent as `Authorization: Bearer`; without it the session can only watch.
    pub token: Option<String>,
    pub pending_timeout: Duration,
    pub settle_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Everything a UI reads from a live session.
#[derive(Clone)]
pub struct Session {
    cache: Arc<Mutex<ReconciliationCache>>,
    pub status: Observable<ConnectionStatus>,
    pub user_id: Observable<Option<String>>,
    pub rate: Observable<Option<RateStatus>>,
    pub level_up: Observable<Option<LevelUp>>,
    pub last_rollback: Observable<Option<Rollback>>,
}

impl Session {
    fn new(pending_timeout: Duration) -> Self {
        Self {
            cache: Arc::new(Mutex::new(ReconciliationCache::new(pending_timeout))),
            status: Observable::new(ConnectionStatus::Disconnected),
            user_id: Observable::new(None),
            rate: Observable::new(None),
            level_up: Observable::new(None),
            last_rollback: Observable::new(None),
        }
    }

    /// Locked access to the merged pixel cache.
    pub fn cache(&self) -> MutexGuard<'_, ReconciliationCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds one server message into the session. Observers run after the cache lock is released.
    pub fn apply(&self, message: ServerMessage) {
        match message {
            ServerMessage::Hello { user_id, rate, .. } => {
                self.user_id.set(user_id);
                if rate.is_some() {
                    self.rate.set(rate);
                }
            }
            ServerMessage::RoomState {
                viewport, pixels, ..
            } => {
                self.cache().on_snapshot(viewport, pixels);
            }
            ServerMessage::PixelsUpdate { pixels } => {
                let mut cache = self.cache();
                for pixel in pixels {
                    cache.on_server_event(pixel);
                }
            }
            ServerMessage::PaintResult { request_id, result } => {
                let rollback = self.cache().on_paint_result(request_id, result);
                if let Some(rollback) = rollback {
                    self.report_rollback(rollback);
                }
            }
            ServerMessage::RateStatus(status) => {
                self.rate.set(Some(status));
            }
            ServerMessage::LevelUp(level_up) => {
                info!(new_level = level_up.new_level, title = %level_up.new_title, "level up");
                self.level_up.set(Some(level_up));
            }
            ServerMessage::Error { code, message } => {
                warn!(%code, %message, "server reported an error");
            }
            ServerMessage::Pong => {}
        }
    }

    fn expire(&self, now: Instant) {
        let rollbacks = self.cache().expire(now);
        for rollback in rollbacks {
            self.report_rollback(rollback);
        }
    }

    /// Paints whose optimistic edit already resolved (timed out, replaced or
    /// overwritten by server truth) must not reach the server any more.
    fn still_wanted(&self, message: &ClientMessage) -> bool {
        match message {
            ClientMessage::Paint { request_id, .. } => self.cache().is_request_pending(*request_id),
            _ => true,
        }
    }

    fn queue_offline(&self, outbox: &mut VecDeque<ClientMessage>, message: ClientMessage) {
        outbox.push_back(message);
        while outbox.len() > OUTBOX_CAPACITY {
            let Some(ClientMessage::Paint { request_id, .. }) = outbox.pop_front() else {
                continue;
            };
            let rollback = self.cache().cancel_request(request_id, RejectReason::Timeout);
            if let Some(rollback) = rollback {
                self.report_rollback(rollback);
            }
        }
    }

    fn report_rollback(&self, rollback: Rollback) {
        debug!(
            request_id = rollback.request_id,
            reason = rollback.reason.code(),
            "optimistic edit rolled back"
        );
        self.last_rollback.set(Some(rollback));
    }
}

enum Command {
    Viewport(Viewport),
    Send(ClientMessage),
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

/// Owns one live connection to the canvas server.
///
/// Several managers can coexist; each keeps its own cache and reconnect loop.
pub struct ConnectionManager {
    config: ConnectionConfig,
    session: Session,
    viewport: Option<Viewport>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let session = Session::new(config.pending_timeout);
        Self {
            config,
            session,
            viewport: None,
            commands: None,
            task: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.task.is_some()
    }

    /// Starts the connection loop on the current tokio runtime. No-op when already started.
    pub fn connect(&mut self) {
        if self.task.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(viewport) = self.viewport {
            let _ = tx.send(Command::Viewport(viewport));
        }
        self.commands = Some(tx);
        self.task = Some(tokio::spawn(run(
            self.config.clone(),
            self.session.clone(),
            rx,
        )));
    }

    pub async fn disconnect(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.session.status.set(ConnectionStatus::Disconnected);
    }

    /// Requests `viewport`; only the settled value reaches the server.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        let viewport = viewport.normalized();
        self.viewport = Some(viewport);
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Viewport(viewport));
        }
    }

    /// Paints optimistically and queues the request. `None` when not connected.
    pub fn paint(&self, cell: Cell, color: HexColor) -> Option<u64> {
        let commands = self.commands.as_ref()?;
        let request_id = self
            .session
            .cache()
            .apply_optimistic(cell, color.clone(), Instant::now());
        let message = ClientMessage::Paint {
            request_id,
            cell,
            color: color.into(),
        };
        commands.send(Command::Send(message)).ok()?;
        Some(request_id)
    }

    pub fn ping(&self) -> bool {
        self.commands
            .as_ref()
            .is_some_and(|commands| commands.send(Command::Send(ClientMessage::Ping)).is_ok())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    config: ConnectionConfig,
    session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut retry = ResyncRetryState::new();
    let mut debouncer = ViewportDebouncer::new(config.settle_delay);
    let mut outbox = VecDeque::new();

    loop {
        session.status.set(if retry.consecutive_failures() == 0 {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Reconnecting
        });

        match open_socket(&config).await {
            Ok(socket) => {
                info!(url = %config.url, "live connection established");
                retry.reset();
                session.status.set(ConnectionStatus::Live);
                match drive(socket, &session, &mut commands, &mut debouncer, &mut outbox).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Dropped(reason) => {
                        warn!(%reason, "live connection lost");
                    }
                }
            }
            Err(e) => warn!(url = %config.url, error = %e, "failed to connect"),
        }

        let delay = retry.mark_failure();
        session.status.set(ConnectionStatus::Reconnecting);
        info!(
            attempt = retry.consecutive_failures(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let wake_at = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(wake_at) => break,
                command = commands.recv() => match command {
                    None => return,
                    Some(Command::Viewport(viewport)) => debouncer.observe(viewport, Instant::now()),
                    Some(Command::Send(message)) => session.queue_offline(&mut outbox, message),
                },
            }
        }
        session.expire(Instant::now());
    }
}

async fn open_socket(config: &ConnectionConfig) -> Result<Socket, String> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| e.to_string())?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| e.to_string())?;
    Ok(socket)
}

async fn drive(
    socket: Socket,
    session: &Session,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    debouncer: &mut ViewportDebouncer,
    outbox: &mut VecDeque<ClientMessage>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    // Resync: the server answers the viewport with a full snapshot of its rooms.
    if let Some(viewport) = debouncer.force_resend() {
        outbox.push_front(ClientMessage::UpdateViewport(viewport));
    }
    session.expire(Instant::now());
    while let Some(message) = outbox.pop_front() {
        if !session.still_wanted(&message) {
            debug!("dropping queued paint that was already rolled back");
            continue;
        }
        if let Err(e) = send(&mut sink, &message).await {
            outbox.push_front(message);
            return SessionEnd::Dropped(e);
        }
    }

    let mut expiry = tokio::time::interval(EXPIRY_TICK);
    loop {
        let settle = debouncer.time_until_due(Instant::now());
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => session.apply(message),
                    Err(e) => warn!(error = %e, "unreadable server message"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Dropped("closed by server".to_owned());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
            },
            command = commands.recv() => match command {
                None => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(Command::Viewport(viewport)) => debouncer.observe(viewport, Instant::now()),
                Some(Command::Send(message)) => {
                    if let Err(e) = send(&mut sink, &message).await {
                        session.queue_offline(outbox, message);
                        return SessionEnd::Dropped(e);
                    }
                }
            },
            () = wait_for(settle) => {}
            _ = expiry.tick() => session.expire(Instant::now()),
        }

        if let Some(viewport) = debouncer.poll(Instant::now()) {
            if let Err(e) = send(&mut sink, &ClientMessage::UpdateViewport(viewport)).await {
                return SessionEnd::Dropped(e);
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &ClientMessage) -> Result<(), String>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.send(Message::text(text)).await.map_err(|e| e.to_string())
}

async fn wait_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
