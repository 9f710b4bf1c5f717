use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use tmuxpilot_core::domain::{Notification, Session, Ticket};
use tmuxpilot_mux::TmuxAdapter;

use crate::error::HubError;
use crate::event_bus::{Event, EventBus};
use crate::pty_manager::PtyManager;
use crate::supervisor::Supervisor;

/// Sliding-window rate limit applied per connection to inbound client
/// messages. A connection that exceeds this is disconnected rather
/// than merely throttled, since a flood is far more likely a buggy client
/// than a legitimate burst.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
pub const DEFAULT_RATE_LIMIT_MAX: usize = 200;

/// Heartbeat cadence. Two consecutive missed pongs terminate the connection.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HEARTBEAT_MISS_LIMIT: u32 = 2;

/// Lines replayed from a session's ring buffer when a client subscribes, so
/// a freshly attached terminal renders recent history instead of a blank
/// screen.
pub const DEFAULT_SUBSCRIBE_REPLAY_LINES: usize = 200;

static NEXT_CONN_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn next_connection_id() -> String {
    let seq = NEXT_CONN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("conn-{}-{seq}", seq)
}

/// Inbound message from a connected client. The `type` discriminant mirrors
/// the wire vocabulary clients speak; field names stay snake_case to match every
/// other serialized type in this crate (see [`Event`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session:subscribe")]
    SessionSubscribe { session_id: String },
    #[serde(rename = "session:unsubscribe")]
    SessionUnsubscribe { session_id: String },
    #[serde(rename = "session:input")]
    SessionInput { session_id: String, text: String },
    #[serde(rename = "session:keys")]
    SessionKeys { session_id: String, hex_encoded_keys: String },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "pty:attach")]
    PtyAttach { session_id: String, cols: u16, rows: u16 },
    #[serde(rename = "pty:detach")]
    PtyDetach,
    #[serde(rename = "pty:data")]
    PtyData { data: String },
    #[serde(rename = "pty:resize")]
    PtyResize { cols: u16, rows: u16 },
    #[serde(rename = "pty:selectPane")]
    PtySelectPane { session_id: String },
}

/// Outbound message to a connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session:output")]
    SessionOutput { session_id: String, lines: Vec<String> },
    #[serde(rename = "session:status")]
    SessionStatus { session: Session },
    #[serde(rename = "session:waiting")]
    SessionWaiting { session_id: String, is_waiting: bool, reason: String },
    #[serde(rename = "ticket:state")]
    TicketState { ticket: Ticket },
    #[serde(rename = "ai:analysis_status")]
    AiAnalysisStatus { session_id: String, ticket_id: String, state: String, message: String },
    #[serde(rename = "review:result")]
    ReviewResult { session_id: String, ticket_id: String, decision: String, reasoning: String },
    #[serde(rename = "notification")]
    Notification { notification: Notification },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "subscribed")]
    Subscribed { session_id: String, lines: Vec<String> },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { session_id: String },
    #[serde(rename = "pty:attached")]
    PtyAttached { session_id: String, cols: u16, rows: u16 },
    #[serde(rename = "pty:detached")]
    PtyDetached,
    #[serde(rename = "pty:output")]
    PtyOutput { data: String },
    #[serde(rename = "pty:exit")]
    PtyExit,
}

/// Maps a [`HubError`] to the stable wire error code clients match on.
fn error_code(err: &HubError) -> &'static str {
    match err {
        HubError::Io(_) => "INTERNAL_ERROR",
        HubError::Serde(_) => "PARSE_ERROR",
        HubError::RateLimited(_) => "RATE_LIMITED",
        HubError::ParseError(_) => "PARSE_ERROR",
        HubError::InvalidMessage(_) => "INVALID_MESSAGE",
        HubError::SessionNotFound(_) => "SESSION_NOT_FOUND",
        HubError::NotSubscribed(_) => "NOT_SUBSCRIBED",
        HubError::Supervisor(_) => "INPUT_FAILED",
        HubError::PtyAlreadyAttached => "PTY_ALREADY_ATTACHED",
        HubError::PtyNotAttached => "PTY_NOT_ATTACHED",
        HubError::PtyInvalidPane => "PTY_INVALID_PANE",
        HubError::PtyAttachFailed(_) => "PTY_ATTACH_FAILED",
        HubError::PtyUnavailable(_) => "PTY_ATTACH_FAILED",
    }
}

impl From<&HubError> for ServerMessage {
    fn from(err: &HubError) -> Self {
        ServerMessage::Error {
            code: error_code(err).to_string(),
            message: err.to_string(),
        }
    }
}

/// Sliding-window counter: keeps only timestamps within the window and
/// compares the remaining count against the cap.
struct RateLimiter {
    window: Duration,
    max: usize,
    hits: Vec<Instant>,
}

impl RateLimiter {
    fn new(window: Duration, max: usize) -> Self {
        Self { window, max, hits: Vec::new() }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        self.hits.retain(|t| now.duration_since(*t) < self.window);
        if self.hits.len() >= self.max {
            return false;
        }
        self.hits.push(now);
        true
    }
}

/// Per-connection bookkeeping the hub needs to route fan-out and enforce
/// auth/rate-limit/heartbeat policy.
struct Connection {
    outbox: mpsc::UnboundedSender<ServerMessage>,
    subscriptions: HashSet<String>,
    rate_limiter: RateLimiter,
    missed_pongs: u32,
    authenticated: bool,
}

/// Realtime Fan-Out Hub: the single WebSocket-facing component. Owns the
/// connection registry and the mapping from session subscriptions to
/// connections, and relays [`Event`]s from the bus to every interested
/// client while routing client RPCs (input, pty attach, ticket actions)
/// back into the rest of the daemon.
///
/// A client attached via PTY is excluded from ordinary
/// `session:output` fan-out for that session — it already receives raw
/// bytes over its own bridge and would otherwise see the output twice.
pub struct Hub {
    supervisor: Arc<Supervisor>,
    pty_manager: Arc<PtyManager>,
    mux: Arc<TmuxAdapter>,
    events: EventBus,
    api_key: Option<String>,
    rate_limit_window: Duration,
    rate_limit_max: usize,
    connections: RwLock<HashMap<String, Connection>>,
}

impl Hub {
    pub fn new(
        supervisor: Arc<Supervisor>,
        pty_manager: Arc<PtyManager>,
        mux: Arc<TmuxAdapter>,
        events: EventBus,
        api_key: Option<String>,
    ) -> Self {
        Self {
            supervisor,
            pty_manager,
            mux,
            events,
            api_key,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_rate_limit(mut self, window: Duration, max: usize) -> Self {
        self.rate_limit_window = window;
        self.rate_limit_max = max;
        self
    }

    /// Whether `query_api_key` is acceptable for a peer arriving from
    /// `peer_is_loopback`. A loopback peer (the bundled desktop client, or a
    /// developer on the same host) is trusted unconditionally; every other
    /// peer must present the configured key, or no key may be configured at
    /// all (open mode).
    pub fn authenticate(&self, query_api_key: Option<&str>, peer_is_loopback: bool) -> bool {
        match &self.api_key {
            None => true,
            Some(_) if peer_is_loopback => true,
            Some(expected) => query_api_key == Some(expected.as_str()),
        }
    }

    /// Register a new connection and return the channel the transport layer
    /// should forward to the socket, plus the connection id to key every
    /// subsequent call by.
    pub async fn register(&self, authenticated: bool) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = next_connection_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            id.clone(),
            Connection {
                outbox: tx,
                subscriptions: HashSet::new(),
                rate_limiter: RateLimiter::new(self.rate_limit_window, self.rate_limit_max),
                missed_pongs: 0,
                authenticated,
            },
        );
        (id, rx)
    }

    /// Tear down a connection: drop its subscriptions and any PTY bridge it
    /// held open.
    pub async fn unregister(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
        let _ = self.pty_manager.detach(connection_id).await;
    }

    async fn send(&self, connection_id: &str, msg: ServerMessage) {
        if let Some(conn) = self.connections.read().await.get(connection_id) {
            let _ = conn.outbox.send(msg);
        }
    }

    /// Record a received pong, resetting the missed-pong counter.
    pub async fn record_pong(&self, connection_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(connection_id) {
            conn.missed_pongs = 0;
        }
    }

    /// Send a ping to every connection, disconnecting any that has missed
    /// `miss_limit` consecutive pongs. Returns the ids evicted, so the
    /// transport layer can close the underlying sockets.
    pub async fn heartbeat_tick(&self, miss_limit: u32) -> Vec<String> {
        let mut dead = Vec::new();
        let mut conns = self.connections.write().await;
        for (id, conn) in conns.iter_mut() {
            if conn.missed_pongs >= miss_limit {
                dead.push(id.clone());
                continue;
            }
            conn.missed_pongs += 1;
            let _ = conn.outbox.send(ServerMessage::Ping);
        }
        for id in &dead {
            conns.remove(id);
        }
        drop(conns);
        for id in &dead {
            let _ = self.pty_manager.detach(id).await;
        }
        dead
    }

    /// Handle one parsed client message. Errors are sent back to the
    /// connection as an `error` frame rather than propagated, since a single
    /// bad RPC should never tear down the socket.
    pub async fn handle_message(&self, connection_id: &str, msg: ClientMessage) {
        if !self.check_authenticated(connection_id).await {
            self.send(connection_id, ServerMessage::Error {
                code: "unauthenticated".into(),
                message: "connection is not authenticated".into(),
            })
            .await;
            return;
        }
        if !self.check_rate_limit(connection_id).await {
            self.send(connection_id, (&HubError::RateLimited(connection_id.to_string())).into())
                .await;
            return;
        }

        let result = self.dispatch(connection_id, msg).await;
        if let Err(err) = result {
            self.send(connection_id, (&err).into()).await;
        }
    }

    async fn check_authenticated(&self, connection_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    async fn check_rate_limit(&self, connection_id: &str) -> bool {
        let mut conns = self.connections.write().await;
        match conns.get_mut(connection_id) {
            Some(conn) => conn.rate_limiter.allow(),
            None => false,
        }
    }

    async fn dispatch(&self, connection_id: &str, msg: ClientMessage) -> Result<(), HubError> {
        match msg {
            ClientMessage::Ping => {
                self.send(connection_id, ServerMessage::Pong).await;
                Ok(())
            }
            ClientMessage::Pong => {
                self.record_pong(connection_id).await;
                Ok(())
            }
            ClientMessage::SessionSubscribe { session_id } => {
                self.supervisor
                    .get_session(&session_id)
                    .await
                    .ok_or_else(|| HubError::SessionNotFound(session_id.clone()))?;
                let mut conns = self.connections.write().await;
                let conn = conns.get_mut(connection_id).ok_or(HubError::PtyNotAttached)?;
                conn.subscriptions.insert(session_id.clone());
                drop(conns);
                let lines = self
                    .supervisor
                    .recent_output(&session_id, DEFAULT_SUBSCRIBE_REPLAY_LINES)
                    .await;
                self.send(
                    connection_id,
                    ServerMessage::Subscribed {
                        session_id: session_id.clone(),
                        lines: lines.clone(),
                    },
                )
                .await;
                if !lines.is_empty() {
                    self.send(connection_id, ServerMessage::SessionOutput { session_id, lines }).await;
                }
                Ok(())
            }
            ClientMessage::SessionUnsubscribe { session_id } => {
                let mut conns = self.connections.write().await;
                let conn = conns.get_mut(connection_id).ok_or(HubError::PtyNotAttached)?;
                conn.subscriptions.remove(&session_id);
                drop(conns);
                self.send(connection_id, ServerMessage::Unsubscribed { session_id }).await;
                Ok(())
            }
            ClientMessage::SessionInput { session_id, text } => {
                self.require_subscribed(connection_id, &session_id).await?;
                self.supervisor.send_input(&session_id, &text).await?;
                Ok(())
            }
            ClientMessage::SessionKeys { session_id, hex_encoded_keys } => {
                self.require_subscribed(connection_id, &session_id).await?;
                self.supervisor.send_keys(&session_id, &hex_encoded_keys).await?;
                Ok(())
            }
            ClientMessage::PtyAttach { session_id, cols, rows } => {
                let (cols, rows, mut rx) = self
                    .pty_manager
                    .attach(connection_id, &session_id, cols, rows)
                    .await?;
                self.send(connection_id, ServerMessage::PtyAttached { session_id, cols, rows })
                    .await;

                let conns_outbox = self.outbox_for(connection_id).await;
                if let Some(outbox) = conns_outbox {
                    tokio::spawn(async move {
                        while let Some(chunk) = rx.recv().await {
                            let data = String::from_utf8_lossy(&chunk).into_owned();
                            if outbox.send(ServerMessage::PtyOutput { data }).is_err() {
                                break;
                            }
                        }
                        let _ = outbox.send(ServerMessage::PtyExit);
                    });
                }
                Ok(())
            }
            ClientMessage::PtyDetach => {
                self.pty_manager.detach(connection_id).await?;
                self.send(connection_id, ServerMessage::PtyDetached).await;
                Ok(())
            }
            ClientMessage::PtyData { data } => {
                self.pty_manager.write(connection_id, data.as_bytes()).await
            }
            ClientMessage::PtyResize { cols, rows } => {
                self.pty_manager.resize(connection_id, cols, rows).await
            }
            ClientMessage::PtySelectPane { session_id } => {
                let pane_id = self.supervisor.resolve_running_pane(&session_id).await?;
                self.mux
                    .select_pane(&pane_id)
                    .await
                    .map_err(|e| HubError::PtyAttachFailed(e.to_string()))?;
                // Only toggle zoom when the pane isn't already zoomed: the
                // supervisor never issues zoom commands itself, so the hub
                // must read the flag before writing it.
                let zoomed = self
                    .mux
                    .is_zoomed(&pane_id)
                    .await
                    .map_err(|e| HubError::PtyAttachFailed(e.to_string()))?;
                if !zoomed {
                    self.mux
                        .resize_pane_zoom(&pane_id)
                        .await
                        .map_err(|e| HubError::PtyAttachFailed(e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    async fn require_subscribed(&self, connection_id: &str, session_id: &str) -> Result<(), HubError> {
        let conns = self.connections.read().await;
        let conn = conns.get(connection_id).ok_or_else(|| HubError::NotSubscribed(session_id.to_string()))?;
        if conn.subscriptions.contains(session_id) {
            Ok(())
        } else {
            Err(HubError::NotSubscribed(session_id.to_string()))
        }
    }

    async fn outbox_for(&self, connection_id: &str) -> Option<mpsc::UnboundedSender<ServerMessage>> {
        self.connections.read().await.get(connection_id).map(|c| c.outbox.clone())
    }

    /// Translate one bus event into zero or more outbound frames and fan it
    /// out to every connection that should see it.
    async fn fan_out(&self, event: Event) {
        let conns = self.connections.read().await;
        match event {
            Event::SessionStarted { session } | Event::SessionUpdated { session } => {
                let session_id = session.id.clone();
                for conn in conns.values() {
                    if conn.subscriptions.contains(&session_id) {
                        let _ = conn.outbox.send(ServerMessage::SessionStatus { session: session.clone() });
                    }
                }
            }
            Event::SessionEnded { .. } => {
                // No client-facing frame: the preceding `SessionUpdated`
                // (status=completed) already went out as `session:status`,
                // which is what a client acts on.
            }
            Event::PaneOutput { session_id, lines } => {
                let ids: Vec<String> = conns
                    .iter()
                    .filter(|(_, conn)| conn.subscriptions.contains(&session_id))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ids {
                    // A connection with its own PTY bridge on this session
                    // already streams raw bytes; skip the polled tail so it
                    // doesn't see the output twice.
                    let attached = self.pty_manager.attached_session(&id).await;
                    if attached.as_deref() == Some(session_id.as_str()) {
                        continue;
                    }
                    if let Some(conn) = conns.get(&id) {
                        let _ = conn.outbox.send(ServerMessage::SessionOutput {
                            session_id: session_id.clone(),
                            lines: lines.clone(),
                        });
                    }
                }
            }
            Event::WaitingStateChanged { session_id, is_waiting, reason } => {
                for conn in conns.values() {
                    if conn.subscriptions.contains(&session_id) {
                        let _ = conn.outbox.send(ServerMessage::SessionWaiting {
                            session_id: session_id.clone(),
                            is_waiting,
                            reason: reason.clone(),
                        });
                    }
                }
            }
            Event::ContextPercentUpdated { .. } => {
                // Folded into the next SessionUpdated snapshot; no standalone frame.
            }
            Event::TicketChanged { ticket } => {
                for conn in conns.values() {
                    let _ = conn.outbox.send(ServerMessage::TicketState { ticket: ticket.clone() });
                }
            }
            Event::NotificationCreated { notification } => {
                for conn in conns.values() {
                    let _ = conn.outbox.send(ServerMessage::Notification { notification: notification.clone() });
                }
            }
            Event::HandoffStarted { session_id, ticket_id } => {
                self.broadcast_analysis(&conns, &session_id, &ticket_id, "handoff_started", "handoff started");
            }
            Event::HandoffProgress { session_id, ticket_id, state, message } => {
                self.broadcast_analysis(&conns, &session_id, &ticket_id, &state, &message);
            }
            Event::HandoffCompleted { session_id, ticket_id, child_session_id } => {
                self.broadcast_analysis(
                    &conns,
                    &session_id,
                    &ticket_id,
                    "handoff_completed",
                    &format!("handed off to {child_session_id}"),
                );
            }
            Event::HandoffFailed { session_id, ticket_id, reason, .. } => {
                self.broadcast_analysis(&conns, &session_id, &ticket_id, "handoff_failed", &reason);
            }
            Event::ReviewStarted { session_id, ticket_id } => {
                self.broadcast_analysis(&conns, &session_id, &ticket_id, "review_started", "review started");
            }
            Event::ReviewCompleted { session_id, ticket_id, decision, reasoning } => {
                for conn in conns.values() {
                    let _ = conn.outbox.send(ServerMessage::ReviewResult {
                        session_id: session_id.clone(),
                        ticket_id: ticket_id.clone(),
                        decision: decision.clone(),
                        reasoning: reasoning.clone(),
                    });
                }
            }
            Event::ReviewFailed { session_id, ticket_id, reason } => {
                self.broadcast_analysis(&conns, &session_id, &ticket_id, "review_failed", &reason);
            }
        }
    }

    fn broadcast_analysis(
        &self,
        conns: &HashMap<String, Connection>,
        session_id: &str,
        ticket_id: &str,
        state: &str,
        message: &str,
    ) {
        for conn in conns.values() {
            let _ = conn.outbox.send(ServerMessage::AiAnalysisStatus {
                session_id: session_id.to_string(),
                ticket_id: ticket_id.to_string(),
                state: state.to_string(),
                message: message.to_string(),
            });
        }
    }

    /// Drive the event bus -> connections relay until cancelled. Intended to
    /// be spawned once per daemon alongside the transport accept loop.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut rx = self.events.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    match event {
                        Ok(event) => self.fan_out(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use std::time::Duration as StdDuration;
    use tmuxpilot_core::domain::{Session, SessionKind, SessionStatus};

    async fn test_hub() -> (Arc<Hub>, Arc<Supervisor>) {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mux = Arc::new(TmuxAdapter::new());
        let events = EventBus::default();
        let supervisor = Arc::new(Supervisor::new(mux.clone(), repo, events.clone(), StdDuration::from_secs(1)));
        let pty_manager = Arc::new(PtyManager::new(supervisor.clone(), mux.clone()));
        let hub = Arc::new(Hub::new(supervisor.clone(), pty_manager, mux, events, Some("secret".into())));
        (hub, supervisor)
    }

    #[tokio::test]
    async fn loopback_peer_bypasses_api_key() {
        let (hub, _) = test_hub().await;
        assert!(hub.authenticate(None, true));
        assert!(!hub.authenticate(None, false));
        assert!(hub.authenticate(Some("secret"), false));
        assert!(!hub.authenticate(Some("wrong"), false));
    }

    #[tokio::test]
    async fn subscribe_to_unknown_session_is_rejected() {
        let (hub, _) = test_hub().await;
        let (id, _rx) = hub.register(true).await;
        hub.handle_message(&id, ClientMessage::SessionSubscribe { session_id: "missing".into() }).await;
        // handle_message swallows the error into an `error` frame; assert no
        // subscription was recorded instead of inspecting the frame.
        let conns = hub.connections.read().await;
        assert!(!conns.get(&id).unwrap().subscriptions.contains("missing"));
    }

    #[tokio::test]
    async fn subscribe_to_known_session_succeeds() {
        let repo = Arc::new(Repository::open_in_memory().unwrap());
        let mux = Arc::new(TmuxAdapter::new());
        let events = EventBus::default();
        let supervisor = Arc::new(Supervisor::new(mux.clone(), repo.clone(), events.clone(), StdDuration::from_secs(1)));
        let session = Session {
            id: "s1".into(),
            project_id: "p1".into(),
            ticket_id: None,
            parent_session_id: None,
            kind: SessionKind::Adhoc,
            status: SessionStatus::Running,
            pane_id: Some("%1".into()),
            context_percent: 0,
            started_at: chrono::Utc::now(),
            ended_at: None,
        };
        repo.save_session(&session).unwrap();

        let pty_manager = Arc::new(PtyManager::new(supervisor.clone(), mux.clone()));
        let hub = Hub::new(supervisor, pty_manager, mux, events, None);
        let (id, mut rx) = hub.register(true).await;
        hub.handle_message(&id, ClientMessage::SessionSubscribe { session_id: "s1".into() }).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Subscribed { session_id, lines } if session_id == "s1" && lines.is_empty()));
        // No ring buffer history yet (the session was never captured into
        // memory), so no replay `session:output` frame should follow.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unauthenticated_connection_is_rejected() {
        let (hub, _) = test_hub().await;
        let (id, mut rx) = hub.register(false).await;
        hub.handle_message(&id, ClientMessage::Ping).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Error { code, .. } if code == "unauthenticated"));
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (hub, _) = test_hub().await;
        let (id, mut rx) = hub.register(true).await;
        hub.handle_message(&id, ClientMessage::Ping).await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Pong));
    }

    #[tokio::test]
    async fn rate_limiter_blocks_after_max_hits() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10), 3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test]
    async fn heartbeat_evicts_after_missed_pongs() {
        let (hub, _) = test_hub().await;
        let (id, _rx) = hub.register(true).await;
        let dead1 = hub.heartbeat_tick(2).await;
        assert!(dead1.is_empty());
        let dead2 = hub.heartbeat_tick(2).await;
        assert!(dead2.is_empty());
        let dead3 = hub.heartbeat_tick(2).await;
        assert_eq!(dead3, vec![id]);
    }
}
