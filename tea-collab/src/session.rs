//! Collaboration session for one assurance case.
//!
//! ```text
//!                     ┌──────────────────────────┐
//!  Connection ──────► │ supervisor task          │ ── Close ──► ReconnectionController
//!   (events)          └────────────┬─────────────┘                  │
//!                                  ▼ enqueue                        │ new Connection
//!                            MessageQueue ◄─────────────────────────┘
//!                                  │ one at a time
//!              ┌───────────────────┼──────────────────────┐
//!              ▼                   ▼                      ▼
//!   case_message → OptimisticState  presence_update → PresenceTracker
//!                                   cursor_update / user_update
//! ```
//!
//! Status is published on a watch channel. When reconnection is exhausted
//! the session becomes `Unavailable`; the confirmed baseline and pending
//! local edits are kept untouched.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use crate::error::{CollabError, Result};
use crate::optimistic::OptimisticState;
use crate::presence::{Collaborator, Cursor, PresenceEntry, PresenceTracker};
use crate::protocol::{AuditReport, Message, MessageType, ProtocolError};
use crate::queue::{MessageQueue, QueueStatus};
use crate::reconnect::{ControllerState, ReconnectionController, ReconnectionStats};

/// What the UI should show about the link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection exhausted; collaboration is unavailable.
    Unavailable,
}

type Opened = (Arc<Connection>, mpsc::Receiver<ConnectionEvent>);

struct Shared {
    config: CollabConfig,
    url: String,
    user: Collaborator,
    state: RwLock<OptimisticState<Value>>,
    presence: RwLock<PresenceTracker>,
    controller: Mutex<ReconnectionController>,
    connection: RwLock<Option<Arc<Connection>>>,
    status: watch::Sender<SessionStatus>,
    /// Set by `disconnect`, cleared by `connect`.
    closing: watch::Sender<bool>,
}

impl Shared {
    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            log::info!(
                "Session for case {} is now {status:?}",
                self.config.case_id
            );
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once a disconnect has been requested.
    async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    async fn open_once(&self) -> Result<Opened> {
        let mut conn = Connection::open(self.url.clone(), self.config.connection.options());
        let events = conn.take_event_rx().ok_or(CollabError::ConnectionClosed)?;

        let opened = conn
            .wait_for_connection(
                self.config.connection.connect_timeout(),
                self.config.connection.poll_interval(),
            )
            .await;
        if let Err(e) = opened {
            conn.close(None, None).await;
            return Err(e);
        }
        Ok((Arc::new(conn), events))
    }

    /// Run a backoff cycle. Abandoned as soon as the session is closing.
    async fn reconnect(&self) -> Result<Opened> {
        let mut controller = self.controller.lock().await;
        tokio::select! {
            opened = controller.reconnect_with_backoff(|_attempt| self.open_once()) => opened,
            _ = self.closed() => Err(CollabError::ConnectionClosed),
        }
    }

    /// Install a freshly opened connection.
    ///
    /// Returns `false`, closing the connection, if a disconnect was requested
    /// meanwhile. The connection is published before `closing` is read and
    /// `disconnect` sets `closing` before reading the connection, so one of
    /// the two always closes it.
    async fn attach(&self, conn: Arc<Connection>) -> bool {
        *self.connection.write().await = Some(conn.clone());
        if self.is_closing() {
            *self.connection.write().await = None;
            conn.close(Some(NORMAL_CLOSURE), Some("session closed")).await;
            return false;
        }
        self.set_status(SessionStatus::Connected);
        true
    }

    /// Fold one inbound message into local state.
    ///
    /// A payload that does not fit its message type is dropped with a
    /// warning; it says nothing about later messages.
    async fn process(&self, message: Message) -> Result<()> {
        let msg_type = message.msg_type;
        if let Err(e) = self.apply(message).await {
            log::warn!(
                "Ignoring {msg_type} for case {}: {e}",
                self.config.case_id
            );
        }
        Ok(())
    }

    async fn apply(&self, message: Message) -> std::result::Result<(), ProtocolError> {
        match message.msg_type {
            MessageType::Ping => {}
            MessageType::CaseMessage => {
                let update = message.case_update()?;
                self.state
                    .write()
                    .await
                    .apply_server_patch(&update.assurance_case);
            }
            MessageType::PresenceUpdate => {
                let snapshot = message.presence_snapshot()?;
                self.presence
                    .write()
                    .await
                    .replace_all(snapshot.current_connections);
            }
            MessageType::CursorUpdate => {
                let update = message.cursor()?;
                let Cursor { x, y, element_id } = update.cursor;
                self.presence
                    .write()
                    .await
                    .cursor_move(&update.user_id, x, y, element_id);
            }
            MessageType::UserUpdate => {
                if let Some(user_id) = &message.user_id {
                    self.presence.write().await.user_active(user_id);
                }
            }
        }
        Ok(())
    }
}

/// A live collaboration session on one case.
pub struct CollabSession {
    shared: Arc<Shared>,
    queue: Arc<MessageQueue>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CollabSession {
    /// Build a disconnected session starting from the confirmed `baseline`.
    pub fn new(config: CollabConfig, baseline: Value) -> Result<Self> {
        config.validate()?;
        let user = Collaborator::new(
            config
                .user_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            config.username.clone(),
        );
        let url = config.case_url(&user.id)?;
        let (status, _) = watch::channel(SessionStatus::Disconnected);

        let shared = Arc::new(Shared {
            url,
            user,
            state: RwLock::new(OptimisticState::new(baseline)),
            presence: RwLock::new(PresenceTracker::with_thresholds(
                config.presence.thresholds(),
            )),
            controller: Mutex::new(ReconnectionController::new(config.reconnect.backoff())),
            connection: RwLock::new(None),
            status,
            closing: watch::channel(false).0,
            config,
        });

        let processor_state = shared.clone();
        let queue = MessageQueue::spawn(
            move |message| {
                let shared = processor_state.clone();
                async move { shared.process(message).await }
            },
            shared.config.queue.failure_policy,
        );

        Ok(Self {
            shared,
            queue: Arc::new(queue),
            supervisor: Mutex::new(None),
        })
    }

    pub fn user(&self) -> &Collaborator {
        &self.shared.user
    }

    pub fn case_id(&self) -> u64 {
        self.shared.config.case_id
    }

    // ─── Link ────────────────────────────────────────────────────────

    /// Open the connection, falling back to the reconnection controller
    /// when the first attempt fails and auto-reconnect is enabled.
    pub async fn connect(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let shared = &self.shared;
        shared.closing.send_replace(false);
        shared.set_status(SessionStatus::Connecting);
        {
            let mut controller = shared.controller.lock().await;
            if controller.state() == ControllerState::Exhausted {
                controller.reset();
            }
        }

        let opened = match shared.open_once().await {
            Ok(opened) => Ok(opened),
            Err(e) if shared.config.reconnect.auto_reconnect => {
                log::warn!("Initial connection to {} failed: {e}", shared.url);
                shared.reconnect().await
            }
            Err(e) => Err(e),
        };

        let (conn, events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let status = match e {
                    CollabError::ReconnectFailed { .. } if !shared.is_closing() => {
                        SessionStatus::Unavailable
                    }
                    _ => SessionStatus::Disconnected,
                };
                shared.set_status(status);
                return Err(e);
            }
        };

        if !shared.attach(conn).await {
            shared.set_status(SessionStatus::Disconnected);
            return Err(CollabError::ConnectionClosed);
        }
        *supervisor = Some(tokio::spawn(supervise(
            shared.clone(),
            self.queue.clone(),
            events,
        )));
        Ok(())
    }

    /// Close the connection without reconnecting.
    ///
    /// Also cancels a reconnection cycle in progress.
    pub async fn disconnect(&self) {
        self.shared.closing.send_replace(true);
        let conn = self.shared.connection.read().await.clone();
        if let Some(conn) = conn {
            conn.close(Some(NORMAL_CLOSURE), Some("session closed")).await;
        }

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        *self.shared.connection.write().await = None;
        self.shared.set_status(SessionStatus::Disconnected);
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_status(&self, target: SessionStatus, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe_status();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map_err(|_| CollabError::ConnectionTimeout(timeout))?
            .is_ok();
        if reached {
            Ok(())
        } else {
            Err(CollabError::ConnectionClosed)
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match self.shared.connection.read().await.as_ref() {
            Some(conn) => conn.state().await,
            None => ConnectionState::Closed,
        }
    }

    pub async fn reconnection_stats(&self) -> ReconnectionStats {
        self.shared.controller.lock().await.stats()
    }

    pub async fn audit_report(&self) -> Option<AuditReport> {
        let conn = self.shared.connection.read().await.clone()?;
        Some(conn.audit_report().await)
    }

    // ─── Outbound ────────────────────────────────────────────────────

    /// Send a message stamped with this session's user id.
    pub async fn send(&self, message: Message) -> Result<()> {
        let conn = self
            .shared
            .connection
            .read()
            .await
            .clone()
            .ok_or(CollabError::NotOpen(ConnectionState::Closed))?;
        let message = match message.user_id {
            Some(_) => message,
            None => message.with_user(self.shared.user.id.clone()),
        };
        conn.send(&message).await
    }

    pub async fn send_cursor(&self, cursor: Cursor) -> Result<()> {
        self.send(Message::cursor_update(self.shared.user.id.clone(), cursor))
            .await
    }

    pub async fn send_case_update(&self, assurance_case: Value) -> Result<()> {
        self.send(Message::case_message(assurance_case)).await
    }

    // ─── Local state ─────────────────────────────────────────────────

    /// Show a local edit immediately. Returns the candidate state.
    pub async fn apply_local_edit(&self, update_id: impl Into<String>, patch: Value) -> Value {
        self.shared
            .state
            .write()
            .await
            .apply_optimistic_update(update_id, patch)
    }

    pub async fn confirm(&self, update_id: &str, server_state: Value) -> Value {
        self.shared
            .state
            .write()
            .await
            .confirm_update(update_id, server_state)
    }

    pub async fn rollback(&self, update_id: &str) -> Value {
        self.shared.state.write().await.rollback_update(update_id)
    }

    pub async fn current_state(&self) -> Value {
        self.shared.state.read().await.current_state().clone()
    }

    pub async fn baseline(&self) -> Value {
        self.shared.state.read().await.baseline().clone()
    }

    pub async fn has_pending_updates(&self) -> bool {
        self.shared.state.read().await.has_pending_updates()
    }

    pub async fn active_users(&self) -> Vec<PresenceEntry> {
        self.shared.presence.read().await.active_users()
    }

    pub async fn presence_entry(&self, user_id: &str) -> Option<PresenceEntry> {
        self.shared.presence.read().await.entry(user_id).cloned()
    }

    /// Demote inactive collaborators. Returns the ids that changed.
    pub async fn sweep_presence(&self) -> Vec<String> {
        self.shared.presence.write().await.sweep(chrono::Utc::now())
    }

    // ─── Inbound queue ───────────────────────────────────────────────

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Wait until every received message has been applied.
    pub async fn wait_idle(&self) -> Result<()> {
        self.queue.wait_idle().await
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    queue: Arc<MessageQueue>,
    mut events: mpsc::Receiver<ConnectionEvent>,
) {
    loop {
        let (code, reason) = pump(&queue, &mut events).await;
        *shared.connection.write().await = None;

        if shared.is_closing() {
            shared.set_status(SessionStatus::Disconnected);
            return;
        }
        log::warn!(
            "Connection for case {} lost ({code}: {reason})",
            shared.config.case_id
        );
        if !shared.config.reconnect.auto_reconnect {
            shared.set_status(SessionStatus::Disconnected);
            return;
        }

        shared.set_status(SessionStatus::Connecting);
        match shared.reconnect().await {
            Ok((conn, rx)) => {
                if !shared.attach(conn).await {
                    shared.set_status(SessionStatus::Disconnected);
                    return;
                }
                events = rx;
            }
            Err(_) if shared.is_closing() => {
                shared.set_status(SessionStatus::Disconnected);
                return;
            }
            Err(e) => {
                log::error!("Collaboration unavailable for case {}: {e}", shared.config.case_id);
                shared.set_status(SessionStatus::Unavailable);
                return;
            }
        }
    }
}

/// Forward inbound messages until the connection closes.
async fn pump(queue: &MessageQueue, events: &mut mpsc::Receiver<ConnectionEvent>) -> (u16, String) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(message) => {
                if let Err(e) = queue.enqueue(message).await {
                    log::error!("Dropping inbound message: {e}");
                }
            }
            ConnectionEvent::Malformed { issues, .. } => {
                log::debug!("Ignoring malformed frame: {issues:?}");
            }
            ConnectionEvent::Error(e) => log::warn!("Connection error: {e}"),
            ConnectionEvent::Open => {}
            ConnectionEvent::Close { code, reason } => return (code, reason),
        }
    }
    (ABNORMAL_CLOSURE, "event channel closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{RelayServer, ServerConfig};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn start_relay() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = RelayServer::new(ServerConfig {
            bind_addr: format!("127.0.0.1:{port}"),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
        });
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });
        port
    }

    fn config(port: u16, user: &str) -> CollabConfig {
        let mut config = CollabConfig {
            server_url: format!("ws://127.0.0.1:{port}"),
            case_id: 1,
            user_id: Some(user.to_string()),
            username: user.to_string(),
            ..CollabConfig::default()
        };
        config.reconnect.max_retries = 2;
        config.reconnect.base_delay_ms = 10;
        config.connection.connect_timeout_ms = 1_000;
        config
    }

    /// Server whose sockets can be dropped, and whose handshakes refused,
    /// on demand.
    struct FlakyServer {
        port: u16,
        refuse: Arc<AtomicBool>,
        generation: Arc<watch::Sender<u32>>,
    }

    impl FlakyServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let refuse = Arc::new(AtomicBool::new(false));
            let generation = Arc::new(watch::channel(0u32).0);

            let (refusing, kicks) = (refuse.clone(), generation.clone());
            tokio::spawn(async move {
                loop {
                    let (tcp, _) = listener.accept().await.unwrap();
                    if refusing.load(Ordering::SeqCst) {
                        drop(tcp);
                        continue;
                    }
                    let mut kicked = kicks.subscribe();
                    tokio::spawn(async move {
                        let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                            return;
                        };
                        loop {
                            tokio::select! {
                                frame = ws.next() => if !matches!(frame, Some(Ok(_))) { break },
                                _ = kicked.changed() => break,
                            }
                        }
                    });
                }
            });
            Self {
                port,
                refuse,
                generation,
            }
        }

        /// Drop every open socket without a close frame.
        fn kick(&self) {
            self.generation.send_modify(|g| *g += 1);
        }

        fn refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connects_and_sees_itself_present() {
        let port = start_relay().await;
        let session = CollabSession::new(config(port, "alice"), json!({})).unwrap();

        session.connect().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);
        assert_eq!(session.connection_state().await, ConnectionState::Open);

        for _ in 0..100 {
            if session.presence_entry("alice").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.active_users().await.len(), 1);

        session.disconnect().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.connection_state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_server_becomes_unavailable() {
        let port = refused_port().await;
        let session = CollabSession::new(config(port, "alice"), json!({"name": "A"})).unwrap();
        session.apply_local_edit("u1", json!({"name": "X"})).await;

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, CollabError::ReconnectFailed { attempts: 2, .. }));
        assert_eq!(session.status(), SessionStatus::Unavailable);
        assert_eq!(session.reconnection_stats().await.failed_attempts, 2);
        // Confirmed and pending state survive.
        assert_eq!(session.baseline().await, json!({"name": "A"}));
        assert_eq!(session.current_state().await, json!({"name": "X"}));
        assert!(session.has_pending_updates().await);
    }

    #[tokio::test]
    async fn test_without_auto_reconnect_fails_fast() {
        let port = refused_port().await;
        let mut cfg = config(port, "alice");
        cfg.reconnect.auto_reconnect = false;
        let session = CollabSession::new(cfg, json!({})).unwrap();

        let err = session.connect().await.unwrap_err();
        assert_eq!(err, CollabError::ConnectionClosed);
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.reconnection_stats().await.total_attempts, 0);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let session = CollabSession::new(config(1, "alice"), json!({})).unwrap();
        let err = session.send_cursor(Cursor::new(1.0, 2.0)).await.unwrap_err();
        assert_eq!(err, CollabError::NotOpen(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_local_edits_confirm_and_rollback() {
        let session = CollabSession::new(config(1, "alice"), json!({"name": "A"})).unwrap();

        session.apply_local_edit("u1", json!({"name": "X"})).await;
        session.apply_local_edit("u2", json!({"name": "Y"})).await;
        assert_eq!(session.current_state().await, json!({"name": "Y"}));

        assert_eq!(session.rollback("u2").await, json!({"name": "X"}));
        assert_eq!(session.confirm("u1", json!({"name": "X!"})).await, json!({"name": "X!"}));
        assert!(!session.has_pending_updates().await);
    }

    #[tokio::test]
    async fn test_reconnects_after_unexpected_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // First socket is dropped right after the handshake, the second
            // stays open.
            let (first, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(first).await.unwrap();
            drop(ws);

            let (second, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(second).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let session = CollabSession::new(config(port, "alice"), json!({})).unwrap();
        session.connect().await.unwrap();

        session
            .wait_for_status(SessionStatus::Connected, Duration::from_secs(5))
            .await
            .unwrap();
        for _ in 0..200 {
            if session.reconnection_stats().await.successful_attempts == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = session.reconnection_stats().await;
        assert_eq!(stats.successful_attempts, 1);
        assert_eq!(session.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_during_backoff_returns_promptly() {
        let server = FlakyServer::start().await;
        let mut cfg = config(server.port, "alice");
        cfg.reconnect.base_delay_ms = 300;
        let session = CollabSession::new(cfg, json!({})).unwrap();
        session.connect().await.unwrap();

        server.kick();
        session
            .wait_for_status(SessionStatus::Connecting, Duration::from_secs(2))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), session.disconnect())
            .await
            .expect("disconnect cancels the reconnection cycle");
        assert_eq!(session.status(), SessionStatus::Disconnected);

        // The abandoned cycle must not bring the link back.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.connection_state().await, ConnectionState::Closed);
        assert_eq!(session.reconnection_stats().await.successful_attempts, 0);

        // And the session can be used again.
        timeout(Duration::from_secs(2), session.connect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn test_recovers_from_unavailable_and_reconnects_again() {
        let server = FlakyServer::start().await;
        let session = CollabSession::new(config(server.port, "alice"), json!({})).unwrap();
        session.connect().await.unwrap();

        server.refuse(true);
        server.kick();
        session
            .wait_for_status(SessionStatus::Unavailable, Duration::from_secs(5))
            .await
            .unwrap();

        server.refuse(false);
        session.connect().await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);

        // A later drop gets a fresh reconnection cycle.
        server.kick();
        for _ in 0..300 {
            if session.reconnection_stats().await.successful_attempts == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = session.reconnection_stats().await;
        assert_eq!(stats.successful_attempts, 1, "{stats:?}");
        session
            .wait_for_status(SessionStatus::Connected, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_payload_from_peer_does_not_halt_updates() {
        let port = start_relay().await;
        let session = CollabSession::new(config(port, "alice"), json!({"name": "A"})).unwrap();
        session.connect().await.unwrap();

        let url = format!("ws://127.0.0.1:{port}/ws/case/1/?user_id=mallory&username=mallory");
        let (mut raw, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        raw.send(WsMessage::text(r#"{"type":"case_message","content":{},"timestamp":1}"#))
            .await
            .unwrap();
        let valid = Message::case_message(json!({"name": "B"})).encode().unwrap();
        raw.send(WsMessage::text(valid)).await.unwrap();

        for _ in 0..200 {
            if session.baseline().await["name"] == "B" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.baseline().await, json!({"name": "B"}));
        assert!(!matches!(session.queue_status(), QueueStatus::Halted(_)));
    }
}
