//! One duplex real-time channel to the collaboration server.
//!
//! A [`Connection`] is returned immediately in the `Connecting` state; a
//! background task performs the WebSocket handshake and then owns the socket,
//! forwarding outgoing frames and publishing inbound traffic as
//! [`ConnectionEvent`]s on a channel, in arrival order.
//!
//! ```text
//!  send() ──► outgoing mpsc ──┐
//!                             ▼
//!                      ┌─────────────┐     WebSocket     ┌────────┐
//!                      │ IO task     │ ◄───────────────► │ server │
//!                      └──────┬──────┘                   └────────┘
//!                             ▼
//!                      event mpsc ──► take_event_rx() / on_message()
//! ```
//!
//! Lifecycle: `Connecting → Open → Closing → Closed`; `Closing` may also be
//! entered straight from `Connecting` or `Open`.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::protocol::{AuditReport, IssueKind, Message, MessageAudit};

/// Close code for a normal shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the peer sent no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the channel dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events published by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Handshake completed
    Open,
    /// Inbound message
    Message(Message),
    /// Inbound frame that could not become a message
    Malformed { raw: String, issues: Vec<IssueKind> },
    /// Transport failure (always followed by `Close`)
    Error(String),
    /// Channel closed
    Close { code: u16, reason: String },
}

/// Buffer sizes for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub send_buffer: usize,
    pub event_buffer: usize,
    pub audit_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            send_buffer: 256,
            event_buffer: 256,
            audit_capacity: 100,
        }
    }
}

enum Outgoing {
    Frame(String),
    Close { code: u16, reason: String },
}

/// A real-time channel.
pub struct Connection {
    id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Outgoing>,
    event_rx: Option<mpsc::Receiver<ConnectionEvent>>,
    audit: Arc<Mutex<MessageAudit>>,
}

impl Connection {
    /// Start connecting to `url`.
    ///
    /// Returns at once in the `Connecting` state. Must be called from within
    /// a Tokio runtime.
    pub fn open(url: impl Into<String>, options: ConnectionOptions) -> Self {
        let url = url.into();
        let (conn, io) = Self::prepare(options);
        log::debug!("Connection {} connecting to {url}", conn.id);

        tokio::spawn(async move {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _response)) => io.run(ws).await,
                Err(e) => io.fail(e.to_string()).await,
            }
        });
        conn
    }

    /// Wrap an already established WebSocket.
    pub fn from_stream<S>(ws: WebSocketStream<S>, options: ConnectionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, io) = Self::prepare(options);
        tokio::spawn(io.run(ws));
        conn
    }

    /// Wrap a raw byte stream without performing an HTTP handshake.
    pub async fn from_raw_socket<S>(stream: S, role: Role, options: ConnectionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = WebSocketStream::from_raw_socket(stream, role, None).await;
        Self::from_stream(ws, options)
    }

    fn prepare(options: ConnectionOptions) -> (Self, ConnectionIo) {
        let id = Uuid::new_v4();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(options.send_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(options.event_buffer.max(1));
        let audit = Arc::new(Mutex::new(MessageAudit::new(options.audit_capacity)));

        let io = ConnectionIo {
            id,
            state: state.clone(),
            outgoing_rx,
            event_tx,
            audit: audit.clone(),
        };
        let conn = Self {
            id,
            state,
            outgoing_tx,
            event_rx: Some(event_rx),
            audit,
        };
        (conn, io)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// Queue a message for transmission.
    ///
    /// Fails with [`CollabError::NotOpen`] unless the connection is open;
    /// never waits for the frame to reach the network.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let state = self.state().await;
        if state != ConnectionState::Open {
            return Err(CollabError::NotOpen(state));
        }

        let text = message.encode()?;
        self.outgoing_tx
            .try_send(Outgoing::Frame(text))
            .map_err(|e| match e {
                TrySendError::Full(_) => CollabError::SendBufferFull,
                TrySendError::Closed(_) => CollabError::ConnectionClosed,
            })
    }

    /// Begin closing the connection.
    ///
    /// The state becomes `Closing` immediately; `Closed` and the matching
    /// [`ConnectionEvent::Close`] follow once the IO task has sent the close
    /// frame. Closing twice is a no-op.
    pub async fn close(&self, code: Option<u16>, reason: Option<&str>) {
        {
            let mut state = self.state.write().await;
            match *state {
                ConnectionState::Closing | ConnectionState::Closed => return,
                _ => *state = ConnectionState::Closing,
            }
        }

        let request = Outgoing::Close {
            code: code.unwrap_or(NORMAL_CLOSURE),
            reason: reason.unwrap_or_default().to_string(),
        };
        if self.outgoing_tx.send(request).await.is_err() {
            // IO task already gone.
            *self.state.write().await = ConnectionState::Closed;
        }
    }

    /// Poll the state every `poll_interval` until the connection is open.
    ///
    /// Fails with [`CollabError::ConnectionTimeout`] after `timeout`, or with
    /// [`CollabError::ConnectionClosed`] as soon as the connection starts
    /// closing. A timeout has no effect on the connection itself.
    pub async fn wait_for_connection(&self, timeout: Duration, poll_interval: Duration) -> Result<()> {
        let poll = async {
            loop {
                match self.state().await {
                    ConnectionState::Open => return Ok(()),
                    ConnectionState::Closing | ConnectionState::Closed => {
                        return Err(CollabError::ConnectionClosed)
                    }
                    ConnectionState::Connecting => tokio::time::sleep(poll_interval).await,
                }
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| CollabError::ConnectionTimeout(timeout))?
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    /// Invoke `handler` once per inbound message, in arrival order.
    ///
    /// Consumes the event receiver; returns `None` if it was already taken.
    pub fn on_message<F>(&mut self, mut handler: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut events = self.take_event_rx()?;
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Message(message) => handler(message),
                    ConnectionEvent::Close { .. } => break,
                    _ => {}
                }
            }
        }))
    }

    /// Integrity audit of every inbound frame seen so far.
    pub async fn audit_report(&self) -> AuditReport {
        self.audit.lock().await.report()
    }
}

/// Socket-owning half of a connection.
struct ConnectionIo {
    id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_rx: mpsc::Receiver<Outgoing>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    audit: Arc<Mutex<MessageAudit>>,
}

impl ConnectionIo {
    async fn fail(self, error: String) {
        log::warn!("Connection {} failed to open: {error}", self.id);
        *self.state.write().await = ConnectionState::Closed;
        let _ = self.event_tx.send(ConnectionEvent::Error(error.clone())).await;
        let _ = self
            .event_tx
            .send(ConnectionEvent::Close {
                code: ABNORMAL_CLOSURE,
                reason: error,
            })
            .await;
    }

    async fn run<S>(self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ConnectionIo {
            id,
            state,
            mut outgoing_rx,
            event_tx,
            audit,
        } = self;

        let opened = {
            let mut state = state.write().await;
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        };
        if opened {
            log::debug!("Connection {id} open");
            let _ = event_tx.send(ConnectionEvent::Open).await;
        }

        let (mut writer, mut reader) = ws.split();
        let inbound = Inbound {
            id,
            state: &state,
            event_tx: &event_tx,
            audit: &audit,
        };

        // The two halves make progress independently: a consumer that stops
        // reading events holds back the reader only, never outgoing frames
        // or a local close.
        let ended = tokio::select! {
            ended = write_loop(&mut writer, &mut outgoing_rx, &state) => ended,
            ended = inbound.read_loop(&mut reader) => ended,
        };

        let _ = writer.close().await;
        *state.write().await = ConnectionState::Closed;
        log::debug!("Connection {id} closed ({}: {})", ended.code, ended.reason);
        if let Some(error) = ended.error {
            let _ = event_tx.send(ConnectionEvent::Error(error)).await;
        }
        let _ = event_tx
            .send(ConnectionEvent::Close {
                code: ended.code,
                reason: ended.reason,
            })
            .await;
    }
}

/// How the socket loop finished.
struct Ended {
    code: u16,
    reason: String,
    error: Option<String>,
}

impl Ended {
    fn clean(code: u16, reason: String) -> Self {
        Self {
            code,
            reason,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: error.clone(),
            error: Some(error),
        }
    }
}

async fn write_loop<W>(
    writer: &mut W,
    outgoing_rx: &mut mpsc::Receiver<Outgoing>,
    state: &RwLock<ConnectionState>,
) -> Ended
where
    W: futures_util::Sink<WsMessage, Error = WsError> + Unpin,
{
    loop {
        match outgoing_rx.recv().await {
            Some(Outgoing::Frame(text)) => {
                if let Err(e) = writer.send(WsMessage::Text(text.into())).await {
                    return Ended::failed(e.to_string());
                }
            }
            Some(Outgoing::Close { code, reason }) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.clone().into(),
                };
                let _ = writer.send(WsMessage::Close(Some(frame))).await;
                return Ended::clean(code, reason);
            }
            None => {
                // Every handle dropped.
                *state.write().await = ConnectionState::Closing;
                let _ = writer.send(WsMessage::Close(None)).await;
                return Ended::clean(NORMAL_CLOSURE, String::new());
            }
        }
    }
}

/// Inbound half: inspects frames and publishes them as events.
struct Inbound<'a> {
    id: Uuid,
    state: &'a RwLock<ConnectionState>,
    event_tx: &'a mpsc::Sender<ConnectionEvent>,
    audit: &'a Mutex<MessageAudit>,
}

impl Inbound<'_> {
    async fn read_loop<R>(&self, reader: &mut R) -> Ended
    where
        R: futures_util::Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
    {
        loop {
            match reader.next().await {
                Some(Ok(WsMessage::Text(text))) => self.deliver(text.as_str()).await,
                Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => self.deliver(text).await,
                    Err(e) => {
                        let issues = vec![IssueKind::InvalidJson(e.to_string())];
                        self.audit.lock().await.record("<binary>", &issues);
                        let _ = self
                            .event_tx
                            .send(ConnectionEvent::Malformed { raw: "<binary>".into(), issues })
                            .await;
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    *self.state.write().await = ConnectionState::Closing;
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    return Ended::clean(code, reason);
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Ended::failed(e.to_string()),
                None => return Ended::clean(ABNORMAL_CLOSURE, "stream ended".to_string()),
            }
        }
    }

    async fn deliver(&self, text: &str) {
        let inspection = Message::inspect(text);
        self.audit.lock().await.record(text, &inspection.issues);

        let event = match inspection.message {
            Some(message) => ConnectionEvent::Message(message),
            None => {
                log::warn!(
                    "Connection {} received malformed frame: {:?}",
                    self.id,
                    inspection.issues
                );
                ConnectionEvent::Malformed {
                    raw: text.to_string(),
                    issues: inspection.issues,
                }
            }
        };
        let _ = self.event_tx.send(event).await;
    }
}
