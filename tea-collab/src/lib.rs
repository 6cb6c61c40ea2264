//! # tea-collab — Real-time collaboration core for assurance case editing
//!
//! Keeps several editors of the same assurance case in sync over a
//! WebSocket channel: local edits are shown optimistically, remote changes
//! are applied strictly in arrival order, and collaborator presence and
//! cursors are tracked live.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────┐
//! │ CollabSession    │ ◄────────────────► │ RelayServer  │
//! │ (per user, case) │     JSON frames    │ (dev/tests)  │
//! └────────┬─────────┘                    └──────┬───────┘
//!          │                                     │
//!          ▼                                     ▼
//! ┌──────────────────┐                   ┌───────────────┐
//! │ Connection       │                   │ BroadcastGroup│
//! │ MessageQueue     │                   │ (per case)    │
//! │ OptimisticState  │                   └───────────────┘
//! │ PresenceTracker  │
//! │ Reconnection     │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire message, typed payloads, integrity audit
//! - [`connection`] — one channel: lifecycle, send, events, close, wait
//! - [`queue`] — in-order, non-overlapping processing of inbound messages
//! - [`optimistic`] — optimistic state with confirm/rollback reconciliation
//! - [`presence`] — collaborator liveness and cursors
//! - [`reconnect`] — exponential backoff reconnection with stats
//! - [`session`] — supervisor wiring the above for one case
//! - [`broadcast`], [`server`] — relay server used in development and tests
//! - [`config`], [`error`] — configuration and error taxonomy

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod optimistic;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, RoomManager, RoomPeer};
pub use config::CollabConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionOptions, ConnectionState};
pub use error::{CollabError, Result};
pub use optimistic::{Merge, OptimisticState, PendingUpdate};
pub use presence::{
    Collaborator, Cursor, InactivityThresholds, PresenceEntry, PresenceStatus, PresenceTracker,
};
pub use protocol::{
    AuditReport, CaseUpdate, CursorUpdate, IntegrityIssue, IssueKind, Message, MessageAudit,
    MessageType, PresenceSnapshot, ProtocolError,
};
pub use queue::{FailurePolicy, MessageQueue, QueueStatus};
pub use reconnect::{
    AttemptRecord, ControllerState, ReconnectConfig, ReconnectionController, ReconnectionStats,
};
pub use server::{CaseRoute, RelayServer, ServerConfig, ServerStats};
pub use session::{CollabSession, SessionStatus};
