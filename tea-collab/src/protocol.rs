//! JSON wire protocol for case collaboration.
//!
//! Wire format (one text frame per message):
//! ```text
//! { "type": "ping" | "case_message" | "user_update" | "cursor_update" | "presence_update",
//!   "content": <type-specific payload>,
//!   "timestamp": <integer ms epoch>,
//!   "userId": <string, optional> }
//! ```
//!
//! A frame without a `type` or with a null/absent `content` is malformed and
//! never becomes a [`Message`]. A frame missing only its `timestamp` is still
//! delivered, but the gap is recorded by [`MessageAudit`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::presence::{Cursor, PresenceEntry};

/// Closed set of message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Heartbeat
    Ping,
    /// Partial assurance case pushed by the server
    CaseMessage,
    /// Collaborator profile/activity change
    UserUpdate,
    /// Collaborator cursor moved
    CursorUpdate,
    /// Authoritative list of connected collaborators
    PresenceUpdate,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Ping,
        MessageType::CaseMessage,
        MessageType::UserUpdate,
        MessageType::CursorUpdate,
        MessageType::PresenceUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::CaseMessage => "case_message",
            MessageType::UserUpdate => "user_update",
            MessageType::CursorUpdate => "cursor_update",
            MessageType::PresenceUpdate => "presence_update",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = IssueKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| IssueKind::UnknownType(s.to_string()))
    }
}

/// Integrity problems detected on an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum IssueKind {
    InvalidJson(String),
    MissingType,
    UnknownType(String),
    MissingContent,
    MissingTimestamp,
    InvalidTimestamp,
}

impl IssueKind {
    /// Stable label used for per-kind counters.
    pub fn label(&self) -> &'static str {
        match self {
            IssueKind::InvalidJson(_) => "invalid_json",
            IssueKind::MissingType => "missing_type",
            IssueKind::UnknownType(_) => "unknown_type",
            IssueKind::MissingContent => "missing_content",
            IssueKind::MissingTimestamp => "missing_timestamp",
            IssueKind::InvalidTimestamp => "invalid_timestamp",
        }
    }

    /// Whether the issue prevents the frame from becoming a [`Message`].
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IssueKind::MissingTimestamp | IssueKind::InvalidTimestamp)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0:?}")]
    Malformed(Vec<IssueKind>),

    #[error("expected {expected} message, got {actual}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("invalid {expected} content: {reason}")]
    InvalidContent {
        expected: MessageType,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// `case_message` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseUpdate {
    pub assurance_case: Value,
}

/// `presence_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub current_connections: Vec<PresenceEntry>,
}

/// `cursor_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    pub user_id: String,
    pub cursor: Cursor,
}

/// Result of inspecting a raw inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    /// The decoded message, unless a fatal issue was found.
    pub message: Option<Message>,
    pub issues: Vec<IssueKind>,
}

/// Lenient shape used to inspect frames before they are trusted.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type", default)]
    msg_type: Option<Value>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(rename = "userId", default)]
    user_id: Option<Value>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(msg_type: MessageType, content: Value) -> Self {
        Self {
            msg_type,
            content,
            timestamp: Some(now_millis()),
            user_id: None,
        }
    }

    /// Attach the originating collaborator.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Create a heartbeat.
    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Value::Object(Default::default()))
    }

    /// Create a case update carrying a partial assurance case.
    pub fn case_message(assurance_case: Value) -> Self {
        let payload = CaseUpdate { assurance_case };
        Self::new(MessageType::CaseMessage, to_value(&payload))
    }

    /// Create a cursor update for `user_id`.
    pub fn cursor_update(user_id: impl Into<String>, cursor: Cursor) -> Self {
        let payload = CursorUpdate {
            user_id: user_id.into(),
            cursor,
        };
        Self::new(MessageType::CursorUpdate, to_value(&payload))
    }

    /// Create a presence snapshot.
    pub fn presence_update(current_connections: Vec<PresenceEntry>) -> Self {
        let payload = PresenceSnapshot { current_connections };
        Self::new(MessageType::PresenceUpdate, to_value(&payload))
    }

    /// Create a user update with an arbitrary payload.
    pub fn user_update(content: Value) -> Self {
        Self::new(MessageType::UserUpdate, content)
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode a text frame, rejecting malformed ones.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let inspection = Self::inspect(text);
        inspection
            .message
            .ok_or(ProtocolError::Malformed(inspection.issues))
    }

    /// Inspect a text frame and collect every integrity issue.
    pub fn inspect(text: &str) -> Inspection {
        let raw: RawMessage = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => {
                return Inspection {
                    message: None,
                    issues: vec![IssueKind::InvalidJson(e.to_string())],
                }
            }
        };

        let mut issues = Vec::new();

        let msg_type = match raw.msg_type {
            Some(Value::String(s)) if !s.is_empty() => match s.parse::<MessageType>() {
                Ok(t) => Some(t),
                Err(issue) => {
                    issues.push(issue);
                    None
                }
            },
            Some(Value::String(_)) | Some(Value::Null) | None => {
                issues.push(IssueKind::MissingType);
                None
            }
            Some(other) => {
                issues.push(IssueKind::UnknownType(other.to_string()));
                None
            }
        };

        let content = match raw.content {
            Some(Value::Null) | None => {
                issues.push(IssueKind::MissingContent);
                None
            }
            Some(v) => Some(v),
        };

        let timestamp = match raw.timestamp {
            Some(Value::Null) | None => {
                issues.push(IssueKind::MissingTimestamp);
                None
            }
            Some(v) => match v.as_i64() {
                Some(ts) => Some(ts),
                None => {
                    issues.push(IssueKind::InvalidTimestamp);
                    None
                }
            },
        };

        // Numeric user ids are normalised to strings.
        let user_id = match raw.user_id {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let message = match (msg_type, content) {
            (Some(msg_type), Some(content)) => Some(Message {
                msg_type,
                content,
                timestamp,
                user_id,
            }),
            _ => None,
        };

        Inspection { message, issues }
    }

    /// Integrity problems of an already decoded message.
    pub fn validate(&self) -> Vec<IssueKind> {
        let mut issues = Vec::new();
        if self.timestamp.is_none() {
            issues.push(IssueKind::MissingTimestamp);
        }
        if self.content.is_null() {
            issues.push(IssueKind::MissingContent);
        }
        issues
    }

    fn payload<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedType {
                expected,
                actual: self.msg_type,
            });
        }
        serde_json::from_value(self.content.clone()).map_err(|e| ProtocolError::InvalidContent {
            expected,
            reason: e.to_string(),
        })
    }

    /// Parse a `case_message` payload.
    pub fn case_update(&self) -> Result<CaseUpdate, ProtocolError> {
        self.payload(MessageType::CaseMessage)
    }

    /// Parse a `presence_update` payload.
    pub fn presence_snapshot(&self) -> Result<PresenceSnapshot, ProtocolError> {
        self.payload(MessageType::PresenceUpdate)
    }

    /// Parse a `cursor_update` payload.
    pub fn cursor(&self) -> Result<CursorUpdate, ProtocolError> {
        self.payload(MessageType::CursorUpdate)
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(e) => {
            // Payload structs only hold strings, numbers and JSON values.
            debug_assert!(false, "payload failed to serialize: {e}");
            log::error!("Payload failed to serialize: {e}");
            Value::Null
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Integrity audit
// ───────────────────────────────────────────────────────────────────

const RAW_EXCERPT_CHARS: usize = 256;

/// One recorded integrity problem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityIssue {
    pub kind: IssueKind,
    /// Leading excerpt of the offending frame.
    pub raw: String,
    pub detected_at: DateTime<Utc>,
}

/// Snapshot of the audit counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditReport {
    pub inspected: u64,
    pub flagged: u64,
    pub by_kind: HashMap<&'static str, u64>,
    pub recent: Vec<IntegrityIssue>,
}

/// Collects integrity issues of inbound frames for diagnostics.
///
/// Malformed frames are never rejected by the audit itself; it only keeps
/// a bounded history and per-kind counters.
#[derive(Debug)]
pub struct MessageAudit {
    inspected: u64,
    flagged: u64,
    by_kind: HashMap<&'static str, u64>,
    recent: VecDeque<IntegrityIssue>,
    capacity: usize,
}

impl MessageAudit {
    pub fn new(capacity: usize) -> Self {
        Self {
            inspected: 0,
            flagged: 0,
            by_kind: HashMap::new(),
            recent: VecDeque::with_capacity(capacity.min(128)),
            capacity,
        }
    }

    /// Record the outcome of inspecting `raw`.
    pub fn record(&mut self, raw: &str, issues: &[IssueKind]) {
        self.inspected += 1;
        if issues.is_empty() {
            return;
        }
        self.flagged += 1;

        let excerpt: String = raw.chars().take(RAW_EXCERPT_CHARS).collect();
        let now = Utc::now();
        for kind in issues {
            *self.by_kind.entry(kind.label()).or_insert(0) += 1;
            if self.capacity == 0 {
                continue;
            }
            if self.recent.len() >= self.capacity {
                self.recent.pop_front();
            }
            self.recent.push_back(IntegrityIssue {
                kind: kind.clone(),
                raw: excerpt.clone(),
                detected_at: now,
            });
        }
    }

    pub fn report(&self) -> AuditReport {
        AuditReport {
            inspected: self.inspected,
            flagged: self.flagged,
            by_kind: self.by_kind.clone(),
            recent: self.recent.iter().cloned().collect(),
        }
    }
}

impl Default for MessageAudit {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let msg = Message::ping().with_user("42");
        let encoded: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(encoded["type"], "ping");
        assert_eq!(encoded["userId"], "42");
        assert!(encoded["timestamp"].is_i64());
        assert!(encoded["content"].is_object());
    }

    #[test]
    fn test_decode_case_message() {
        let text = r#"{"type":"case_message","content":{"assuranceCase":{"name":"X"}},"timestamp":2}"#;
        let msg = Message::decode(text).unwrap();

        assert_eq!(msg.msg_type, MessageType::CaseMessage);
        assert_eq!(msg.timestamp, Some(2));
        assert_eq!(msg.case_update().unwrap().assurance_case, json!({"name": "X"}));
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let inspection = Message::inspect(r#"{"content":{},"timestamp":1}"#);
        assert!(inspection.message.is_none());
        assert_eq!(inspection.issues, vec![IssueKind::MissingType]);
    }

    #[test]
    fn test_empty_type_is_malformed() {
        let err = Message::decode(r#"{"type":"","content":{},"timestamp":1}"#).unwrap_err();
        assert_eq!(err, ProtocolError::Malformed(vec![IssueKind::MissingType]));
    }

    #[test]
    fn test_null_content_is_malformed() {
        let inspection = Message::inspect(r#"{"type":"ping","content":null,"timestamp":1}"#);
        assert!(inspection.message.is_none());
        assert_eq!(inspection.issues, vec![IssueKind::MissingContent]);
    }

    #[test]
    fn test_unknown_type() {
        let inspection = Message::inspect(r#"{"type":"teleport","content":{},"timestamp":1}"#);
        assert!(inspection.message.is_none());
        assert_eq!(inspection.issues, vec![IssueKind::UnknownType("teleport".into())]);
    }

    #[test]
    fn test_missing_timestamp_still_delivered() {
        let inspection = Message::inspect(r#"{"type":"ping","content":{}}"#);
        let msg = inspection.message.unwrap();

        assert_eq!(msg.timestamp, None);
        assert_eq!(inspection.issues, vec![IssueKind::MissingTimestamp]);
        assert_eq!(msg.validate(), vec![IssueKind::MissingTimestamp]);
    }

    #[test]
    fn test_invalid_json() {
        let inspection = Message::inspect("not json");
        assert!(inspection.message.is_none());
        assert!(matches!(inspection.issues[0], IssueKind::InvalidJson(_)));
    }

    #[test]
    fn test_numeric_user_id_normalised() {
        let msg = Message::decode(r#"{"type":"user_update","content":{},"timestamp":1,"userId":7}"#)
            .unwrap();
        assert_eq!(msg.user_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_cursor_payload() {
        let cursor = Cursor {
            x: 10.0,
            y: 20.0,
            element_id: Some("goal-1".into()),
        };
        let msg = Message::cursor_update("1", cursor.clone());

        assert_eq!(msg.content["cursor"]["elementId"], "goal-1");
        let parsed = msg.cursor().unwrap();
        assert_eq!(parsed.user_id, "1");
        assert_eq!(parsed.cursor, cursor);
    }

    #[test]
    fn test_constructors_always_produce_object_content() {
        let msg = Message::cursor_update("1", Cursor::new(f64::NAN, f64::INFINITY));

        // Non-finite coordinates serialize as null; the frame stays well formed.
        assert_eq!(msg.content["userId"], "1");
        assert!(msg.content["cursor"]["x"].is_null());
        let inspection = Message::inspect(&msg.encode().unwrap());
        assert!(inspection.message.is_some());
        assert!(inspection.issues.is_empty());
        assert!(matches!(msg.cursor(), Err(ProtocolError::InvalidContent { .. })));

        for msg in [
            Message::case_message(json!({"name": "A"})),
            Message::presence_update(Vec::new()),
        ] {
            assert!(msg.content.is_object(), "{msg:?}");
        }
    }

    #[test]
    fn test_presence_payload_defaults() {
        let text = r#"{"type":"presence_update","timestamp":5,
            "content":{"current_connections":[{"id":"1","username":"Bob"}]}}"#;
        let snapshot = Message::decode(text).unwrap().presence_snapshot().unwrap();

        assert_eq!(snapshot.current_connections.len(), 1);
        assert_eq!(snapshot.current_connections[0].username, "Bob");
        assert!(snapshot.current_connections[0].cursor.is_none());
    }

    #[test]
    fn test_payload_type_mismatch() {
        let err = Message::ping().case_update().unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedType {
                expected: MessageType::CaseMessage,
                actual: MessageType::Ping,
            }
        );
    }

    #[test]
    fn test_payload_invalid_content() {
        let msg = Message::new(MessageType::CursorUpdate, json!({"cursor": 5}));
        assert!(matches!(msg.cursor(), Err(ProtocolError::InvalidContent { .. })));
    }

    #[test]
    fn test_message_type_parse() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert!("PING".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_audit_counts_and_bounds() {
        let mut audit = MessageAudit::new(2);

        audit.record("{}", &[IssueKind::MissingType, IssueKind::MissingContent]);
        audit.record("{\"type\":\"ping\",\"content\":{}}", &[IssueKind::MissingTimestamp]);
        audit.record("{\"type\":\"ping\",\"content\":{},\"timestamp\":1}", &[]);

        let report = audit.report();
        assert_eq!(report.inspected, 3);
        assert_eq!(report.flagged, 2);
        assert_eq!(report.by_kind["missing_type"], 1);
        assert_eq!(report.by_kind["missing_timestamp"], 1);
        // Oldest issue evicted.
        assert_eq!(report.recent.len(), 2);
        assert_eq!(report.recent[0].kind, IssueKind::MissingContent);
        assert_eq!(report.recent[1].kind, IssueKind::MissingTimestamp);
    }

    #[test]
    fn test_audit_truncates_raw() {
        let mut audit = MessageAudit::default();
        let raw = "x".repeat(1000);
        audit.record(&raw, &[IssueKind::InvalidJson("eof".into())]);

        assert_eq!(audit.report().recent[0].raw.len(), RAW_EXCERPT_CHARS);
    }
}
