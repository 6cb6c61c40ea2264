//! Client configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::connection::ConnectionOptions;
use crate::error::{CollabError, Result};
use crate::presence::InactivityThresholds;
use crate::queue::FailurePolicy;
use crate::reconnect::ReconnectConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollabConfig {
    /// Base WebSocket URL of the collaboration server.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub case_id: u64,
    /// Opaque credential, passed as `?token=`.
    #[serde(default)]
    pub token: Option<String>,
    /// Collaborator id; a random one is generated per session when unset.
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub presence: PresenceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_buffer")]
    pub send_buffer: usize,
    #[serde(default = "default_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSettings {
    #[serde(default = "default_idle_after")]
    pub idle_after_ms: u64,
    #[serde(default = "default_away_after")]
    pub away_after_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            case_id: 0,
            token: None,
            user_id: None,
            username: default_username(),
            connection: ConnectionSettings::default(),
            reconnect: ReconnectSettings::default(),
            queue: QueueSettings::default(),
            presence: PresenceSettings::default(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            send_buffer: default_buffer(),
            event_buffer: default_buffer(),
            connect_timeout_ms: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: None,
            auto_reconnect: true,
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            idle_after_ms: default_idle_after(),
            away_after_ms: default_away_after(),
        }
    }
}

fn default_server_url() -> String { "ws://127.0.0.1:8000".to_string() }
fn default_username() -> String { "anonymous".to_string() }
fn default_buffer() -> usize { 256 }
fn default_connect_timeout() -> u64 { 5_000 }
fn default_poll_interval() -> u64 { 10 }
fn default_max_retries() -> u32 { 5 }
fn default_base_delay() -> u64 { 1_000 }
fn default_true() -> bool { true }
fn default_idle_after() -> u64 { 60_000 }
fn default_away_after() -> u64 { 300_000 }

impl CollabConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CollabError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CollabError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CollabError::Config(msg.to_string()));

        if self.reconnect.max_retries == 0 {
            return fail("reconnect.max_retries must be at least 1");
        }
        if self.connection.send_buffer == 0 || self.connection.event_buffer == 0 {
            return fail("connection buffers must be non-zero");
        }
        if self.connection.poll_interval_ms == 0 {
            return fail("connection.poll_interval_ms must be non-zero");
        }
        if self.presence.away_after_ms < self.presence.idle_after_ms {
            return fail("presence.away_after_ms must not be below idle_after_ms");
        }
        self.case_url("user")?;
        Ok(())
    }

    /// `<server_url>/ws/case/<case_id>/?token=..&user_id=..&username=..`
    pub fn case_url(&self, user_id: &str) -> Result<String> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| CollabError::Config(format!("invalid server_url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(CollabError::Config(format!(
                "server_url must use ws or wss, got {}",
                url.scheme()
            )));
        }

        let case_id = self.case_id.to_string();
        url.path_segments_mut()
            .map_err(|_| CollabError::Config("server_url cannot be a base".into()))?
            .pop_if_empty()
            .extend(["ws", "case", case_id.as_str(), ""]);
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            query
                .append_pair("user_id", user_id)
                .append_pair("username", &self.username);
        }
        Ok(url.into())
    }
}

impl ConnectionSettings {
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            send_buffer: self.send_buffer,
            event_buffer: self.event_buffer,
            ..ConnectionOptions::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ReconnectSettings {
    pub fn backoff(&self) -> ReconnectConfig {
        ReconnectConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: self.max_delay_ms.map(Duration::from_millis),
        }
    }
}

impl PresenceSettings {
    pub fn thresholds(&self) -> InactivityThresholds {
        InactivityThresholds {
            idle_after: Duration::from_millis(self.idle_after_ms),
            away_after: Duration::from_millis(self.away_after_ms),
        }
    }
}
