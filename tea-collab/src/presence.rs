//! Presence tracking for case collaborators.
//!
//! Purely reactive: the tracker never produces outbound messages, it only
//! folds inbound join/leave/cursor/presence events into a liveness view.
//!
//! ## Event flow
//!
//! ```text
//! presence_update ──► PresenceTracker::replace_all()
//! cursor_update   ──► PresenceTracker::cursor_move()
//! user_update     ──► PresenceTracker::user_active()
//!                          │
//!                          ▼
//!                 active_users() ──► UI collaborator indicators
//! ```
//!
//! Join/leave and cursor events may arrive out of order across a degraded
//! connection, so updates for unknown collaborators are dropped rather than
//! creating placeholder entries.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Cursor position of a collaborator on the case diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
    /// Diagram element under the cursor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            element_id: None,
        }
    }

    pub fn on_element(mut self, element_id: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self
    }
}

/// Liveness of a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

/// Identity of a collaborator joining a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: String,
    pub username: String,
}

impl Collaborator {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// One collaborator's live status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl PresenceEntry {
    /// Fresh active entry with no cursor.
    pub fn joined(user: Collaborator, now: DateTime<Utc>) -> Self {
        Self {
            id: user.id,
            username: user.username,
            cursor: None,
            last_activity: now,
            status: PresenceStatus::Active,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Inactivity thresholds used by [`PresenceTracker::sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InactivityThresholds {
    pub idle_after: Duration,
    pub away_after: Duration,
}

impl Default for InactivityThresholds {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(60),
            away_after: Duration::from_secs(300),
        }
    }
}

/// Maintains the set of collaborators in one case and their cursors.
///
/// Entries are created only by [`user_join`](Self::user_join) or by an
/// authoritative [`replace_all`](Self::replace_all) snapshot.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<String, PresenceEntry>,
    thresholds: InactivityThresholds,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(thresholds: InactivityThresholds) -> Self {
        Self {
            entries: HashMap::new(),
            thresholds,
        }
    }

    /// Register a collaborator as active. Re-joining resets the entry.
    pub fn user_join(&mut self, user: Collaborator) {
        log::debug!("Presence: {} ({}) joined", user.username, user.id);
        let entry = PresenceEntry::joined(user, Utc::now());
        self.entries.insert(entry.id.clone(), entry);
    }

    /// Remove a collaborator together with its cursor.
    pub fn user_leave(&mut self, user_id: &str) -> Option<PresenceEntry> {
        let removed = self.entries.remove(user_id);
        if removed.is_some() {
            log::debug!("Presence: {user_id} left");
        }
        removed
    }

    /// Move a collaborator's cursor. Returns `false` for unknown users.
    pub fn cursor_move(&mut self, user_id: &str, x: f64, y: f64, element_id: Option<String>) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                entry.cursor = Some(Cursor { x, y, element_id });
                entry.last_activity = Utc::now();
                true
            }
            None => {
                log::trace!("Presence: dropping cursor for unknown user {user_id}");
                false
            }
        }
    }

    /// Mark a collaborator idle. Returns `false` for unknown users.
    pub fn user_idle(&mut self, user_id: &str) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                entry.status = PresenceStatus::Idle;
                true
            }
            None => false,
        }
    }

    /// Record activity: status back to active, `last_activity` refreshed.
    pub fn user_active(&mut self, user_id: &str) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                entry.status = PresenceStatus::Active;
                entry.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Replace every entry with an authoritative server snapshot.
    ///
    /// Cursors of collaborators present in both views are kept when the
    /// snapshot carries none.
    pub fn replace_all(&mut self, snapshot: Vec<PresenceEntry>) {
        let mut previous = std::mem::take(&mut self.entries);
        for mut entry in snapshot {
            if entry.cursor.is_none() {
                entry.cursor = previous.remove(&entry.id).and_then(|old| old.cursor);
            }
            self.entries.insert(entry.id.clone(), entry);
        }
    }

    /// Demote entries by inactivity. Returns the ids whose status changed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let idle_after = to_chrono(self.thresholds.idle_after);
        let away_after = to_chrono(self.thresholds.away_after);

        let mut changed = Vec::new();
        for entry in self.entries.values_mut() {
            let inactive = now - entry.last_activity;
            let status = if inactive >= away_after {
                PresenceStatus::Away
            } else if inactive >= idle_after {
                PresenceStatus::Idle
            } else {
                continue;
            };
            if entry.status != status && entry.status != PresenceStatus::Away {
                entry.status = status;
                changed.push(entry.id.clone());
            }
        }
        changed
    }

    /// Entries with `status = active`, in no particular order.
    pub fn active_users(&self) -> Vec<PresenceEntry> {
        self.entries
            .values()
            .filter(|e| e.status == PresenceStatus::Active)
            .cloned()
            .collect()
    }

    pub fn entry(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

// ===================================================================
// Tests
// ===================================================================
