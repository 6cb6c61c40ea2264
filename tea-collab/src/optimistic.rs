//! Optimistic state tracking with server reconciliation.
//!
//! Local edits are shown immediately as candidates derived from the
//! confirmed baseline; each one is later confirmed (server state becomes
//! the new baseline) or rolled back (discarded, baseline untouched).
//!
//! Every pending candidate is `baseline ⊕ patch` for the *current*
//! baseline: patches are never chained onto each other, and they are
//! rebased whenever the baseline changes. The presented state is the most
//! recently applied candidate, or the baseline when nothing is pending.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// States that can have a partial patch merged over them.
pub trait Merge: Clone {
    /// Return `self` with `patch` applied on top.
    fn merged(&self, patch: &Self) -> Self;
}

impl Merge for Value {
    /// Shallow object merge: keys of `patch` replace keys of `self`.
    /// A non-object on either side is replaced wholesale by `patch`.
    fn merged(&self, patch: &Self) -> Self {
        match (self, patch) {
            (Value::Object(base), Value::Object(changes)) => {
                let mut out = base.clone();
                for (key, value) in changes {
                    out.insert(key.clone(), value.clone());
                }
                Value::Object(out)
            }
            _ => patch.clone(),
        }
    }
}

/// A speculative local mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate<S> {
    pub update_id: String,
    pub patch: S,
    /// `baseline ⊕ patch`
    pub candidate: S,
    pub applied_at: DateTime<Utc>,
}

/// Confirmed baseline plus the set of pending optimistic updates.
#[derive(Debug, Clone)]
pub struct OptimisticState<S> {
    baseline: S,
    /// Ordered by submission; the last entry is the presented one.
    pending: Vec<PendingUpdate<S>>,
}

impl<S: Merge> OptimisticState<S> {
    pub fn new(baseline: S) -> Self {
        Self {
            baseline,
            pending: Vec::new(),
        }
    }

    /// Merge `patch` over the confirmed baseline and track it as pending.
    ///
    /// Re-using a pending `update_id` replaces that update and makes it the
    /// most recent one. Returns the candidate state.
    pub fn apply_optimistic_update(&mut self, update_id: impl Into<String>, patch: S) -> S {
        let update_id = update_id.into();
        self.pending.retain(|p| p.update_id != update_id);

        let candidate = self.baseline.merged(&patch);
        self.pending.push(PendingUpdate {
            update_id,
            patch,
            candidate: candidate.clone(),
            applied_at: Utc::now(),
        });
        candidate
    }

    /// Resolve `update_id` with the authoritative server state.
    ///
    /// The server state replaces the baseline verbatim and remaining pending
    /// updates are rebased onto it. Unknown ids are a no-op returning the
    /// current state.
    pub fn confirm_update(&mut self, update_id: &str, server_state: S) -> S {
        let Some(index) = self.position(update_id) else {
            log::trace!("Confirm for unknown update {update_id} ignored");
            return self.current_state().clone();
        };
        self.pending.remove(index);
        self.baseline = server_state;
        self.rebase();
        self.baseline.clone()
    }

    /// Discard `update_id` without touching the baseline.
    ///
    /// Returns the state now presented: the most recent remaining candidate,
    /// or the baseline.
    pub fn rollback_update(&mut self, update_id: &str) -> S {
        match self.position(update_id) {
            Some(index) => {
                self.pending.remove(index);
            }
            None => log::trace!("Rollback for unknown update {update_id} ignored"),
        }
        self.current_state().clone()
    }

    /// Merge a server-pushed partial state into the baseline.
    pub fn apply_server_patch(&mut self, patch: &S) -> S {
        self.baseline = self.baseline.merged(patch);
        self.rebase();
        self.current_state().clone()
    }

    /// The state to present: latest pending candidate, else the baseline.
    pub fn current_state(&self) -> &S {
        self.pending
            .last()
            .map(|p| &p.candidate)
            .unwrap_or(&self.baseline)
    }

    pub fn baseline(&self) -> &S {
        &self.baseline
    }

    pub fn has_pending_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, update_id: &str) -> bool {
        self.position(update_id).is_some()
    }

    /// Pending update ids in submission order.
    pub fn pending_ids(&self) -> Vec<&str> {
        self.pending.iter().map(|p| p.update_id.as_str()).collect()
    }

    pub fn pending(&self) -> &[PendingUpdate<S>] {
        &self.pending
    }

    fn position(&self, update_id: &str) -> Option<usize> {
        self.pending.iter().position(|p| p.update_id == update_id)
    }

    fn rebase(&mut self) {
        for update in &mut self.pending {
            update.candidate = self.baseline.merged(&update.patch);
        }
    }
}
