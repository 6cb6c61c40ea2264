//! Reconnection controller with exponential backoff.
//!
//! ```text
//! idle ──► connecting ──► open
//!              │  ▲
//!              ▼  │ sleep(base * 2^k)
//!            failed ──(k == max_retries)──► exhausted
//! ```
//!
//! `exhausted` is terminal: further reconnection calls fail immediately
//! until [`ReconnectionController::reset`] is called.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::{CollabError, Result};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound on a single delay. `None` keeps pure exponential growth.
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Connecting,
    Open,
    Failed,
    Exhausted,
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based within its reconnection cycle.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    /// Backoff waited before this attempt.
    pub delay: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregate over every recorded attempt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReconnectionStats {
    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub failed_attempts: usize,
    pub average_delay: Duration,
    pub last_error: Option<String>,
}

pub struct ReconnectionController {
    config: ReconnectConfig,
    state: ControllerState,
    attempts: Vec<AttemptRecord>,
}

impl ReconnectionController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ControllerState::Idle,
            attempts: Vec::new(),
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// Delay before 0-indexed attempt `k`: `base_delay * 2^k`, capped by
    /// `max_delay` when set. Saturates instead of overflowing.
    pub fn delay_for(&self, k: u32) -> Duration {
        let raw = 2u32
            .checked_pow(k)
            .and_then(|factor| self.config.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        match self.config.max_delay {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }

    /// Run a reconnection cycle with `create` as the connection factory.
    pub async fn reconnect_with_backoff<T, F, Fut>(&mut self, create: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.simulate_reconnection_with_backoff(create, |_| false).await
    }

    /// Run a reconnection cycle where `should_fail(attempt)` may force an
    /// attempt to fail without calling `create`.
    ///
    /// Each attempt first sleeps its backoff delay, then opens. Returns the
    /// first successful result, or [`CollabError::ReconnectFailed`] once
    /// `max_retries` attempts have failed.
    pub async fn simulate_reconnection_with_backoff<T, F, Fut, P>(
        &mut self,
        mut create: F,
        mut should_fail: P,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: FnMut(u32) -> bool,
    {
        if self.state == ControllerState::Exhausted {
            return Err(self.exhausted_error());
        }

        let max_retries = self.config.max_retries;
        for k in 0..max_retries {
            let attempt = k + 1;
            let delay = self.delay_for(k);
            self.state = ControllerState::Connecting;
            log::info!("Reconnection attempt {attempt}/{max_retries} after {delay:?}");

            tokio::time::sleep(delay).await;

            let outcome = if should_fail(attempt) {
                Err(CollabError::Transport("simulated connection failure".into()))
            } else {
                create(attempt).await
            };

            match outcome {
                Ok(connection) => {
                    self.record(attempt, delay, None);
                    self.state = ControllerState::Open;
                    log::info!("Reconnected on attempt {attempt}");
                    return Ok(connection);
                }
                Err(e) => {
                    log::warn!("Reconnection attempt {attempt} failed: {e}");
                    self.record(attempt, delay, Some(e.to_string()));
                    self.state = ControllerState::Failed;
                }
            }
        }

        self.state = ControllerState::Exhausted;
        let err = self.exhausted_error();
        log::error!("{err}");
        Err(err)
    }

    pub fn stats(&self) -> ReconnectionStats {
        let total_attempts = self.attempts.len();
        let successful_attempts = self.attempts.iter().filter(|a| a.success).count();
        let average_delay = if total_attempts == 0 {
            Duration::ZERO
        } else {
            let total: Duration = self.attempts.iter().map(|a| a.delay).sum();
            total / total_attempts as u32
        };
        ReconnectionStats {
            total_attempts,
            successful_attempts,
            failed_attempts: total_attempts - successful_attempts,
            average_delay,
            last_error: self.attempts.iter().rev().find_map(|a| a.error.clone()),
        }
    }

    /// Leave `exhausted` and forget recorded attempts.
    pub fn reset(&mut self) {
        self.state = ControllerState::Idle;
        self.attempts.clear();
    }

    fn record(&mut self, attempt: u32, delay: Duration, error: Option<String>) {
        self.attempts.push(AttemptRecord {
            attempt,
            at: Utc::now(),
            delay,
            success: error.is_none(),
            error,
        });
    }

    fn exhausted_error(&self) -> CollabError {
        CollabError::ReconnectFailed {
            attempts: self.config.max_retries,
            last_error: self
                .stats()
                .last_error
                .unwrap_or_else(|| "no attempt recorded".into()),
        }
    }
}

impl Default for ReconnectionController {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn controller(max_retries: u32, base_ms: u64) -> ReconnectionController {
        ReconnectionController::new(ReconnectConfig {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: None,
        })
    }

    async fn refuse(_attempt: u32) -> Result<u32> {
        Err(CollabError::Transport("connection refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_retries() {
        let mut ctl = controller(3, 100);
        let started = Instant::now();

        let err = ctl.reconnect_with_backoff(refuse).await.unwrap_err();

        match err {
            CollabError::ReconnectFailed { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let stats = ctl.stats();
        assert_eq!(stats.failed_attempts, 3);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successful_attempts, 0);
        assert_eq!(ctl.state(), ControllerState::Exhausted);
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_grow_exponentially() {
        let mut ctl = controller(4, 100);
        let _ = ctl
            .simulate_reconnection_with_backoff(refuse, |_| true)
            .await;

        let delays: Vec<u64> = ctl
            .attempts()
            .iter()
            .map(|a| a.delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ctl.stats().average_delay, Duration::from_millis(375));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_skips_factory() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut ctl = controller(5, 10);

        let opened = ctl
            .simulate_reconnection_with_backoff(
                move |attempt| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(attempt) }
                },
                |attempt| attempt < 3,
            )
            .await
            .unwrap();

        assert_eq!(opened, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.state(), ControllerState::Open);
        let stats = ctl.stats();
        assert_eq!(stats.successful_attempts, 1);
        assert_eq!(stats.failed_attempts, 2);
        assert_eq!(
            stats.last_error.as_deref(),
            Some("transport error: simulated connection failure")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_is_terminal_until_reset() {
        let mut ctl = controller(2, 10);
        assert!(ctl.reconnect_with_backoff(refuse).await.is_err());

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let again = ctl
            .reconnect_with_backoff(move |attempt| {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok(attempt) }
            })
            .await;
        assert!(matches!(again, Err(CollabError::ReconnectFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctl.stats().total_attempts, 2);

        ctl.reset();
        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(ctl.reconnect_with_backoff(|a| async move { Ok(a) }).await.unwrap(), 1);
    }

    #[test]
    fn test_delay_cap_and_saturation() {
        let mut ctl = controller(10, 100);
        assert_eq!(ctl.delay_for(0), Duration::from_millis(100));
        assert_eq!(ctl.delay_for(3), Duration::from_millis(800));
        assert_eq!(ctl.delay_for(40), Duration::MAX);

        ctl.config.max_delay = Some(Duration::from_millis(250));
        assert_eq!(ctl.delay_for(1), Duration::from_millis(200));
        assert_eq!(ctl.delay_for(2), Duration::from_millis(250));
        assert_eq!(ctl.delay_for(40), Duration::from_millis(250));
    }

    #[test]
    fn test_empty_stats() {
        let ctl = ReconnectionController::default();
        assert_eq!(ctl.stats(), ReconnectionStats::default());
        assert_eq!(ctl.config().max_retries, 5);
    }
}
