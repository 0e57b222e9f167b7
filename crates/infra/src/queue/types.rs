//! Queued stage units, their lifecycle and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub Uuid);

impl UnitId {
    /// Time-ordered id, so ids sort roughly by enqueue time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Where a unit is in its lifecycle.
///
/// `Failed` units wait for their next attempt at `scheduled_at`;
/// `Completed` and `DeadLettered` are final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Completed,
    Failed { error: String, attempt: u32 },
    DeadLettered { error: String, attempts: u32 },
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::DeadLettered { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    #[default]
    Exponential,
}

/// How often, and how far apart, a failing unit is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(6, Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Wait before the attempt following attempt number `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let exp = attempt.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1 << exp).min(self.max_delay)
            }
        }
    }

    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// One stage message waiting on, or running from, a named queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedUnit {
    pub id: UnitId,
    pub queue: String,
    /// Encoded stage envelope; only the queue's handler decodes it.
    pub payload: serde_json::Value,
    pub status: UnitStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the unit may be claimed; `None` means now.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub history: Vec<Attempt>,
}

/// A finished attempt, kept for the dead-letter report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl QueuedUnit {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: UnitId::new(),
            queue: queue.into(),
            payload,
            status: UnitStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn scheduled_in(self, delay: Duration) -> Self {
        self.scheduled_at(after(Utc::now(), delay))
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn mark_running(&mut self) {
        self.attempt += 1;
        self.status = UnitStatus::Running;
        self.updated_at = Utc::now();
    }

    fn finish_attempt(&mut self, started_at: DateTime<Utc>, error: Option<String>) -> DateTime<Utc> {
        let now = Utc::now();
        self.history.push(Attempt {
            number: self.attempt,
            started_at,
            finished_at: now,
            error,
        });
        self.updated_at = now;
        now
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        self.finish_attempt(started_at, None);
        self.status = UnitStatus::Completed;
    }

    /// A retryable failure: reschedule, or dead-letter once the policy is spent.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = self.finish_attempt(started_at, Some(error.clone()));
        if !self.retry_policy.allows_another(self.attempt) {
            self.status = UnitStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
            return;
        }
        self.scheduled_at = Some(after(now, self.retry_policy.delay_after(self.attempt)));
        self.status = UnitStatus::Failed {
            error,
            attempt: self.attempt,
        };
    }

    pub fn mark_fatal(&mut self, error: String, started_at: DateTime<Utc>) {
        self.finish_attempt(started_at, Some(error.clone()));
        self.status = UnitStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }
}

/// What a handler decided about one attempt.
#[derive(Debug)]
pub enum UnitResult {
    Success,
    /// Try again later under the unit's retry policy.
    Retry(String),
    /// Never try again.
    Fatal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub unit: QueuedUnit,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(unit: QueuedUnit, reason: String) -> Self {
        Self {
            unit,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
        assert_eq!(policy.delay_after(40), Duration::from_secs(5));
    }

    #[test]
    fn zero_base_never_waits() {
        let policy = RetryPolicy::exponential(3, Duration::ZERO, Duration::from_secs(300));
        assert_eq!(policy.delay_after(2), Duration::ZERO);
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }

    #[test]
    fn failing_unit_is_dead_lettered_when_the_policy_is_spent() {
        let mut unit = QueuedUnit::new("dispatch", serde_json::json!({}))
            .with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)));

        unit.mark_running();
        unit.mark_failed("bus down".into(), Utc::now());
        assert!(matches!(unit.status, UnitStatus::Failed { attempt: 1, .. }));
        assert!(unit.scheduled_at.is_some());

        unit.mark_running();
        unit.mark_failed("bus down".into(), Utc::now());
        assert!(matches!(unit.status, UnitStatus::DeadLettered { attempts: 2, .. }));
        assert_eq!(unit.history.len(), 2);
        assert_eq!(unit.history[1].number, 2);
    }

    #[test]
    fn fatal_failure_is_final() {
        let mut unit = QueuedUnit::new("csv_split", serde_json::json!({}));
        unit.mark_running();
        unit.mark_fatal("expected header 'userIds'".into(), Utc::now());
        assert!(unit.status.is_terminal());
        assert_eq!(unit.history.len(), 1);
    }

    #[test]
    fn scheduled_unit_waits() {
        let unit = QueuedUnit::new("job_completed", serde_json::json!({})).scheduled_in(Duration::from_secs(60));
        assert!(!unit.is_ready_at(Utc::now()));
        assert!(unit.is_ready_at(Utc::now() + chrono::Duration::seconds(61)));
    }
}
