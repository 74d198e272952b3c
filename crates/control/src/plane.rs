//! The control plane: one handle over the gate, the retry/breaker pair, the
//! dead letter queue and backpressure evaluation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;
use warden_core::{Clock, ControlPlaneConfig, ErrorTaxonomy, SystemClock};

use crate::backpressure::BackpressureController;
use crate::breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
use crate::dlq::{DeadLetterQueue, DlqEntry, DlqReason, DlqStats, NewDlqEntry};
use crate::error::ControlError;
use crate::gate::{ConcurrencyGate, GateStats};
use crate::monitor::{monitor_interval, spawn_monitor, MetricsSource, MonitorHandle};
use crate::retry::{RetryBudgetManager, RetryDecision};
use crate::session::{SessionState, TenantSession};

/// A failed task as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    pub task_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub taxonomy: ErrorTaxonomy,
    pub error_message: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Result of [`ControlPlane::record_failure`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// The task may run again; `attempts` failures are on record so far.
    Retry { attempts: u32 },
    DeadLettered(DlqEntry),
}

/// Point-in-time view of the whole plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStats {
    pub gate: GateStats,
    pub circuit: CircuitBreakerState,
    pub dlq: DlqStats,
}

pub struct ControlPlane {
    config: ControlPlaneConfig,
    clock: Arc<dyn Clock>,
    gate: Arc<ConcurrencyGate>,
    retry: RetryBudgetManager,
    dlq: DeadLetterQueue,
    backpressure: BackpressureController,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig, clock: Arc<dyn Clock>) -> Self {
        let breaker = CircuitBreaker::from_config(&config.breaker, clock.clone());
        let plane = Self {
            gate: Arc::new(ConcurrencyGate::from_config(&config.gate)),
            retry: RetryBudgetManager::new(&config.retry, breaker, clock.clone()),
            dlq: DeadLetterQueue::from_config(&config.dlq, clock.clone()),
            backpressure: BackpressureController::new(config.concurrency.clone()),
            clock,
            config,
        };
        info!(profile = %plane.config.profile_label(), "control plane ready");
        plane
    }

    pub fn with_system_clock(config: ControlPlaneConfig) -> Self {
        Self::new(config, Arc::new(SystemClock::new()))
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Shared so acquirers can hold it across `.await`s in spawned tasks.
    pub fn gate(&self) -> Arc<ConcurrencyGate> {
        self.gate.clone()
    }

    pub fn retry(&self) -> &RetryBudgetManager {
        &self.retry
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Open an `idle` session for `tenant_id` with a fresh id and the
    /// configured TTL.
    pub fn open_session(&self, tenant_id: &str) -> Result<TenantSession, ControlError> {
        let ttl = Duration::from_millis(self.config.session.ttl_ms);
        let session = TenantSession::new(
            Uuid::new_v4().to_string(),
            tenant_id,
            ttl,
            self.clock.now(),
        )?;
        debug!(session_id = %session.session_id, tenant_id, "session opened");
        Ok(session)
    }

    pub fn transition_session(
        &self,
        session: &TenantSession,
        to: SessionState,
    ) -> Result<TenantSession, ControlError> {
        session.transition(to, self.clock.now())
    }

    pub fn is_session_expired(&self, session: &TenantSession) -> bool {
        session.is_expired(self.clock.now())
    }

    // ── Task outcomes ────────────────────────────────────────────────

    /// Record a failure and decide its fate.
    ///
    /// The budget check happens before the attempt is counted, so a budget
    /// of `n` allows `n` retries after the first failure. If counting the
    /// attempt trips the breaker, the task is dead-lettered as
    /// `circuit_open` instead of being retried against an open circuit. A
    /// task that is not retried lands in the DLQ with its full attempt
    /// history.
    pub fn record_failure(&self, failure: FailedTask) -> FailureOutcome {
        let mut decision = self.retry.decide(&failure.task_id, failure.taxonomy);
        let retryable = self.retry.is_retryable(failure.taxonomy);
        let budget = self.retry.record_attempt(
            &failure.task_id,
            failure.taxonomy,
            &failure.error_message,
            retryable,
        );
        if decision == RetryDecision::Retry && self.retry.breaker().state() == CircuitState::Open {
            decision = RetryDecision::DeadLetter(DlqReason::CircuitOpen);
        }

        match decision {
            RetryDecision::Retry => {
                debug!(task_id = %failure.task_id, attempts = budget.attempt_count, "task will be retried");
                FailureOutcome::Retry {
                    attempts: budget.attempt_count,
                }
            }
            RetryDecision::DeadLetter(reason) => {
                let attempts = self
                    .retry
                    .take_budget(&failure.task_id)
                    .map_or(budget.attempts, |b| b.attempts);
                let entry = self.dlq.enqueue(NewDlqEntry {
                    task_id: failure.task_id,
                    session_id: failure.session_id,
                    error_taxonomy: failure.taxonomy,
                    error_message: failure.error_message,
                    attempts,
                    original_payload: failure.payload,
                    reason,
                });
                FailureOutcome::DeadLettered(entry)
            }
        }
    }

    pub fn record_success(&self, task_id: &str, taxonomy: ErrorTaxonomy) {
        self.retry.record_success(task_id, taxonomy);
    }

    // ── Load ─────────────────────────────────────────────────────────

    /// Start sampling `source` at the configured interval.
    pub fn spawn_monitor(
        &self,
        source: Arc<dyn MetricsSource>,
        shutdown: watch::Receiver<bool>,
    ) -> MonitorHandle {
        spawn_monitor(
            source,
            self.backpressure.clone(),
            monitor_interval(&self.config.monitor),
            shutdown,
        )
    }

    pub fn stats(&self) -> ControlPlaneStats {
        ControlPlaneStats {
            gate: self.gate.stats(),
            circuit: self.retry.global_circuit_state(),
            dlq: self.dlq.stats(),
        }
    }

    /// Drop retry budgets, close the breaker and empty the DLQ. Gate slots
    /// belong to their holders and are left alone.
    pub fn reset(&self) {
        self.retry.reset();
        self.dlq.clear();
        info!("control plane reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::ManualClock;

    fn plane() -> (ControlPlane, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        (ControlPlane::new(ControlPlaneConfig::default(), clock.clone()), clock)
    }

    fn failure(task_id: &str, taxonomy: ErrorTaxonomy) -> FailedTask {
        FailedTask {
            task_id: task_id.to_string(),
            session_id: Some("s-1".into()),
            taxonomy,
            error_message: format!("{taxonomy} in {task_id}"),
            payload: Some(serde_json::json!({ "step": 3 })),
        }
    }

    #[test]
    fn first_retryable_failure_is_retried_second_is_dead_lettered() {
        let (plane, _) = plane();
        let first = plane.record_failure(failure("t1", ErrorTaxonomy::Timeout));
        assert_eq!(first, FailureOutcome::Retry { attempts: 1 });

        match plane.record_failure(failure("t1", ErrorTaxonomy::Timeout)) {
            FailureOutcome::DeadLettered(entry) => {
                assert_eq!(entry.reason, DlqReason::RetriesExhausted);
                assert_eq!(entry.attempts.len(), 2);
                assert_eq!(entry.session_id.as_deref(), Some("s-1"));
                assert!(entry.original_payload.is_some());
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert!(plane.retry().budget("t1").is_none());
    }

    #[test]
    fn invariant_violation_goes_straight_to_dlq() {
        let (plane, _) = plane();
        match plane.record_failure(failure("t2", ErrorTaxonomy::InvariantViolation)) {
            FailureOutcome::DeadLettered(entry) => {
                assert_eq!(entry.reason, DlqReason::NonRetryable);
                assert_eq!(entry.attempts.len(), 1);
                assert!(!entry.attempts[0].retryable);
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[test]
    fn open_circuit_dead_letters_fresh_tasks() {
        let (plane, _) = plane();
        for i in 0..5 {
            plane.record_failure(failure(&format!("t{i}"), ErrorTaxonomy::ToolFailure));
        }
        assert_eq!(plane.stats().circuit.state, CircuitState::Open);

        match plane.record_failure(failure("fresh", ErrorTaxonomy::ToolFailure)) {
            FailureOutcome::DeadLettered(entry) => assert_eq!(entry.reason, DlqReason::CircuitOpen),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[test]
    fn failure_that_trips_breaker_is_not_retried() {
        let (plane, _) = plane();
        for i in 0..4 {
            assert_eq!(
                plane.record_failure(failure(&format!("t{i}"), ErrorTaxonomy::ToolFailure)),
                FailureOutcome::Retry { attempts: 1 }
            );
        }

        match plane.record_failure(failure("t4", ErrorTaxonomy::ToolFailure)) {
            FailureOutcome::DeadLettered(entry) => {
                assert_eq!(entry.reason, DlqReason::CircuitOpen);
                assert_eq!(entry.attempts.len(), 1);
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(plane.stats().circuit.state, CircuitState::Open);
        assert!(!plane.retry().can_retry("t4", ErrorTaxonomy::ToolFailure));
        assert!(plane.retry().budget("t4").is_none());
    }

    #[test]
    fn success_clears_budget() {
        let (plane, _) = plane();
        plane.record_failure(failure("t1", ErrorTaxonomy::SchemaViolation));
        plane.record_success("t1", ErrorTaxonomy::SchemaViolation);
        assert_eq!(
            plane.record_failure(failure("t1", ErrorTaxonomy::SchemaViolation)),
            FailureOutcome::Retry { attempts: 1 }
        );
    }

    #[test]
    fn sessions_use_configured_ttl() {
        let (plane, clock) = plane();
        let session = plane.open_session("tenant-a").unwrap();
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.expires_at - session.created_at, chrono::Duration::hours(1));

        let active = plane.transition_session(&session, SessionState::Active).unwrap();
        assert_eq!(active.state, SessionState::Active);

        clock.advance_ms(3_600_000);
        assert!(plane.is_session_expired(&active));
    }

    #[test]
    fn reset_empties_dlq_and_closes_circuit() {
        let (plane, _) = plane();
        plane.record_failure(failure("t", ErrorTaxonomy::PolicyViolation));
        assert_eq!(plane.dlq().len(), 1);
        plane.reset();
        assert!(plane.dlq().is_empty());
        assert_eq!(plane.stats().circuit.failure_count, 0);
    }
}
