//! Per-task retry budgets backed by the global circuit breaker.
//!
//! A task may be retried while its failure category is retryable, its budget
//! has attempts left and the circuit is not open. Every recorded attempt is
//! also reported to the breaker, whatever its category, because the breaker
//! guards the system rather than any one task.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use warden_core::{Clock, ErrorTaxonomy, RetryConfig};

use crate::breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
use crate::dlq::DlqReason;

/// One failed attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub timestamp: DateTime<Utc>,
    pub taxonomy: ErrorTaxonomy,
    pub error_message: String,
    pub retryable: bool,
}

/// Attempt history of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    pub task_id: String,
    pub attempt_count: u32,
    pub exhausted: bool,
    pub attempts: Vec<RetryAttempt>,
}

/// What a caller should do with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    Retry,
    DeadLetter(DlqReason),
}

pub struct RetryBudgetManager {
    max_attempts: u32,
    retryable: HashSet<ErrorTaxonomy>,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    budgets: Mutex<HashMap<String, RetryBudget>>,
}

impl RetryBudgetManager {
    pub fn new(config: &RetryConfig, breaker: CircuitBreaker, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: config.max_attempts_per_task.max(1),
            retryable: config
                .retryable
                .iter()
                .copied()
                .filter(|t| !t.is_never_retryable())
                .collect(),
            breaker,
            clock,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    fn budgets(&self) -> MutexGuard<'_, HashMap<String, RetryBudget>> {
        self.budgets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_retryable(&self, taxonomy: ErrorTaxonomy) -> bool {
        self.retryable.contains(&taxonomy)
    }

    pub fn can_retry(&self, task_id: &str, taxonomy: ErrorTaxonomy) -> bool {
        self.decide(task_id, taxonomy) == RetryDecision::Retry
    }

    /// Like [`can_retry`](Self::can_retry), naming the reason when the
    /// answer is no.
    pub fn decide(&self, task_id: &str, taxonomy: ErrorTaxonomy) -> RetryDecision {
        if self.breaker.state() == CircuitState::Open {
            return RetryDecision::DeadLetter(DlqReason::CircuitOpen);
        }
        if !self.is_retryable(taxonomy) {
            return RetryDecision::DeadLetter(DlqReason::NonRetryable);
        }
        let exhausted = self
            .budgets()
            .get(task_id)
            .is_some_and(|b| b.exhausted);
        if exhausted {
            return RetryDecision::DeadLetter(DlqReason::RetriesExhausted);
        }
        RetryDecision::Retry
    }

    /// Record a failed attempt and feed it to the breaker.
    ///
    /// Returns the task's budget after the update.
    pub fn record_attempt(
        &self,
        task_id: &str,
        taxonomy: ErrorTaxonomy,
        error_message: &str,
        retryable: bool,
    ) -> RetryBudget {
        let attempt = RetryAttempt {
            timestamp: self.clock.now(),
            taxonomy,
            error_message: error_message.to_string(),
            retryable,
        };
        let budget = {
            let mut budgets = self.budgets();
            let budget = budgets
                .entry(task_id.to_string())
                .or_insert_with(|| RetryBudget {
                    task_id: task_id.to_string(),
                    attempt_count: 0,
                    exhausted: false,
                    attempts: Vec::new(),
                });
            budget.attempts.push(attempt);
            budget.attempt_count += 1;
            if !budget.exhausted && budget.attempt_count >= self.max_attempts {
                budget.exhausted = true;
                info!(task_id, attempts = budget.attempt_count, "retry budget exhausted");
            }
            budget.clone()
        };
        debug!(task_id, %taxonomy, retryable, "attempt recorded");
        self.breaker.record_failure();
        budget
    }

    /// Forget the task's budget and report the success to the breaker.
    pub fn record_success(&self, task_id: &str, taxonomy: ErrorTaxonomy) {
        if self.budgets().remove(task_id).is_some() {
            debug!(task_id, %taxonomy, "retry budget cleared after success");
        }
        self.breaker.record_success();
    }

    pub fn budget(&self, task_id: &str) -> Option<RetryBudget> {
        self.budgets().get(task_id).cloned()
    }

    /// Remove and return a budget, e.g. once it has been handed to the DLQ.
    pub fn take_budget(&self, task_id: &str) -> Option<RetryBudget> {
        self.budgets().remove(task_id)
    }

    /// Budgets with no attempts left, ordered by task id.
    pub fn exhausted_budgets(&self) -> Vec<RetryBudget> {
        let mut out: Vec<RetryBudget> = self
            .budgets()
            .values()
            .filter(|b| b.exhausted)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    pub fn global_circuit_state(&self) -> CircuitBreakerState {
        self.breaker.snapshot()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Clear every budget and close the breaker.
    pub fn reset(&self) {
        self.budgets().clear();
        self.breaker.reset();
    }
}
