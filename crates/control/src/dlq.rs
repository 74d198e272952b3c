//! Bounded dead-letter queue for work that will not be retried.
//!
//! Entries keep a copy of the attempt history taken at enqueue time, so the
//! queue never points back into the retry manager. At capacity the oldest
//! reviewed entry (`DISCARDED` or `RESOLVED`) is evicted first; when there is
//! none the oldest entry goes regardless of status, which can drop an
//! unreviewed `PENDING` failure.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use warden_core::{Clock, DlqConfig, ErrorTaxonomy};

use crate::retry::RetryAttempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DlqStatus {
    Pending,
    Reviewing,
    Retried,
    Discarded,
    Resolved,
}

impl DlqStatus {
    /// Reviewed entries are evicted before anything else.
    pub fn is_disposable(self) -> bool {
        matches!(self, Self::Discarded | Self::Resolved)
    }
}

impl fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Reviewing => "REVIEWING",
            Self::Retried => "RETRIED",
            Self::Discarded => "DISCARDED",
            Self::Resolved => "RESOLVED",
        })
    }
}

/// Why a task ended up in the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    RetriesExhausted,
    NonRetryable,
    CircuitOpen,
    BudgetExceeded,
    Manual,
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::NonRetryable => "non_retryable",
            Self::CircuitOpen => "circuit_open",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub id: u64,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub error_taxonomy: ErrorTaxonomy,
    pub error_message: String,
    pub attempts: Vec<RetryAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_payload: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    pub status: DlqStatus,
    pub reason: DlqReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`DeadLetterQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDlqEntry {
    pub task_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub error_taxonomy: ErrorTaxonomy,
    pub error_message: String,
    #[serde(default)]
    pub attempts: Vec<RetryAttempt>,
    #[serde(default)]
    pub original_payload: Option<Value>,
    pub reason: DlqReason,
}

/// Filter for [`DeadLetterQueue::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DlqQuery {
    pub status: Option<DlqStatus>,
    pub taxonomy: Option<ErrorTaxonomy>,
    pub reason: Option<DlqReason>,
    pub task_id: Option<String>,
    pub limit: Option<usize>,
}

impl DlqQuery {
    fn matches(&self, entry: &DlqEntry) -> bool {
        self.status.map_or(true, |s| entry.status == s)
            && self.taxonomy.map_or(true, |t| entry.error_taxonomy == t)
            && self.reason.map_or(true, |r| entry.reason == r)
            && self.task_id.as_deref().map_or(true, |id| entry.task_id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqStats {
    pub total: usize,
    pub by_status: BTreeMap<DlqStatus, usize>,
    pub by_taxonomy: BTreeMap<ErrorTaxonomy, usize>,
    pub by_reason: BTreeMap<DlqReason, usize>,
    /// Age of the oldest `PENDING` entry, `None` when nothing is pending.
    pub oldest_pending_age_ms: Option<i64>,
}

struct Inner {
    entries: VecDeque<DlqEntry>,
    next_id: u64,
}

pub struct DeadLetterQueue {
    max_size: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_size: max_size.max(1),
            clock,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    pub fn from_config(config: &DlqConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.max_size, clock)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Store a new `PENDING` entry, evicting one if the queue is full.
    pub fn enqueue(&self, new: NewDlqEntry) -> DlqEntry {
        let now = self.clock.now();
        let mut inner = self.lock();

        while inner.entries.len() >= self.max_size {
            let victim = inner
                .entries
                .iter()
                .position(|e| e.status.is_disposable())
                .unwrap_or(0);
            if let Some(evicted) = inner.entries.remove(victim) {
                if evicted.status.is_disposable() {
                    info!(id = evicted.id, task_id = %evicted.task_id, "evicted reviewed DLQ entry");
                } else {
                    warn!(
                        id = evicted.id,
                        task_id = %evicted.task_id,
                        status = %evicted.status,
                        "DLQ full, evicted unreviewed entry"
                    );
                }
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let entry = DlqEntry {
            id,
            task_id: new.task_id,
            session_id: new.session_id,
            error_taxonomy: new.error_taxonomy,
            error_message: new.error_message,
            attempts: new.attempts,
            original_payload: new.original_payload,
            enqueued_at: now,
            status: DlqStatus::Pending,
            reason: new.reason,
            notes: None,
            updated_at: now,
        };
        info!(
            id,
            task_id = %entry.task_id,
            taxonomy = %entry.error_taxonomy,
            reason = %entry.reason,
            "task dead-lettered"
        );
        inner.entries.push_back(entry.clone());
        entry
    }

    /// Set status (and optionally notes). `None` if no entry has `id`.
    pub fn update_status(&self, id: u64, status: DlqStatus, notes: Option<&str>) -> Option<DlqEntry> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let entry = inner.entries.iter_mut().find(|e| e.id == id)?;
        entry.status = status;
        if let Some(notes) = notes {
            entry.notes = Some(notes.to_string());
        }
        entry.updated_at = now;
        Some(entry.clone())
    }

    pub fn get(&self, id: u64) -> Option<DlqEntry> {
        self.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Matching entries, oldest first.
    pub fn query(&self, query: &DlqQuery) -> Vec<DlqEntry> {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DlqStats {
        let now = self.clock.now();
        let inner = self.lock();
        let mut by_status = BTreeMap::new();
        let mut by_taxonomy = BTreeMap::new();
        let mut by_reason = BTreeMap::new();
        let mut oldest_pending: Option<DateTime<Utc>> = None;

        for e in &inner.entries {
            *by_status.entry(e.status).or_insert(0) += 1;
            *by_taxonomy.entry(e.error_taxonomy).or_insert(0) += 1;
            *by_reason.entry(e.reason).or_insert(0) += 1;
            if e.status == DlqStatus::Pending {
                oldest_pending = Some(oldest_pending.map_or(e.enqueued_at, |t| t.min(e.enqueued_at)));
            }
        }

        DlqStats {
            total: inner.entries.len(),
            by_status,
            by_taxonomy,
            by_reason,
            oldest_pending_age_ms: oldest_pending.map(|t| (now - t).num_milliseconds()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Drop every entry. Ids keep counting up.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}
