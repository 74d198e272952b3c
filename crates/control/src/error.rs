//! Control plane error types.
//!
//! Only genuine caller mistakes and abandoned waits are errors. Full queues,
//! open circuits and exhausted budgets are reported as plain values.

use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid session transition: {from} -> {to}")]
    InvalidStateTransition { from: SessionState, to: SessionState },

    #[error("session ttl must be positive")]
    InvalidTtl,

    #[error("slot acquire for agent '{agent_id}' timed out after {timeout_ms}ms")]
    AcquireTimeout { agent_id: String, timeout_ms: u64 },

    #[error("slot acquire for agent '{agent_id}' was cancelled")]
    AcquireCancelled { agent_id: String },

    #[error(transparent)]
    Core(#[from] warden_core::WardenError),
}
