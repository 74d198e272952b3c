pub mod backpressure;
pub mod breaker;
pub mod dlq;
pub mod error;
pub mod gate;
pub mod monitor;
pub mod plane;
pub mod recorder;
pub mod retry;
pub mod session;

pub use backpressure::{AdmissionAdvice, BackpressureController};
pub use breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use dlq::{
    DeadLetterQueue, DlqEntry, DlqQuery, DlqReason, DlqStats, DlqStatus, NewDlqEntry,
};
pub use error::ControlError;
pub use gate::{ConcurrencyGate, GateStats};
pub use monitor::{spawn_monitor, MetricsSource, MonitorHandle};
pub use plane::{ControlPlane, ControlPlaneStats, FailedTask, FailureOutcome};
pub use recorder::{LoadRecorder, RingBuffer};
pub use retry::{RetryAttempt, RetryBudget, RetryBudgetManager, RetryDecision};
pub use session::{
    create_tenant_session, extend_session, is_session_expired, is_valid_transition,
    transition_session, SessionState, TenantSession,
};
