//! Tenant session lifecycle.
//!
//! Sessions are values: every transition returns a new [`TenantSession`] and
//! leaves the receiver untouched. Eviction of expired sessions belongs to
//! whoever stores them.
//!
//! ```text
//! idle ──► active ◄──► processing
//!   │        │             │
//!   │        ▼             ▼
//!   │     expired ◄────────┘
//!   ▼        │
//! suspended ◄┘   (terminal, reachable from every non-terminal state)
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::Clock;

use crate::error::ControlError;

/// Default session lifetime: one hour.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_millis(3_600_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Processing,
    Expired,
    Suspended,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        Self::Idle,
        Self::Active,
        Self::Processing,
        Self::Expired,
        Self::Suspended,
    ];

    /// States reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [SessionState] {
        use SessionState::*;
        match self {
            Idle => &[Active, Suspended],
            Active => &[Processing, Expired, Suspended],
            Processing => &[Active, Expired, Suspended],
            Expired => &[Suspended],
            Suspended => &[],
        }
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Processing => "processing",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure lookup in the transition table.
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    from.can_transition_to(to)
}

/// One tenant's session.
///
/// Invariants: `expires_at > created_at`, and `last_request_at`, when set,
/// lies within `[created_at, expires_at]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSession {
    pub session_id: String,
    pub tenant_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<DateTime<Utc>>,
}

impl TenantSession {
    /// Create an `idle` session expiring `ttl` after `now`.
    ///
    /// A zero TTL, or one that would push `expires_at` past the
    /// representable range, is rejected.
    pub fn new(
        session_id: impl Into<String>,
        tenant_id: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, ControlError> {
        let ttl = to_chrono(ttl);
        if ttl <= chrono::Duration::zero() {
            return Err(ControlError::InvalidTtl);
        }
        let expires_at = now.checked_add_signed(ttl).ok_or(ControlError::InvalidTtl)?;
        Ok(Self {
            session_id: session_id.into(),
            tenant_id: tenant_id.into(),
            state: SessionState::Idle,
            created_at: now,
            expires_at,
            last_request_at: None,
        })
    }

    /// Move to `to`, stamping `last_request_at`.
    ///
    /// Fails without touching `self` when the edge is not in the table.
    pub fn transition(&self, to: SessionState, now: DateTime<Utc>) -> Result<Self, ControlError> {
        if !self.state.can_transition_to(to) {
            return Err(ControlError::InvalidStateTransition {
                from: self.state,
                to,
            });
        }
        let stamped = now.clamp(self.created_at, self.expires_at);
        Ok(Self {
            state: to,
            last_request_at: Some(stamped),
            ..self.clone()
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Push `expires_at` forward by `by`, saturating at the latest
    /// representable instant. The state is left alone.
    pub fn extend(&self, by: Duration) -> Self {
        Self {
            expires_at: self
                .expires_at
                .checked_add_signed(to_chrono(by))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ..self.clone()
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

pub fn create_tenant_session(
    session_id: impl Into<String>,
    tenant_id: impl Into<String>,
    ttl: Duration,
    clock: &dyn Clock,
) -> Result<TenantSession, ControlError> {
    TenantSession::new(session_id, tenant_id, ttl, clock.now())
}

pub fn transition_session(
    session: &TenantSession,
    new_state: SessionState,
    clock: &dyn Clock,
) -> Result<TenantSession, ControlError> {
    session.transition(new_state, clock.now())
}

pub fn is_session_expired(session: &TenantSession, now: DateTime<Utc>) -> bool {
    session.is_expired(now)
}

pub fn extend_session(session: &TenantSession, by: Duration) -> TenantSession {
    session.extend(by)
}
