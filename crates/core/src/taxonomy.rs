//! Closed classification of task failure causes.
//!
//! The taxonomy decides retry eligibility: the retry budget manager only
//! grants another attempt to failures whose category is in the configured
//! retryable set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Why a task attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorTaxonomy {
    /// Output did not match the expected schema. Usually fixed by another attempt.
    SchemaViolation,
    /// A tool invocation failed transiently.
    ToolFailure,
    /// The attempt ran out of time.
    Timeout,
    /// An internal invariant was broken. Retrying cannot help.
    InvariantViolation,
    /// The task was refused by a policy (permissions, guardrails).
    PolicyViolation,
}

impl ErrorTaxonomy {
    /// Every variant, in declaration order.
    pub const ALL: [ErrorTaxonomy; 5] = [
        Self::SchemaViolation,
        Self::ToolFailure,
        Self::Timeout,
        Self::InvariantViolation,
        Self::PolicyViolation,
    ];

    /// Categories retried out of the box.
    pub const DEFAULT_RETRYABLE: [ErrorTaxonomy; 3] =
        [Self::SchemaViolation, Self::ToolFailure, Self::Timeout];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaViolation => "SCHEMA_VIOLATION",
            Self::ToolFailure => "TOOL_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::PolicyViolation => "POLICY_VIOLATION",
        }
    }

    /// Categories that may never be made retryable through configuration.
    pub fn is_never_retryable(self) -> bool {
        matches!(self, Self::InvariantViolation)
    }
}

impl fmt::Display for ErrorTaxonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorTaxonomy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown error taxonomy '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_names_case_insensitively() {
        assert_eq!("TOOL_FAILURE".parse(), Ok(ErrorTaxonomy::ToolFailure));
        assert_eq!("schema-violation".parse(), Ok(ErrorTaxonomy::SchemaViolation));
        assert!("BOGUS".parse::<ErrorTaxonomy>().is_err());
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorTaxonomy::InvariantViolation).unwrap();
        assert_eq!(json, "\"INVARIANT_VIOLATION\"");
    }

    #[test]
    fn invariant_violation_is_never_retryable() {
        assert!(ErrorTaxonomy::InvariantViolation.is_never_retryable());
        assert!(!ErrorTaxonomy::DEFAULT_RETRYABLE
            .contains(&ErrorTaxonomy::InvariantViolation));
    }
}
