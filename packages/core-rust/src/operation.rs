//! Deferred operation records and their lifecycle state machine.
//!
//! An [`Operation`] tracks one asynchronous call from creation to a terminal
//! status. Status changes go through [`Operation::transition_to`], which
//! consults the explicit [`TRANSITIONS`] table. Once terminal, a record is
//! read-only: every mutator returns [`OperationError::Terminal`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorInfo;

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a deferred operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    /// Finished with side effects applied but no result payload.
    Processed,
    Cancelled,
    Expired,
}

/// Allowed transitions, one row per source status.
///
/// Terminal statuses have empty rows. A status never appears in its own row.
pub const TRANSITIONS: &[(OperationStatus, &[OperationStatus])] = &[
    (
        OperationStatus::Queued,
        &[
            OperationStatus::Processing,
            OperationStatus::Cancelled,
            OperationStatus::Expired,
        ],
    ),
    (
        OperationStatus::Processing,
        &[
            OperationStatus::Completed,
            OperationStatus::Failed,
            OperationStatus::Cancelled,
            OperationStatus::Expired,
            OperationStatus::Processed,
        ],
    ),
    (OperationStatus::Completed, &[]),
    (OperationStatus::Failed, &[]),
    (OperationStatus::Processed, &[]),
    (OperationStatus::Cancelled, &[]),
    (OperationStatus::Expired, &[]),
];

impl OperationStatus {
    pub const ALL: [OperationStatus; 7] = [
        OperationStatus::Queued,
        OperationStatus::Processing,
        OperationStatus::Completed,
        OperationStatus::Failed,
        OperationStatus::Processed,
        OperationStatus::Cancelled,
        OperationStatus::Expired,
    ];

    /// Statuses reachable from `self` in one step.
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [OperationStatus] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, to)| *to)
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Processed => "processed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OperationError::UnknownStatus(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Failures raised by the operation state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("operation {id} is in terminal status {status} and cannot change")]
    Terminal { id: String, status: OperationStatus },
    #[error("malformed operation id `{0}`")]
    MalformedId(String),
    #[error("unknown operation status `{0}`")]
    UnknownStatus(String),
}

// ---------------------------------------------------------------------------
// OperationId
// ---------------------------------------------------------------------------

static OPERATION_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^op_[0-9a-f]{24}$").expect("operation id pattern is valid"));

/// Operation identifier: `op_` followed by 24 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId(String);

impl OperationId {
    /// Generates a fresh id from 12 random bytes.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 12] = rand::random();
        Self(format!("op_{}", hex::encode(bytes)))
    }

    /// Validates and wraps an id string.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::MalformedId`] if `raw` does not match
    /// `^op_[0-9a-f]{24}$`.
    pub fn parse(raw: &str) -> Result<Self, OperationError> {
        if OPERATION_ID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(OperationError::MalformedId(raw.to_string()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OperationId {
    type Error = OperationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OperationId> for String {
    fn from(id: OperationId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Handle returned to the caller when an async call is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    pub operation_id: OperationId,
    pub status: OperationStatus,
}

/// Durable record of one deferred call.
///
/// Fields are public for reading and persistence mapping; mutation should go
/// through the methods so that terminal records stay frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub function: String,
    pub version: String,
    pub status: OperationStatus,
    /// Completion ratio in `0.0..=1.0`, stored with four decimal places.
    pub progress: f64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<ErrorInfo>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Creates a queued operation with a fresh id.
    #[must_use]
    pub fn new(
        function: impl Into<String>,
        version: impl Into<String>,
        caller_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            function: function.into(),
            version: version.into(),
            status: OperationStatus::Queued,
            progress: 0.0,
            result: None,
            errors: None,
            metadata: None,
            caller_id,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the expiry timestamp at creation time.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.expires_at.is_some_and(|at| at <= now)
    }

    #[must_use]
    pub fn handle(&self) -> OperationHandle {
        OperationHandle {
            operation_id: self.id.clone(),
            status: self.status,
        }
    }

    /// Moves the operation to `next`, stamping lifecycle timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::InvalidStatusTransition`] when the table does
    /// not allow `status -> next` (this covers terminal sources and
    /// self-transitions).
    pub fn transition_to(
        &mut self,
        next: OperationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), OperationError> {
        if !self.status.can_transition_to(next) {
            return Err(OperationError::InvalidStatusTransition {
                from: self.status,
                to: next,
            });
        }
        match next {
            OperationStatus::Processing => self.started_at = Some(now),
            OperationStatus::Cancelled => self.cancelled_at = Some(now),
            OperationStatus::Completed
            | OperationStatus::Failed
            | OperationStatus::Processed
            | OperationStatus::Expired => self.completed_at = Some(now),
            OperationStatus::Queued => {}
        }
        if next == OperationStatus::Completed {
            self.progress = 1.0;
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Records the result and moves to `Completed`.
    ///
    /// # Errors
    ///
    /// Fails if the operation is not `Processing`.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> Result<(), OperationError> {
        self.transition_to(OperationStatus::Completed, now)?;
        self.result = Some(result);
        Ok(())
    }

    /// Records errors and moves to `Failed`.
    ///
    /// # Errors
    ///
    /// Fails if the operation is not `Processing`.
    pub fn fail(&mut self, errors: Vec<ErrorInfo>, now: DateTime<Utc>) -> Result<(), OperationError> {
        self.transition_to(OperationStatus::Failed, now)?;
        self.errors = Some(errors);
        Ok(())
    }

    /// Updates progress, clamped to `0.0..=1.0` and rounded to four decimals.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Terminal`] on a terminal operation.
    pub fn set_progress(&mut self, progress: f64, now: DateTime<Utc>) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.progress = normalize_progress(progress);
        self.updated_at = now;
        Ok(())
    }

    /// Inserts one metadata entry.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Terminal`] on a terminal operation.
    pub fn set_metadata(
        &mut self,
        key: impl Into<String>,
        value: Value,
        now: DateTime<Utc>,
    ) -> Result<(), OperationError> {
        self.ensure_mutable()?;
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self.updated_at = now;
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), OperationError> {
        if self.is_terminal() {
            return Err(OperationError::Terminal {
                id: self.id.to_string(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Clamps to `0.0..=1.0` and keeps four decimal places (durable fixed-point).
#[must_use]
pub fn normalize_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        return 0.0;
    }
    (progress.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
