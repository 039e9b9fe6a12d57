//! Domain errors for the Grace control plane.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors that can occur in the control plane.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Incident not found: {0}")]
    IncidentNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Playbook not found: {0}")]
    PlaybookNotFound(String),

    #[error("Kernel not found for intent: {0}")]
    NoKernelForIntent(String),

    #[error("Kernel not registered: {0}")]
    KernelNotRegistered(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Event payload missing required field '{field}' for {event_type}")]
    PayloadSchemaViolation { event_type: String, field: String },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Governance denied: {0}")]
    GovernanceDenied(String),

    #[error("Audit chain broken at line {line}: {detail}")]
    AuditChainBroken { line: usize, detail: String },

    #[error("Incident log schema mismatch: {0}")]
    IncidentSchemaBroken(String),

    #[error("HTM task journal inconsistent: {0}")]
    HtmInconsistency(String),

    #[error("Boot phase {phase} failed: {reason}")]
    BootPhaseFailed { phase: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

/// Error taxonomy for worker results.
///
/// Workers never panic across the bus; every failure becomes a value with an
/// explicit retryability flag that the HTM scheduler consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// I/O timeout or deadline exceeded.
    Timeout,
    /// Ephemeral unavailability of a collaborator.
    Unavailable,
    /// Bus backpressure prevented progress.
    Backpressure,
    /// A declared precondition did not hold.
    PreconditionViolation,
    /// Governance denied the action.
    GovernanceDeny,
    /// Audit or incident log integrity violation.
    IntegrityViolation,
    /// The task was cancelled externally.
    Cancelled,
    /// Unclassified internal failure.
    Internal,
}

impl WorkerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Backpressure => "backpressure",
            Self::PreconditionViolation => "precondition_violation",
            Self::GovernanceDeny => "governance_deny",
            Self::IntegrityViolation => "integrity_violation",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// A structured worker failure: `Err(kind, retryable, message)`.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{kind:?}: {message}")]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl WorkerError {
    /// A transient failure eligible for retry.
    pub fn transient(kind: WorkerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: true,
            message: message.into(),
        }
    }

    /// A fatal failure that must not be retried.
    pub fn fatal(kind: WorkerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient(WorkerErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self {
        Self::fatal(WorkerErrorKind::Cancelled, "task cancelled")
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_error_retryability() {
        let transient = WorkerError::timeout("read timed out");
        assert!(transient.retryable);
        assert_eq!(transient.kind, WorkerErrorKind::Timeout);

        let fatal = WorkerError::fatal(WorkerErrorKind::GovernanceDeny, "denied");
        assert!(!fatal.retryable);
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(!WorkerError::cancelled().retryable);
    }

    #[test]
    fn test_worker_error_serializes() {
        let err = WorkerError::transient(WorkerErrorKind::Unavailable, "bus down");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("unavailable"));
        let back: WorkerError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, WorkerErrorKind::Unavailable);
    }
}
