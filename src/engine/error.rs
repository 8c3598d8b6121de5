use ulid::Ulid;

use super::availability::AvailabilityDetails;

#[derive(Debug)]
pub enum EngineError {
    /// Resource, event, allocation, or attendance absent (or out of scope).
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Insufficient quantity, concurrency cap exceeded, malformed window,
    /// or a kind-specific rule broken. Carries the capacity arithmetic when
    /// the rejection came out of an availability check, so callers can
    /// explain "why" without a second round trip.
    ValidationFailed {
        reason: String,
        details: Option<AvailabilityDetails>,
    },
    /// The per-resource write lock could not be acquired within its bounded
    /// budget. Retryable.
    Contended(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        EngineError::ValidationFailed {
            reason: reason.into(),
            details: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Contended(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::ValidationFailed { reason, details } => match details {
                Some(d) => write!(
                    f,
                    "validation failed: {reason} (allocated {}, remaining {} of {})",
                    d.allocated_quantity, d.remaining_quantity, d.total_quantity
                ),
                None => write!(f, "validation failed: {reason}"),
            },
            EngineError::Contended(id) => {
                write!(f, "resource {id} is contended, retry the operation")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
