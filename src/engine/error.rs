use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, ConflictingBooking};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict with {}: {}", plural(.0), list(.0))]
    Conflict(Vec<ConflictingBooking>),
    #[error("{0} not found: {1}")]
    NotFound(&'static str, Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("booking {id} is already {status}")]
    AlreadyResolved { id: Ulid, status: BookingStatus },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("location {0} is busy, retry later")]
    Busy(Ulid),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Infrastructure failures a caller may retry. Everything else is a
    /// modelled outcome that will fail again with the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Busy(_) | EngineError::WalError(_))
    }

    pub fn conflicts(&self) -> &[ConflictingBooking] {
        match self {
            EngineError::Conflict(list) => list,
            _ => &[],
        }
    }
}

fn plural(conflicts: &[ConflictingBooking]) -> String {
    let n = conflicts.len();
    if n == 1 { "1 booking".into() } else { format!("{n} bookings") }
}

fn list(conflicts: &[ConflictingBooking]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;

    #[test]
    fn conflict_message_lists_blockers() {
        let id = Ulid::from_string("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
        let err = EngineError::Conflict(vec![ConflictingBooking {
            id,
            span: Span::new(100, 200),
            status: BookingStatus::Pending,
            purpose: "Lecture".into(),
        }]);
        assert_eq!(
            err.to_string(),
            "conflict with 1 booking: 01ARZ3NDEKTSV4RRFFQ69G5FAV [100, 200) pending \"Lecture\""
        );
        assert_eq!(err.conflicts().len(), 1);
    }

    #[test]
    fn only_infrastructure_errors_are_transient() {
        assert!(EngineError::Busy(Ulid::nil()).is_transient());
        assert!(EngineError::WalError("disk full".into()).is_transient());
        assert!(!EngineError::Conflict(vec![]).is_transient());
        assert!(!EngineError::Validation("x".into()).is_transient());
        assert!(
            !EngineError::AlreadyResolved { id: Ulid::nil(), status: BookingStatus::Approved }
                .is_transient()
        );
    }
}
