use ulid::Ulid;

use crate::model::*;

use super::{ConflictPolicy, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::Validation(format!(
            "start ({}) must be before end ({})",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_window(window: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if window.start >= window.end {
        return Err(EngineError::Validation(format!(
            "window start ({}) must be before end ({})",
            window.start, window.end
        )));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_text(field: &str, text: &str, max: usize) -> Result<(), EngineError> {
    if text.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} must not be blank")));
    }
    if text.len() > max {
        return Err(EngineError::Validation(format!(
            "{field} longer than {max} bytes"
        )));
    }
    Ok(())
}

pub(crate) fn validate_details(details: &BookingDetails) -> Result<(), EngineError> {
    use crate::limits::*;
    validate_text("purpose", &details.purpose, MAX_PURPOSE_LEN)?;
    if details.attendees == 0 {
        return Err(EngineError::Validation("attendees must be at least 1".into()));
    }
    if let Some(contact) = &details.contact {
        validate_text("contact", contact, MAX_CONTACT_LEN)?;
    }
    Ok(())
}

impl ConflictPolicy {
    /// Whether a booking in `status` takes part in conflict checks.
    pub fn blocks(self, status: BookingStatus) -> bool {
        match self {
            ConflictPolicy::PendingBlocks => status.is_active(),
            ConflictPolicy::ApprovedOnly => status == BookingStatus::Approved,
        }
    }
}

/// Blocking bookings overlapping `span`, ascending by start. `exclude` skips
/// the booking being re-checked on approval.
pub(crate) fn find_conflicts(
    ls: &LocationState,
    span: &Span,
    exclude: Option<Ulid>,
    policy: ConflictPolicy,
) -> Vec<ConflictingBooking> {
    ls.overlapping(span)
        .filter(|b| Some(b.id) != exclude && policy.blocks(b.status))
        .map(Booking::as_conflict)
        .collect()
}

pub(crate) fn check_no_conflict(
    ls: &LocationState,
    span: &Span,
    exclude: Option<Ulid>,
    policy: ConflictPolicy,
) -> Result<(), EngineError> {
    let conflicts = find_conflicts(ls, span, exclude, policy);
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict(conflicts))
    }
}
