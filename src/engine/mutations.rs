use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_details, validate_span};
use super::{Engine, EngineError, Resolution, WalCommand};

impl Engine {
    /// Check the span against the location's blocking set and, if clear,
    /// record a new pending booking. Check and insert happen under the same
    /// write lock.
    pub async fn try_create(
        &self,
        id: Ulid,
        location_id: Ulid,
        span: Span,
        created_by: Ulid,
        details: BookingDetails,
    ) -> Result<Booking, EngineError> {
        validate_span(&span)?;
        validate_details(&details)?;

        let guard = self.lock_location(location_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many bookings on location"));
        }

        if let Err(e) = check_no_conflict(&guard, &span, None, self.config.conflict_policy) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "operation" => "create")
                .increment(1);
            tracing::debug!(%location_id, %created_by, conflicts = e.conflicts().len(), "booking request conflicts");
            return Err(e);
        }

        // Ids are unique across locations; claim this one while the lock is held.
        match self.booking_to_location.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(location_id);
            }
        }

        let BookingDetails {
            purpose,
            attendees,
            contact,
        } = details;
        let event = Event::BookingRequested {
            id,
            location_id,
            created_by,
            span,
            purpose,
            attendees,
            contact,
            created_at: now_ms(),
        };
        let booking = self.commit(location_id, guard, event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(booking_id = %id, %location_id, %created_by, start = span.start, end = span.end, attendees, "booking requested");
        Ok(booking)
    }

    /// Move a pending booking to approved or rejected. Approval re-checks the
    /// interval against the blocking set minus the booking itself.
    pub async fn transition(
        &self,
        id: Ulid,
        resolution: Resolution,
        actor_id: Ulid,
    ) -> Result<Booking, EngineError> {
        if let Resolution::Reject { reason: Some(reason) } = &resolution
            && reason.len() > MAX_REASON_LEN
        {
            return Err(EngineError::Validation(format!(
                "reason longer than {MAX_REASON_LEN} bytes"
            )));
        }

        let (location_id, guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.get(&id).ok_or(EngineError::NotFound("booking", id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::AlreadyResolved {
                id,
                status: booking.status,
            });
        }
        let span = booking.span;
        let at = now_ms();

        let event = match resolution {
            Resolution::Approve => {
                if let Err(e) = check_no_conflict(&guard, &span, Some(id), self.config.conflict_policy) {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "operation" => "approve")
                        .increment(1);
                    tracing::debug!(booking_id = %id, %location_id, conflicts = e.conflicts().len(), "approval blocked");
                    return Err(e);
                }
                Event::BookingApproved {
                    id,
                    location_id,
                    actor_id,
                    at,
                }
            }
            Resolution::Reject { reason } => Event::BookingRejected {
                id,
                location_id,
                actor_id,
                at,
                reason,
            },
        };
        let booking = self.commit(location_id, guard, event).await?;
        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => booking.status.as_str())
            .increment(1);
        tracing::info!(booking_id = %id, %location_id, %actor_id, status = %booking.status, "booking resolved");
        Ok(booking)
    }

    /// Release an active booking's interval.
    pub async fn cancel(&self, id: Ulid, actor_id: Ulid) -> Result<Booking, EngineError> {
        let (location_id, guard) = self.resolve_booking_write(&id).await?;
        let booking = guard.get(&id).ok_or(EngineError::NotFound("booking", id))?;
        if !booking.is_active() {
            return Err(EngineError::AlreadyResolved {
                id,
                status: booking.status,
            });
        }

        let event = Event::BookingCancelled {
            id,
            location_id,
            actor_id,
            at: now_ms(),
        };
        let booking = self.commit(location_id, guard, event).await?;

        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => "cancelled").increment(1);
        tracing::info!(booking_id = %id, %location_id, %actor_id, "booking cancelled");
        Ok(booking)
    }

    /// Rewrite the WAL as one snapshot event per booking. Returns the number
    /// of events in the compacted log.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
