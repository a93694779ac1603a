use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_slots;
use super::conflict::{find_conflicts, validate_window};
use super::{Engine, EngineError, SharedLocationState};

impl Engine {
    /// Active bookings overlapping `window`, ascending by start.
    /// Unknown location → empty.
    pub async fn list_active(&self, location_id: Ulid, window: &Span) -> Vec<Booking> {
        let Some(rs) = self.get_location(&location_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .overlapping(window)
            .filter(|b| b.is_active())
            .cloned()
            .collect()
    }

    /// Bookings of every status overlapping `window`, ascending by start.
    pub async fn list_bookings(&self, location_id: Ulid, window: &Span) -> Vec<Booking> {
        let Some(rs) = self.get_location(&location_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard
            .overlapping(window)
            .take(MAX_RESULT_ROWS)
            .cloned()
            .collect()
    }

    /// Read-only conflict check plus the free gaps inside `span`.
    pub async fn check_availability(
        &self,
        location_id: Ulid,
        span: &Span,
    ) -> Result<AvailabilityResult, EngineError> {
        validate_window(span)?;
        let conflicting_bookings = match self.get_location(&location_id) {
            Some(rs) => {
                let guard = rs.read().await;
                find_conflicts(&guard, span, None, self.config.conflict_policy)
            }
            None => Vec::new(),
        };
        let blocking: Vec<Span> = conflicting_bookings.iter().map(|c| c.span).collect();
        Ok(AvailabilityResult {
            location_id,
            is_available: conflicting_bookings.is_empty(),
            available_slots: free_slots(&blocking, span),
            conflicting_bookings,
        })
    }

    /// Free gaps of `window` not held by a blocking booking.
    pub async fn free_in_window(&self, location_id: Ulid, window: &Span) -> Result<Vec<Span>, EngineError> {
        Ok(self.check_availability(location_id, window).await?.available_slots)
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let location_id = self.get_location_for_booking(id)?;
        let rs = self.get_location(&location_id)?;
        let guard = rs.read().await;
        guard.get(id).cloned()
    }

    /// Bookings in `status` across all locations. Pending ones come in the
    /// order an admin works through them, ascending by start; settled ones
    /// newest decision first.
    pub async fn list_by_status(&self, status: BookingStatus) -> Vec<Booking> {
        let mut bookings = self.collect_matching(|b| b.status == status).await;
        match status {
            BookingStatus::Pending => bookings.sort_by_key(|b| (b.span.start, b.id)),
            BookingStatus::Approved | BookingStatus::Rejected => {
                bookings.sort_by(|a, b| b.resolved_at.cmp(&a.resolved_at).then(b.id.cmp(&a.id)))
            }
            BookingStatus::Cancelled => {
                bookings.sort_by(|a, b| b.cancelled_at.cmp(&a.cancelled_at).then(b.id.cmp(&a.id)))
            }
        }
        bookings.truncate(MAX_RESULT_ROWS);
        bookings
    }

    /// Bookings created by `user_id`, newest request first.
    pub async fn list_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        let mut bookings = self.collect_matching(|b| b.created_by == user_id).await;
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        bookings.truncate(MAX_RESULT_ROWS);
        bookings
    }

    async fn collect_matching(&self, pred: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        // Clone the Arcs first so no DashMap shard guard is held across an await.
        let locations: Vec<SharedLocationState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in locations {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| pred(b)).cloned());
        }
        out
    }
}
