use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::broadcast;
use ulid::Ulid;

use crate::catalog::{LocationCatalog, RoleDirectory};
use crate::engine::{Engine, EngineError, Resolution, now_ms, validate_details, validate_span, validate_window};
use crate::model::*;
use crate::observability;
use crate::policy::{BookingPolicy, ResourceType};

/// Daily opening window, as offsets from UTC midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub open: Ms,
    pub close: Ms,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open: 8 * HOUR_MS,
            close: 18 * HOUR_MS,
        }
    }
}

impl BusinessHours {
    /// The opening window of the UTC day containing `t`.
    pub fn window(&self, t: Ms) -> Span {
        let day = day_window(t);
        Span::new(day.start + self.open, day.start + self.close)
    }
}

impl fmt::Display for BusinessHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hm = |ms: Ms| (ms / HOUR_MS, (ms % HOUR_MS) / 60_000);
        let (oh, om) = hm(self.open);
        let (ch, cm) = hm(self.close);
        write!(f, "{oh:02}:{om:02}-{ch:02}:{cm:02}")
    }
}

/// Parses `HH[:MM]-HH[:MM]`, e.g. `08:00-18:00` or `9-17`. `24:00` closes at midnight.
impl FromStr for BusinessHours {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn offset(part: &str) -> Option<Ms> {
            let (h, m) = part.trim().split_once(':').unwrap_or((part.trim(), "0"));
            let h: Ms = h.parse().ok()?;
            let m: Ms = m.parse().ok()?;
            ((0..=24).contains(&h) && (0..60).contains(&m) && (h < 24 || m == 0))
                .then_some(h * HOUR_MS + m * 60_000)
        }
        let bad = || format!("invalid business hours: {s} (expected HH:MM-HH:MM)");
        let (open, close) = s.split_once('-').ok_or_else(bad)?;
        let open = offset(open).ok_or_else(bad)?;
        let close = offset(close).ok_or_else(bad)?;
        if open >= close {
            return Err(bad());
        }
        Ok(Self { open, close })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    /// Accept requests whose start lies in the past, and cancellations of
    /// bookings that have already started.
    pub allow_past_bookings: bool,
    pub business_hours: BusinessHours,
}

/// A user asking for a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub location_id: Ulid,
    pub user_id: Ulid,
    pub starts_at: Ms,
    pub ends_at: Ms,
    pub purpose: String,
    pub attendees: u32,
    pub contact: Option<String>,
}

impl BookingRequest {
    pub fn new(location_id: Ulid, user_id: Ulid, starts_at: Ms, ends_at: Ms, purpose: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            location_id,
            user_id,
            starts_at,
            ends_at,
            purpose: purpose.into(),
            attendees: DEFAULT_ATTENDEES,
            contact: None,
        }
    }

    pub fn with_attendees(mut self, attendees: u32) -> Self {
        self.attendees = attendees;
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }
}

/// Entry point for callers: validation, permissions and the approval state
/// machine on top of the booking store.
pub struct BookingService {
    engine: Arc<Engine>,
    catalog: Arc<dyn LocationCatalog>,
    directory: Arc<dyn RoleDirectory>,
    policy: Arc<dyn BookingPolicy>,
    settings: ServiceSettings,
}

fn span_of(starts_at: Ms, ends_at: Ms) -> Result<Span, EngineError> {
    Span::try_new(starts_at, ends_at).ok_or_else(|| {
        EngineError::Validation(format!("start ({starts_at}) must be before end ({ends_at})"))
    })
}

impl BookingService {
    pub fn new(
        engine: Arc<Engine>,
        catalog: Arc<dyn LocationCatalog>,
        directory: Arc<dyn RoleDirectory>,
        policy: Arc<dyn BookingPolicy>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            engine,
            catalog,
            directory,
            policy,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    fn location(&self, id: Ulid) -> Result<Location, EngineError> {
        self.catalog
            .get_location(&id)
            .ok_or(EngineError::NotFound("location", id))
    }

    fn deny(&self, operation: &'static str, user_id: Ulid, reason: String) -> EngineError {
        metrics::counter!(observability::PERMISSION_DENIALS_TOTAL, "operation" => operation).increment(1);
        tracing::debug!(%user_id, operation, %reason, "permission denied");
        EngineError::Forbidden(reason)
    }

    fn authorize_resolver(&self, operation: &'static str, admin_id: Ulid) -> Result<(), EngineError> {
        let role = self.directory.role(&admin_id);
        if self.policy.can_resolve(role) {
            Ok(())
        } else {
            Err(self.deny(operation, admin_id, format!("role {role} may not {operation} bookings")))
        }
    }

    // ── Commands ─────────────────────────────────────────────

    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let span = span_of(request.starts_at, request.ends_at)?;
        validate_span(&span)?;
        let details = BookingDetails {
            purpose: request.purpose.trim().to_string(),
            attendees: request.attendees,
            contact: request
                .contact
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        };
        validate_details(&details)?;
        if !self.settings.allow_past_bookings && span.start < now_ms() {
            return Err(EngineError::Validation("start is in the past".into()));
        }

        let location = self.location(request.location_id)?;
        let role = self.directory.role(&request.user_id);
        if !self.policy.can_book(role, location.resource_type) {
            return Err(self.deny(
                "create",
                request.user_id,
                format!("role {role} may not book {} locations", location.resource_type),
            ));
        }

        if let Some(capacity) = location.capacity
            && details.attendees > capacity
        {
            return Err(EngineError::Validation(format!(
                "{} attendees exceed the capacity of {} ({capacity})",
                details.attendees, location.name
            )));
        }

        self.engine
            .try_create(request.id, location.id, span, request.user_id, details)
            .await
    }

    pub async fn approve_booking(&self, booking_id: Ulid, admin_id: Ulid) -> Result<Booking, EngineError> {
        self.authorize_resolver("approve", admin_id)?;
        self.engine
            .transition(booking_id, Resolution::Approve, admin_id)
            .await
    }

    pub async fn reject_booking(
        &self,
        booking_id: Ulid,
        admin_id: Ulid,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.authorize_resolver("reject", admin_id)?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        self.engine
            .transition(booking_id, Resolution::Reject { reason }, admin_id)
            .await
    }

    /// The creator or an admin may cancel a pending or approved booking
    /// that has not started yet.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.get_booking(booking_id).await?;
        if booking.created_by != actor_id {
            let role = self.directory.role(&actor_id);
            if !self.policy.can_resolve(role) {
                return Err(self.deny(
                    "cancel",
                    actor_id,
                    format!("only the creator or an admin may cancel booking {booking_id}"),
                ));
            }
        }
        if booking.is_active() && !self.settings.allow_past_bookings && booking.span.start <= now_ms() {
            return Err(EngineError::Validation(format!(
                "booking {booking_id} has already started"
            )));
        }
        self.engine.cancel(booking_id, actor_id).await
    }

    // ── Reads ────────────────────────────────────────────────

    pub async fn check_availability(
        &self,
        location_id: Ulid,
        starts_at: Ms,
        ends_at: Ms,
    ) -> Result<AvailabilityResult, EngineError> {
        let span = span_of(starts_at, ends_at)?;
        self.location(location_id)?;
        self.engine.check_availability(location_id, &span).await
    }

    /// Bookings of every status overlapping the window, ascending by start.
    pub async fn list_bookings_for_location(
        &self,
        location_id: Ulid,
        starts_at: Ms,
        ends_at: Ms,
    ) -> Result<Vec<Booking>, EngineError> {
        let window = span_of(starts_at, ends_at)?;
        validate_window(&window)?;
        self.location(location_id)?;
        Ok(self.engine.list_bookings(location_id, &window).await)
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.engine
            .get_booking(&booking_id)
            .await
            .ok_or(EngineError::NotFound("booking", booking_id))
    }

    /// Admin views of pending, approved, rejected or cancelled bookings.
    pub async fn bookings_by_status(&self, status: BookingStatus) -> Vec<Booking> {
        self.engine.list_by_status(status).await
    }

    pub async fn bookings_for_user(&self, user_id: Ulid) -> Vec<Booking> {
        self.engine.list_for_user(user_id).await
    }

    /// Stream of applied events for one location: requests, approvals,
    /// rejections and cancellations. A notification service embedding roomd
    /// subscribes here; lagging receivers lose the oldest events.
    pub fn watch_location(&self, location_id: Ulid) -> Result<broadcast::Receiver<Event>, EngineError> {
        self.location(location_id)?;
        Ok(self.engine.notify.subscribe(location_id))
    }

    pub fn available_resource_types(&self, user_id: Ulid) -> BTreeSet<ResourceType> {
        self.policy
            .available_resource_types(self.directory.role(&user_id))
    }

    /// Free time within business hours on the UTC day containing `day`.
    pub async fn day_slots(&self, location_id: Ulid, day: Ms) -> Result<Vec<Span>, EngineError> {
        self.location(location_id)?;
        let window = self.settings.business_hours.window(day);
        self.engine.free_in_window(location_id, &window).await
    }

    pub async fn day_overview(&self, location_id: Ulid, day: Ms) -> Result<DayOverview, EngineError> {
        let location = self.location(location_id)?;
        let day_span = day_window(day);
        let bookings = self.engine.list_active(location_id, &day_span).await;
        let window = self.settings.business_hours.window(day);
        let available_slots = self.engine.free_in_window(location_id, &window).await?;
        Ok(DayOverview {
            location,
            day: day_span,
            bookings,
            available_slots,
        })
    }
}
