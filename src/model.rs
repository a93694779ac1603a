use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::policy::ResourceType;

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Half-open overlap test on raw bounds: `[a_start, a_end)` vs `[b_start, b_end)`.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Intersection with `window`, if non-empty.
    pub fn clip(&self, window: &Span) -> Option<Span> {
        Span::try_new(self.start.max(window.start), self.end.min(window.end))
    }
}

/// The UTC day `[00:00, 24:00)` containing `t`.
pub fn day_window(t: Ms) -> Span {
    let start = t.div_euclid(DAY_MS) * DAY_MS;
    Span::new(start, start + DAY_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    /// Pending and approved bookings hold their interval.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "approved" => Ok(BookingStatus::Approved),
            "rejected" => Ok(BookingStatus::Rejected),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// A reservation of one location for one interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub location_id: Ulid,
    pub created_by: Ulid,
    pub span: Span,
    pub purpose: String,
    /// Expected head count.
    pub attendees: u32,
    pub contact: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    /// Admin who approved or rejected the booking.
    pub resolved_by: Option<Ulid>,
    pub resolved_at: Option<Ms>,
    pub rejection_reason: Option<String>,
    pub cancelled_by: Option<Ulid>,
    pub cancelled_at: Option<Ms>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn as_conflict(&self) -> ConflictingBooking {
        ConflictingBooking {
            id: self.id,
            span: self.span,
            status: self.status,
            purpose: self.purpose.clone(),
        }
    }
}

/// What a caller sees about a booking that blocks its request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingBooking {
    pub id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub purpose: String,
}

impl fmt::Display for ConflictingBooking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}, {}) {} \"{}\"",
            self.id, self.span.start, self.span.end, self.status, self.purpose
        )
    }
}

/// A bookable unit from the location catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub capacity: Option<u32>,
    pub block_id: Ulid,
    pub floor_id: Ulid,
    pub building_id: Ulid,
}

/// All bookings of one location, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct LocationState {
    pub id: Ulid,
    pub bookings: Vec<Booking>,
}

impl LocationState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings of any status whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.is_active()).count()
    }
}

/// Head count assumed when a request does not state one.
pub const DEFAULT_ATTENDEES: u32 = 1;

/// What the requester states about a booking besides place and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    pub purpose: String,
    pub attendees: u32,
    pub contact: Option<String>,
}

impl BookingDetails {
    /// A single attendee and no contact.
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
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

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingRequested {
        id: Ulid,
        location_id: Ulid,
        created_by: Ulid,
        span: Span,
        purpose: String,
        attendees: u32,
        contact: Option<String>,
        created_at: Ms,
    },
    BookingApproved {
        id: Ulid,
        location_id: Ulid,
        actor_id: Ulid,
        at: Ms,
    },
    BookingRejected {
        id: Ulid,
        location_id: Ulid,
        actor_id: Ulid,
        at: Ms,
        reason: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        location_id: Ulid,
        actor_id: Ulid,
        at: Ms,
    },
    /// Full record, written by compaction in place of its history.
    BookingRestored { booking: Booking },
}

impl Event {
    pub fn location_id(&self) -> Ulid {
        match self {
            Event::BookingRequested { location_id, .. }
            | Event::BookingApproved { location_id, .. }
            | Event::BookingRejected { location_id, .. }
            | Event::BookingCancelled { location_id, .. } => *location_id,
            Event::BookingRestored { booking } => booking.location_id,
        }
    }

    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::BookingRequested { id, .. }
            | Event::BookingApproved { id, .. }
            | Event::BookingRejected { id, .. }
            | Event::BookingCancelled { id, .. } => *id,
            Event::BookingRestored { booking } => booking.id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityResult {
    pub location_id: Ulid,
    pub is_available: bool,
    pub conflicting_bookings: Vec<ConflictingBooking>,
    pub available_slots: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayOverview {
    pub location: Location,
    pub day: Span,
    pub bookings: Vec<Booking>,
    pub available_slots: Vec<Span>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            location_id: Ulid::nil(),
            created_by: Ulid::nil(),
            span: Span::new(start, end),
            purpose: "test".into(),
            attendees: 1,
            contact: None,
            status,
            created_at: 0,
            resolved_by: None,
            resolved_at: None,
            rejection_reason: None,
            cancelled_by: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn try_new_rejects_degenerate() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn overlap_is_symmetric() {
        let cases = [(0, 10, 5, 15), (0, 10, 10, 20), (0, 10, 2, 3), (5, 6, 0, 5)];
        for (a, b, c, d) in cases {
            assert_eq!(overlaps(a, b, c, d), overlaps(c, d, a, b));
        }
    }

    #[test]
    fn overlap_half_open_boundary() {
        let nine = 9 * HOUR_MS;
        let ten = 10 * HOUR_MS;
        // [9:00, 10:00) vs a booking starting at 10:00
        assert!(!overlaps(nine, ten, ten, ten + HOUR_MS));
        // vs a booking starting at 9:59
        let nine_59 = ten - 60_000;
        assert!(overlaps(nine, ten, nine_59, nine_59 + HOUR_MS));
    }

    #[test]
    fn clip_to_window() {
        let w = Span::new(100, 200);
        assert_eq!(Span::new(50, 150).clip(&w), Some(Span::new(100, 150)));
        assert_eq!(Span::new(150, 250).clip(&w), Some(Span::new(150, 200)));
        assert_eq!(Span::new(200, 300).clip(&w), None);
    }

    #[test]
    fn day_window_aligns_to_midnight() {
        let d = 4_102_444_800_000; // 2100-01-01T00:00Z
        assert_eq!(day_window(d), Span::new(d, d + DAY_MS));
        assert_eq!(day_window(d + 13 * HOUR_MS), Span::new(d, d + DAY_MS));
        assert_eq!(day_window(d + DAY_MS - 1), Span::new(d, d + DAY_MS));
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Approved.is_active());
        assert!(!BookingStatus::Rejected.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
    }

    #[test]
    fn status_parse() {
        assert_eq!("PENDING".parse::<BookingStatus>(), Ok(BookingStatus::Pending));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("maybe".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut ls = LocationState::new(Ulid::new());
        ls.insert_booking(booking(300, 400, BookingStatus::Pending));
        ls.insert_booking(booking(100, 200, BookingStatus::Approved));
        ls.insert_booking(booking(200, 300, BookingStatus::Rejected));
        let starts: Vec<_> = ls.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ls = LocationState::new(Ulid::new());
        ls.insert_booking(booking(100, 200, BookingStatus::Pending));
        ls.insert_booking(booking(450, 600, BookingStatus::Pending));
        ls.insert_booking(booking(1000, 1100, BookingStatus::Pending));

        let hits: Vec<_> = ls.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ls = LocationState::new(Ulid::new());
        ls.insert_booking(booking(100, 200, BookingStatus::Approved));
        assert_eq!(ls.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(ls.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_long_booking_spanning_query() {
        let mut ls = LocationState::new(Ulid::new());
        ls.insert_booking(booking(0, 10_000, BookingStatus::Pending));
        assert_eq!(ls.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn active_count_ignores_inert() {
        let mut ls = LocationState::new(Ulid::new());
        ls.insert_booking(booking(0, 10, BookingStatus::Pending));
        ls.insert_booking(booking(10, 20, BookingStatus::Approved));
        ls.insert_booking(booking(20, 30, BookingStatus::Rejected));
        ls.insert_booking(booking(30, 40, BookingStatus::Cancelled));
        assert_eq!(ls.active_count(), 2);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingRejected {
            id: Ulid::new(),
            location_id: Ulid::new(),
            actor_id: Ulid::new(),
            at: 42,
            reason: Some("exam week".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
