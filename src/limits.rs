use crate::model::{DAY_MS, Ms};

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Longest single booking.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;
/// Widest availability or listing window.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

pub const MAX_PURPOSE_LEN: usize = 500;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_CONTACT_LEN: usize = 200;

pub const MAX_BOOKINGS_PER_LOCATION: usize = 100_000;
pub const MAX_RESULT_ROWS: usize = 10_000;
