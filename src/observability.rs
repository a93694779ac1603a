use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomd_query_duration_seconds";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: bookings recorded as pending.
pub const BOOKINGS_CREATED_TOTAL: &str = "roomd_bookings_created_total";

/// Counter: requests or approvals refused by an overlap. Labels: operation.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roomd_booking_conflicts_total";

/// Counter: status changes after creation. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "roomd_booking_transitions_total";

/// Counter: operations refused by the permission policy. Labels: operation.
pub const PERMISSION_DENIALS_TOTAL: &str = "roomd_permission_denials_total";

/// Counter: location lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "roomd_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roomd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::ApproveBooking { .. } => "approve_booking",
        Command::RejectBooking { .. } => "reject_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookingsByStatus { .. } => "select_bookings_by_status",
        Command::SelectUserBookings { .. } => "select_user_bookings",
        Command::SelectDaySlots { .. } => "select_day_slots",
        Command::SelectResourceTypes { .. } => "select_resource_types",
    }
}
