use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

/// Counter: bookings reserved.
pub const RESERVATIONS_TOTAL: &str = "parkd_reservations_total";

/// Counter: reserve attempts lost to capacity conflicts.
pub const CONFLICTS_TOTAL: &str = "parkd_conflicts_total";

/// Counter: gate codes validated successfully.
pub const ENTRIES_VALIDATED_TOTAL: &str = "parkd_entries_validated_total";

/// Counter: pending bookings cancelled by the payment-deadline sweep.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "parkd_bookings_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "parkd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSpot { .. } => "insert_spot",
        Command::UpdateSpot { .. } => "update_spot",
        Command::DeactivateSpot { .. } => "deactivate_spot",
        Command::InsertBlock { .. } => "insert_block",
        Command::UpdateBlock { .. } => "update_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetPaymentStatus { .. } => "set_payment_status",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectSpots => "select_spots",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectEntry { .. } => "select_entry",
    }
}
