use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tabletime_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tabletime_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tabletime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tabletime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tabletime_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tabletime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tabletime_wal_flush_batch_size";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "tabletime_bookings_created_total";

/// Counter: booking attempts refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "tabletime_bookings_rejected_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "tabletime_bookings_cancelled_total";

/// Counter: lock re-acquisitions after the contention set changed.
pub const TXN_RETRIES_TOTAL: &str = "tabletime_txn_retries_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertCampaign { .. } => "insert_campaign",
        Command::InsertCampaignRoom { .. } => "insert_campaign_room",
        Command::InsertFacilitator { .. } => "insert_facilitator",
        Command::InsertCampaignFacilitator { .. } => "insert_campaign_facilitator",
        Command::InsertUser { .. } => "insert_user",
        Command::DeleteCampaign { .. } => "delete_campaign",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectAvailableTimes { .. } => "select_available_times",
        Command::SelectUserBookings { .. } => "select_user_bookings",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectCampaigns => "select_campaigns",
        Command::SelectRooms => "select_rooms",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
