use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "allot_queries_total";

/// Histogram: command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "allot_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "allot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "allot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "allot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "allot_tenants_active";

/// Counter: mutations that gave up on a contended resource lock.
pub const LOCK_CONTENTION_TOTAL: &str = "allot_lock_contention_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "allot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "allot_wal_flush_batch_size";

/// Start the Prometheus exporter when a metrics port is configured; without
/// one, metrics stay in-process only.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let listen: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://{listen}/metrics");
}

/// Short per-command label for the RED metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEvent { .. } => "update_event",
        Command::DeleteEvent { .. } => "delete_event",
        Command::InsertAllocation { .. } => "insert_allocation",
        Command::UpdateAllocation { .. } => "update_allocation",
        Command::DeleteAllocation { .. } => "delete_allocation",
        Command::InsertAttendance { .. } => "insert_attendance",
        Command::DeleteAttendance { .. } => "delete_attendance",
        Command::InsertStockEntry { .. } => "insert_stock_entry",
        Command::BookEvent { .. } => "book_event",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectResources => "select_resources",
        Command::SelectEvents => "select_events",
        Command::SelectAllocations { .. } => "select_allocations",
        Command::SelectAttendances { .. } => "select_attendances",
        Command::SelectStockEntries { .. } => "select_stock_entries",
        Command::SelectDoubleBookedUsers => "report_double_booked_users",
        Command::SelectViolatedConstraints => "report_violated_constraints",
        Command::SelectHierarchyViolations => "report_hierarchy_violations",
        Command::SelectUtilization { .. } => "report_resource_utilization",
        Command::SelectExternalAttendees { .. } => "report_external_attendees",
    }
}
