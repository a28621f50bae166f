use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "paddock_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "paddock_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "paddock_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "paddock_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "paddock_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "paddock_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "paddock_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "paddock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "paddock_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "paddock_wal_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: requests stopped by an existing booking or block. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "paddock_conflicts_total";

pub const RESERVATIONS_CREATED_TOTAL: &str = "paddock_reservations_created_total";

/// Counter. Labels: cause (`user`, `admin`, `user_disabled`).
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "paddock_reservations_cancelled_total";

pub const RESERVATIONS_IMPACTED_TOTAL: &str = "paddock_reservations_impacted_total";

pub const RESERVATIONS_RESTORED_TOTAL: &str = "paddock_reservations_restored_total";

/// Counter: block mutations. Labels: op.
pub const BLOCKS_TOTAL: &str = "paddock_blocks_total";

pub const USERS_DISABLED_TOTAL: &str = "paddock_users_disabled_total";

/// Histogram: reservations cancelled per user disable.
pub const DISABLE_CASCADE_SIZE: &str = "paddock_disable_cascade_size";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notifications handed to the notifier. Labels: kind.
pub const NOTIFICATIONS_DISPATCHED_TOTAL: &str = "paddock_notifications_dispatched_total";

/// Counter: notifications the notifier rejected or the mailer dropped.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "paddock_notifications_failed_total";

/// Counter: notifications delivered by the mailer.
pub const NOTIFICATIONS_SENT_TOTAL: &str = "paddock_notifications_sent_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::InsertUser { .. } => "insert_user",
        Command::SetUserStatus { .. } => "set_user_status",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::InsertBlock { .. } => "insert_block",
        Command::UpdateBlock { .. } => "update_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectUserReservations { .. } => "select_user_reservations",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectAuditLog { .. } => "select_audit_log",
        Command::SelectResources => "select_resources",
        Command::SelectUsers => "select_users",
    }
}
