use std::net::SocketAddr;
use std::time::Instant;

use crate::config::Config;
use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "lodgebook_operations_total";

/// Histogram: operation latency in seconds, lock wait included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "lodgebook_operation_duration_seconds";

/// Counter: approvals and reschedules rejected by the availability check. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "lodgebook_conflicts_total";

/// Counter: sequence numbers handed out by `counter_next`.
pub const COUNTER_ISSUED_TOTAL: &str = "lodgebook_counter_issued_total";

/// Counter: duty assignments made by the rotation.
pub const ROTATION_ADVANCES_TOTAL: &str = "lodgebook_rotation_advances_total";

/// Counter: completed rotation cycles (reset + reseed).
pub const ROTATION_CYCLES_TOTAL: &str = "lodgebook_rotation_cycles_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "lodgebook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lodgebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (frames per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lodgebook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "lodgebook_wal_compactions_total";

/// Install the fmt tracing subscriber and, when a port is configured, the
/// Prometheus exporter. For hosts that don't bring their own.
pub fn init(config: &Config) {
    let _ = tracing_subscriber::fmt().try_init();

    let Some(port) = config.metrics_port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::warn!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Record the outcome and latency of one engine operation.
pub(crate) fn record_op<T>(op: &'static str, started: Instant, result: &Result<T, EngineError>) {
    let status = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
