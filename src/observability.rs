use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Calendar service ────────────────────────────────────────────

/// Counter: applied proposals. Labels: outcome.
pub const PROPOSALS_TOTAL: &str = "blockcal_proposals_total";

/// Counter: removals. Labels: result.
pub const REMOVALS_TOTAL: &str = "blockcal_removals_total";

/// Counter: failed gateway calls. Labels: op (list, create, delete).
pub const GATEWAY_FAILURES_TOTAL: &str = "blockcal_gateway_failures_total";

/// Counter: local views rebuilt after a failed write.
pub const RECONCILES_TOTAL: &str = "blockcal_reconciles_total";

/// Histogram: view query latency in seconds. Labels: view.
pub const QUERY_DURATION_SECONDS: &str = "blockcal_query_duration_seconds";

// ── Local store ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "blockcal_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "blockcal_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
