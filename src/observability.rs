use std::net::SocketAddr;

// ── RED metrics (operation-driven) ──────────────────────────────

/// Counter: allocation operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "roomledger_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "roomledger_operation_duration_seconds";

// ── Consistency metrics ─────────────────────────────────────────

/// Counter: assignments that lost a same-slot race after writing.
pub const CAPACITY_RACES_TOTAL: &str = "roomledger_capacity_races_total";

/// Counter: compensating writes (rolled-back assignments, restored rooms).
pub const COMPENSATIONS_TOTAL: &str = "roomledger_compensations_total";

/// Counter: students unassigned by reconciliation because a room was over capacity.
pub const EVICTIONS_TOTAL: &str = "roomledger_evictions_total";

/// Counter: full reconciliation passes run.
pub const RECONCILE_RUNS_TOTAL: &str = "roomledger_reconcile_runs_total";

/// Counter: rooms whose cached occupancy had drifted and was rewritten.
pub const RECONCILE_CORRECTIONS_TOTAL: &str = "roomledger_reconcile_corrections_total";

/// Counter: rooms whose cached occupancy disagreed with the derived view at read time.
pub const VIEW_DRIFT_TOTAL: &str = "roomledger_view_drift_total";

// ── Change propagation ──────────────────────────────────────────

/// Counter: projection re-fetches performed by change listeners.
pub const VIEW_REFRESH_TOTAL: &str = "roomledger_view_refresh_total";

/// Counter: change events folded into an already pending re-fetch.
pub const COALESCED_EVENTS_TOTAL: &str = "roomledger_coalesced_events_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: hostels with a loaded engine.
pub const HOSTELS_ACTIVE: &str = "roomledger_hostels_active";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "roomledger_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (entries per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "roomledger_journal_flush_batch_size";

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
