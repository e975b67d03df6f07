//! Replication metrics, rendered in text exposition format.

use std::fmt::Write as _;

use quilt_core::peer::PeerId;

/// Counters accumulated by the engine. Gauges (connected peers, per-peer
/// lag) are computed at render time from live state.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub messages_in: u64,
    pub messages_out: u64,
    pub retransmission_requests_in: u64,
    pub retransmission_requests_out: u64,
    /// Requests over the per-sweep ceiling, deferred to the next sweep.
    pub retransmission_requests_deferred: u64,
    pub maintenance_seconds: f64,
    pub max_drift_ms: i64,
    pub read_your_write_timeouts: u64,
}

/// Per-peer lag sample: `clock_drift + last_msg_ts - contiguous_unix_ms`.
#[derive(Debug, Clone, Copy)]
pub struct PeerLag {
    pub peer: PeerId,
    pub lag_seconds: f64,
}

/// Render the exposition text.
pub fn render(metrics: &Metrics, connected_peers: usize, lags: &[PeerLag]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# TYPE db_replication_connected_peers gauge");
    let _ = writeln!(out, "db_replication_connected_peers {connected_peers}");

    let _ = writeln!(out, "# TYPE db_replication_lag_seconds gauge");
    for lag in lags {
        let _ = writeln!(
            out,
            "db_replication_lag_seconds{{remote_peer=\"{}\"}} {:.3}",
            lag.peer, lag.lag_seconds
        );
    }

    let _ = writeln!(
        out,
        "# TYPE db_replication_retransmission_requests_total counter"
    );
    let _ = writeln!(
        out,
        "db_replication_retransmission_requests_total{{direction=\"inbound\"}} {}",
        metrics.retransmission_requests_in
    );
    let _ = writeln!(
        out,
        "db_replication_retransmission_requests_total{{direction=\"outbound\"}} {}",
        metrics.retransmission_requests_out
    );
    let _ = writeln!(
        out,
        "db_replication_retransmission_requests_total{{direction=\"deferred\"}} {}",
        metrics.retransmission_requests_deferred
    );

    let _ = writeln!(out, "# TYPE db_replication_messages_total counter");
    let _ = writeln!(
        out,
        "db_replication_messages_total{{direction=\"inbound\"}} {}",
        metrics.messages_in
    );
    let _ = writeln!(
        out,
        "db_replication_messages_total{{direction=\"outbound\"}} {}",
        metrics.messages_out
    );

    let _ = writeln!(out, "# TYPE db_maintenance_time_seconds_total counter");
    let _ = writeln!(
        out,
        "db_maintenance_time_seconds_total {:.3}",
        metrics.maintenance_seconds
    );

    let _ = writeln!(out, "# TYPE db_logical_clock_drift_max_seconds gauge");
    let _ = writeln!(
        out,
        "db_logical_clock_drift_max_seconds {:.3}",
        metrics.max_drift_ms as f64 / 1000.0
    );

    let _ = writeln!(out, "# TYPE db_read_your_write_timeouts_total counter");
    let _ = writeln!(
        out,
        "db_read_your_write_timeouts_total {}",
        metrics.read_your_write_timeouts
    );

    out
}
