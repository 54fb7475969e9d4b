//! Default `tracing`-backed implementations of the log and metrics ports.

use std::time::Duration;

use conveyor_schemas::RequestId;
use tracing::{debug, error, info, warn};

use crate::ports::{MetricsRecorder, ReconcileLog, Severity};

/// Routes engine log lines to `tracing`. Critical lines are `ERROR` events
/// tagged `severity = "critical"` so alerting can filter on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl ReconcileLog for TracingLog {
    fn log(&self, severity: Severity, request_id: RequestId, message: &str) {
        let request_id = request_id.to_string();
        match severity {
            Severity::Debug => debug!(%request_id, "{message}"),
            Severity::Info => info!(%request_id, "{message}"),
            Severity::Warning => warn!(%request_id, "{message}"),
            Severity::Critical => error!(%request_id, severity = "critical", "{message}"),
        }
    }
}

/// Emits one `debug` event per timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsRecorder for TracingMetrics {
    fn record_timer(&self, metric: &str, elapsed: Duration) {
        debug!(
            target: "conveyor::metrics",
            metric,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "timer"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record_timer(&self, _metric: &str, _elapsed: Duration) {}
}
