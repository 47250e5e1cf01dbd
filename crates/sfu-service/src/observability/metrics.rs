//! Metrics definitions for the SFU service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `method`: bounded by signaling methods (~15 values)
//! - `status`: `success` or an error type label (~17 values)
//! - `operation`: bounded by meeting store calls (3 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Histogram buckets:
/// - Signaling latency p99 < 250ms (router/transport creation dominates)
/// - Meeting store latency p99 < 10ms
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_meeting_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set meeting store latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics (Gauges)
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Set the number of joined peers across all rooms.
///
/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Set the number of live media workers.
///
/// Metric: `sfu_workers_active`
pub fn set_workers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_workers_active").set(count as f64);
}

// ============================================================================
// Lifecycle Metrics (Counters)
// ============================================================================

/// Record a router creation.
///
/// Metric: `sfu_routers_created_total`
pub fn record_router_created() {
    counter!("sfu_routers_created_total").increment(1);
}

/// Record an unexpected worker death.
///
/// Metric: `sfu_worker_deaths_total`
pub fn record_worker_death() {
    counter!("sfu_worker_deaths_total").increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a handled signaling request.
///
/// Metric: `sfu_signaling_requests_total`
/// Labels: `method`, `status` (`success` or error type label)
pub fn record_signaling_request(method: &'static str, status: &'static str) {
    counter!("sfu_signaling_requests_total", "method" => method, "status" => status).increment(1);
}

/// Record signaling request processing latency.
///
/// Metric: `sfu_signaling_latency_seconds`
/// Labels: `method`
pub fn record_signaling_latency(method: &'static str, duration: Duration) {
    histogram!("sfu_signaling_latency_seconds", "method" => method).record(duration.as_secs_f64());
}

/// Record meeting store operation latency.
///
/// Metric: `sfu_meeting_store_latency_seconds`
/// Labels: `operation` (find, mark_active, mark_ended)
pub fn record_meeting_store_latency(operation: &'static str, duration: Duration) {
    histogram!("sfu_meeting_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_gauges_and_histograms_without_recorder() {
        // No recorder installed: calls go to the no-op recorder.
        set_rooms_active(0);
        set_rooms_active(12);
        set_peers_active(40);
        set_workers_active(4);
        record_signaling_latency("join", Duration::from_millis(15));
        record_meeting_store_latency("find", Duration::from_micros(700));
    }

    #[test]
    fn test_counters_are_recorded_with_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_router_created();
            record_router_created();
            record_worker_death();
            record_signaling_request("join", "success");
            record_signaling_request("join", "room_full");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let counter_value = |name: &str| -> u64 {
            snapshot
                .iter()
                .filter(|(key, _, _, _)| key.key().name() == name)
                .map(|(_, _, _, value)| match value {
                    DebugValue::Counter(v) => *v,
                    _ => 0,
                })
                .sum()
        };

        assert_eq!(counter_value("sfu_routers_created_total"), 2);
        assert_eq!(counter_value("sfu_worker_deaths_total"), 1);
        assert_eq!(counter_value("sfu_signaling_requests_total"), 2);

        let statuses: Vec<String> = snapshot
            .iter()
            .filter(|(key, _, _, _)| key.key().name() == "sfu_signaling_requests_total")
            .flat_map(|(key, _, _, _)| {
                key.key()
                    .labels()
                    .filter(|label| label.key() == "status")
                    .map(|label| label.value().to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        assert!(statuses.contains(&"success".to_string()));
        assert!(statuses.contains(&"room_full".to_string()));
    }
}
