use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus exporter and register all application metrics.
/// Returns a `PrometheusHandle` whose `render()` method produces the
/// text/plain Prometheus scrape payload.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // Pre-register counters so they appear even before the first increment.
    counter!("poll_cycles_total").absolute(0);
    counter!("poll_cycles_skipped_total").absolute(0);
    counter!("invariant_violations_total").absolute(0);
    counter!("lifecycle_resolved_total").absolute(0);
    counter!("settlement_events_total").absolute(0);
    counter!("stream_messages_total").absolute(0);
    counter!("stream_updates_applied_total").absolute(0);
    counter!("stream_duplicates_total").absolute(0);
    counter!("stream_stale_total").absolute(0);
    counter!("stream_reconnects_total").absolute(0);
    for pass in ["a", "b", "c"] {
        counter!("poll_markets_total", "pass" => pass).absolute(0);
        counter!("catalog_fetch_errors_total", "pass" => pass).absolute(0);
        counter!("catalog_markets_dropped_total", "pass" => pass).absolute(0);
        histogram!("poll_pass_seconds", "pass" => pass).record(0.0);
    }

    // Pre-register gauges at zero.
    gauge!("stream_connected").set(0.0);
    gauge!("stream_subscription_tokens").set(0.0);

    handle
}
