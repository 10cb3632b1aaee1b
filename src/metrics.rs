//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustread_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "rustread_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("rustread_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("rustread_activitypub_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustread_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "rustread_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Background task metrics
    pub static ref FEDERATION_TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustread_federation_tasks_total", "Total number of detached federation tasks by outcome"),
        &["task", "outcome"]
    ).expect("metric can be created");
    pub static ref FEDERATION_TASKS_IN_FLIGHT: IntGauge = IntGauge::new(
        "rustread_federation_tasks_in_flight",
        "Detached federation tasks currently waiting or running"
    ).expect("metric can be created");

    // Content Metrics
    pub static ref POSTS_IMPORTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustread_posts_imported_total", "Total number of remote posts materialized"),
        &["source"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("rustread_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HTTP_REQUESTS_TOTAL.clone()),
            Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
            Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()),
            Box::new(ACTIVITYPUB_ACTIVITIES_SENT.clone()),
            Box::new(FEDERATION_REQUESTS_TOTAL.clone()),
            Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
            Box::new(FEDERATION_TASKS_TOTAL.clone()),
            Box::new(FEDERATION_TASKS_IN_FLIGHT.clone()),
            Box::new(POSTS_IMPORTED_TOTAL.clone()),
            Box::new(ERRORS_TOTAL.clone()),
        ];

        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "Failed to register metric");
            }
        }

        tracing::info!("Metrics registry initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_metrics();
        init_metrics();
        ERRORS_TOTAL.with_label_values(&["validation"]).inc();
        let families = REGISTRY.gather();
        assert!(
            families
                .iter()
                .any(|family| family.get_name() == "rustread_errors_total")
        );
    }
}
