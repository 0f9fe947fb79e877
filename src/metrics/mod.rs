// Prometheus metrics for the origin handler and the edge authenticator

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

pub struct Metrics {
    /// Origin responses by HTTP status
    pub responses: IntCounterVec,

    /// Edge decisions by outcome (forwarded, missing_signature, ...)
    pub edge_decisions: IntCounterVec,

    /// Edit pipeline duration by output content type (in seconds)
    pub pipeline_duration: HistogramVec,

    /// Responses served from the fallback image
    pub fallback_responses: IntCounter,

    /// Overlay images served from the in-memory cache
    pub overlay_cache_hits: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    /// Initialize and return the global metrics instance
    pub fn global() -> &'static Self {
        METRICS.get_or_init(|| {
            let responses = register_int_counter_vec!(
                "shashin_responses_total",
                "Total number of origin responses by status code",
                &["status"]
            )
            .expect("Failed to register responses_total metric");

            let edge_decisions = register_int_counter_vec!(
                "shashin_edge_decisions_total",
                "Total number of edge authentication decisions by outcome",
                &["outcome"]
            )
            .expect("Failed to register edge_decisions_total metric");

            let pipeline_duration = register_histogram_vec!(
                "shashin_pipeline_duration_seconds",
                "Duration of the edit pipeline in seconds",
                &["content_type"],
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            )
            .expect("Failed to register pipeline_duration_seconds metric");

            let fallback_responses = register_int_counter!(
                "shashin_fallback_responses_total",
                "Total number of responses served from the fallback image"
            )
            .expect("Failed to register fallback_responses_total metric");

            let overlay_cache_hits = register_int_counter!(
                "shashin_overlay_cache_hits_total",
                "Total number of overlay images served from cache"
            )
            .expect("Failed to register overlay_cache_hits_total metric");

            Metrics {
                responses,
                edge_decisions,
                pipeline_duration,
                fallback_responses,
                overlay_cache_hits,
            }
        })
    }

    pub fn record_response(&self, status: u16) {
        self.responses
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    pub fn record_edge_decision(&self, outcome: &str) {
        self.edge_decisions.with_label_values(&[outcome]).inc();
    }

    pub fn observe_pipeline(&self, content_type: &str, seconds: f64) {
        self.pipeline_duration
            .with_label_values(&[content_type])
            .observe(seconds);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn export() -> String {
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
