//! Built-in origin endpoints.
//!
//! - `/health` - liveness with uptime and version
//! - `/metrics` - Prometheus metrics export
//!
//! Handlers return an `EndpointResponse`; the caller writes it to the session.

use std::time::Instant;

use crate::metrics::Metrics;

pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";

/// Response from a special endpoint handler.
#[derive(Debug, Clone)]
pub struct EndpointResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl EndpointResponse {
    pub fn json(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    /// Plain text in the Prometheus exposition format
    pub fn prometheus(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; version=0.0.4",
            body,
        }
    }
}

/// Route a path to its built-in handler, if it has one.
pub fn handle_special_endpoint(path: &str, start_time: Instant) -> Option<EndpointResponse> {
    match path {
        HEALTH_PATH => Some(handle_health(start_time)),
        METRICS_PATH => Some(handle_metrics()),
        _ => None,
    }
}

pub fn handle_health(start_time: Instant) -> EndpointResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION")
    })
    .to_string();

    EndpointResponse::json(200, body)
}

pub fn handle_metrics() -> EndpointResponse {
    // Registers the collectors before the first scrape
    let _ = Metrics::global();
    EndpointResponse::prometheus(Metrics::export())
}
