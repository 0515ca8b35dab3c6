use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const REQUESTS_TOTAL: &str = "bridge_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "bridge_request_duration_seconds";
pub const RESPONSE_LATENCY_SECONDS: &str = "bridge_response_latency_seconds";
pub const TUNNEL_CLIENTS: &str = "bridge_tunnel_clients";
pub const PENDING_REQUESTS: &str = "bridge_pending_requests";
pub const UNROUTABLE_RESPONSES_TOTAL: &str = "bridge_unroutable_responses_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup. Without it every metric call is a no-op.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;

    metrics::describe_counter!(REQUESTS_TOTAL, "Preview requests by terminal outcome.");
    metrics::describe_histogram!(
        REQUEST_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time from preview request arrival to its outcome."
    );
    metrics::describe_histogram!(
        RESPONSE_LATENCY_SECONDS,
        metrics::Unit::Seconds,
        "Time a pending slot waited for its response envelope."
    );
    metrics::describe_gauge!(TUNNEL_CLIENTS, "Registered tunnel connections.");
    metrics::describe_gauge!(PENDING_REQUESTS, "Requests waiting for a tunnel response.");
    metrics::describe_counter!(
        UNROUTABLE_RESPONSES_TOTAL,
        "Response envelopes with no matching pending request."
    );

    Ok(handle)
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
