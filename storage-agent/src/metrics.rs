//! Prometheus metrics for the storage agent
//!
//! Covers control calls, resource provider and plugin container health, and
//! offer churn on the master side.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Control calls by type and status
    pub const CONFIG_CALLS_TOTAL: &str = "storage_agent_config_calls_total";
    /// Histogram: Duration of control calls in seconds
    pub const CONFIG_CALL_DURATION_SECONDS: &str = "storage_agent_config_call_duration_seconds";
    /// Gauge: Resource providers by state (active/degraded)
    pub const PROVIDERS_TOTAL: &str = "storage_agent_resource_providers";
    /// Gauge: Plugin containers by state
    pub const PLUGIN_CONTAINERS_TOTAL: &str = "storage_agent_plugin_containers";
    /// Counter: Plugin container launches by status
    pub const PLUGIN_LAUNCHES_TOTAL: &str = "storage_agent_plugin_launches_total";
    /// Counter: Plugin containers that exited on their own
    pub const PLUGIN_EXITS_TOTAL: &str = "storage_agent_plugin_unexpected_exits_total";
    /// Counter: Offers rescinded by the master
    pub const OFFERS_RESCINDED_TOTAL: &str = "storage_agent_offers_rescinded_total";
    /// Counter: Offers made by the master
    pub const OFFERS_MADE_TOTAL: &str = "storage_agent_offers_made_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a control call with its result
pub fn record_call(call: &str, status: &str, duration_secs: f64) {
    counter!(names::CONFIG_CALLS_TOTAL, "call" => call.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CONFIG_CALL_DURATION_SECONDS, "call" => call.to_string())
        .record(duration_secs);
}

/// Set the number of providers in a state
pub fn set_providers_count(state: &str, count: usize) {
    gauge!(names::PROVIDERS_TOTAL, "state" => state.to_string()).set(count as f64);
}

/// Set the number of plugin containers in a state
pub fn set_plugin_containers_count(state: &str, count: usize) {
    gauge!(names::PLUGIN_CONTAINERS_TOTAL, "state" => state.to_string()).set(count as f64);
}

pub fn record_plugin_launch(status: &str) {
    counter!(names::PLUGIN_LAUNCHES_TOTAL, "status" => status.to_string()).increment(1);
}

pub fn record_plugin_exit() {
    counter!(names::PLUGIN_EXITS_TOTAL).increment(1);
}

pub fn record_offers_rescinded(count: usize) {
    counter!(names::OFFERS_RESCINDED_TOTAL).increment(count as u64);
}

pub fn record_offer_made() {
    counter!(names::OFFERS_MADE_TOTAL).increment(1);
}

/// Helper for timing control calls
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_call(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_call(&self.operation, error_code, duration);
    }
}
