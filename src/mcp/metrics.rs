//! Client metrics for tool calls and session lifecycle
//!
//! Recorded through the `metrics` facade, so nothing is collected until a
//! recorder is installed. [`init_metrics_exporter`] installs the Prometheus
//! recorder when the crate is built with the `prometheus` feature.
//!
//! # Metrics
//!
//! - `mcp_tool_calls_total`: Counter of finished tool calls by server and outcome
//! - `mcp_tool_call_duration_seconds`: Histogram of tool call latency by server
//! - `mcp_tool_calls_active`: Gauge of in-flight tool calls by server
//! - `mcp_session_transitions_total`: Counter of session state changes by server and state
//! - `mcp_reconnects_total`: Counter of reconnect cycles by server and outcome
//!
//! # Examples
//!
//! ```
//! use conduit::mcp::metrics::ToolCallMetrics;
//!
//! let metrics = ToolCallMetrics::new("filesystem");
//! metrics.record("ok");
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};

use crate::error::{classify, ConduitError};
use crate::mcp::session::SessionState;

/// Metrics for one tool call
///
/// Increments the in-flight gauge on creation. The first call to
/// [`ToolCallMetrics::record`] settles the call; dropping an unsettled
/// tracker (a caller abandoned the future) only releases the gauge.
#[derive(Debug)]
pub struct ToolCallMetrics {
    server: String,
    start: Instant,
    recorded: AtomicBool,
}

impl ToolCallMetrics {
    /// Start tracking a call to `server`.
    pub fn new(server: &str) -> Self {
        increment_gauge!("mcp_tool_calls_active", 1.0, "server" => server.to_string());
        Self {
            server: server.to_string(),
            start: Instant::now(),
            recorded: AtomicBool::new(false),
        }
    }

    /// Record the outcome of the call. Later calls are ignored.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `"ok"` or an error label from [`error_label`]
    pub fn record(&self, outcome: &str) {
        if self.recorded.swap(true, Ordering::SeqCst) {
            return;
        }

        histogram!(
            "mcp_tool_call_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "server" => self.server.clone()
        );
        increment_counter!(
            "mcp_tool_calls_total",
            "server" => self.server.clone(),
            "outcome" => outcome.to_string()
        );
        decrement_gauge!("mcp_tool_calls_active", 1.0, "server" => self.server.clone());
    }

    /// Record `"ok"` or the error label of `result`.
    pub fn record_result<T>(&self, result: &crate::error::Result<T>) {
        match result {
            Ok(_) => self.record("ok"),
            Err(e) => self.record(error_label(e)),
        }
    }

    /// Whether an outcome has been recorded.
    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }

    /// Time since the call started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for ToolCallMetrics {
    fn drop(&mut self) {
        if !self.recorded.load(Ordering::SeqCst) {
            decrement_gauge!("mcp_tool_calls_active", 1.0, "server" => self.server.clone());
        }
    }
}

/// Low-cardinality label for an error.
pub fn error_label(error: &anyhow::Error) -> &'static str {
    match classify(error) {
        Some(ConduitError::Config(_)) => "config",
        Some(ConduitError::Connection { .. }) => "connection",
        Some(ConduitError::Timeout { .. }) => "timeout",
        Some(ConduitError::Protocol { .. }) | Some(ConduitError::ProtocolVersion { .. }) => {
            "protocol"
        }
        Some(ConduitError::ToolInvocation { .. }) => "tool_error",
        Some(ConduitError::Schema(_)) => "schema",
        Some(ConduitError::ConnectionLost { .. }) => "connection_lost",
        Some(ConduitError::Cancelled { .. }) => "cancelled",
        Some(ConduitError::NotReady { .. }) => "not_ready",
        Some(ConduitError::Auth(_)) => "auth",
        Some(ConduitError::Rpc { .. }) => "rpc",
        Some(_) | None => "other",
    }
}

/// Count a session state change.
pub fn record_transition(server: &str, state: SessionState) {
    increment_counter!(
        "mcp_session_transitions_total",
        "server" => server.to_string(),
        "state" => state.to_string()
    );
}

/// Count the end of a reconnect cycle.
pub fn record_reconnect(server: &str, succeeded: bool) {
    let outcome = if succeeded { "success" } else { "exhausted" };
    increment_counter!(
        "mcp_reconnects_total",
        "server" => server.to_string(),
        "outcome" => outcome
    );
}

/// Initializes the metrics exporter for Prometheus
///
/// With the `prometheus` feature this installs the Prometheus recorder and
/// its HTTP listener; otherwise it does nothing. Safe to call more than
/// once: a second install fails and is logged.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Err(e) = PrometheusBuilder::new().install() {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_settled_once() {
        let metrics = ToolCallMetrics::new("fs");
        assert!(!metrics.is_recorded());
        metrics.record("ok");
        assert!(metrics.is_recorded());
        // Second outcome is ignored.
        metrics.record("timeout");
        assert!(metrics.is_recorded());
    }

    #[test]
    fn test_drop_without_record_is_harmless() {
        let metrics = ToolCallMetrics::new("fs");
        assert!(metrics.elapsed() < std::time::Duration::from_secs(5));
        drop(metrics);
    }

    #[test]
    fn test_record_result_uses_error_label() {
        let metrics = ToolCallMetrics::new("fs");
        let result: crate::error::Result<()> = Err(ConduitError::Timeout {
            server: "fs".into(),
            method: "tools/call".into(),
            after: std::time::Duration::from_secs(1),
        }
        .into());
        metrics.record_result(&result);
        assert!(metrics.is_recorded());
    }

    #[test]
    fn test_error_labels() {
        let lost: anyhow::Error = ConduitError::ConnectionLost { server: "a".into() }.into();
        assert_eq!(error_label(&lost), "connection_lost");
        let schema: anyhow::Error = ConduitError::Schema("nested".into()).into();
        assert_eq!(error_label(&schema), "schema");
        assert_eq!(error_label(&anyhow::anyhow!("plain")), "other");
    }

    #[test]
    fn test_lifecycle_counters_without_recorder() {
        record_transition("fs", SessionState::Ready);
        record_reconnect("fs", true);
        record_reconnect("fs", false);
        init_metrics_exporter();
    }
}
