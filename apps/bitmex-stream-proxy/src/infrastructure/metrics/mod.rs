//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Upstream frames received by kind, decode errors
//! - **Control**: Control frames sent upstream, acknowledgements by outcome
//! - **Fan-out**: Updates delivered to and dropped for downstream clients
//! - **Connections**: Upstream connection state, downstream clients, sessions
//! - **Latency**: Fan-out duration per update
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::Operation;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream frames
    describe_counter!(
        "bitmex_proxy_frames_received_total",
        "Total frames received from the BitMEX feed by kind"
    );
    describe_counter!(
        "bitmex_proxy_decode_errors_total",
        "Total upstream frames that failed to decode"
    );

    // Control plane
    describe_counter!(
        "bitmex_proxy_control_frames_total",
        "Total control frames written upstream by operation and result"
    );
    describe_counter!(
        "bitmex_proxy_acks_total",
        "Total upstream acknowledgements by correlation outcome"
    );

    // Fan-out
    describe_counter!(
        "bitmex_proxy_updates_delivered_total",
        "Total price updates written to downstream clients"
    );
    describe_counter!(
        "bitmex_proxy_delivery_failures_total",
        "Total failed writes to downstream clients"
    );

    // Connection gauges
    describe_gauge!(
        "bitmex_proxy_upstream_connected",
        "Whether the upstream connection is live (1) or not (0)"
    );
    describe_gauge!(
        "bitmex_proxy_downstream_clients",
        "Number of connected downstream clients"
    );
    describe_gauge!(
        "bitmex_proxy_sessions",
        "Number of live subscription sessions"
    );

    // Latency histograms
    describe_histogram!(
        "bitmex_proxy_fanout_seconds",
        "Time to fan one price update out to all subscribers"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for upstream frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Handshake banner or other ignorable frame.
    Noise,
    /// Control acknowledgement.
    Ack,
    /// Table update.
    Data,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Noise => "noise",
            Self::Ack => "ack",
            Self::Data => "data",
        }
    }
}

/// Metric labels for acknowledgement correlation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Resolved a session.
    Resolved,
    /// Consumed one entry of a multi-symbol session.
    Progress,
    /// Absorbed by a detached entry.
    Absorbed,
    /// No outstanding entry matched.
    Unmatched,
}

impl AckOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Progress => "progress",
            Self::Absorbed => "absorbed",
            Self::Unmatched => "unmatched",
        }
    }
}

/// Record a frame received from the upstream feed.
pub fn record_frame_received(kind: FrameKind) {
    counter!(
        "bitmex_proxy_frames_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record an upstream frame that failed to decode.
pub fn record_decode_error(reason: &'static str) {
    counter!(
        "bitmex_proxy_decode_errors_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record a control frame write attempt.
pub fn record_control_frame(operation: Operation, ok: bool) {
    counter!(
        "bitmex_proxy_control_frames_total",
        "op" => operation.as_str(),
        "result" => if ok { "sent" } else { "failed" }
    )
    .increment(1);
}

/// Record an acknowledgement correlation outcome.
pub fn record_ack(outcome: AckOutcome) {
    counter!(
        "bitmex_proxy_acks_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record updates written to downstream clients.
pub fn record_updates_delivered(count: u64) {
    counter!("bitmex_proxy_updates_delivered_total").increment(count);
}

/// Record failed downstream writes.
pub fn record_delivery_failures(count: u64) {
    counter!("bitmex_proxy_delivery_failures_total").increment(count);
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("bitmex_proxy_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the downstream client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_downstream_clients(count: usize) {
    gauge!("bitmex_proxy_downstream_clients").set(count as f64);
}

/// Update the live session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions(count: usize) {
    gauge!("bitmex_proxy_sessions").set(count as f64);
}

/// Record the duration of one fan-out pass.
pub fn record_fanout_duration(duration: Duration) {
    histogram!("bitmex_proxy_fanout_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_kind_as_str() {
        assert_eq!(FrameKind::Noise.as_str(), "noise");
        assert_eq!(FrameKind::Ack.as_str(), "ack");
        assert_eq!(FrameKind::Data.as_str(), "data");
    }

    #[test]
    fn ack_outcome_as_str() {
        assert_eq!(AckOutcome::Resolved.as_str(), "resolved");
        assert_eq!(AckOutcome::Progress.as_str(), "progress");
        assert_eq!(AckOutcome::Absorbed.as_str(), "absorbed");
        assert_eq!(AckOutcome::Unmatched.as_str(), "unmatched");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame_received(FrameKind::Data);
        record_control_frame(Operation::Subscribe, true);
        record_ack(AckOutcome::Unmatched);
        set_upstream_connected(false);
        record_fanout_duration(Duration::from_micros(5));
    }
}
