//! Market Data Streaming Types
//!
//! Core domain types for the relay: control acknowledgements, translated
//! price updates, and the frames written to downstream clients. These types
//! are codec-agnostic; the BitMEX wire shapes live in
//! `infrastructure::bitmex::messages`.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Control Operations
// =============================================================================

/// Subscription control operation sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Start receiving updates for a channel.
    Subscribe,
    /// Stop receiving updates for a channel.
    Unsubscribe,
}

impl Operation {
    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }

    /// Parse a wire name, case-sensitive like the upstream protocol.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream confirmation (or rejection) of one control frame.
///
/// Carries no request id: correlation happens purely on
/// `(operation, requested_symbol)` in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAck {
    /// Whether the upstream accepted the request.
    pub success: bool,
    /// Operation being acknowledged.
    pub operation: Operation,
    /// Symbol extracted from the acknowledged channel name.
    pub requested_symbol: String,
}

impl ControlAck {
    /// Successful acknowledgement.
    #[must_use]
    pub fn accepted(operation: Operation, symbol: impl Into<String>) -> Self {
        Self {
            success: true,
            operation,
            requested_symbol: symbol.into(),
        }
    }

    /// Rejected acknowledgement.
    #[must_use]
    pub fn rejected(operation: Operation, symbol: impl Into<String>) -> Self {
        Self {
            success: false,
            operation,
            requested_symbol: symbol.into(),
        }
    }
}

// =============================================================================
// Price Updates
// =============================================================================

/// Value contributed by a candidate price field that is absent or null.
pub const ABSENT_PRICE: f64 = -1.0;

/// Select the relayed price from the upstream candidates.
///
/// The price is the maximum of impact-ask, last and mark price. Absent
/// candidates count as [`ABSENT_PRICE`] and take part in the comparison like
/// any other value, so a row with no usable price relays `-1`.
#[must_use]
pub fn select_price(impact_ask: Option<f64>, last: Option<f64>, mark: Option<f64>) -> f64 {
    [impact_ask, last, mark]
        .into_iter()
        .map(|p| p.unwrap_or(ABSENT_PRICE))
        .fold(f64::NEG_INFINITY, f64::max)
}

/// A translated instrument price update.
#[derive(Debug, Clone, PartialEq)]
pub struct DataUpdate {
    /// Instrument symbol, e.g. `XBTUSD`.
    pub symbol: String,
    /// Upstream timestamp, relayed verbatim.
    pub timestamp: String,
    /// Selected price (see [`select_price`]).
    pub price: f64,
}

// =============================================================================
// Downstream Frames
// =============================================================================

/// A frame written to a downstream client.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamFrame {
    /// Price update for a subscribed symbol.
    Data(DataUpdate),
    /// Outcome of a subscribe/unsubscribe request.
    Ack {
        /// Whether the request succeeded.
        success: bool,
    },
    /// Local rejection or connection-level failure.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl DownstreamFrame {
    /// Build an error frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Some(10.1), Some(9.9), Some(10.5), 10.5 ; "max of three")]
    #[test_case(Some(-1.0), Some(-1.0), Some(-1.0), -1.0 ; "all sentinel passthrough")]
    #[test_case(None, None, None, -1.0 ; "all absent")]
    #[test_case(None, Some(42.0), None, 42.0 ; "only last present")]
    #[test_case(Some(7.5), None, Some(7.25), 7.5 ; "impact ask wins")]
    #[test_case(Some(-3.0), None, Some(-2.0), -1.0 ; "absent beats negative")]
    fn price_selection(impact_ask: Option<f64>, last: Option<f64>, mark: Option<f64>, expected: f64) {
        assert_eq!(select_price(impact_ask, last, mark), expected);
    }

    #[test]
    fn operation_round_trips_wire_names() {
        for op in [Operation::Subscribe, Operation::Unsubscribe] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("Subscribe"), None);
        assert_eq!(Operation::parse("ping"), None);
    }

    #[test]
    fn operation_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Operation::Unsubscribe).unwrap(),
            "\"unsubscribe\""
        );
    }

    #[test]
    fn control_ack_constructors() {
        let ok = ControlAck::accepted(Operation::Subscribe, "XBTUSD");
        assert!(ok.success);
        assert_eq!(ok.requested_symbol, "XBTUSD");

        let rejected = ControlAck::rejected(Operation::Unsubscribe, "ETHUSD");
        assert!(!rejected.success);
        assert_eq!(rejected.operation, Operation::Unsubscribe);
    }

    #[test]
    fn downstream_frame_kinds() {
        assert_eq!(DownstreamFrame::Ack { success: true }.kind(), "ack");
        assert_eq!(DownstreamFrame::error("nope").kind(), "error");
    }
}
