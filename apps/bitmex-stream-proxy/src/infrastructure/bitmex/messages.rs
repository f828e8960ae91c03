//! BitMEX WebSocket Message Types
//!
//! Wire format types for the BitMEX realtime API. These types map directly
//! to the JSON objects exchanged on `wss://ws.bitmex.com/realtime`.
//!
//! # Message Types
//!
//! ## Sent
//! - `ControlFrame`: `{"op": "subscribe", "args": "instrument:XBTUSD"}`
//!
//! ## Received
//! - Welcome banner: `{"info": "Welcome to the BitMEX Realtime API.", ...}`
//! - `SubscriptionStatus`: `{"success": true, "subscribe": "instrument:XBTUSD", "request": {...}}`
//! - `RequestError`: `{"status": 400, "error": "Unknown table: ...", "request": {...}}`
//! - `TableFrame`: `{"table": "instrument", "action": "update", "data": [...]}`
//!
//! # References
//!
//! - [WebSocket API](https://www.bitmex.com/app/wsAPI)

use serde::{Deserialize, Serialize};

use crate::domain::streaming::Operation;

// =============================================================================
// Control Frames
// =============================================================================

/// Subscribe/unsubscribe request sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlFrame {
    /// Operation.
    pub op: Operation,
    /// Channel name, `<table>:<SYMBOL>`.
    pub args: String,
}

impl ControlFrame {
    /// Build a frame for `symbol` on `table`.
    #[must_use]
    pub fn new(op: Operation, table: &str, symbol: &str) -> Self {
        Self {
            op,
            args: channel_name(table, symbol),
        }
    }
}

/// Channel name for a symbol on a table.
#[must_use]
pub fn channel_name(table: &str, symbol: &str) -> String {
    format!("{table}:{symbol}")
}

/// Symbol part of a channel name: the text after the first `:`, or the
/// whole value when there is none.
#[must_use]
pub fn channel_symbol(channel: &str) -> &str {
    channel.split_once(':').map_or(channel, |(_, symbol)| symbol)
}

/// `args` of an echoed request: a single channel or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RequestArgs {
    /// `"args": "instrument:XBTUSD"`
    One(String),
    /// `"args": ["instrument:XBTUSD", ...]`
    Many(Vec<String>),
}

impl RequestArgs {
    /// First channel named by the request.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::One(arg) => Some(arg.as_str()),
            Self::Many(args) => args.first().map(String::as_str),
        }
    }
}

/// The original request echoed by acknowledgements and errors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EchoedRequest {
    /// Requested operation (`subscribe`, `unsubscribe`, ...).
    #[serde(default)]
    pub op: Option<String>,
    /// Requested channel(s).
    #[serde(default)]
    pub args: Option<RequestArgs>,
}

/// Acknowledgement of a subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionStatus {
    /// Whether the request succeeded.
    pub success: bool,
    /// Channel subscribed, on subscribe acks.
    #[serde(default)]
    pub subscribe: Option<String>,
    /// Channel unsubscribed, on unsubscribe acks.
    #[serde(default)]
    pub unsubscribe: Option<String>,
    /// The request being acknowledged.
    pub request: EchoedRequest,
}

/// Rejection of a request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestError {
    /// HTTP-like status code.
    #[serde(default)]
    pub status: Option<u16>,
    /// Reason.
    pub error: String,
    /// The rejected request.
    pub request: EchoedRequest,
}

// =============================================================================
// Table Frames
// =============================================================================

/// A table push: `partial`, `insert`, `update` or `delete`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableFrame {
    /// Table name, e.g. `instrument`.
    pub table: String,
    /// Table action.
    pub action: String,
    /// Rows, decoded individually.
    pub data: Vec<serde_json::Value>,
}

/// One `instrument` row. Only the fields the relay uses are decoded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentRow {
    /// Instrument symbol.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Row timestamp (ISO 8601).
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Impact ask price.
    #[serde(default)]
    pub impact_ask_price: Option<f64>,
    /// Last traded price.
    #[serde(default)]
    pub last_price: Option<f64>,
    /// Mark price.
    #[serde(default)]
    pub mark_price: Option<f64>,
}

// =============================================================================
// Tests
// =============================================================================
