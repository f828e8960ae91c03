//! Frame Codec
//!
//! Decodes BitMEX frames into relay events and encodes outgoing frames.
//!
//! Decoding is a strict shape match in priority order:
//!
//! 1. acknowledgement: `success` + `request`
//! 2. request error: `error` + `request`, decoded as a rejected ack
//! 3. table frame: `table` + `action` + `data`
//! 4. informational: `info` or `docs` (the welcome banner)
//!
//! Anything else is [`DecodeError::UnrecognizedShape`]. Downstream frames are
//! built as JSON values directly; control frames go through their `Serialize`
//! impl.

use serde_json::{Map, Value, json};

use super::messages::{
    ControlFrame, InstrumentRow, RequestError, SubscriptionStatus, TableFrame, channel_symbol,
};
use crate::domain::streaming::{
    ControlAck, DataUpdate, DownstreamFrame, Operation, select_price,
};

// =============================================================================
// Errors
// =============================================================================

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON matching none of the known shapes.
    #[error("unrecognized frame shape")]
    UnrecognizedShape,

    /// A known shape whose fields could not be interpreted.
    #[error("malformed {shape} frame: {reason}")]
    Malformed {
        /// Shape that matched.
        shape: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

impl DecodeError {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::UnrecognizedShape => "unrecognized_shape",
            Self::Malformed { .. } => "malformed",
        }
    }
}

/// A decoded upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Banner, docs, or a table action the relay ignores.
    Noise,
    /// Acknowledgement (or rejection) of a control frame.
    Ack(ControlAck),
    /// Price updates, one per usable row.
    Data(Vec<DataUpdate>),
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode one upstream frame.
///
/// # Errors
///
/// Returns [`DecodeError`] for invalid JSON, an unrecognized shape, or a
/// recognized shape with unusable fields. None of these is fatal.
pub fn decode(payload: &[u8]) -> Result<Decoded, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::UnrecognizedShape);
    };

    if obj.get("success").is_some_and(Value::is_boolean) && obj.contains_key("request") {
        return decode_status(obj).map(Decoded::Ack);
    }

    if obj.contains_key("error") && obj.contains_key("request") {
        return decode_request_error(obj).map(Decoded::Ack);
    }

    if obj.contains_key("table") && obj.contains_key("action") && obj.contains_key("data") {
        return decode_table(obj);
    }

    if obj.contains_key("info") || obj.contains_key("docs") {
        return Ok(Decoded::Noise);
    }

    Err(DecodeError::UnrecognizedShape)
}

fn decode_status(obj: Map<String, Value>) -> Result<ControlAck, DecodeError> {
    let status: SubscriptionStatus =
        serde_json::from_value(Value::Object(obj)).map_err(|e| DecodeError::Malformed {
            shape: "acknowledgement",
            reason: e.to_string(),
        })?;

    let (operation, channel) = if let Some(channel) = status.subscribe {
        (Operation::Subscribe, Some(channel))
    } else if let Some(channel) = status.unsubscribe {
        (Operation::Unsubscribe, Some(channel))
    } else {
        let op = request_operation(status.request.op.as_deref(), "acknowledgement")?;
        (op, None)
    };

    let channel = channel
        .or_else(|| {
            status
                .request
                .args
                .as_ref()
                .and_then(|a| a.first())
                .map(str::to_string)
        })
        .ok_or_else(|| DecodeError::Malformed {
            shape: "acknowledgement",
            reason: "no channel".to_string(),
        })?;

    Ok(ControlAck {
        success: status.success,
        operation,
        requested_symbol: channel_symbol(&channel).to_string(),
    })
}

fn decode_request_error(obj: Map<String, Value>) -> Result<ControlAck, DecodeError> {
    let rejection: RequestError =
        serde_json::from_value(Value::Object(obj)).map_err(|e| DecodeError::Malformed {
            shape: "error",
            reason: e.to_string(),
        })?;

    tracing::debug!(
        status = ?rejection.status,
        error = %rejection.error,
        "Upstream rejected request"
    );

    let operation = request_operation(rejection.request.op.as_deref(), "error")?;
    let channel = rejection
        .request
        .args
        .as_ref()
        .and_then(|a| a.first())
        .ok_or_else(|| DecodeError::Malformed {
            shape: "error",
            reason: "no channel".to_string(),
        })?;

    Ok(ControlAck::rejected(operation, channel_symbol(channel)))
}

fn request_operation(op: Option<&str>, shape: &'static str) -> Result<Operation, DecodeError> {
    let op = op.ok_or_else(|| DecodeError::Malformed {
        shape,
        reason: "no operation".to_string(),
    })?;
    Operation::parse(op).ok_or_else(|| DecodeError::Malformed {
        shape,
        reason: format!("unsupported operation {op:?}"),
    })
}

fn decode_table(obj: Map<String, Value>) -> Result<Decoded, DecodeError> {
    let frame: TableFrame =
        serde_json::from_value(Value::Object(obj)).map_err(|e| DecodeError::Malformed {
            shape: "table",
            reason: e.to_string(),
        })?;

    if frame.action != "update" {
        tracing::trace!(table = %frame.table, action = %frame.action, "Ignoring table action");
        return Ok(Decoded::Noise);
    }

    let updates = frame
        .data
        .into_iter()
        .filter_map(|row| {
            let row: InstrumentRow = match serde_json::from_value(row) {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(table = %frame.table, error = %e, "Skipping malformed row");
                    return None;
                }
            };
            let (Some(symbol), Some(timestamp)) = (row.symbol, row.timestamp) else {
                tracing::warn!(table = %frame.table, "Skipping row without symbol or timestamp");
                return None;
            };
            Some(DataUpdate {
                symbol,
                timestamp,
                price: select_price(row.impact_ask_price, row.last_price, row.mark_price),
            })
        })
        .collect();

    Ok(Decoded::Data(updates))
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a frame for a downstream client.
#[must_use]
pub fn encode_downstream(frame: &DownstreamFrame) -> String {
    let value = match frame {
        DownstreamFrame::Data(update) => json!({
            "symbol": update.symbol,
            "timestamp": update.timestamp,
            "price": update.price,
        }),
        DownstreamFrame::Ack { success } => json!({ "success": success }),
        DownstreamFrame::Error { message } => json!({
            "success": false,
            "error": message,
        }),
    };
    value.to_string()
}

/// Encode an upstream control frame.
///
/// # Errors
///
/// Returns the serializer error if the frame cannot be written as JSON.
pub fn encode_control(frame: &ControlFrame) -> serde_json::Result<String> {
    serde_json::to_string(frame)
}

// =============================================================================
// Tests
// =============================================================================
