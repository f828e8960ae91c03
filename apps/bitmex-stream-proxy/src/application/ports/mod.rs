//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ControlPort`: Sends subscribe/unsubscribe control frames upstream
//! - `DownstreamSink`: Writes a frame to one downstream client

use async_trait::async_trait;

use crate::domain::streaming::{DownstreamFrame, Operation};

// =============================================================================
// Errors
// =============================================================================

/// Failure to send an upstream control frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// The write to the upstream socket failed.
    #[error("upstream write failed: {0}")]
    Write(String),

    /// There is no live upstream connection.
    #[error("upstream connection lost")]
    Lost,
}

/// Failure to write a frame to a downstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The client connection is gone.
    #[error("downstream sink closed")]
    Closed,

    /// The client is not draining its queue.
    #[error("downstream sink full")]
    Full,
}

// =============================================================================
// Ports
// =============================================================================

/// Sends control frames over the shared upstream connection.
///
/// Implementations serialize concurrent callers so frames never interleave.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPort: Send + Sync {
    /// Send one control frame for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Lost`] without a live connection and
    /// [`ControlError::Write`] if the socket write fails.
    async fn send_control(&self, operation: Operation, symbol: &str) -> Result<(), ControlError>;
}

/// Writes frames to a single downstream client.
///
/// `send` must not block: fan-out calls it from the upstream read loop.
#[cfg_attr(test, mockall::automock)]
pub trait DownstreamSink: Send + Sync {
    /// Queue a frame for the client.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the frame cannot be queued.
    fn send(&self, frame: &DownstreamFrame) -> Result<(), SinkError>;
}
