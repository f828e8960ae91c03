#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! BitMEX Stream Proxy - Market Data Multiplexer
//!
//! A WebSocket relay that keeps one connection to the BitMEX realtime feed
//! and multiplexes instrument prices to many downstream clients. The
//! upstream protocol carries no request identifiers, so acknowledgements
//! are matched to the requesting session by arrival order and shape.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core relay types and state
//!   - `streaming`: Operations, acknowledgements, price updates
//!   - `subscription`: Session registry and acknowledgement correlation
//!
//! - **Application**: Ports and the downstream contract
//!   - `ports`: Upstream control port, downstream sink
//!   - `services`: `StreamProxy` (connect, message, close)
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `bitmex`: Codec, classifier and the upstream connection manager
//!   - `broadcast`: Fan-out relay and bounded client queues
//!   - `websocket`: Downstream WebSocket endpoint
//!   - `config`: Configuration loading
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                     ┌──────────────┐  control   ┌─────────────┐
//! Client 1 ──────────►│              │───────────►│             │
//! Client 2 ──────────►│ StreamProxy  │            │  Upstream   │◄──► BitMEX WS
//! Client N ──────────►│              │            │  Manager    │
//!                     └──────┬───────┘            └──────┬──────┘
//!                            │   ┌────────────────┐      │ acks / data
//!                            └──►│ SessionRegistry│◄─────┤
//!                                └────────────────┘      ▼
//! Client 1 ◄──┐                  ┌────────────────┐
//! Client 2 ◄──┼──────────────────│  FanoutRelay   │
//! Client N ◄──┘                  └────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no I/O.
pub mod domain;

/// Application layer - Ports and the downstream contract.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{
    ABSENT_PRICE, ControlAck, DataUpdate, DownstreamFrame, Operation, select_price,
};
pub use domain::subscription::{
    AckResolution, ControlPlan, DownstreamId, FailureReason, RegistryError, RegistryStats,
    SessionId, SessionOutcome, SessionRegistry, SessionState, Symbol,
};

// Ports and services
pub use application::ports::{ControlError, ControlPort, DownstreamSink, SinkError};
pub use application::services::StreamProxy;

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Environment, ProxyConfig, ServerSettings, UpstreamSettings,
};

// Upstream adapter
pub use infrastructure::bitmex::{
    ConnectionState, FeedState, UpstreamConfig, UpstreamError, UpstreamManager,
};

// Fan-out relay
pub use infrastructure::broadcast::{ChannelSink, DeliveryReport, FanoutRelay};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::websocket::{ServerError, WebSocketServer};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
