//! Domain Layer - Relay types and session bookkeeping.
//!
//! Pure Rust with serialization support and no I/O. The session registry
//! holds all state shared between the downstream handlers and the
//! upstream read loop.

/// Control operations, acknowledgements and price updates.
pub mod streaming;

/// Session registry and acknowledgement correlation.
pub mod subscription;
