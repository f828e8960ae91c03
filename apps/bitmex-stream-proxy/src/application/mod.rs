//! Application Layer - Ports and the downstream contract.
//!
//! Defines the traits the relay core writes through and the service the
//! HTTP layer drives when clients connect, send requests and disconnect.

/// Port interfaces for upstream control frames and downstream sinks.
pub mod ports;

/// The stream proxy service.
pub mod services;
