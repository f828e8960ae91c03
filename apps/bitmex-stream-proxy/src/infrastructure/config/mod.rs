//! Configuration Module
//!
//! Configuration loading for the proxy service.

mod settings;

pub use settings::{ConfigError, Environment, ProxyConfig, ServerSettings, UpstreamSettings};
