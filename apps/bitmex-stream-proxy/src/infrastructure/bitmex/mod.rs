//! BitMEX WebSocket Adapter
//!
//! Implements the upstream side of the relay on BitMEX's realtime API:
//!
//! - **messages**: Wire types for control frames, acks and table pushes
//! - **codec**: Frame decoding and encoding (JSON)
//! - **classifier**: Handshake skipping and shape-first frame dispatch
//! - **connection**: The shared upstream connection and its read loop
//! - **heartbeat**: Ping-based liveness monitoring

pub mod classifier;
pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod messages;

pub use classifier::{HANDSHAKE_FRAMES, OrdinalClassifier, RawFrame};
pub use codec::{DecodeError, Decoded, decode, encode_control, encode_downstream};
pub use connection::{ConnectionState, FeedState, UpstreamConfig, UpstreamError, UpstreamManager};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::{ControlFrame, channel_name, channel_symbol};
