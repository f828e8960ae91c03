//! Upstream Connection Manager
//!
//! Owns the single BitMEX WebSocket shared by every downstream client.
//!
//! # Protocol
//!
//! - Production: `wss://ws.bitmex.com/realtime`
//! - Testnet: `wss://ws.testnet.bitmex.com/realtime`
//!
//! The socket is split on attach. The write half sits behind an async mutex
//! so concurrent control frames never interleave; the read half belongs to
//! one read-loop task that classifies every frame and dispatches it to the
//! session registry or the fan-out relay. Nothing in the read loop awaits a
//! socket write: pongs, pings and release frames are written from spawned
//! tasks.
//!
//! When the connection ends (close frame, stream end, read or write error,
//! heartbeat timeout) every session is failed or cleared and notified. The
//! manager does not reconnect.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::classifier::OrdinalClassifier;
use super::codec::{self, Decoded};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::ControlFrame;
use crate::UpstreamSettings;
use crate::application::ports::{ControlError, ControlPort};
use crate::domain::streaming::{ControlAck, DownstreamFrame, Operation};
use crate::domain::subscription::{
    AckResolution, FailureReason, SessionRegistry, SessionState, Symbol,
};
use crate::infrastructure::broadcast::FanoutRelay;
use crate::infrastructure::metrics::{self, AckOutcome, FrameKind};

/// Boxed write half of the upstream socket.
type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Interval of the acknowledgement timeout sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Error Type
// =============================================================================

/// Errors establishing the upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// WebSocket handshake failed.
    #[error("WebSocket connection failed: {0}")]
    Connect(#[from] WsError),

    /// A connection is already live or being established.
    #[error("upstream connection already {0}")]
    AlreadyConnected(&'static str),
}

// =============================================================================
// Connection State
// =============================================================================

/// Process-wide upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No live connection.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected and reading.
    Connected,
}

impl ConnectionState {
    /// State name for health responses.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Shared view of the upstream feed for health reporting.
#[derive(Debug, Default)]
pub struct FeedState {
    state: RwLock<ConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
}

impl FeedState {
    /// Set the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            *self.last_error.write() = None;
        }
        metrics::set_upstream_connected(state == ConnectionState::Connected);
    }

    /// Record why the connection failed.
    pub fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn get_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// When the current or last connection was established.
    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.last_connected_at.read()
    }

    /// Last connection error, cleared on connect.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Frames received since startup.
    #[must_use]
    pub fn get_frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Frames that failed to decode since startup.
    #[must_use]
    pub fn get_decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    fn increment_frames(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the upstream manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// WebSocket URL.
    pub url: String,
    /// Data table; control frames target `<table>:<SYMBOL>`.
    pub table: String,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Acknowledgement timeout (`None` = wait forever).
    pub ack_timeout: Option<Duration>,
}

impl UpstreamConfig {
    /// Create a configuration with default heartbeat and ack timeout.
    #[must_use]
    pub fn new(url: impl Into<String>, table: impl Into<String>) -> Self {
        let defaults = UpstreamSettings::default();
        Self {
            url: url.into(),
            table: table.into(),
            heartbeat: HeartbeatConfig::from_upstream_settings(&defaults),
            ack_timeout: defaults.ack_timeout,
        }
    }
}

impl From<&UpstreamSettings> for UpstreamConfig {
    fn from(settings: &UpstreamSettings) -> Self {
        Self {
            url: settings.url.clone(),
            table: settings.table.clone(),
            heartbeat: HeartbeatConfig::from_upstream_settings(settings),
            ack_timeout: settings.ack_timeout,
        }
    }
}

// =============================================================================
// Upstream Manager
// =============================================================================

/// Single owner of the upstream socket.
pub struct UpstreamManager {
    config: UpstreamConfig,
    registry: Arc<SessionRegistry>,
    relay: Arc<FanoutRelay>,
    feed: Arc<FeedState>,
    writer: Mutex<Option<WsSink>>,
    connection: parking_lot::Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UpstreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamManager")
            .field("config", &self.config)
            .field("state", &self.feed.get_state())
            .finish_non_exhaustive()
    }
}

impl UpstreamManager {
    /// Create a disconnected manager. `cancel` stops any connection it owns.
    #[must_use]
    pub fn new(config: UpstreamConfig, relay: Arc<FanoutRelay>, cancel: CancellationToken) -> Self {
        Self {
            config,
            registry: Arc::clone(relay.registry()),
            relay,
            feed: Arc::new(FeedState::default()),
            writer: Mutex::new(None),
            connection: parking_lot::Mutex::new(None),
            cancel,
        }
    }

    /// Shared feed state for health reporting.
    #[must_use]
    pub fn feed_state(&self) -> Arc<FeedState> {
        Arc::clone(&self.feed)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.feed.get_state()
    }

    /// Connect to the configured URL and start the read loop.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::AlreadyConnected`] if a connection exists and
    /// [`UpstreamError::Connect`] if the handshake fails. The manager stays
    /// `Disconnected` after a failure.
    pub async fn connect(self: &Arc<Self>) -> Result<JoinHandle<()>, UpstreamError> {
        {
            let mut state = self.feed.state.write();
            if *state != ConnectionState::Disconnected {
                return Err(UpstreamError::AlreadyConnected(state.as_str()));
            }
            *state = ConnectionState::Connecting;
        }

        tracing::info!(url = %self.config.url, "Connecting to BitMEX realtime API");

        match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
            Ok((ws_stream, _response)) => {
                let (write, read) = ws_stream.split();
                Ok(self.attach(write, read).await)
            }
            Err(e) => {
                tracing::error!(url = %self.config.url, error = %e, "Upstream connection failed");
                self.feed.set_error(e.to_string());
                self.feed.set_state(ConnectionState::Disconnected);
                Err(e.into())
            }
        }
    }

    /// Attach an established sink/stream pair and start the read loop.
    pub async fn attach<W, R>(self: &Arc<Self>, sink: W, stream: R) -> JoinHandle<()>
    where
        W: Sink<Message, Error = WsError> + Send + 'static,
        R: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
    {
        *self.writer.lock().await = Some(Box::pin(sink));

        let connection = self.cancel.child_token();
        *self.connection.lock() = Some(connection.clone());
        self.feed.set_state(ConnectionState::Connected);
        tracing::info!(table = %self.config.table, "Upstream connected");

        tokio::spawn(Arc::clone(self).read_loop(stream, connection))
    }

    /// Close the current connection, if any.
    pub fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().as_ref() {
            connection.cancel();
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn write(&self, message: Message) -> Result<(), ControlError> {
        let result = {
            let mut writer = self.writer.lock().await;
            let sink = writer.as_mut().ok_or(ControlError::Lost)?;
            sink.send(message).await
        };

        result.map_err(|e| {
            tracing::warn!(error = %e, "Upstream write failed");
            self.feed.set_error(e.to_string());
            self.disconnect();
            ControlError::Write(e.to_string())
        })
    }

    fn spawn_write(self: &Arc<Self>, message: Message) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.write(message).await {
                tracing::debug!(error = %e, "Dropped upstream write");
            }
        });
    }

    /// Unsubscribe symbols nobody holds any more.
    fn spawn_release(self: &Arc<Self>, symbols: Vec<Symbol>) {
        if symbols.is_empty() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            for symbol in symbols {
                if let Err(e) = this.send_control(Operation::Unsubscribe, &symbol).await {
                    tracing::debug!(symbol = %symbol, error = %e, "Release unsubscribe not sent");
                }
            }
        });
    }

    // =========================================================================
    // Read Loop
    // =========================================================================

    async fn read_loop<R>(self: Arc<Self>, mut stream: R, connection: CancellationToken)
    where
        R: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
    {
        let mut classifier = OrdinalClassifier::new();

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(10);
        let heartbeat_cancel = connection.child_token();
        let heartbeat_manager = HeartbeatManager::new(
            self.config.heartbeat,
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            heartbeat_cancel.clone(),
        );
        let _heartbeat_handle = tokio::spawn(heartbeat_manager.run());

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let sweeping = self.config.ack_timeout.is_some();

        let reason = loop {
            tokio::select! {
                () = connection.cancelled() => break "cancelled",
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => {
                            heartbeat_state.mark_ping_sent();
                            self.spawn_write(Message::Ping(Vec::<u8>::new().into()));
                        }
                        Some(HeartbeatEvent::Timeout) => break "heartbeat timeout",
                        None => {
                            tracing::debug!("Heartbeat channel closed");
                        }
                    }
                }
                _ = sweep.tick(), if sweeping => self.sweep_expired(),
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat_state.record_activity();
                            self.handle_payload(&mut classifier, text.as_str().as_bytes());
                        }
                        Some(Ok(Message::Binary(data))) => {
                            heartbeat_state.record_activity();
                            self.handle_payload(&mut classifier, &data);
                        }
                        Some(Ok(Message::Pong(_))) => heartbeat_state.record_activity(),
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_state.record_activity();
                            self.spawn_write(Message::Pong(data));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "Upstream sent close frame");
                            break "closed by upstream";
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Upstream read failed");
                            self.feed.set_error(e.to_string());
                            break "read error";
                        }
                        None => break "stream ended",
                    }
                }
            }
        };

        heartbeat_cancel.cancel();
        self.teardown(reason, classifier.received()).await;
    }

    fn handle_payload(self: &Arc<Self>, classifier: &mut OrdinalClassifier, payload: &[u8]) {
        self.feed.increment_frames();
        let (ordinal, decoded) = classifier.next(payload);

        match decoded {
            Ok(Decoded::Noise) => {
                metrics::record_frame_received(FrameKind::Noise);
                tracing::trace!(ordinal, "Noise frame");
            }
            Ok(Decoded::Ack(ack)) => {
                metrics::record_frame_received(FrameKind::Ack);
                self.handle_ack(ordinal, &ack);
            }
            Ok(Decoded::Data(updates)) => {
                metrics::record_frame_received(FrameKind::Data);
                for update in &updates {
                    let report = self.relay.deliver(update);
                    self.spawn_release(report.release);
                }
            }
            Err(e) => {
                self.feed.increment_decode_errors();
                metrics::record_decode_error(e.reason());
                tracing::warn!(ordinal, error = %e, "Dropping undecodable upstream frame");
            }
        }
    }

    fn handle_ack(self: &Arc<Self>, ordinal: u64, ack: &ControlAck) {
        let resolution = self.registry.resolve_ack(ack);
        match &resolution {
            AckResolution::Resolved { .. } => metrics::record_ack(AckOutcome::Resolved),
            AckResolution::Progress {
                session, remaining, ..
            } => {
                metrics::record_ack(AckOutcome::Progress);
                tracing::debug!(ordinal, session, remaining, "Acknowledgement progress");
            }
            AckResolution::Absorbed => {
                metrics::record_ack(AckOutcome::Absorbed);
                tracing::debug!(
                    ordinal,
                    op = %ack.operation,
                    symbol = %ack.requested_symbol,
                    "Acknowledgement for a departed session"
                );
            }
            AckResolution::Unmatched => {
                metrics::record_ack(AckOutcome::Unmatched);
                tracing::warn!(
                    ordinal,
                    op = %ack.operation,
                    symbol = %ack.requested_symbol,
                    success = ack.success,
                    "Acknowledgement matched no outstanding request"
                );
            }
        }

        for removal in resolution.settled() {
            let outcome = removal.outcome;
            let success = !matches!(outcome.state, SessionState::Failed(_));
            tracing::info!(
                ordinal,
                session = outcome.session,
                client = outcome.handle,
                op = %ack.operation,
                symbol = %ack.requested_symbol,
                state = ?outcome.state,
                "Control operation resolved"
            );
            self.notify(outcome.handle, &DownstreamFrame::Ack { success });
            self.spawn_release(removal.release);
        }
        metrics::set_sessions(self.registry.stats().sessions);
    }

    fn sweep_expired(self: &Arc<Self>) {
        let Some(timeout) = self.config.ack_timeout else {
            return;
        };
        for removal in self.registry.expire(Instant::now(), timeout) {
            tracing::warn!(
                session = removal.outcome.session,
                client = removal.outcome.handle,
                timeout_secs = timeout.as_secs(),
                "Acknowledgement timed out"
            );
            self.notify(removal.outcome.handle, &DownstreamFrame::Ack { success: false });
            self.spawn_release(removal.release);
        }
    }

    fn notify(&self, handle: u64, frame: &DownstreamFrame) {
        if let Err(e) = self.relay.notify(handle, frame) {
            tracing::debug!(client = handle, kind = frame.kind(), error = %e, "Notification dropped");
        }
    }

    async fn teardown(&self, reason: &'static str, frames: u64) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        *self.connection.lock() = None;
        self.feed.set_state(ConnectionState::Disconnected);

        let outcomes = self.registry.fail_all(FailureReason::UpstreamLost);
        let lost = DownstreamFrame::error("upstream connection lost");
        for outcome in &outcomes {
            match outcome.state {
                SessionState::Failed(_) => {
                    self.notify(outcome.handle, &DownstreamFrame::Ack { success: false });
                }
                _ => self.notify(outcome.handle, &lost),
            }
        }
        metrics::set_sessions(0);

        if self.cancel.is_cancelled() {
            tracing::info!(frames, "Upstream connection closed");
        } else {
            tracing::warn!(
                reason,
                frames,
                sessions = outcomes.len(),
                "Upstream connection lost"
            );
        }
    }
}

#[async_trait]
impl ControlPort for UpstreamManager {
    async fn send_control(&self, operation: Operation, symbol: &str) -> Result<(), ControlError> {
        if self.feed.get_state() != ConnectionState::Connected {
            metrics::record_control_frame(operation, false);
            return Err(ControlError::Lost);
        }

        let frame = ControlFrame::new(operation, &self.config.table, symbol);
        tracing::debug!(op = %operation, channel = %frame.args, "Sending control frame");

        let text = codec::encode_control(&frame).map_err(|e| {
            metrics::record_control_frame(operation, false);
            ControlError::Write(e.to_string())
        })?;
        let result = self.write(Message::Text(text.into())).await;
        metrics::record_control_frame(operation, result.is_ok());
        result
    }
}

// =============================================================================
// Tests
// =============================================================================
