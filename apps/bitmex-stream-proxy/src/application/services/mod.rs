//! Application Services
//!
//! `StreamProxy` is the driver-side contract the HTTP layer talks to. It
//! turns downstream requests into registry transitions and upstream control
//! frames, and writes the immediate replies.
//!
//! Replies that depend on the upstream (subscribe/unsubscribe outcomes) are
//! written by the upstream read loop once the acknowledgement arrives.

use std::sync::Arc;

use serde::Deserialize;

use crate::application::ports::{ControlError, ControlPort, DownstreamSink};
use crate::domain::streaming::{DownstreamFrame, Operation};
use crate::domain::subscription::{
    ControlPlan, DownstreamId, FailureReason, SessionId, SessionRegistry, Symbol,
};
use crate::infrastructure::broadcast::FanoutRelay;
use crate::infrastructure::metrics;

// =============================================================================
// Client Requests
// =============================================================================

/// A downstream request body: `{"action": "...", "symbols": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRequest {
    /// `subscribe` or `unsubscribe`.
    pub action: String,
    /// Instrument symbols.
    #[serde(default)]
    pub symbols: Vec<String>,
}

// =============================================================================
// Stream Proxy
// =============================================================================

/// Downstream entry point of the relay.
pub struct StreamProxy {
    registry: Arc<SessionRegistry>,
    relay: Arc<FanoutRelay>,
    control: Arc<dyn ControlPort>,
}

impl std::fmt::Debug for StreamProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProxy")
            .field("relay", &self.relay)
            .field("sessions", &self.registry.stats())
            .finish_non_exhaustive()
    }
}

impl StreamProxy {
    /// Create a proxy over a relay and an upstream control port.
    #[must_use]
    pub fn new(relay: Arc<FanoutRelay>, control: Arc<dyn ControlPort>) -> Self {
        Self {
            registry: Arc::clone(relay.registry()),
            relay,
            control,
        }
    }

    /// The session registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The fan-out relay.
    #[must_use]
    pub const fn relay(&self) -> &Arc<FanoutRelay> {
        &self.relay
    }

    /// Register a newly connected downstream client.
    pub fn on_downstream_connected(&self, sink: Arc<dyn DownstreamSink>) -> DownstreamId {
        let handle = self.relay.attach(sink);
        tracing::info!(client = handle, "Downstream client connected");
        handle
    }

    /// Handle one message from a downstream client.
    ///
    /// Malformed requests are answered with an error frame; nothing a
    /// client sends can fail the relay.
    pub async fn on_downstream_message(&self, handle: DownstreamId, bytes: &[u8]) {
        let request: ClientRequest = match serde_json::from_slice(bytes) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(client = handle, error = %e, "Malformed downstream request");
                self.reply(handle, DownstreamFrame::error(format!("malformed request: {e}")));
                return;
            }
        };

        match Operation::parse(&request.action) {
            Some(Operation::Subscribe) => self.subscribe(handle, request.symbols).await,
            Some(Operation::Unsubscribe) => self.unsubscribe(handle, &request.symbols).await,
            None => {
                tracing::debug!(client = handle, action = %request.action, "Unknown action");
                self.reply(
                    handle,
                    DownstreamFrame::error(format!("unknown action: {}", request.action)),
                );
            }
        }
    }

    /// Clean up after a downstream client disconnects.
    ///
    /// Safe to call while acknowledgements for the client's sessions are
    /// still in flight.
    pub async fn on_downstream_closed(&self, handle: DownstreamId) {
        self.relay.detach(handle);
        let removals = self.registry.remove_handle(handle);
        tracing::info!(
            client = handle,
            sessions = removals.len(),
            "Downstream client disconnected"
        );

        let release: Vec<Symbol> = removals.into_iter().flat_map(|r| r.release).collect();
        self.release(release).await;
        metrics::set_sessions(self.registry.stats().sessions);
    }

    // =========================================================================
    // Requests
    // =========================================================================

    async fn subscribe(&self, handle: DownstreamId, symbols: Vec<String>) {
        let symbols: Vec<Symbol> = symbols
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let session = match self.registry.register(handle, symbols) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(client = handle, error = %e, "Subscribe rejected");
                self.reply(handle, DownstreamFrame::error(e.to_string()));
                return;
            }
        };

        match self.registry.mark_pending(session, Operation::Subscribe) {
            Ok(plan) => {
                tracing::info!(
                    client = handle,
                    session,
                    symbols = ?self.registry.symbols(session),
                    frames = plan.frames.len(),
                    "Subscribe requested"
                );
                self.execute(handle, plan).await;
            }
            Err(e) => {
                self.registry.remove(session);
                self.reply(handle, DownstreamFrame::error(e.to_string()));
            }
        }
        metrics::set_sessions(self.registry.stats().sessions);
    }

    async fn unsubscribe(&self, handle: DownstreamId, symbols: &[String]) {
        let sessions = self.registry.sessions_matching(handle, symbols);
        if sessions.is_empty() {
            self.reply(handle, DownstreamFrame::error("not subscribed"));
            return;
        }

        for session in sessions {
            // Only the named symbols stop; the rest of the session stays active.
            let planned = self
                .registry
                .split_off(session, symbols)
                .and_then(|target| self.registry.mark_pending(target, Operation::Unsubscribe));
            match planned {
                Ok(plan) => {
                    tracing::info!(
                        client = handle,
                        session = plan.session,
                        symbols = ?self.registry.symbols(plan.session),
                        frames = plan.frames.len(),
                        "Unsubscribe requested"
                    );
                    self.execute(handle, plan).await;
                }
                Err(e) => {
                    tracing::debug!(client = handle, session, error = %e, "Unsubscribe rejected");
                    self.reply(handle, DownstreamFrame::error(e.to_string()));
                }
            }
        }
        metrics::set_sessions(self.registry.stats().sessions);
    }

    /// Send the frames of a plan, or reply at once if it settled locally.
    async fn execute(&self, handle: DownstreamId, plan: ControlPlan) {
        if plan.is_settled() {
            self.reply(handle, DownstreamFrame::Ack { success: true });
            return;
        }

        for (sent, symbol) in plan.frames.iter().enumerate() {
            if let Err(e) = self.control.send_control(plan.operation, symbol).await {
                self.abort(handle, plan.session, &plan.frames[sent..], &e)
                    .await;
                return;
            }
        }
    }

    /// Fail a session whose frames could not all be sent.
    async fn abort(
        &self,
        handle: DownstreamId,
        session: SessionId,
        unsent: &[Symbol],
        error: &ControlError,
    ) {
        let reason = match error {
            ControlError::Lost => FailureReason::UpstreamLost,
            ControlError::Write(_) => FailureReason::UpstreamWrite,
        };
        tracing::warn!(client = handle, session, error = %error, "Control frame not sent");

        // Empty when already resolved elsewhere (for example by an upstream loss sweep).
        let removals = self.registry.fail_session(session, reason, unsent);
        let mut release = Vec::new();
        for removal in removals {
            self.reply(removal.outcome.handle, DownstreamFrame::Ack { success: false });
            release.extend(removal.release);
        }
        self.release(release).await;
    }

    async fn release(&self, symbols: Vec<Symbol>) {
        for symbol in symbols {
            if let Err(e) = self
                .control
                .send_control(Operation::Unsubscribe, &symbol)
                .await
            {
                tracing::debug!(symbol = %symbol, error = %e, "Release unsubscribe not sent");
            }
        }
    }

    fn reply(&self, handle: DownstreamId, frame: DownstreamFrame) {
        if let Err(e) = self.relay.notify(handle, &frame) {
            tracing::debug!(client = handle, kind = frame.kind(), error = %e, "Reply dropped");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::MockControlPort;
    use crate::domain::streaming::ControlAck;
    use crate::domain::subscription::AckResolution;
    use crate::infrastructure::broadcast::ChannelSink;

    struct Harness {
        proxy: StreamProxy,
        registry: Arc<SessionRegistry>,
    }

    fn harness(control: MockControlPort) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let relay = Arc::new(FanoutRelay::new(Arc::clone(&registry)));
        Harness {
            proxy: StreamProxy::new(relay, Arc::new(control)),
            registry,
        }
    }

    fn connect(proxy: &StreamProxy) -> (DownstreamId, mpsc::Receiver<DownstreamFrame>) {
        let (sink, rx) = ChannelSink::channel(16);
        (proxy.on_downstream_connected(Arc::new(sink)), rx)
    }

    fn accepting() -> MockControlPort {
        let mut control = MockControlPort::new();
        control.expect_send_control().returning(|_, _| Ok(()));
        control
    }

    #[tokio::test]
    async fn malformed_request_gets_error_frame() {
        let h = harness(MockControlPort::new());
        let (client, mut rx) = connect(&h.proxy);

        h.proxy.on_downstream_message(client, b"not json").await;

        let Ok(DownstreamFrame::Error { message }) = rx.try_recv() else {
            panic!("expected error frame");
        };
        assert!(message.starts_with("malformed request"));
    }

    #[tokio::test]
    async fn unknown_action_gets_error_frame() {
        let h = harness(MockControlPort::new());
        let (client, mut rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"ping","symbols":["XBTUSD"]}"#)
            .await;

        assert_eq!(
            rx.try_recv().unwrap(),
            DownstreamFrame::error("unknown action: ping")
        );
    }

    #[tokio::test]
    async fn empty_symbol_list_is_rejected() {
        let h = harness(MockControlPort::new());
        let (client, mut rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"subscribe","symbols":[" "]}"#)
            .await;

        assert!(matches!(rx.try_recv(), Ok(DownstreamFrame::Error { .. })));
        assert_eq!(h.registry.stats().sessions, 0);
    }

    #[tokio::test]
    async fn subscribe_sends_one_frame_per_symbol() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .with(eq(Operation::Subscribe), eq("ETHUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        control
            .expect_send_control()
            .with(eq(Operation::Subscribe), eq("XBTUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness(control);
        let (client, mut rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(
                client,
                br#"{"action":"subscribe","symbols":["XBTUSD","ETHUSD"]}"#,
            )
            .await;

        // The reply waits for the upstream acknowledgements.
        assert!(rx.try_recv().is_err());
        assert_eq!(h.registry.stats().pending, 1);
    }

    #[tokio::test]
    async fn subscribe_to_live_symbol_replies_immediately() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness(control);
        let (first, _first_rx) = connect(&h.proxy);
        let (second, mut second_rx) = connect(&h.proxy);

        let body = br#"{"action":"subscribe","symbols":["XBTUSD"]}"#;
        h.proxy.on_downstream_message(first, body).await;
        h.registry
            .resolve_ack(&ControlAck::accepted(Operation::Subscribe, "XBTUSD"));

        h.proxy.on_downstream_message(second, body).await;

        assert_eq!(
            second_rx.try_recv().unwrap(),
            DownstreamFrame::Ack { success: true }
        );
        assert_eq!(h.registry.subscribers_of("XBTUSD").len(), 2);
    }

    #[tokio::test]
    async fn overlapping_subscribe_is_rejected() {
        let h = harness(accepting());
        let (client, mut rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"subscribe","symbols":["XBTUSD"]}"#)
            .await;
        h.proxy
            .on_downstream_message(client, br#"{"action":"subscribe","symbols":["XBTUSD"]}"#)
            .await;

        assert!(matches!(rx.try_recv(), Ok(DownstreamFrame::Error { .. })));
        assert_eq!(h.registry.stats().sessions, 1);
    }

    #[tokio::test]
    async fn send_failure_fails_session_with_negative_ack() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .returning(|_, _| Err(ControlError::Lost));
        let h = harness(control);
        let (client, mut rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"subscribe","symbols":["XBTUSD"]}"#)
            .await;

        assert_eq!(
            rx.try_recv().unwrap(),
            DownstreamFrame::Ack { success: false }
        );
        assert_eq!(h.registry.stats().sessions, 0);
        // Nothing was sent, so nothing is awaited.
        assert_eq!(h.registry.stats().detached, 0);
    }

    #[tokio::test]
    async fn unsubscribe_without_session_is_error() {
        let h = harness(MockControlPort::new());
        let (client, mut rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"unsubscribe","symbols":["XBTUSD"]}"#)
            .await;

        assert_eq!(rx.try_recv().unwrap(), DownstreamFrame::error("not subscribed"));
    }

    #[tokio::test]
    async fn unsubscribe_while_pending_is_invalid_transition() {
        let h = harness(accepting());
        let (client, mut rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"subscribe","symbols":["XBTUSD"]}"#)
            .await;
        h.proxy
            .on_downstream_message(client, br#"{"action":"unsubscribe","symbols":["XBTUSD"]}"#)
            .await;

        assert!(matches!(rx.try_recv(), Ok(DownstreamFrame::Error { .. })));
        assert_eq!(h.registry.stats().pending, 1);
    }

    #[tokio::test]
    async fn unsubscribe_sends_frame_for_last_holder() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .with(eq(Operation::Subscribe), eq("XBTUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        control
            .expect_send_control()
            .with(eq(Operation::Unsubscribe), eq("XBTUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness(control);
        let (client, _rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"subscribe","symbols":["XBTUSD"]}"#)
            .await;
        h.registry
            .resolve_ack(&ControlAck::accepted(Operation::Subscribe, "XBTUSD"));
        h.proxy
            .on_downstream_message(client, br#"{"action":"unsubscribe","symbols":[]}"#)
            .await;

        assert_eq!(h.registry.stats().unsubscribing, 1);
        assert!(matches!(
            h.registry
                .resolve_ack(&ControlAck::accepted(Operation::Unsubscribe, "XBTUSD")),
            AckResolution::Resolved { .. }
        ));
    }

    #[tokio::test]
    async fn partial_unsubscribe_keeps_other_symbols() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .with(eq(Operation::Subscribe), mockall::predicate::always())
            .times(2)
            .returning(|_, _| Ok(()));
        control
            .expect_send_control()
            .with(eq(Operation::Unsubscribe), eq("XBTUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness(control);
        let (client, _rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(
                client,
                br#"{"action":"subscribe","symbols":["XBTUSD","ETHUSD"]}"#,
            )
            .await;
        for symbol in ["ETHUSD", "XBTUSD"] {
            h.registry
                .resolve_ack(&ControlAck::accepted(Operation::Subscribe, symbol));
        }
        h.proxy
            .on_downstream_message(client, br#"{"action":"unsubscribe","symbols":["XBTUSD"]}"#)
            .await;

        assert_eq!(h.registry.subscribers_of("ETHUSD").len(), 1);
        assert!(h.registry.subscribers_of("XBTUSD").is_empty());
        assert_eq!(h.registry.stats().unsubscribing, 1);
    }

    #[tokio::test]
    async fn concurrent_subscribe_waits_without_a_frame() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .with(eq(Operation::Subscribe), eq("XBTUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness(control);
        let (first, _first_rx) = connect(&h.proxy);
        let (second, mut second_rx) = connect(&h.proxy);

        let body = br#"{"action":"subscribe","symbols":["XBTUSD"]}"#;
        h.proxy.on_downstream_message(first, body).await;
        h.proxy.on_downstream_message(second, body).await;

        // No immediate reply; the second client settles with the first.
        assert!(second_rx.try_recv().is_err());
        assert_eq!(h.registry.stats().pending, 2);
    }

    #[tokio::test]
    async fn send_failure_fails_followers_of_unsent_frame() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .returning(|_, _| Err(ControlError::Lost));
        let h = harness(control);
        let (first, mut first_rx) = connect(&h.proxy);
        let (second, mut second_rx) = connect(&h.proxy);

        // The follower registers between planning and sending by the leader.
        let leader = h.registry.register(first, ["XBTUSD".to_string()]).unwrap();
        let plan = h.registry.mark_pending(leader, Operation::Subscribe).unwrap();
        h.proxy
            .on_downstream_message(second, br#"{"action":"subscribe","symbols":["XBTUSD"]}"#)
            .await;
        assert!(second_rx.try_recv().is_err());

        h.proxy.execute(first, plan).await;

        assert_eq!(
            first_rx.try_recv().unwrap(),
            DownstreamFrame::Ack { success: false }
        );
        assert_eq!(
            second_rx.try_recv().unwrap(),
            DownstreamFrame::Ack { success: false }
        );
        assert_eq!(h.registry.stats().sessions, 0);
    }

    #[tokio::test]
    async fn close_releases_unheld_symbols() {
        let mut control = MockControlPort::new();
        control
            .expect_send_control()
            .with(eq(Operation::Subscribe), eq("XBTUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        control
            .expect_send_control()
            .with(eq(Operation::Unsubscribe), eq("XBTUSD"))
            .times(1)
            .returning(|_, _| Ok(()));
        let h = harness(control);
        let (client, _rx) = connect(&h.proxy);

        h.proxy
            .on_downstream_message(client, br#"{"action":"subscribe","symbols":["XBTUSD"]}"#)
            .await;
        h.proxy.on_downstream_closed(client).await;

        assert_eq!(h.registry.stats().sessions, 0);
        assert_eq!(h.proxy.relay().client_count(), 0);

        // The in-flight subscribe ack is absorbed, not an error.
        assert_eq!(
            h.registry
                .resolve_ack(&ControlAck::accepted(Operation::Subscribe, "XBTUSD")),
            AckResolution::Absorbed
        );
    }
}
