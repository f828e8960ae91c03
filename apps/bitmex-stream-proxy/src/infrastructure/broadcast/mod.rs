//! Fan-out Relay
//!
//! Delivers translated price updates to every downstream client with an
//! `Active` session for the update's symbol, and carries acknowledgement
//! and error frames to individual clients.
//!
//! # Architecture
//!
//! The relay keeps a directory of connected downstream clients, each
//! represented by a [`DownstreamSink`]. Subscriber lookup goes through the
//! [`SessionRegistry`] symbol index. A failed write to one client is logged,
//! the affected session is removed, and delivery continues to the others.
//!
//! [`ChannelSink`] is the production sink: a bounded `mpsc` queue drained
//! by the client's socket writer task. A full queue counts as a failed
//! write so a stalled client never stalls the upstream read loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::application::ports::{DownstreamSink, SinkError};
use crate::domain::streaming::{DataUpdate, DownstreamFrame};
use crate::domain::subscription::{DownstreamId, SessionRegistry, Symbol};
use crate::infrastructure::metrics;

// =============================================================================
// Channel Sink
// =============================================================================

/// Bounded-channel [`DownstreamSink`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DownstreamFrame>,
}

impl ChannelSink {
    /// Create a sink and the receiver its writer task drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DownstreamFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl DownstreamSink for ChannelSink {
    fn send(&self, frame: &DownstreamFrame) -> Result<(), SinkError> {
        self.tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

// =============================================================================
// Delivery Report
// =============================================================================

/// Result of delivering one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Clients the update was written to.
    pub delivered: usize,
    /// Clients whose write failed; their sessions were removed.
    pub failed: Vec<DownstreamId>,
    /// Symbols left without a holder by those removals.
    pub release: Vec<Symbol>,
}

// =============================================================================
// Fan-out Relay
// =============================================================================

/// Directory of downstream clients plus per-symbol fan-out.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use bitmex_stream_proxy::infrastructure::broadcast::{ChannelSink, FanoutRelay};
/// use bitmex_stream_proxy::domain::subscription::SessionRegistry;
///
/// let relay = FanoutRelay::new(Arc::new(SessionRegistry::new()));
/// let (sink, _rx) = ChannelSink::channel(16);
///
/// let handle = relay.attach(Arc::new(sink));
/// assert_eq!(relay.client_count(), 1);
///
/// relay.detach(handle);
/// assert_eq!(relay.client_count(), 0);
/// ```
pub struct FanoutRelay {
    registry: Arc<SessionRegistry>,
    clients: RwLock<HashMap<DownstreamId, Arc<dyn DownstreamSink>>>,
    next_client: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for FanoutRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutRelay")
            .field("clients", &self.client_count())
            .field("delivered", &self.delivered.load(Ordering::Relaxed))
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl FanoutRelay {
    /// Create a relay over a session registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            clients: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// The registry subscriber lookups go through.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Add a downstream client and return its handle.
    pub fn attach(&self, sink: Arc<dyn DownstreamSink>) -> DownstreamId {
        let handle = self.next_client.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut clients = self.clients.write();
            clients.insert(handle, sink);
            clients.len()
        };
        metrics::set_downstream_clients(count);
        handle
    }

    /// Remove a downstream client. Returns `false` if it was unknown.
    pub fn detach(&self, handle: DownstreamId) -> bool {
        let (removed, count) = {
            let mut clients = self.clients.write();
            (clients.remove(&handle).is_some(), clients.len())
        };
        metrics::set_downstream_clients(count);
        removed
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Updates written since startup.
    #[must_use]
    pub fn delivered_total(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Failed writes since startup.
    #[must_use]
    pub fn failures_total(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Write a frame to a single client.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] for an unknown handle, or whatever the
    /// client's sink reports.
    pub fn notify(&self, handle: DownstreamId, frame: &DownstreamFrame) -> Result<(), SinkError> {
        let sink = self.clients.read().get(&handle).cloned();
        let Some(sink) = sink else {
            return Err(SinkError::Closed);
        };
        sink.send(frame)
    }

    /// Fan an update out to every active subscriber of its symbol.
    ///
    /// Write failures are isolated: the failing session is removed and the
    /// remaining subscribers still receive the update.
    pub fn deliver(&self, update: &DataUpdate) -> DeliveryReport {
        let start = Instant::now();
        let subscribers = self.registry.subscribers_of(&update.symbol);
        let mut report = DeliveryReport::default();

        if subscribers.is_empty() {
            tracing::trace!(symbol = %update.symbol, "No subscribers for update");
            return report;
        }

        let frame = DownstreamFrame::Data(update.clone());
        let sinks: Vec<_> = {
            let clients = self.clients.read();
            subscribers
                .iter()
                .map(|s| (*s, clients.get(&s.handle).cloned()))
                .collect()
        };

        for (subscriber, sink) in sinks {
            let result = sink.map_or(Err(SinkError::Closed), |sink| sink.send(&frame));
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        client = subscriber.handle,
                        session = subscriber.session,
                        symbol = %update.symbol,
                        error = %e,
                        "Downstream write failed, removing session"
                    );
                    report.failed.push(subscriber.handle);
                    if let Some(removal) = self.registry.remove(subscriber.session) {
                        report.release.extend(removal.release);
                    }
                }
            }
        }

        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        metrics::record_updates_delivered(report.delivered as u64);
        if !report.failed.is_empty() {
            metrics::record_delivery_failures(report.failed.len() as u64);
        }
        metrics::record_fanout_duration(start.elapsed());

        report
    }
}

// =============================================================================
// Tests
// =============================================================================
