//! Session Registry
//!
//! Tracks downstream subscription sessions and correlates upstream control
//! acknowledgements back to the session that requested them.
//!
//! # Design
//!
//! The upstream feed multiplexes acknowledgements and data on one ordered
//! stream without request ids. Every control frame the relay sends is
//! recorded here as an outstanding entry with a global issue sequence. An
//! acknowledgement for `(operation, symbol)` consumes the oldest matching
//! entry, whichever session owns it.
//!
//! Entries can outlive their session: when a session is removed or fails
//! while frames are in flight, those entries stay behind as detached
//! tombstones so a late acknowledgement is absorbed instead of resolving an
//! unrelated session. Release frames (unsubscribes sent after the last
//! holder of a symbol goes away) are recorded the same way.
//!
//! Session lifecycle:
//!
//! ```text
//! Idle ──subscribe──► Pending ──ack──► Active ──unsubscribe──► Unsubscribing ──ack──► Closed
//!                        │                                          │
//!                        └──────────────► Failed ◄──────────────────┘
//! ```
//!
//! Symbols stay subscribed upstream while any `Pending` or `Active` session
//! holds them, so several clients can share one upstream subscription.
//!
//! A subscribe for a symbol that another session is still awaiting sends no
//! frame. The later session follows the earlier one's entry instead and
//! settles with it: `Active` on success, `Failed` on rejection. When the
//! awaiting session goes away first, its entry passes to the oldest follower.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use super::streaming::{ControlAck, Operation};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscription session.
pub type SessionId = u64;

/// Opaque handle to a downstream client connection.
pub type DownstreamId = u64;

/// An instrument symbol, e.g. `XBTUSD`.
pub type Symbol = String;

/// Why a session ended in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The upstream answered `success: false`.
    SubscriptionRejected,
    /// The upstream connection was lost while the session awaited an ack.
    UpstreamLost,
    /// A control frame could not be written upstream.
    UpstreamWrite,
    /// No acknowledgement arrived within the configured timeout.
    AckTimeout,
}

impl FailureReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SubscriptionRejected => "subscription_rejected",
            Self::UpstreamLost => "upstream_lost",
            Self::UpstreamWrite => "upstream_write",
            Self::AckTimeout => "ack_timeout",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered; no control frame issued yet.
    Idle,
    /// Subscribe frames in flight.
    Pending,
    /// Subscribed; receives data for its symbols.
    Active,
    /// Unsubscribe frames in flight.
    Unsubscribing,
    /// Unsubscribed or cleared. Terminal.
    Closed,
    /// Failed. Terminal.
    Failed(FailureReason),
}

impl SessionState {
    /// Whether the session has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    /// Whether the session keeps its symbols subscribed upstream.
    const fn holds_upstream(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The downstream handle already has a live session for this symbol.
    #[error("downstream {handle} is already subscribed to {symbol}")]
    AlreadySubscribed {
        /// Downstream handle.
        handle: DownstreamId,
        /// First overlapping symbol.
        symbol: Symbol,
    },

    /// The requested operation is not allowed in the session's state.
    #[error("session {session} cannot {operation} while {state:?}")]
    InvalidTransition {
        /// Session id.
        session: SessionId,
        /// Current state.
        state: SessionState,
        /// Requested operation.
        operation: Operation,
    },

    /// The session does not exist (never registered or already removed).
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// A session needs at least one symbol.
    #[error("symbol set is empty")]
    EmptySymbols,
}

/// Upstream frames required by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlan {
    /// Session that requested the transition.
    pub session: SessionId,
    /// Operation being applied.
    pub operation: Operation,
    /// Symbols that need a control frame, in send order.
    pub frames: Vec<Symbol>,
    /// Session state after planning.
    pub state: SessionState,
}

impl ControlPlan {
    /// Whether the transition completed without waiting on the upstream.
    ///
    /// A plan with no frames can still be unsettled when the session follows
    /// another session's in-flight subscribe.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Closed)
    }
}

/// A session that reached a terminal or active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Session id.
    pub session: SessionId,
    /// Owning downstream handle.
    pub handle: DownstreamId,
    /// New state.
    pub state: SessionState,
}

/// A removed session and the symbols nobody holds any more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Final outcome of the removed session.
    pub outcome: SessionOutcome,
    /// Symbols to unsubscribe upstream (already recorded as releases).
    pub release: Vec<Symbol>,
}

/// Result of correlating an acknowledgement.
///
/// `followers` lists the sessions that were following the consumed entry and
/// settled with it, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckResolution {
    /// The ack consumed one of several outstanding entries of a session.
    Progress {
        /// Session id.
        session: SessionId,
        /// Symbols still awaited, directly or as a follower.
        remaining: usize,
        /// Followers that settled.
        followers: Vec<Removal>,
    },
    /// The session's control operation completed.
    Resolved {
        /// Outcome of the requesting session.
        removal: Removal,
        /// Followers that settled.
        followers: Vec<Removal>,
    },
    /// A detached entry absorbed the ack.
    Absorbed,
    /// Nothing was waiting for this ack.
    Unmatched,
}

impl AckResolution {
    /// Every session that settled, requester first.
    #[must_use]
    pub fn settled(self) -> Vec<Removal> {
        match self {
            Self::Progress { followers, .. } => followers,
            Self::Resolved { removal, followers } => {
                let mut settled = Vec::with_capacity(followers.len() + 1);
                settled.push(removal);
                settled.extend(followers);
                settled
            }
            Self::Absorbed | Self::Unmatched => Vec::new(),
        }
    }
}

/// A session eligible for fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscriber {
    /// Session id.
    pub session: SessionId,
    /// Downstream handle to write to.
    pub handle: DownstreamId,
}

// =============================================================================
// Internal State
// =============================================================================

/// Control frames of one operation awaiting acknowledgement.
#[derive(Debug)]
struct Outstanding {
    operation: Operation,
    /// Symbol to issue sequence.
    awaiting: BTreeMap<Symbol, u64>,
    /// Symbols awaited through another session's subscribe entry.
    following: BTreeSet<Symbol>,
    issued_at: Instant,
}

impl Outstanding {
    fn is_done(&self) -> bool {
        self.awaiting.is_empty() && self.following.is_empty()
    }
}

#[derive(Debug)]
struct Session {
    handle: DownstreamId,
    symbols: BTreeSet<Symbol>,
    state: SessionState,
    outstanding: Option<Outstanding>,
}

impl Session {
    /// Whether the upstream has confirmed `symbol` for this session.
    fn confirms(&self, symbol: &str) -> bool {
        match self.state {
            SessionState::Active => true,
            SessionState::Pending => self.outstanding.as_ref().is_some_and(|out| {
                !out.awaiting.contains_key(symbol) && !out.following.contains(symbol)
            }),
            _ => false,
        }
    }

    /// Whether this session's own subscribe entry for `symbol` is in flight.
    fn leads(&self, symbol: &str) -> bool {
        self.outstanding.as_ref().is_some_and(|out| {
            out.operation == Operation::Subscribe && out.awaiting.contains_key(symbol)
        })
    }
}

/// An outstanding entry with no owning session.
#[derive(Debug, Clone)]
struct Detached {
    seq: u64,
    operation: Operation,
    symbol: Symbol,
    issued_at: Instant,
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    by_symbol: HashMap<Symbol, BTreeSet<SessionId>>,
    by_handle: HashMap<DownstreamId, BTreeSet<SessionId>>,
    detached: Vec<Detached>,
    next_session: SessionId,
    next_seq: u64,
}

impl RegistryState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Whether a session other than `except` matching `pred` holds `symbol`.
    fn held_elsewhere(
        &self,
        symbol: &str,
        except: SessionId,
        pred: impl Fn(&Session) -> bool,
    ) -> bool {
        self.by_symbol.get(symbol).is_some_and(|ids| {
            ids.iter()
                .filter(|id| **id != except)
                .filter_map(|id| self.sessions.get(id))
                .any(&pred)
        })
    }

    /// Sessions following another session's subscribe entry for `symbol`,
    /// oldest request first.
    fn followers_of(&self, symbol: &str) -> Vec<SessionId> {
        let mut followers: Vec<(Instant, SessionId)> = self
            .by_symbol
            .get(symbol)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                let out = self.sessions.get(id)?.outstanding.as_ref()?;
                out.following.contains(symbol).then_some((out.issued_at, *id))
            })
            .collect();
        followers.sort_unstable();
        followers.into_iter().map(|(_, id)| id).collect()
    }

    /// Oldest outstanding entry matching the ack: `Some(Some(id))` for a
    /// session, `Some(None)` for a detached entry at `detached_idx`.
    fn oldest_match(&self, ack: &ControlAck) -> Option<(u64, Option<SessionId>, usize)> {
        let symbol = ack.requested_symbol.as_str();

        let from_sessions = self
            .by_symbol
            .get(symbol)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                let out = self.sessions.get(id)?.outstanding.as_ref()?;
                if out.operation != ack.operation {
                    return None;
                }
                out.awaiting.get(symbol).map(|seq| (*seq, Some(*id), 0))
            });

        let from_detached = self
            .detached
            .iter()
            .enumerate()
            .filter(|(_, d)| d.operation == ack.operation && d.symbol == symbol)
            .map(|(idx, d)| (d.seq, None, idx));

        from_sessions.chain(from_detached).min_by_key(|(seq, ..)| *seq)
    }

    /// Drop a session from every index. Its in-flight subscribe entries pass
    /// to the oldest follower of each symbol; the rest become detached
    /// entries. Returns the symbols that no longer have a holder, excluding
    /// `skip`, and records release frames for them.
    fn destroy(
        &mut self,
        id: SessionId,
        final_state: SessionState,
        skip: &BTreeSet<Symbol>,
        now: Instant,
    ) -> Option<Removal> {
        let session = self.sessions.remove(&id)?;

        for symbol in &session.symbols {
            if let Some(ids) = self.by_symbol.get_mut(symbol) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_symbol.remove(symbol);
                }
            }
        }
        if let Some(ids) = self.by_handle.get_mut(&session.handle) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_handle.remove(&session.handle);
            }
        }

        if let Some(out) = session.outstanding {
            for (symbol, seq) in out.awaiting {
                if skip.contains(&symbol) {
                    continue;
                }
                if out.operation == Operation::Subscribe
                    && let Some(heir) = self.followers_of(&symbol).first().copied()
                    && let Some(heir) = self
                        .sessions
                        .get_mut(&heir)
                        .and_then(|s| s.outstanding.as_mut())
                {
                    heir.following.remove(&symbol);
                    heir.awaiting.insert(symbol, seq);
                    continue;
                }
                self.detached.push(Detached {
                    seq,
                    operation: out.operation,
                    symbol,
                    issued_at: now,
                });
            }
        }

        let mut release = Vec::new();
        if session.state.holds_upstream() {
            for symbol in &session.symbols {
                if skip.contains(symbol)
                    || self.held_elsewhere(symbol, id, |s| s.state.holds_upstream())
                {
                    continue;
                }
                let seq = self.next_seq();
                self.detached.push(Detached {
                    seq,
                    operation: Operation::Unsubscribe,
                    symbol: symbol.clone(),
                    issued_at: now,
                });
                release.push(symbol.clone());
            }
        }

        Some(Removal {
            outcome: SessionOutcome {
                session: id,
                handle: session.handle,
                state: final_state,
            },
            release,
        })
    }
}

// =============================================================================
// Session Registry
// =============================================================================

/// Thread-safe registry of subscription sessions.
///
/// # Example
///
/// ```rust
/// use bitmex_stream_proxy::domain::streaming::{ControlAck, Operation};
/// use bitmex_stream_proxy::domain::subscription::{AckResolution, SessionRegistry, SessionState};
///
/// let registry = SessionRegistry::new();
///
/// let session = registry.register(7, ["XBTUSD".to_string()]).unwrap();
/// let plan = registry.mark_pending(session, Operation::Subscribe).unwrap();
/// assert_eq!(plan.frames, vec!["XBTUSD".to_string()]);
///
/// let resolution = registry.resolve_ack(&ControlAck::accepted(Operation::Subscribe, "XBTUSD"));
/// assert!(matches!(resolution, AckResolution::Resolved { .. }));
/// assert_eq!(registry.state(session), Some(SessionState::Active));
/// ```
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for a downstream handle.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EmptySymbols`] for an empty symbol set and
    /// [`RegistryError::AlreadySubscribed`] if the handle already has a live
    /// session covering one of the symbols.
    pub fn register(
        &self,
        handle: DownstreamId,
        symbols: impl IntoIterator<Item = Symbol>,
    ) -> Result<SessionId, RegistryError> {
        let symbols: BTreeSet<Symbol> = symbols.into_iter().collect();
        if symbols.is_empty() {
            return Err(RegistryError::EmptySymbols);
        }

        let mut st = self.state.write();

        if let Some(existing) = st.by_handle.get(&handle) {
            for id in existing {
                if let Some(session) = st.sessions.get(id)
                    && let Some(symbol) = session.symbols.intersection(&symbols).next()
                {
                    return Err(RegistryError::AlreadySubscribed {
                        handle,
                        symbol: symbol.clone(),
                    });
                }
            }
        }

        st.next_session += 1;
        let id = st.next_session;

        for symbol in &symbols {
            st.by_symbol.entry(symbol.clone()).or_default().insert(id);
        }
        st.by_handle.entry(handle).or_default().insert(id);
        st.sessions.insert(
            id,
            Session {
                handle,
                symbols,
                state: SessionState::Idle,
                outstanding: None,
            },
        );

        Ok(id)
    }

    /// Start a control operation for a session.
    ///
    /// `Subscribe` moves `Idle -> Pending`, `Unsubscribe` moves
    /// `Active -> Unsubscribing`. Symbols that need no upstream frame are
    /// settled locally; when none need a frame the session reaches its
    /// target state (`Active`, or `Closed` and removed) immediately.
    ///
    /// A subscribe symbol another session is still awaiting gets no frame;
    /// the session follows that entry and stays `Pending` until it resolves.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidTransition`] when the operation is not
    /// allowed in the current state, including while a previous control
    /// operation is still outstanding.
    pub fn mark_pending(
        &self,
        id: SessionId,
        operation: Operation,
    ) -> Result<ControlPlan, RegistryError> {
        let mut st = self.state.write();
        let now = Instant::now();

        let session = st.sessions.get(&id).ok_or(RegistryError::UnknownSession(id))?;
        let mut frames: Vec<Symbol> = Vec::new();
        let mut following = BTreeSet::new();
        match (session.state, operation) {
            (SessionState::Idle, Operation::Subscribe) => {
                for symbol in &session.symbols {
                    // Already live upstream: settled locally.
                    if st.held_elsewhere(symbol, id, |s| s.confirms(symbol)) {
                        continue;
                    }
                    if st.held_elsewhere(symbol, id, |s| s.leads(symbol)) {
                        following.insert(symbol.clone());
                    } else {
                        frames.push(symbol.clone());
                    }
                }
            }
            // A symbol someone else still holds must stay subscribed.
            (SessionState::Active, Operation::Unsubscribe) => {
                frames = session
                    .symbols
                    .iter()
                    .filter(|s| !st.held_elsewhere(s, id, |other| other.state.holds_upstream()))
                    .cloned()
                    .collect();
            }
            (state, operation) => {
                return Err(RegistryError::InvalidTransition {
                    session: id,
                    state,
                    operation,
                });
            }
        }

        if frames.is_empty() && following.is_empty() {
            let state = match operation {
                Operation::Subscribe => {
                    if let Some(session) = st.sessions.get_mut(&id) {
                        session.state = SessionState::Active;
                    }
                    SessionState::Active
                }
                Operation::Unsubscribe => {
                    st.destroy(id, SessionState::Closed, &BTreeSet::new(), now);
                    SessionState::Closed
                }
            };
            return Ok(ControlPlan {
                session: id,
                operation,
                frames,
                state,
            });
        }

        let mut awaiting = BTreeMap::new();
        for symbol in &frames {
            let seq = st.next_seq();
            awaiting.insert(symbol.clone(), seq);
        }

        let state = match operation {
            Operation::Subscribe => SessionState::Pending,
            Operation::Unsubscribe => SessionState::Unsubscribing,
        };
        if let Some(session) = st.sessions.get_mut(&id) {
            session.state = state;
            session.outstanding = Some(Outstanding {
                operation,
                awaiting,
                following,
                issued_at: now,
            });
        }

        Ok(ControlPlan {
            session: id,
            operation,
            frames,
            state,
        })
    }

    /// Correlate an upstream acknowledgement with the oldest matching
    /// outstanding control frame.
    ///
    /// Sessions following the consumed subscribe entry settle with it. An
    /// ack for a session that was already removed is absorbed by the
    /// detached entry left behind; an ack nothing was waiting for is
    /// reported as [`AckResolution::Unmatched`]. Neither is an error.
    pub fn resolve_ack(&self, ack: &ControlAck) -> AckResolution {
        let mut st = self.state.write();
        let now = Instant::now();
        let symbol = &ack.requested_symbol;

        let Some((_, owner, detached_idx)) = st.oldest_match(ack) else {
            return AckResolution::Unmatched;
        };

        let Some(id) = owner else {
            st.detached.swap_remove(detached_idx);
            return AckResolution::Absorbed;
        };

        let (operation, remaining) = {
            let Some(session) = st.sessions.get_mut(&id) else {
                return AckResolution::Unmatched;
            };
            let Some(out) = session.outstanding.as_mut() else {
                return AckResolution::Unmatched;
            };
            out.awaiting.remove(symbol);
            (out.operation, out.awaiting.len() + out.following.len())
        };

        let followers = match operation {
            Operation::Subscribe => st.followers_of(symbol),
            Operation::Unsubscribe => Vec::new(),
        };

        if !ack.success {
            let skip = BTreeSet::from([symbol.clone()]);
            let failed = SessionState::Failed(FailureReason::SubscriptionRejected);
            let Some(removal) = st.destroy(id, failed, &skip, now) else {
                return AckResolution::Unmatched;
            };
            let followers = followers
                .into_iter()
                .filter_map(|f| st.destroy(f, failed, &skip, now))
                .collect();
            return AckResolution::Resolved { removal, followers };
        }

        let followers: Vec<Removal> = followers
            .into_iter()
            .filter_map(|f| {
                let session = st.sessions.get_mut(&f)?;
                let out = session.outstanding.as_mut()?;
                out.following.remove(symbol);
                if !out.is_done() {
                    return None;
                }
                session.state = SessionState::Active;
                session.outstanding = None;
                Some(Removal {
                    outcome: SessionOutcome {
                        session: f,
                        handle: session.handle,
                        state: SessionState::Active,
                    },
                    release: Vec::new(),
                })
            })
            .collect();

        if remaining > 0 {
            return AckResolution::Progress {
                session: id,
                remaining,
                followers,
            };
        }

        let removal = match operation {
            Operation::Subscribe => {
                let Some(session) = st.sessions.get_mut(&id) else {
                    return AckResolution::Unmatched;
                };
                session.state = SessionState::Active;
                session.outstanding = None;
                Removal {
                    outcome: SessionOutcome {
                        session: id,
                        handle: session.handle,
                        state: SessionState::Active,
                    },
                    release: Vec::new(),
                }
            }
            Operation::Unsubscribe => {
                let Some(removal) = st.destroy(id, SessionState::Closed, &BTreeSet::new(), now)
                else {
                    return AckResolution::Unmatched;
                };
                removal
            }
        };
        AckResolution::Resolved { removal, followers }
    }

    /// Fail a session whose control frames could not all be written.
    ///
    /// `unsent` lists the planned frames that never reached the upstream;
    /// they are dropped instead of left behind as detached entries, and the
    /// sessions following them fail too. Returns the requester first, or
    /// nothing if the session no longer exists.
    pub fn fail_session(
        &self,
        id: SessionId,
        reason: FailureReason,
        unsent: &[Symbol],
    ) -> Vec<Removal> {
        let mut st = self.state.write();
        let now = Instant::now();
        let failed = SessionState::Failed(reason);
        let skip: BTreeSet<Symbol> = unsent.iter().cloned().collect();

        let Some(session) = st.sessions.get(&id) else {
            return Vec::new();
        };
        let mut stranded: Vec<SessionId> = skip
            .iter()
            .filter(|symbol| session.leads(symbol))
            .flat_map(|symbol| st.followers_of(symbol))
            .collect();
        stranded.sort_unstable();
        stranded.dedup();

        let Some(removal) = st.destroy(id, failed, &skip, now) else {
            return Vec::new();
        };
        let mut removals = vec![removal];
        removals.extend(
            stranded
                .into_iter()
                .filter_map(|f| st.destroy(f, failed, &skip, now)),
        );
        removals
    }

    /// Remove a session regardless of its state.
    ///
    /// Returns `None` if the session no longer exists.
    pub fn remove(&self, id: SessionId) -> Option<Removal> {
        self.state
            .write()
            .destroy(id, SessionState::Closed, &BTreeSet::new(), Instant::now())
    }

    /// Remove every session owned by a downstream handle.
    pub fn remove_handle(&self, handle: DownstreamId) -> Vec<Removal> {
        let mut st = self.state.write();
        let now = Instant::now();
        let ids: Vec<SessionId> = st
            .by_handle
            .get(&handle)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        ids.into_iter()
            .filter_map(|id| st.destroy(id, SessionState::Closed, &BTreeSet::new(), now))
            .collect()
    }

    /// Clear the registry after the upstream connection was lost.
    ///
    /// Sessions awaiting an acknowledgement fail with `reason`; active ones
    /// are closed. Idle sessions and detached entries are dropped silently.
    pub fn fail_all(&self, reason: FailureReason) -> Vec<SessionOutcome> {
        let mut st = self.state.write();
        let drained = std::mem::take(&mut *st);
        st.next_session = drained.next_session;
        st.next_seq = drained.next_seq;

        let mut outcomes: Vec<SessionOutcome> = drained
            .sessions
            .into_iter()
            .filter_map(|(id, session)| {
                let state = match session.state {
                    SessionState::Pending | SessionState::Unsubscribing => {
                        SessionState::Failed(reason)
                    }
                    SessionState::Active => SessionState::Closed,
                    _ => return None,
                };
                Some(SessionOutcome {
                    session: id,
                    handle: session.handle,
                    state,
                })
            })
            .collect();
        outcomes.sort_by_key(|o| o.session);
        outcomes
    }

    /// Fail sessions whose control operation has been outstanding for
    /// longer than `timeout`, and discard detached entries of that age.
    pub fn expire(&self, now: Instant, timeout: Duration) -> Vec<Removal> {
        let mut st = self.state.write();

        st.detached
            .retain(|d| now.saturating_duration_since(d.issued_at) < timeout);

        let mut stale: Vec<SessionId> = st
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.outstanding
                    .as_ref()
                    .is_some_and(|o| now.saturating_duration_since(o.issued_at) >= timeout)
            })
            .map(|(id, _)| *id)
            .collect();
        stale.sort_unstable();

        stale
            .into_iter()
            .filter_map(|id| {
                st.destroy(
                    id,
                    SessionState::Failed(FailureReason::AckTimeout),
                    &BTreeSet::new(),
                    now,
                )
            })
            .collect()
    }

    /// Active sessions subscribed to `symbol`.
    #[must_use]
    pub fn subscribers_of(&self, symbol: &str) -> Vec<Subscriber> {
        let st = self.state.read();
        st.by_symbol
            .get(symbol)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                let session = st.sessions.get(id)?;
                (session.state == SessionState::Active).then_some(Subscriber {
                    session: *id,
                    handle: session.handle,
                })
            })
            .collect()
    }

    /// Current state of a session, `None` once it has been removed.
    #[must_use]
    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.state.read().sessions.get(&id).map(|s| s.state)
    }

    /// Symbols of a session.
    #[must_use]
    pub fn symbols(&self, id: SessionId) -> Vec<Symbol> {
        self.state
            .read()
            .sessions
            .get(&id)
            .map(|s| s.symbols.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Owning handle of a session.
    #[must_use]
    pub fn handle_of(&self, id: SessionId) -> Option<DownstreamId> {
        self.state.read().sessions.get(&id).map(|s| s.handle)
    }

    /// Sessions of a handle whose symbols intersect `symbols`.
    ///
    /// An empty `symbols` slice matches every session of the handle.
    #[must_use]
    pub fn sessions_matching(&self, handle: DownstreamId, symbols: &[Symbol]) -> Vec<SessionId> {
        let st = self.state.read();
        st.by_handle
            .get(&handle)
            .into_iter()
            .flatten()
            .filter(|id| {
                st.sessions.get(id).is_some_and(|s| {
                    symbols.is_empty() || symbols.iter().any(|sym| s.symbols.contains(sym))
                })
            })
            .copied()
            .collect()
    }

    /// Move the symbols of an `Active` session that appear in `symbols` into
    /// a new `Active` session owned by the same handle.
    ///
    /// Returns the session covering exactly the matched symbols: `id` itself
    /// when all of them match or `symbols` is empty.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidTransition`] unless the session is
    /// `Active`, and [`RegistryError::EmptySymbols`] when no symbol matches.
    pub fn split_off(&self, id: SessionId, symbols: &[Symbol]) -> Result<SessionId, RegistryError> {
        let mut st = self.state.write();

        let session = st
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        if session.state != SessionState::Active {
            return Err(RegistryError::InvalidTransition {
                session: id,
                state: session.state,
                operation: Operation::Unsubscribe,
            });
        }
        if symbols.is_empty() {
            return Ok(id);
        }

        let moved: BTreeSet<Symbol> = session
            .symbols
            .iter()
            .filter(|s| symbols.contains(s))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(RegistryError::EmptySymbols);
        }
        if moved.len() == session.symbols.len() {
            return Ok(id);
        }
        session.symbols.retain(|s| !moved.contains(s));
        let handle = session.handle;

        st.next_session += 1;
        let split = st.next_session;
        for symbol in &moved {
            if let Some(ids) = st.by_symbol.get_mut(symbol) {
                ids.remove(&id);
                ids.insert(split);
            }
        }
        st.by_handle.entry(handle).or_default().insert(split);
        st.sessions.insert(
            split,
            Session {
                handle,
                symbols: moved,
                state: SessionState::Active,
                outstanding: None,
            },
        );

        Ok(split)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let st = self.state.read();
        let mut stats = RegistryStats {
            sessions: st.sessions.len(),
            symbols: st.by_symbol.len(),
            handles: st.by_handle.len(),
            detached: st.detached.len(),
            ..RegistryStats::default()
        };
        for session in st.sessions.values() {
            match session.state {
                SessionState::Pending => stats.pending += 1,
                SessionState::Active => stats.active += 1,
                SessionState::Unsubscribing => stats.unsubscribing += 1,
                _ => {}
            }
        }
        stats
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live sessions.
    pub sessions: usize,
    /// Sessions awaiting a subscribe ack.
    pub pending: usize,
    /// Sessions receiving data.
    pub active: usize,
    /// Sessions awaiting an unsubscribe ack.
    pub unsubscribing: usize,
    /// Distinct symbols across live sessions.
    pub symbols: usize,
    /// Downstream handles owning at least one session.
    pub handles: usize,
    /// Detached outstanding entries.
    pub detached: usize,
}

// =============================================================================
// Tests
// =============================================================================
