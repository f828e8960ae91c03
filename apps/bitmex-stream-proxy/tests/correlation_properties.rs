//! Correlation and Fan-out Properties
//!
//! Property tests over the session registry and relay: concurrent requests
//! put at most one frame per symbol in flight, every session settles exactly
//! once, and data reaches only clients with an active session for the symbol.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;

use bitmex_stream_proxy::{
    AckResolution, ChannelSink, ControlAck, DataUpdate, DownstreamFrame, FanoutRelay, Operation,
    SessionId, SessionRegistry, SessionState,
};

const POOL: [&str; 4] = ["XBTUSD", "ETHUSD", "SOLUSD", "XRPUSD"];

fn symbol_set() -> impl Strategy<Value = BTreeSet<String>> {
    proptest::collection::btree_set(0..POOL.len(), 1..=POOL.len())
        .prop_map(|idx| idx.into_iter().map(|i| POOL[i].to_string()).collect())
}

fn sessions() -> impl Strategy<Value = Vec<BTreeSet<String>>> {
    proptest::collection::vec(symbol_set(), 1..8)
}

/// Order `items` by the generated sort keys, keeping ties in issue order.
fn permute<T: Clone>(items: &[T], keys: &[u32]) -> Vec<T> {
    let mut keyed: Vec<(u32, usize)> = (0..items.len())
        .map(|i| (keys[i % keys.len()], i))
        .collect();
    keyed.sort_unstable();
    keyed.into_iter().map(|(_, i)| items[i].clone()).collect()
}

/// Register and start a subscribe for each symbol set, one client per set.
fn subscribe_all(
    registry: &SessionRegistry,
    sets: &[BTreeSet<String>],
) -> (Vec<SessionId>, Vec<String>) {
    let mut ids = Vec::new();
    let mut frames = Vec::new();
    for (client, symbols) in sets.iter().enumerate() {
        let id = registry
            .register(client as u64 + 1, symbols.iter().cloned())
            .unwrap();
        let plan = registry.mark_pending(id, Operation::Subscribe).unwrap();
        frames.extend(plan.frames);
        ids.push(id);
    }
    (ids, frames)
}

proptest! {
    #[test]
    fn every_session_settles_once(
        sets in sessions(),
        keys in proptest::collection::vec(any::<u32>(), 1..32),
    ) {
        let registry = SessionRegistry::new();
        let (ids, frames) = subscribe_all(&registry, &sets);

        // Later requests for a symbol follow the first one's frame.
        let distinct: BTreeSet<&String> = frames.iter().collect();
        prop_assert_eq!(distinct.len(), frames.len());

        let mut settled = Vec::new();
        for symbol in permute(&frames, &keys) {
            let resolution = registry.resolve_ack(&ControlAck::accepted(Operation::Subscribe, symbol));
            prop_assert!(
                matches!(resolution, AckResolution::Resolved { .. } | AckResolution::Progress { .. }),
                "unexpected resolution {:?}",
                resolution
            );
            for removal in resolution.settled() {
                prop_assert_eq!(removal.outcome.state, SessionState::Active);
                settled.push(removal.outcome.session);
            }
        }

        settled.sort_unstable();
        prop_assert_eq!(&settled, &ids);
        for id in &ids {
            prop_assert_eq!(registry.state(*id), Some(SessionState::Active));
        }
        for symbol in POOL {
            prop_assert_eq!(
                registry.resolve_ack(&ControlAck::accepted(Operation::Subscribe, symbol)),
                AckResolution::Unmatched
            );
        }
    }

    #[test]
    fn rejection_fails_every_holder_of_the_symbol(
        sets in sessions(),
        pick in any::<prop::sample::Index>(),
    ) {
        let registry = SessionRegistry::new();
        let (ids, frames) = subscribe_all(&registry, &sets);
        let symbol = pick.get(&frames).clone();

        let holders: Vec<SessionId> = ids
            .iter()
            .copied()
            .filter(|id| registry.symbols(*id).contains(&symbol))
            .collect();

        let settled = registry
            .resolve_ack(&ControlAck::rejected(Operation::Subscribe, symbol))
            .settled();
        prop_assert_eq!(
            settled.iter().map(|r| r.outcome.session).collect::<Vec<_>>(),
            holders.clone()
        );
        for removal in &settled {
            prop_assert!(matches!(removal.outcome.state, SessionState::Failed(_)));
        }

        for id in ids {
            if holders.contains(&id) {
                prop_assert_eq!(registry.state(id), None);
            } else {
                prop_assert_eq!(registry.state(id), Some(SessionState::Pending));
            }
        }
    }

    #[test]
    fn data_reaches_only_active_sessions(
        sets in sessions(),
        keys in proptest::collection::vec(any::<u32>(), 1..32),
        acked in 0usize..24,
    ) {
        let registry = Arc::new(SessionRegistry::new());
        let relay = FanoutRelay::new(Arc::clone(&registry));

        let mut receivers = Vec::new();
        let mut ids = Vec::new();
        let mut frames = Vec::new();
        for symbols in &sets {
            let (sink, rx) = ChannelSink::channel(8);
            let handle = relay.attach(Arc::new(sink));
            let id = registry.register(handle, symbols.iter().cloned()).unwrap();
            frames.extend(registry.mark_pending(id, Operation::Subscribe).unwrap().frames);
            receivers.push(rx);
            ids.push(id);
        }

        for symbol in permute(&frames, &keys).into_iter().take(acked) {
            registry.resolve_ack(&ControlAck::accepted(Operation::Subscribe, symbol));
        }

        for symbol in POOL {
            let update = DataUpdate {
                symbol: symbol.to_string(),
                timestamp: "2026-10-14T09:00:00.000Z".to_string(),
                price: 1.0,
            };
            let report = relay.deliver(&update);
            prop_assert!(report.failed.is_empty());

            let mut expected = 0;
            for (id, rx) in ids.iter().zip(receivers.iter_mut()) {
                let active = registry.state(*id) == Some(SessionState::Active)
                    && registry.symbols(*id).iter().any(|s| s == symbol);
                let received = rx.try_recv().ok();
                if active {
                    expected += 1;
                    prop_assert_eq!(received, Some(DownstreamFrame::Data(update.clone())));
                } else {
                    prop_assert_eq!(received, None);
                }
            }
            prop_assert_eq!(report.delivered, expected);
        }
    }
}
