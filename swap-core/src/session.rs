//! Swap session: owns the swap types of every transport, their status bus and the peers
//! discovered while the session runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Receiver;

use crate::lifecycle::{StatusBus, StatusEvent, SwapControl, SwapError, TransportKind};
use crate::peer::{Peer, PeerSet};

pub struct SwapSession {
    bus: Arc<StatusBus>,
    swaps: Vec<Arc<dyn SwapControl>>,
    peers: Mutex<PeerSet>,
}

impl Default for SwapSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapSession {
    pub fn new() -> Self {
        Self::with_bus(Arc::new(StatusBus::new()))
    }

    pub fn with_bus(bus: Arc<StatusBus>) -> Self {
        Self {
            bus,
            swaps: Vec::new(),
            peers: Mutex::new(PeerSet::new()),
        }
    }

    /// Bus to hand to swap types built for this session.
    pub fn bus(&self) -> Arc<StatusBus> {
        self.bus.clone()
    }

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        self.bus.subscribe()
    }

    /// Add the swap type for its transport kind, returning the one it replaces.
    pub fn register(&mut self, swap: Arc<dyn SwapControl>) -> Option<Arc<dyn SwapControl>> {
        let kind = swap.kind();
        match self.swaps.iter_mut().find(|s| s.kind() == kind) {
            Some(slot) => Some(std::mem::replace(slot, swap)),
            None => {
                self.swaps.push(swap);
                None
            }
        }
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn SwapControl>> {
        self.swaps.iter().find(|s| s.kind() == kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = TransportKind> + '_ {
        self.swaps.iter().map(|s| s.kind())
    }

    /// True while any transport is connected.
    pub fn is_any_active(&self) -> bool {
        self.swaps.iter().any(|s| s.is_connected())
    }

    /// Start every registered transport. One failing does not keep the others down.
    pub fn start_all(&self) -> Vec<(TransportKind, Result<(), SwapError>)> {
        self.swaps
            .iter()
            .map(|s| {
                let result = s.start();
                if let Err(e) = &result {
                    tracing::warn!(transport = %s.kind(), error = %e, "transport did not start");
                }
                (s.kind(), result)
            })
            .collect()
    }

    pub fn stop_all(&self) {
        for swap in self.swaps.iter().rev() {
            swap.stop();
        }
    }

    /// Record a discovered peer; see `PeerSet::insert`.
    pub fn add_peer(&self, peer: Peer) -> bool {
        let added = self.peer_set().insert(peer);
        if added {
            tracing::debug!(peers = self.peer_set().len(), "peer set updated");
        }
        added
    }

    pub fn remove_peer(&self, peer: &Peer) -> bool {
        self.peer_set().remove(peer)
    }

    pub fn clear_peers(&self) {
        self.peer_set().clear();
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peer_set().iter().cloned().collect()
    }

    fn peer_set(&self) -> MutexGuard<'_, PeerSet> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{SwapState, SwapStatus, SwapTransport, SwapType};

    struct Toggle {
        kind: TransportKind,
        up: bool,
        broken: bool,
    }

    impl SwapTransport for Toggle {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn bring_up(&mut self) -> Result<(), SwapError> {
            if self.broken {
                return Err(SwapError::Adapter {
                    kind: self.kind,
                    message: "missing".into(),
                });
            }
            self.up = true;
            Ok(())
        }

        fn tear_down(&mut self) {
            self.up = false;
        }

        fn is_alive(&self) -> bool {
            self.up
        }
    }

    fn swap(session: &SwapSession, kind: TransportKind, broken: bool) -> Arc<dyn SwapControl> {
        Arc::new(SwapType::new(
            Toggle {
                kind,
                up: false,
                broken,
            },
            session.bus(),
        ))
    }

    #[test]
    fn any_active_follows_transports() {
        let mut session = SwapSession::new();
        let radio = swap(&session, TransportKind::Radio, true);
        let wifi = swap(&session, TransportKind::Wifi, false);
        session.register(radio);
        session.register(wifi);
        assert!(!session.is_any_active());

        let results = session.start_all();
        assert!(results.iter().any(|(k, r)| *k == TransportKind::Radio && r.is_err()));
        assert!(session.is_any_active());
        assert_eq!(session.get(TransportKind::Wifi).unwrap().state(), SwapState::Connected);

        session.stop_all();
        assert!(!session.is_any_active());
    }

    #[test]
    fn register_replaces_same_kind() {
        let mut session = SwapSession::new();
        let first = swap(&session, TransportKind::Wifi, false);
        let second = swap(&session, TransportKind::Wifi, false);
        assert!(session.register(first).is_none());
        assert!(session.register(second).is_some());
        assert_eq!(session.kinds().count(), 1);
    }

    #[test]
    fn events_reach_session_subscribers() {
        let mut session = SwapSession::new();
        let rx = session.subscribe();
        let wifi = swap(&session, TransportKind::Wifi, false);
        session.register(wifi);
        session.start_all();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.channel == TransportKind::Wifi.channel()));
        assert_eq!(events[1].status, SwapStatus::Started);
    }

    #[test]
    fn peers_are_deduplicated() {
        let session = SwapSession::new();
        assert!(session.add_peer(Peer::from_locator("http://10.0.0.2:8888/fdroid/repo")));
        assert!(!session.add_peer(Peer::from_locator("http://10.0.0.2:8888/fdroid/repo")));
        assert_eq!(session.peers().len(), 1);
        session.clear_peers();
        assert!(session.peers().is_empty());
    }
}
