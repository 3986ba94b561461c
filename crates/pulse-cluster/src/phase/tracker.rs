/// PhaseTracker: degree accounting from connection events.
///
/// Pure state machine: feed it [`HostEvent`]s, get back a
/// [`PhaseChangeEvent`] whenever a peer's first host connection opens or
/// its last one closes. Client connections and stream events never touch
/// the counter.
use std::collections::HashMap;

use crate::phase::{phase, Phase, PhaseChangeEvent};
use crate::substrate::HostEvent;
use crate::types::{LinkState, PeerId, PeerKind};

pub struct PhaseTracker {
    /// Open host connections per peer. Never holds a zero.
    counts: HashMap<PeerId, usize>,
    kmin: usize,
    kmax: usize,
}

impl PhaseTracker {
    pub fn new(kmin: usize, kmax: usize) -> Self {
        Self {
            counts: HashMap::new(),
            kmin,
            kmax,
        }
    }

    /// Number of distinct host peers with at least one open connection.
    pub fn degree(&self) -> usize {
        self.counts.len()
    }

    pub fn phase(&self) -> Phase {
        phase(self.degree(), self.kmin, self.kmax)
    }

    /// Apply one event. Returns a change event on 0↔1 edges only.
    pub fn observe(&mut self, event: &HostEvent) -> Option<PhaseChangeEvent> {
        let HostEvent::Connection { peer, state, kind } = event else {
            return None;
        };
        if *kind != PeerKind::Host {
            return None;
        }

        let from = self.phase();
        match state {
            LinkState::Opened => {
                let count = self.counts.entry(*peer).or_insert(0);
                *count += 1;
                if *count > 1 {
                    return None;
                }
            }
            LinkState::Closed => {
                let Some(count) = self.counts.get_mut(peer) else {
                    tracing::trace!(peer = %peer.fmt_short(), "phase: close for untracked peer");
                    return None;
                };
                *count -= 1;
                if *count > 0 {
                    return None;
                }
                self.counts.remove(peer);
            }
        }

        let n = self.degree();
        Some(PhaseChangeEvent {
            peer: *peer,
            from,
            to: phase(n, self.kmin, self.kmax),
            n,
        })
    }
}

impl std::fmt::Debug for PhaseTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseTracker")
            .field("degree", &self.degree())
            .field("kmin", &self.kmin)
            .field("kmax", &self.kmax)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn conn(p: u8, state: LinkState) -> HostEvent {
        HostEvent::Connection {
            peer: peer(p),
            state,
            kind: PeerKind::Host,
        }
    }

    #[test]
    fn degree_sequence_walks_the_phases() {
        let mut tracker = PhaseTracker::new(3, 6);
        assert_eq!(tracker.phase(), Phase::Orphaned);

        let mut phases = vec![tracker.phase()];
        for p in 1..=7u8 {
            let ev = tracker.observe(&conn(p, LinkState::Opened)).unwrap();
            assert_eq!(ev.n, p as usize);
            if [1, 2, 3, 7].contains(&p) {
                phases.push(ev.to);
            }
        }
        assert_eq!(
            phases,
            vec![
                Phase::Orphaned,
                Phase::Partial,
                Phase::Partial,
                Phase::Complete,
                Phase::Overloaded
            ]
        );
    }

    #[test]
    fn only_zero_edges_emit() {
        let mut tracker = PhaseTracker::new(3, 6);

        let first = tracker.observe(&conn(1, LinkState::Opened)).unwrap();
        assert_eq!((first.from, first.to, first.n), (Phase::Orphaned, Phase::Partial, 1));

        // Second connection to the same peer: no edge.
        assert!(tracker.observe(&conn(1, LinkState::Opened)).is_none());
        assert!(tracker.observe(&conn(1, LinkState::Closed)).is_none());
        assert_eq!(tracker.degree(), 1);

        let last = tracker.observe(&conn(1, LinkState::Closed)).unwrap();
        assert_eq!(last.peer, peer(1));
        assert_eq!((last.from, last.to, last.n), (Phase::Partial, Phase::Orphaned, 0));
    }

    #[test]
    fn unknown_close_is_ignored() {
        let mut tracker = PhaseTracker::new(3, 6);
        assert!(tracker.observe(&conn(9, LinkState::Closed)).is_none());
        assert_eq!(tracker.degree(), 0);
    }

    #[test]
    fn clients_and_streams_are_ignored() {
        let mut tracker = PhaseTracker::new(3, 6);
        let client = HostEvent::Connection {
            peer: peer(1),
            state: LinkState::Opened,
            kind: PeerKind::Client,
        };
        let stream = HostEvent::Stream {
            peer: peer(2),
            protocol: "/pulse/rpc".into(),
            state: LinkState::Opened,
            kind: PeerKind::Host,
        };
        assert!(tracker.observe(&client).is_none());
        assert!(tracker.observe(&stream).is_none());
        assert_eq!(tracker.degree(), 0);
    }

    #[test]
    fn same_phase_edges_still_emit() {
        let mut tracker = PhaseTracker::new(3, 6);
        tracker.observe(&conn(1, LinkState::Opened));
        let ev = tracker.observe(&conn(2, LinkState::Opened)).unwrap();
        assert_eq!((ev.from, ev.to, ev.n), (Phase::Partial, Phase::Partial, 2));
    }
}
