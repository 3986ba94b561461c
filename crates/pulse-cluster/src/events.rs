use serde::{Deserialize, Serialize};

use crate::phase::PhaseChangeEvent;
use crate::substrate::HostEvent;
use crate::types::{LinkState, PeerId, PeerKind};

/// Everything a [`ClusterHandle`](crate::ClusterHandle) subscriber can observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    ConnectionChanged {
        peer: PeerId,
        state: LinkState,
        kind: PeerKind,
    },
    StreamChanged {
        peer: PeerId,
        protocol: String,
        state: LinkState,
        kind: PeerKind,
    },
    PhaseChanged(PhaseChangeEvent),
}

impl From<HostEvent> for ClusterEvent {
    fn from(event: HostEvent) -> Self {
        match event {
            HostEvent::Connection { peer, state, kind } => {
                ClusterEvent::ConnectionChanged { peer, state, kind }
            }
            HostEvent::Stream {
                peer,
                protocol,
                state,
                kind,
            } => ClusterEvent::StreamChanged {
                peer,
                protocol,
                state,
                kind,
            },
        }
    }
}

impl From<PhaseChangeEvent> for ClusterEvent {
    fn from(event: PhaseChangeEvent) -> Self {
        ClusterEvent::PhaseChanged(event)
    }
}
