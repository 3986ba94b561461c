//! In-process substrate.
//!
//! A [`MemoryNetwork`] holds any number of nodes. Each node gets a
//! [`MemoryHost`], [`MemoryDiscovery`] and [`MemoryPubSub`] sharing the
//! same network state, so the full heartbeat and connectivity loops run
//! without sockets. Used by the test suites and local simulations.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Discovery, Host, HostEvent, Message, PubSub, Topic, Validation, Validator};
use crate::error::{ClusterError, PublishError};
use crate::types::{LinkState, PeerId, PeerInfo, PeerKind};

/// Shared state of an in-memory network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

#[derive(Default)]
struct NetState {
    hosts: HashMap<PeerId, HostSlot>,
    /// Undirected host links, stored as (low, high).
    links: HashSet<(PeerId, PeerId)>,
    unreachable: HashSet<PeerId>,
    dial_delay: Duration,
    /// Topic → peers that joined it.
    members: HashMap<String, BTreeSet<PeerId>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    validators: HashMap<(PeerId, String), Arc<dyn Validator>>,
    closed_topics: HashSet<String>,
    /// Last sequence number issued per publisher.
    seqnos: HashMap<PeerId, u64>,
}

struct HostSlot {
    addrs: Vec<SocketAddr>,
    events: mpsc::UnboundedSender<HostEvent>,
}

struct Subscriber {
    peer: PeerId,
    tx: mpsc::UnboundedSender<Message>,
}

/// Collaborators for one node of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryNode {
    pub host: Arc<MemoryHost>,
    pub discovery: Arc<MemoryDiscovery>,
    pub pubsub: Arc<MemoryPubSub>,
}

impl std::fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNode").field("id", &self.host.id).finish()
    }
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

impl NetState {
    fn emit(&self, to: PeerId, event: HostEvent) {
        if let Some(slot) = self.hosts.get(&to) {
            let _ = slot.events.send(event);
        }
    }

    fn emit_link(&self, a: PeerId, b: PeerId, state: LinkState) {
        for (local, remote) in [(a, b), (b, a)] {
            self.emit(
                local,
                HostEvent::Connection {
                    peer: remote,
                    state,
                    kind: PeerKind::Host,
                },
            );
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its collaborators.
    ///
    /// A node registered with no addresses behaves like a host that has
    /// not started listening yet.
    pub fn add_node(&self, id: PeerId, addrs: Vec<SocketAddr>) -> MemoryNode {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().hosts.insert(
            id,
            HostSlot {
                addrs: addrs.clone(),
                events: tx,
            },
        );

        MemoryNode {
            host: Arc::new(MemoryHost {
                id,
                addrs,
                net: self.clone(),
                events: Mutex::new(Some(rx)),
            }),
            discovery: Arc::new(MemoryDiscovery { net: self.clone() }),
            pubsub: Arc::new(MemoryPubSub {
                id,
                net: self.clone(),
            }),
        }
    }

    /// Drop a node: its links close, its subscriptions end.
    pub fn remove_node(&self, id: PeerId) {
        let mut state = self.state.lock();
        let dropped: Vec<(PeerId, PeerId)> = state
            .links
            .iter()
            .filter(|(a, b)| *a == id || *b == id)
            .copied()
            .collect();
        for (a, b) in dropped {
            state.links.remove(&(a, b));
            let other = if a == id { b } else { a };
            state.emit(
                other,
                HostEvent::Connection {
                    peer: id,
                    state: LinkState::Closed,
                    kind: PeerKind::Host,
                },
            );
        }
        state.hosts.remove(&id);
        for members in state.members.values_mut() {
            members.remove(&id);
        }
        for subs in state.subscribers.values_mut() {
            subs.retain(|s| s.peer != id);
        }
        state.validators.retain(|(peer, _), _| *peer != id);
    }

    /// Make dials to `id` fail (or succeed again).
    pub fn set_unreachable(&self, id: PeerId, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(id);
        } else {
            state.unreachable.remove(&id);
        }
    }

    /// Latency applied to every dial.
    pub fn set_dial_delay(&self, delay: Duration) {
        self.state.lock().dial_delay = delay;
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.state.lock().links.contains(&link_key(a, b))
    }

    /// Number of host links of `id`.
    pub fn degree(&self, id: PeerId) -> usize {
        self.state
            .lock()
            .links
            .iter()
            .filter(|(a, b)| *a == id || *b == id)
            .count()
    }

    /// Close the link between `a` and `b`. Returns whether it existed.
    pub fn disconnect(&self, a: PeerId, b: PeerId) -> bool {
        let mut state = self.state.lock();
        if !state.links.remove(&link_key(a, b)) {
            return false;
        }
        state.emit_link(a, b, LinkState::Closed);
        true
    }

    /// Open (or close) a client-classified connection at `host`.
    ///
    /// Client links never enter the host link table.
    pub fn open_client(&self, host: PeerId, client: PeerId, state: LinkState) {
        self.state.lock().emit(
            host,
            HostEvent::Connection {
                peer: client,
                state,
                kind: PeerKind::Client,
            },
        );
    }

    /// Inject a stream event at `host`.
    pub fn stream_event(&self, host: PeerId, peer: PeerId, protocol: &str, state: LinkState) {
        self.state.lock().emit(
            host,
            HostEvent::Stream {
                peer,
                protocol: protocol.to_string(),
                state,
                kind: PeerKind::Host,
            },
        );
    }

    /// Subsequent publishes on `topic` fail with [`PublishError::Closed`].
    pub fn close_topic(&self, topic: &str) {
        self.state.lock().closed_topics.insert(topic.to_string());
    }

    fn peer_info(state: &NetState, id: PeerId) -> Option<PeerInfo> {
        state
            .hosts
            .get(&id)
            .map(|slot| PeerInfo::new(id, slot.addrs.clone()))
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryNetwork")
            .field("hosts", &state.hosts.len())
            .field("links", &state.links.len())
            .finish()
    }
}

// ── Host ─────────────────────────────────────────────────────────────

pub struct MemoryHost {
    id: PeerId,
    addrs: Vec<SocketAddr>,
    net: MemoryNetwork,
    events: Mutex<Option<mpsc::UnboundedReceiver<HostEvent>>>,
}

impl std::fmt::Debug for MemoryHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHost").field("id", &self.id).finish()
    }
}

#[async_trait::async_trait]
impl Host for MemoryHost {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addrs(&self) -> Vec<SocketAddr> {
        self.addrs.clone()
    }

    async fn connect(&self, cancel: CancellationToken, peer: PeerInfo) -> Result<(), ClusterError> {
        let delay = self.net.state.lock().dial_delay;
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClusterError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut state = self.net.state.lock();
        if peer.id == self.id {
            return Err(ClusterError::Dial {
                peer: peer.id,
                reason: "cannot dial self".into(),
            });
        }
        if !state.hosts.contains_key(&peer.id) || state.unreachable.contains(&peer.id) {
            return Err(ClusterError::Dial {
                peer: peer.id,
                reason: "unreachable".into(),
            });
        }
        if state.links.insert(link_key(self.id, peer.id)) {
            state.emit_link(self.id, peer.id, LinkState::Opened);
        }
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, HostEvent> {
        match self.events.lock().take() {
            Some(rx) => channel_stream(rx),
            None => stream::empty().boxed(),
        }
    }
}

// ── Discovery ────────────────────────────────────────────────────────

pub struct MemoryDiscovery {
    net: MemoryNetwork,
}

impl std::fmt::Debug for MemoryDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDiscovery").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Discovery for MemoryDiscovery {
    /// Every registered host (the caller included), in identity order.
    async fn discover_peers(
        &self,
        _cancel: CancellationToken,
        limit: usize,
    ) -> Result<BoxStream<'static, PeerInfo>, ClusterError> {
        let state = self.net.state.lock();
        let mut ids: Vec<PeerId> = state.hosts.keys().copied().collect();
        ids.sort();
        let found: Vec<PeerInfo> = ids
            .into_iter()
            .filter_map(|id| MemoryNetwork::peer_info(&state, id))
            .take(limit)
            .collect();
        Ok(stream::iter(found).boxed())
    }

    /// Hosts that joined the `namespace` topic.
    async fn find_peers(
        &self,
        _cancel: CancellationToken,
        namespace: &str,
        limit: usize,
    ) -> Result<BoxStream<'static, PeerInfo>, ClusterError> {
        let state = self.net.state.lock();
        let found: Vec<PeerInfo> = state
            .members
            .get(namespace)
            .into_iter()
            .flatten()
            .filter_map(|id| MemoryNetwork::peer_info(&state, *id))
            .take(limit)
            .collect();
        Ok(stream::iter(found).boxed())
    }
}

// ── PubSub ───────────────────────────────────────────────────────────

pub struct MemoryPubSub {
    id: PeerId,
    net: MemoryNetwork,
}

impl std::fmt::Debug for MemoryPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPubSub").field("id", &self.id).finish()
    }
}

#[async_trait::async_trait]
impl PubSub for MemoryPubSub {
    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, ClusterError> {
        self.net
            .state
            .lock()
            .members
            .entry(topic.to_string())
            .or_default()
            .insert(self.id);
        Ok(Arc::new(MemoryTopic {
            id: self.id,
            name: topic.to_string(),
            net: self.net.clone(),
        }))
    }

    fn register_validator(
        &self,
        topic: &str,
        validator: Arc<dyn Validator>,
    ) -> Result<(), ClusterError> {
        let mut state = self.net.state.lock();
        let key = (self.id, topic.to_string());
        if state.validators.contains_key(&key) {
            return Err(ClusterError::Substrate(format!(
                "validator already registered for {topic}"
            )));
        }
        state.validators.insert(key, validator);
        Ok(())
    }

    fn unregister_validator(&self, topic: &str) {
        self.net.state.lock().validators.remove(&(self.id, topic.to_string()));
    }
}

pub struct MemoryTopic {
    id: PeerId,
    name: String,
    net: MemoryNetwork,
}

impl std::fmt::Debug for MemoryTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTopic")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait::async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    /// Deliver to every other subscriber whose validator accepts.
    async fn publish(&self, cancel: CancellationToken, data: Bytes) -> Result<(), PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Other("cancelled".into()));
        }

        let mut state = self.net.state.lock();
        if state.closed_topics.contains(&self.name) {
            return Err(PublishError::Closed);
        }

        let seqno = {
            let seq = state.seqnos.entry(self.id).or_insert(0);
            *seq += 1;
            *seq
        };

        let state = &mut *state;
        let validators = &state.validators;
        if let Some(subs) = state.subscribers.get_mut(&self.name) {
            subs.retain(|sub| {
                if sub.peer == self.id {
                    return !sub.tx.is_closed();
                }
                let mut msg = Message {
                    from: self.id,
                    seqno,
                    topic: self.name.clone(),
                    data: data.clone(),
                    heartbeat: None,
                };
                let verdict = validators
                    .get(&(sub.peer, self.name.clone()))
                    .map_or(Validation::Accept, |v| v.validate(&mut msg));
                if verdict == Validation::Reject {
                    return true;
                }
                sub.tx.send(msg).is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Message>, ClusterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.net
            .state
            .lock()
            .subscribers
            .entry(self.name.clone())
            .or_default()
            .push(Subscriber { peer: self.id, tx });
        Ok(channel_stream(rx))
    }
}
