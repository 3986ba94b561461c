//! Collaborator seams.
//!
//! The cluster layer never talks to sockets, routing tables or gossip
//! meshes directly. It consumes three collaborators through these traits:
//!
//! - [`Host`]: local identity, listen addresses, dialing and the
//!   connection/stream event feed.
//! - [`Discovery`]: bootstrap discovery and namespace (routing) lookup.
//! - [`PubSub`] / [`Topic`]: heartbeat dissemination with a per-topic
//!   [`Validator`] gate.
//!
//! [`memory`] provides an in-process implementation of all three.

pub mod memory;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, PublishError};
use crate::heartbeat::Heartbeat;
use crate::types::{LinkState, PeerId, PeerInfo, PeerKind};

/// Connection and stream notifications from the network collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connection {
        peer: PeerId,
        state: LinkState,
        kind: PeerKind,
    },
    Stream {
        peer: PeerId,
        protocol: String,
        state: LinkState,
        kind: PeerKind,
    },
}

impl HostEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            HostEvent::Connection { peer, .. } | HostEvent::Stream { peer, .. } => *peer,
        }
    }
}

/// The local network host.
#[async_trait::async_trait]
pub trait Host: Send + Sync + 'static {
    /// This node's identity.
    fn id(&self) -> PeerId;

    /// Currently bound listen addresses.
    fn addrs(&self) -> Vec<SocketAddr>;

    /// Open a connection to `peer`. Already-connected peers succeed.
    async fn connect(&self, cancel: CancellationToken, peer: PeerInfo) -> Result<(), ClusterError>;

    /// Connection/stream event feed. Intended to be taken once.
    fn events(&self) -> BoxStream<'static, HostEvent>;
}

/// Peer discovery strategies.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Bootstrap discovery: any reachable cluster members.
    async fn discover_peers(
        &self,
        cancel: CancellationToken,
        limit: usize,
    ) -> Result<BoxStream<'static, PeerInfo>, ClusterError>;

    /// Routing discovery: peers advertising `namespace`.
    async fn find_peers(
        &self,
        cancel: CancellationToken,
        namespace: &str,
        limit: usize,
    ) -> Result<BoxStream<'static, PeerInfo>, ClusterError>;
}

/// A pub/sub message as seen by validators and subscribers.
///
/// Sender identity and sequence number come from the substrate envelope,
/// not from the payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: PeerId,
    pub seqno: u64,
    pub topic: String,
    pub data: Bytes,
    /// Decoded payload, attached by the validator on acceptance.
    pub heartbeat: Option<Heartbeat>,
}

/// Validator verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Deliver locally and keep disseminating.
    Accept,
    /// Drop; do not forward.
    Reject,
}

/// Gate invoked by the substrate on every incoming message of a topic.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, msg: &mut Message) -> Validation;
}

/// Handle to a joined topic.
#[async_trait::async_trait]
pub trait Topic: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn publish(&self, cancel: CancellationToken, data: Bytes) -> Result<(), PublishError>;

    /// Stream of validated messages from other peers.
    async fn subscribe(&self) -> Result<BoxStream<'static, Message>, ClusterError>;
}

/// The gossip substrate.
#[async_trait::async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, ClusterError>;

    fn register_validator(
        &self,
        topic: &str,
        validator: Arc<dyn Validator>,
    ) -> Result<(), ClusterError>;

    /// Remove the validator for `topic`, if any.
    fn unregister_validator(&self, topic: &str);
}
