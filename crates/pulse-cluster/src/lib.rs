//! Pulse cluster layer.
//!
//! Decentralized liveness and degree control on top of a pub/sub and
//! peer-routing substrate:
//!
//! - every node gossips a heartbeat carrying its TTL; receivers keep a
//!   [`LivenessFilter`] of peers whose latest heartbeat is still fresh,
//! - a [`PhaseTracker`] classifies the node's host degree against a
//!   `[kmin, kmax)` target,
//! - a [`ConnectivityController`] joins, grafts or backs off to keep the
//!   degree in range.
//!
//! The substrate is consumed through the traits in [`substrate`];
//! [`substrate::memory`] runs everything in-process.
//!
//! Wire format: the heartbeat payload is a single MessagePack integer.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod liveness;
pub mod metrics;
pub mod phase;
pub mod substrate;
pub mod types;

pub use cluster::{Cluster, ClusterHandle};
pub use config::{ClusterConfig, DEFAULT_NAMESPACE};
pub use controller::{ConnectivityController, Flight, Singleflight};
pub use error::{ClusterError, PublishError};
pub use events::ClusterEvent;
pub use heartbeat::{AnnounceSchedule, Announcer, Heartbeat, HeartbeatValidator};
pub use liveness::LivenessFilter;
pub use metrics::{ClusterMetrics, Counter, Gauge, MetricsSnapshot};
pub use phase::{phase, Phase, PhaseChangeEvent, PhaseSnapshot, PhaseTracker};
pub use substrate::{Discovery, Host, HostEvent, Message, PubSub, Topic, Validation, Validator};
pub use types::{LinkState, PeerId, PeerInfo, PeerKind};
