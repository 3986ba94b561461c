//! Integration tests: full cluster layer on the in-memory substrate.
//!
//! Every test runs on a paused clock, so TTL expiry and backstop ticks are
//! deterministic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pulse_cluster::substrate::memory::{MemoryNetwork, MemoryNode, MemoryPubSub};
use pulse_cluster::{
    Cluster, ClusterConfig, ClusterError, ClusterEvent, ClusterHandle, LinkState, PeerId, PeerKind,
    Phase, PubSub, Topic, Validator,
};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn peer(seed: u8) -> PeerId {
    PeerId::from_bytes([seed; 32])
}

fn addrs(seed: u8) -> Vec<SocketAddr> {
    vec![SocketAddr::from(([10, 0, 0, seed], 4001))]
}

fn config() -> ClusterConfig {
    ClusterConfig::new()
        .namespace("itest")
        .ttl(Duration::from_secs(1))
        .degree(2, 4)
        .join_limit(2)
        .dial_timeout(Duration::from_millis(500))
        .operation_timeout(Duration::from_secs(2))
        .backstop_interval(Duration::from_secs(3))
}

async fn spawn(node: &MemoryNode, config: ClusterConfig, cancel: &CancellationToken) -> ClusterHandle {
    Cluster::spawn(
        node.host.clone(),
        node.discovery.clone(),
        node.pubsub.clone(),
        config,
        cancel.clone(),
    )
    .await
    .unwrap()
}

async fn three_nodes() -> (MemoryNetwork, CancellationToken, Vec<ClusterHandle>) {
    let net = MemoryNetwork::new();
    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for seed in 1..=3 {
        let node = net.add_node(peer(seed), addrs(seed));
        handles.push(spawn(&node, config(), &cancel).await);
    }
    (net, cancel, handles)
}

/// Three nodes announce, validate and end up in each other's filters.
#[tokio::test(start_paused = true)]
async fn nodes_discover_each_other() {
    init_tracing();
    let (_net, cancel, handles) = three_nodes().await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    for handle in &handles {
        let peers = handle.peers();
        assert_eq!(peers.len(), 2, "{:?} sees {peers:?}", handle.local_id());
        assert!(!peers.contains(&handle.local_id()));
        for other in &handles {
            if other.local_id() != handle.local_id() {
                assert!(handle.contains(&other.local_id()));
            }
        }
        let metrics = handle.metrics();
        assert!(metrics.heartbeats_accepted >= 2);
        assert!(metrics.heartbeats_published >= 2);
        assert_eq!(metrics.heartbeats_stale, 0);
    }

    cancel.cancel();
    for handle in handles {
        handle.shutdown().await;
    }
}

/// A node that stops announcing drops out of everyone's view within its TTL.
#[tokio::test(start_paused = true)]
async fn silent_node_expires() {
    init_tracing();
    let (_net, cancel, mut handles) = three_nodes().await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let gone = handles.pop().unwrap();
    let gone_id = gone.local_id();
    assert!(handles[0].contains(&gone_id));

    gone.shutdown().await;
    tokio::time::sleep(Duration::from_millis(1100)).await;

    for handle in &handles {
        assert!(!handle.contains(&gone_id));
        assert!(!handle.peers().contains(&gone_id));
        assert_eq!(handle.peers().len(), 1);
    }

    cancel.cancel();
}

/// Fresh nodes join on their own and settle in the target range.
#[tokio::test(start_paused = true)]
async fn degree_reaches_complete() {
    init_tracing();
    let (net, cancel, handles) = three_nodes().await;

    tokio::time::sleep(Duration::from_millis(500)).await;

    for handle in &handles {
        let snapshot = handle.phase();
        assert_eq!(snapshot.degree, 2);
        assert_eq!(snapshot.phase, Phase::Complete);
        assert_eq!(net.degree(handle.local_id()), 2);
        assert_eq!(handle.metrics().degree, 2);
    }

    cancel.cancel();
}

/// Losing every link sends the node back through join.
#[tokio::test(start_paused = true)]
async fn orphaned_node_rejoins() {
    init_tracing();
    let (net, cancel, handles) = three_nodes().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut events = handles[0].subscribe();
    let mut phases = handles[0].watch_phase();
    net.disconnect(peer(1), peer(2));
    net.disconnect(peer(1), peer(3));

    let orphaned = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let ClusterEvent::PhaseChanged(change) = events.recv().await.unwrap() {
                if change.to == Phase::Orphaned {
                    break change;
                }
            }
        }
    })
    .await
    .expect("node should become orphaned");
    assert_eq!(orphaned.n, 0);

    tokio::time::timeout(Duration::from_secs(5), phases.wait_for(|s| s.phase == Phase::Complete))
        .await
        .expect("node should rejoin")
        .unwrap();
    assert_eq!(net.degree(peer(1)), 2);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn events_are_typed_and_clients_do_not_count() {
    init_tracing();
    let net = MemoryNetwork::new();
    let cancel = CancellationToken::new();
    let node = net.add_node(peer(1), addrs(1));
    let handle = spawn(&node, config(), &cancel).await;
    let mut events = handle.subscribe();

    net.open_client(peer(1), peer(42), LinkState::Opened);
    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        ClusterEvent::ConnectionChanged {
            peer: peer(42),
            state: LinkState::Opened,
            kind: PeerKind::Client,
        }
    );
    assert_eq!(handle.phase().degree, 0);

    net.stream_event(peer(1), peer(42), "/pulse/rpc/1", LinkState::Opened);
    assert!(matches!(
        events.recv().await.unwrap(),
        ClusterEvent::StreamChanged { .. }
    ));

    // A late peer's first join dials us.
    let late = net.add_node(peer(2), addrs(2));
    let _late = spawn(&late, config(), &cancel).await;
    let phase_change = loop {
        match events.recv().await.unwrap() {
            ClusterEvent::PhaseChanged(change) => break change,
            _ => continue,
        }
    };
    assert_eq!(phase_change.peer, peer(2));
    assert_eq!(phase_change.from, Phase::Orphaned);
    assert_eq!(phase_change.to, Phase::Partial);
    assert_eq!(phase_change.n, 1);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn spawn_requires_listen_addrs() {
    let net = MemoryNetwork::new();
    let node = net.add_node(peer(1), vec![]);
    let err = Cluster::spawn(
        node.host.clone(),
        node.discovery.clone(),
        node.pubsub.clone(),
        config(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClusterError::NoListenAddrs));
}

#[tokio::test(start_paused = true)]
async fn spawn_rejects_invalid_config() {
    let net = MemoryNetwork::new();
    let node = net.add_node(peer(1), addrs(1));
    let err = Cluster::spawn(
        node.host.clone(),
        node.discovery.clone(),
        node.pubsub.clone(),
        config().degree(4, 4),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClusterError::Config(_)));
}

/// Pub/sub whose first topic join fails.
struct FlakyJoin {
    inner: Arc<MemoryPubSub>,
    failed: AtomicBool,
}

#[async_trait::async_trait]
impl PubSub for FlakyJoin {
    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, ClusterError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::Substrate("join refused".into()));
        }
        self.inner.join(topic).await
    }

    fn register_validator(&self, topic: &str, validator: Arc<dyn Validator>) -> Result<(), ClusterError> {
        self.inner.register_validator(topic, validator)
    }

    fn unregister_validator(&self, topic: &str) {
        self.inner.unregister_validator(topic)
    }
}

#[tokio::test(start_paused = true)]
async fn failed_spawn_can_be_retried() {
    let net = MemoryNetwork::new();
    let node = net.add_node(peer(1), addrs(1));
    let pubsub = Arc::new(FlakyJoin {
        inner: node.pubsub.clone(),
        failed: AtomicBool::new(false),
    });
    let cancel = CancellationToken::new();

    let err = Cluster::spawn(
        node.host.clone(),
        node.discovery.clone(),
        pubsub.clone(),
        config(),
        cancel.clone(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ClusterError::Substrate(_)));

    let handle = Cluster::spawn(node.host.clone(), node.discovery.clone(), pubsub, config(), cancel.clone())
        .await
        .unwrap();
    assert!(!handle.is_shutdown());

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_stops_announcing() {
    let (_net, cancel, handles) = three_nodes().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    cancel.cancel();
    assert!(handles.iter().all(|h| h.is_shutdown()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let published: Vec<u64> = handles.iter().map(|h| h.metrics().heartbeats_published).collect();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let after: Vec<u64> = handles.iter().map(|h| h.metrics().heartbeats_published).collect();
    assert_eq!(published, after);

    // Everyone has expired from everyone else's view.
    assert!(handles.iter().all(|h| h.peers().is_empty()));
}

#[tokio::test(start_paused = true)]
async fn metrics_snapshot_serializes() {
    let (_net, cancel, handles) = three_nodes().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let json = serde_json::to_value(handles[0].metrics()).unwrap();
    assert!(json["heartbeats_published"].as_u64().unwrap() >= 1);
    assert_eq!(json["degree"], 2);

    cancel.cancel();
}
