//! Node orchestration.
//!
//! [`Cluster::spawn`] wires the liveness filter, heartbeat announcer and
//! validator, phase tracker and connectivity controller around the three
//! substrate collaborators, then hands back a [`ClusterHandle`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::controller::ConnectivityController;
use crate::error::ClusterError;
use crate::events::ClusterEvent;
use crate::heartbeat::{Announcer, Heartbeat, HeartbeatValidator};
use crate::liveness::LivenessFilter;
use crate::metrics::{ClusterMetrics, MetricsSnapshot};
use crate::phase::{PhaseChangeEvent, PhaseSnapshot, PhaseTracker};
use crate::substrate::{Discovery, Host, HostEvent, Message, PubSub};
use crate::types::PeerId;

/// Entry point for running the cluster layer on one node.
#[derive(Debug)]
pub struct Cluster;

impl Cluster {
    /// Build every component and spawn the background tasks.
    ///
    /// The tasks stop when `cancel` (or any ancestor) is cancelled, when
    /// [`ClusterHandle::shutdown`] is called, or when the handle is dropped.
    ///
    /// Fails with [`ClusterError::NoListenAddrs`] if `host` is not yet
    /// listening.
    pub async fn spawn(
        host: Arc<dyn Host>,
        discovery: Arc<dyn Discovery>,
        pubsub: Arc<dyn PubSub>,
        config: ClusterConfig,
        cancel: CancellationToken,
    ) -> Result<ClusterHandle, ClusterError> {
        config.validate()?;
        if host.addrs().is_empty() {
            return Err(ClusterError::NoListenAddrs);
        }

        let local_id = host.id();
        let root = cancel.child_token();
        let filter = Arc::new(LivenessFilter::new());
        let metrics = Arc::new(ClusterMetrics::default());
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(filter.clone().run_reaper(root.clone())));

        let result = Self::start(host, discovery, pubsub, &config, &filter, &metrics, &root, &mut tasks).await;
        let (phase_rx, events_tx) = match result {
            Ok(channels) => channels,
            Err(e) => {
                root.cancel();
                return Err(e);
            }
        };

        tracing::info!(
            peer = %local_id.fmt_short(),
            namespace = config.namespace.as_str(),
            kmin = config.kmin,
            kmax = config.kmax,
            "cluster: started"
        );

        Ok(ClusterHandle {
            local_id,
            filter,
            metrics,
            phase: phase_rx,
            events: events_tx,
            cancel: root,
            tasks,
        })
    }

    /// Register the heartbeat validator, then wire everything else.
    /// The registration is undone if any later step fails.
    #[allow(clippy::too_many_arguments)]
    async fn start(
        host: Arc<dyn Host>,
        discovery: Arc<dyn Discovery>,
        pubsub: Arc<dyn PubSub>,
        config: &ClusterConfig,
        filter: &Arc<LivenessFilter>,
        metrics: &Arc<ClusterMetrics>,
        root: &CancellationToken,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(watch::Receiver<PhaseSnapshot>, broadcast::Sender<ClusterEvent>), ClusterError> {
        let validator = Arc::new(HeartbeatValidator::new(filter.clone(), metrics.clone()));
        pubsub.register_validator(&config.namespace, validator)?;

        let result = Self::wire(host, discovery, pubsub.as_ref(), config, metrics, root, tasks).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, topic = config.namespace.as_str(), "cluster: startup failed, unregistering validator");
            pubsub.unregister_validator(&config.namespace);
        }
        result
    }

    async fn wire(
        host: Arc<dyn Host>,
        discovery: Arc<dyn Discovery>,
        pubsub: &dyn PubSub,
        config: &ClusterConfig,
        metrics: &Arc<ClusterMetrics>,
        root: &CancellationToken,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(watch::Receiver<PhaseSnapshot>, broadcast::Sender<ClusterEvent>), ClusterError> {
        let topic = pubsub.join(&config.namespace).await?;
        let messages = topic.subscribe().await?;

        let announcer = Announcer::new(host.clone(), topic, config.ttl, metrics.clone());
        tasks.push(announcer.start(root.clone())?);

        tasks.push(tokio::spawn(deliver(messages, metrics.clone(), root.clone())));

        let (phase_tx, phase_rx) = watch::channel(PhaseSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_buffer);
        let (changes_tx, changes_rx) = mpsc::channel(config.event_buffer);
        let tracker = PhaseTracker::new(config.kmin, config.kmax);
        tasks.push(tokio::spawn(track(
            host.events(),
            tracker,
            Outputs {
                phase: phase_tx,
                events: events_tx.clone(),
                changes: changes_tx,
                metrics: metrics.clone(),
            },
            root.clone(),
        )));

        let controller = ConnectivityController::new(host, discovery, config.clone(), metrics.clone());
        tasks.push(tokio::spawn(controller.run(changes_rx, root.clone())));

        Ok((phase_rx, events_tx))
    }
}

/// Drain the heartbeat subscription.
///
/// Liveness was already updated by the registered validator. Messages from
/// substrates that do not attach the decoded heartbeat are only decoded
/// here, never upserted a second time.
async fn deliver(
    mut messages: BoxStream<'static, Message>,
    metrics: Arc<ClusterMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = messages.next() => match msg {
                Some(msg) => msg,
                None => {
                    tracing::debug!("cluster: heartbeat subscription ended");
                    break;
                }
            },
        };
        if msg.heartbeat.is_none() {
            if let Err(e) = Heartbeat::from_bytes(&msg.data) {
                tracing::debug!(peer = %msg.from.fmt_short(), error = %e, "cluster: undecodable heartbeat delivered");
                continue;
            }
        }
        metrics.messages_delivered.inc();
        tracing::trace!(peer = %msg.from.fmt_short(), seq = msg.seqno, "cluster: heartbeat delivered");
    }
}

struct Outputs {
    phase: watch::Sender<PhaseSnapshot>,
    events: broadcast::Sender<ClusterEvent>,
    changes: mpsc::Sender<PhaseChangeEvent>,
    metrics: Arc<ClusterMetrics>,
}

/// Feed host events through the tracker and fan out the results.
async fn track(
    mut host_events: BoxStream<'static, HostEvent>,
    mut tracker: PhaseTracker,
    out: Outputs,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = host_events.next() => match event {
                Some(event) => event,
                None => {
                    tracing::debug!("cluster: host event feed ended");
                    break;
                }
            },
        };

        let change = tracker.observe(&event);
        // No subscribers is fine.
        let _ = out.events.send(event.into());

        let Some(change) = change else { continue };
        out.metrics.degree.set(change.n as u64);
        out.phase.send_replace(PhaseSnapshot {
            phase: change.to,
            degree: change.n,
        });
        if change.from != change.to {
            tracing::info!(from = %change.from, to = %change.to, n = change.n, "phase: transition");
        }
        let _ = out.events.send(change.into());
        if out.changes.send(change).await.is_err() {
            tracing::debug!("cluster: controller gone, tracker stopping");
            break;
        }
    }
}

/// Running cluster layer of one node.
///
/// Dropping the handle cancels all background tasks without waiting for
/// them; [`shutdown`](Self::shutdown) also waits.
pub struct ClusterHandle {
    local_id: PeerId,
    filter: Arc<LivenessFilter>,
    metrics: Arc<ClusterMetrics>,
    phase: watch::Receiver<PhaseSnapshot>,
    events: broadcast::Sender<ClusterEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterHandle {
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Peers with a live heartbeat. Never includes the local node.
    pub fn peers(&self) -> HashSet<PeerId> {
        self.filter.peers()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.filter.contains(id)
    }

    /// Latest phase and degree.
    pub fn phase(&self) -> PhaseSnapshot {
        *self.phase.borrow()
    }

    /// Watch channel of phase snapshots.
    pub fn watch_phase(&self) -> watch::Receiver<PhaseSnapshot> {
        self.phase.clone()
    }

    /// Connection, stream and phase events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn filter(&self) -> &Arc<LivenessFilter> {
        &self.filter
    }

    /// Whether the background tasks have been told to stop.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every background task and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "cluster: task failed during shutdown");
            }
        }
        tracing::info!(peer = %self.local_id.fmt_short(), "cluster: stopped");
    }
}

impl Drop for ClusterHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("local_id", &self.local_id)
            .field("phase", &*self.phase.borrow())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{Validation, Validator};
    use bytes::Bytes;
    use std::time::Duration;

    fn heartbeat_from(seed: u8, seqno: u64, data: Vec<u8>) -> Message {
        Message {
            from: PeerId::from_bytes([seed; 32]),
            seqno,
            topic: "ns".into(),
            data: Bytes::from(data),
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn delivery_does_not_revalidate_accepted_heartbeats() {
        let filter = Arc::new(LivenessFilter::new());
        let metrics = Arc::new(ClusterMetrics::default());
        let validator = HeartbeatValidator::new(filter.clone(), metrics.clone());
        let payload = Heartbeat::new(Duration::from_secs(5)).to_bytes().unwrap();

        // The substrate validated this one but did not attach the payload.
        let mut accepted = heartbeat_from(1, 7, payload);
        assert_eq!(validator.validate(&mut accepted), Validation::Accept);
        accepted.heartbeat = None;
        let junk = heartbeat_from(2, 1, b"\xa4junk".to_vec());

        let messages = futures::stream::iter(vec![accepted, junk]).boxed();
        deliver(messages, metrics.clone(), CancellationToken::new()).await;

        assert_eq!(metrics.messages_delivered.get(), 1);
        assert_eq!(metrics.heartbeats_accepted.get(), 1);
        assert_eq!(metrics.heartbeats_stale.get(), 0);
        assert_eq!(metrics.heartbeats_malformed.get(), 0);
        assert_eq!(filter.sequence(&PeerId::from_bytes([1; 32])), Some(7));
        assert!(!filter.contains(&PeerId::from_bytes([2; 32])));
    }
}
