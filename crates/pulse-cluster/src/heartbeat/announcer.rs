/// Announcer: periodic self-announcement on the heartbeat topic.
///
/// Publishes once immediately, then every `TTL/2 + jitter` where jitter is
/// uniform in `[TTL/4, TTL/2)`. The jitter RNG is seeded from the node's
/// identity: a restarted node reproduces its own schedule, distinct nodes
/// are uncorrelated.
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, PublishError};
use crate::heartbeat::Heartbeat;
use crate::metrics::ClusterMetrics;
use crate::substrate::{Host, Topic};
use crate::types::PeerId;

/// Deterministic announce delays for one node.
///
/// Jitter has millisecond resolution, matching the TTL on the wire, so a
/// rounded-up timer never pushes an announcement past its own TTL.
#[derive(Debug)]
pub struct AnnounceSchedule {
    rng: StdRng,
    base: Duration,
    jitter_lo: u64,
    jitter_hi: u64,
}

impl AnnounceSchedule {
    pub fn new(id: PeerId, ttl: Duration) -> Self {
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            rng: StdRng::from_seed(*id.as_bytes()),
            base: Duration::from_millis(millis(ttl / 2)),
            jitter_lo: millis(ttl / 4),
            jitter_hi: millis(ttl / 2),
        }
    }

    /// Delay until the next announcement, in `[0.75·TTL, TTL)`.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = if self.jitter_lo < self.jitter_hi {
            self.rng.random_range(self.jitter_lo..self.jitter_hi)
        } else {
            self.jitter_lo
        };
        self.base + Duration::from_millis(jitter)
    }
}

/// Heartbeat publisher for the local node.
pub struct Announcer {
    host: Arc<dyn Host>,
    topic: Arc<dyn Topic>,
    ttl: Duration,
    metrics: Arc<ClusterMetrics>,
}

impl Announcer {
    pub fn new(
        host: Arc<dyn Host>,
        topic: Arc<dyn Topic>,
        ttl: Duration,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            host,
            topic,
            ttl,
            metrics,
        }
    }

    /// Spawn the announce loop.
    ///
    /// Fails with [`ClusterError::NoListenAddrs`] if the host is not yet
    /// listening; the caller retries once it is. The task ends on
    /// cancellation or when the topic reports it is closed.
    pub fn start(self, cancel: CancellationToken) -> Result<JoinHandle<()>, ClusterError> {
        if self.host.addrs().is_empty() {
            return Err(ClusterError::NoListenAddrs);
        }
        let payload = Bytes::from(Heartbeat::new(self.ttl).to_bytes()?);
        Ok(tokio::spawn(self.run(payload, cancel)))
    }

    async fn run(self, payload: Bytes, cancel: CancellationToken) {
        let id = self.host.id();
        let mut schedule = AnnounceSchedule::new(id, self.ttl);
        tracing::info!(
            peer = %id.fmt_short(),
            topic = self.topic.name(),
            ttl_ms = self.ttl.as_millis() as u64,
            "announcer: started"
        );

        loop {
            match self.topic.publish(cancel.clone(), payload.clone()).await {
                Ok(()) => {
                    self.metrics.heartbeats_published.inc();
                    tracing::trace!("announcer: heartbeat published");
                }
                Err(PublishError::Closed) => {
                    tracing::debug!("announcer: topic closed, stopping");
                    return;
                }
                Err(e) => {
                    self.metrics.publish_failures.inc();
                    tracing::warn!(error = %e, "announcer: publish failed");
                }
            }

            let delay = schedule.next_delay();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("announcer: cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
