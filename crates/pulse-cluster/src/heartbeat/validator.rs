use std::sync::Arc;

use crate::heartbeat::Heartbeat;
use crate::liveness::LivenessFilter;
use crate::metrics::ClusterMetrics;
use crate::substrate::{Message, Validation, Validator};

/// Receive-side heartbeat gate.
///
/// Registered with the pub/sub substrate on the heartbeat topic. A message
/// is accepted only if it decodes and its envelope sequence number
/// advances the sender's entry in the [`LivenessFilter`]. Accepted
/// messages carry the decoded [`Heartbeat`] onward in `msg.heartbeat`.
pub struct HeartbeatValidator {
    filter: Arc<LivenessFilter>,
    metrics: Arc<ClusterMetrics>,
}

impl HeartbeatValidator {
    pub fn new(filter: Arc<LivenessFilter>, metrics: Arc<ClusterMetrics>) -> Self {
        Self { filter, metrics }
    }
}

impl Validator for HeartbeatValidator {
    fn validate(&self, msg: &mut Message) -> Validation {
        let hb = match Heartbeat::from_bytes(&msg.data) {
            Ok(hb) => hb,
            Err(e) => {
                self.metrics.heartbeats_malformed.inc();
                tracing::debug!(peer = %msg.from.fmt_short(), error = %e, "heartbeat: dropping malformed payload");
                return Validation::Reject;
            }
        };

        if !self.filter.upsert(msg.from, msg.seqno, hb.ttl()) {
            self.metrics.heartbeats_stale.inc();
            tracing::debug!(peer = %msg.from.fmt_short(), seq = msg.seqno, "heartbeat: dropping stale sequence");
            return Validation::Reject;
        }

        self.metrics.heartbeats_accepted.inc();
        tracing::trace!(peer = %msg.from.fmt_short(), seq = msg.seqno, ttl_ms = hb.ttl().as_millis() as u64, "heartbeat: accepted");
        msg.heartbeat = Some(hb);
        Validation::Accept
    }
}

impl std::fmt::Debug for HeartbeatValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatValidator")
            .field("tracked", &self.filter.tracked_count())
            .finish()
    }
}
