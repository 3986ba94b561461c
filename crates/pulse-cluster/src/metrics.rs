//! Cluster statistics.
//!
//! [`Counter`] and [`Gauge`] are plain atomics with `Relaxed` ordering;
//! they feed log lines and snapshots, never control flow.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonically increasing counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

/// Last-written value.
#[derive(Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gauge").field(&self.get()).finish()
    }
}

/// Counters shared by the announcer, validator and controller.
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    pub heartbeats_published: Counter,
    pub publish_failures: Counter,
    pub heartbeats_accepted: Counter,
    pub heartbeats_stale: Counter,
    pub heartbeats_malformed: Counter,
    pub messages_delivered: Counter,
    pub joins_started: Counter,
    pub grafts_started: Counter,
    pub dials_succeeded: Counter,
    pub dials_failed: Counter,
    pub operations_cancelled: Counter,
    pub degree: Gauge,
}

impl ClusterMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            heartbeats_published: self.heartbeats_published.get(),
            publish_failures: self.publish_failures.get(),
            heartbeats_accepted: self.heartbeats_accepted.get(),
            heartbeats_stale: self.heartbeats_stale.get(),
            heartbeats_malformed: self.heartbeats_malformed.get(),
            messages_delivered: self.messages_delivered.get(),
            joins_started: self.joins_started.get(),
            grafts_started: self.grafts_started.get(),
            dials_succeeded: self.dials_succeeded.get(),
            dials_failed: self.dials_failed.get(),
            operations_cancelled: self.operations_cancelled.get(),
            degree: self.degree.get(),
        }
    }
}

/// Point-in-time copy of [`ClusterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub heartbeats_published: u64,
    pub publish_failures: u64,
    pub heartbeats_accepted: u64,
    pub heartbeats_stale: u64,
    pub heartbeats_malformed: u64,
    pub messages_delivered: u64,
    pub joins_started: u64,
    pub grafts_started: u64,
    pub dials_succeeded: u64,
    pub dials_failed: u64,
    pub operations_cancelled: u64,
    pub degree: u64,
}
