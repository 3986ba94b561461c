//! ConnectivityController: closed-loop degree control.
//!
//! Consumes [`PhaseChangeEvent`]s and reacts to the latest phase:
//!
//! | Phase        | Action                                              |
//! |--------------|-----------------------------------------------------|
//! | `Orphaned`   | `join`: dial a few bootstrap peers                  |
//! | `Partial`    | `graft`: dial `kmin - N` peers from the namespace   |
//! | `Complete`   | nothing                                             |
//! | `Overloaded` | cancel in-flight `join` / `graft`                   |
//!
//! A backstop tick re-applies the action for the last phase, so missed or
//! coalesced events are eventually acted upon. Operations are deduplicated
//! per key through [`Singleflight`] and always release their key when they
//! finish.
pub mod singleflight;

pub use singleflight::{Flight, Singleflight};

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::phase::{Phase, PhaseChangeEvent};
use crate::substrate::{Discovery, Host};
use crate::types::{PeerId, PeerInfo};

const JOIN: &str = "join";
const GRAFT: &str = "graft";

#[derive(Clone)]
pub struct ConnectivityController {
    inner: Arc<Inner>,
}

struct Inner {
    host: Arc<dyn Host>,
    discovery: Arc<dyn Discovery>,
    config: ClusterConfig,
    flights: Singleflight,
    metrics: Arc<ClusterMetrics>,
}

/// Last observed connectivity, as seen through events.
struct Observed {
    phase: Phase,
    degree: usize,
    neighbours: HashSet<PeerId>,
}

/// Removes a singleflight marker when the leader's future ends.
struct Release {
    inner: Arc<Inner>,
    key: &'static str,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.inner.flights.reset(self.key);
    }
}

impl ConnectivityController {
    pub fn new(
        host: Arc<dyn Host>,
        discovery: Arc<dyn Discovery>,
        config: ClusterConfig,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                discovery,
                config,
                flights: Singleflight::new(),
                metrics,
            }),
        }
    }

    /// Whether a `"join"` or `"graft"` operation is running.
    pub fn in_flight(&self, key: &str) -> bool {
        self.inner.flights.in_flight(key)
    }

    /// Event loop. Returns when `cancel` fires, after in-flight operations
    /// have wound down.
    pub async fn run(self, mut events: mpsc::Receiver<PhaseChangeEvent>, cancel: CancellationToken) {
        let mut observed = Observed {
            phase: Phase::Orphaned,
            degree: 0,
            neighbours: HashSet::new(),
        };
        let mut tasks = JoinSet::new();
        let mut backstop = tokio::time::interval(self.inner.config.backstop_interval);
        backstop.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv(), if events_open => {
                    let Some(event) = event else {
                        tracing::debug!("controller: event source closed, backstop only");
                        events_open = false;
                        continue;
                    };
                    if event.n > observed.degree {
                        observed.neighbours.insert(event.peer);
                    } else {
                        observed.neighbours.remove(&event.peer);
                    }
                    observed.phase = event.to;
                    observed.degree = event.n;
                    if event.from != event.to {
                        tracing::info!(from = %event.from, to = %event.to, n = event.n, "controller: phase changed");
                    }
                    self.apply(&observed, &cancel, &mut tasks);
                }
                _ = backstop.tick() => {
                    tracing::trace!(phase = %observed.phase, n = observed.degree, "controller: backstop tick");
                    self.apply(&observed, &cancel, &mut tasks);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "controller: operation task failed");
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        tracing::debug!("controller: stopped");
    }

    fn apply(&self, observed: &Observed, cancel: &CancellationToken, tasks: &mut JoinSet<()>) {
        match observed.phase {
            Phase::Orphaned => self.launch(JOIN, cancel, tasks, |inner, token| async move {
                inner.metrics.joins_started.inc();
                inner.join(token).await
            }),
            Phase::Partial => {
                let deficit = self.inner.config.kmin.saturating_sub(observed.degree);
                if deficit == 0 {
                    return;
                }
                let exclude = observed.neighbours.clone();
                self.launch(GRAFT, cancel, tasks, move |inner, token| async move {
                    inner.metrics.grafts_started.inc();
                    inner.graft(deficit, exclude, token).await
                });
            }
            Phase::Overloaded => {
                for key in [JOIN, GRAFT] {
                    if self.inner.flights.cancel(key) {
                        self.inner.metrics.operations_cancelled.inc();
                        tracing::info!(operation = key, "controller: overloaded, cancelling");
                    }
                }
            }
            Phase::Complete => {}
        }
    }

    /// Spawn `op` under the singleflight marker for `key`.
    fn launch<F, Fut>(&self, key: &'static str, cancel: &CancellationToken, tasks: &mut JoinSet<()>, op: F)
    where
        F: FnOnce(Arc<Inner>, CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<usize, ClusterError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let flight = inner
                .flights
                .run(key, &cancel, |token| {
                    let release = Release {
                        inner: inner.clone(),
                        key,
                    };
                    let op = inner.clone().guarded(key, token, op);
                    async move {
                        let _release = release;
                        op.await
                    }
                })
                .await;

            match flight {
                Flight::Executed(Ok(connected)) => {
                    tracing::info!(operation = key, connected, "controller: operation finished");
                }
                Flight::Executed(Err(ClusterError::Cancelled)) => {
                    tracing::debug!(operation = key, "controller: operation cancelled");
                }
                Flight::Executed(Err(e)) => {
                    tracing::warn!(operation = key, error = %e, "controller: operation failed");
                }
                Flight::Joined => {
                    tracing::trace!(operation = key, "controller: joined in-flight operation");
                }
            }
        });
    }
}

impl std::fmt::Debug for ConnectivityController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityController")
            .field("flights", &self.inner.flights)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Bound `op` by the operation timeout and its cancellation token.
    async fn guarded<F, Fut>(
        self: Arc<Self>,
        operation: &'static str,
        token: CancellationToken,
        op: F,
    ) -> Result<usize, ClusterError>
    where
        F: FnOnce(Arc<Inner>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<usize, ClusterError>>,
    {
        tracing::info!(operation, "controller: operation started");
        let timeout = self.config.operation_timeout;
        let fut = op(self, token.clone());
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClusterError::Cancelled),
            result = tokio::time::timeout(timeout, fut) => {
                result.unwrap_or(Err(ClusterError::OperationTimeout { operation }))
            }
        }
    }

    /// Dial up to `join_limit` bootstrap peers. Succeeds if any dial does.
    async fn join(&self, token: CancellationToken) -> Result<usize, ClusterError> {
        let limit = self.config.join_limit;
        let found = self.discovery.discover_peers(token.clone(), limit + 1).await?;
        let dialed = self.dial_found(found, &HashSet::new(), limit, &token).await;
        match dialed {
            Dialed { attempted: 0, .. } => {
                Err(ClusterError::Discovery("no bootstrap candidates".into()))
            }
            Dialed {
                connected: 0,
                last_err: Some(e),
                ..
            } => Err(e),
            Dialed { connected, .. } => Ok(connected),
        }
    }

    /// Dial up to `deficit` namespace peers not already connected.
    /// Individual failures are logged, not returned.
    async fn graft(
        &self,
        deficit: usize,
        exclude: HashSet<PeerId>,
        token: CancellationToken,
    ) -> Result<usize, ClusterError> {
        let limit = deficit + exclude.len() + 1;
        let found = self
            .discovery
            .find_peers(token.clone(), &self.config.namespace, limit)
            .await?;
        let dialed = self.dial_found(found, &exclude, deficit, &token).await;
        tracing::debug!(
            deficit,
            attempted = dialed.attempted,
            connected = dialed.connected,
            "controller: graft dialed"
        );
        Ok(dialed.connected)
    }

    /// Dial candidates as discovery yields them, up to `limit`.
    ///
    /// Reading the stream stops at `limit` accepted candidates, when it
    /// ends, when `discovery_timeout` elapses or when `token` fires; dials
    /// already started are always awaited.
    async fn dial_found(
        &self,
        mut found: BoxStream<'static, PeerInfo>,
        exclude: &HashSet<PeerId>,
        limit: usize,
        token: &CancellationToken,
    ) -> Dialed {
        let local = self.host.id();
        let mut dials = JoinSet::new();
        let mut dialed = Dialed::default();
        let mut discovering = limit > 0;
        let discovery_deadline = tokio::time::sleep(self.config.discovery_timeout);
        tokio::pin!(discovery_deadline);

        loop {
            tokio::select! {
                peer = found.next(), if discovering => match peer {
                    Some(peer) if peer.id != local && !exclude.contains(&peer.id) => {
                        dialed.attempted += 1;
                        if dialed.attempted >= limit {
                            discovering = false;
                        }
                        self.spawn_dial(&mut dials, peer, token);
                    }
                    Some(_) => {}
                    None => discovering = false,
                },
                _ = &mut discovery_deadline, if discovering => {
                    tracing::debug!(found = dialed.attempted, "controller: discovery timed out");
                    discovering = false;
                }
                _ = token.cancelled(), if discovering => discovering = false,
                Some(joined) = dials.join_next(), if !dials.is_empty() => self.record(joined, &mut dialed),
                else => break,
            }
        }
        dialed
    }

    fn spawn_dial(
        &self,
        dials: &mut JoinSet<(PeerId, Result<(), ClusterError>)>,
        peer: PeerInfo,
        token: &CancellationToken,
    ) {
        let host = self.host.clone();
        let token = token.clone();
        let dial_timeout = self.config.dial_timeout;
        dials.spawn(async move {
            let id = peer.id;
            let result = tokio::select! {
                _ = token.cancelled() => Err(ClusterError::Cancelled),
                result = tokio::time::timeout(dial_timeout, host.connect(token.clone(), peer)) => {
                    result.unwrap_or(Err(ClusterError::DialTimeout { peer: id }))
                }
            };
            (id, result)
        });
    }

    fn record(
        &self,
        joined: Result<(PeerId, Result<(), ClusterError>), tokio::task::JoinError>,
        dialed: &mut Dialed,
    ) {
        match joined {
            Ok((peer, Ok(()))) => {
                dialed.connected += 1;
                self.metrics.dials_succeeded.inc();
                tracing::debug!(peer = %peer.fmt_short(), "controller: connected");
            }
            Ok((peer, Err(e))) => {
                self.metrics.dials_failed.inc();
                tracing::debug!(peer = %peer.fmt_short(), error = %e, "controller: dial failed");
                dialed.last_err = Some(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "controller: dial task failed");
            }
        }
    }
}

/// Outcome of one round of dials.
#[derive(Debug, Default)]
struct Dialed {
    attempted: usize,
    connected: usize,
    last_err: Option<ClusterError>,
}
