/// LivenessFilter: concurrent TTL registry keyed by peer identity.
///
/// Each entry holds the last accepted sequence number and an expiry
/// deadline. Updates are accepted only when the sequence number strictly
/// increases; an accepted update rearms the deadline with the TTL it
/// carried. Expired entries are invisible to readers immediately and are
/// physically removed by a single reaper task draining a min-heap of
/// deadlines.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::PeerId;

/// Upper bound on a single TTL, keeps deadline arithmetic in range.
const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry {
    /// Highest accepted sequence number.
    seq: AtomicU64,
    /// Rearming the deadline is not atomic with the CAS above.
    timer: Mutex<Timer>,
}

struct Timer {
    /// Sequence number that armed `deadline`.
    armed_by: u64,
    deadline: Instant,
}

impl Entry {
    fn new(seq: u64, deadline: Instant) -> Self {
        Self {
            seq: AtomicU64::new(seq),
            timer: Mutex::new(Timer {
                armed_by: seq,
                deadline,
            }),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.timer.lock().deadline > now
    }

    /// Advance to `seq` if it is newer; rearm the deadline on success.
    fn advance(&self, seq: u64, deadline: Instant) -> bool {
        let mut current = self.seq.load(Ordering::Acquire);
        loop {
            if seq <= current {
                return false;
            }
            match self
                .seq
                .compare_exchange_weak(current, seq, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // Two accepted updates may race to here; the newer one wins.
        let mut timer = self.timer.lock();
        if seq > timer.armed_by {
            timer.armed_by = seq;
            timer.deadline = deadline;
        }
        true
    }
}

/// Concurrent peer liveness registry.
pub struct LivenessFilter {
    entries: RwLock<HashMap<PeerId, Arc<Entry>>>,
    deadlines: Mutex<BinaryHeap<Reverse<(Instant, PeerId)>>>,
    wakeup: Notify,
}

impl LivenessFilter {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            deadlines: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
        }
    }

    /// Record a heartbeat from `id` carrying sequence number `seq`.
    ///
    /// Returns `true` when the update was accepted: either `id` had no
    /// live entry (fresh insert, any `seq`), or `seq` is strictly greater
    /// than the stored one. A rejected update leaves the deadline alone.
    pub fn upsert(&self, id: PeerId, seq: u64, ttl: Duration) -> bool {
        let now = Instant::now();
        let deadline = now + ttl.min(MAX_TTL);

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&id) {
                if entry.is_live(now) {
                    let accepted = entry.advance(seq, deadline);
                    drop(entries);
                    if accepted {
                        self.schedule(id, deadline);
                    }
                    return accepted;
                }
            }
        }

        let mut entries = self.entries.write();
        let accepted = match entries.get(&id) {
            // Lost the race against another insert for the same peer.
            Some(entry) if entry.is_live(now) => entry.advance(seq, deadline),
            _ => {
                entries.insert(id, Arc::new(Entry::new(seq, deadline)));
                true
            }
        };
        drop(entries);

        if accepted {
            self.schedule(id, deadline);
        }
        accepted
    }

    /// Whether `id` has an unexpired entry.
    pub fn contains(&self, id: &PeerId) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .get(id)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Snapshot of all unexpired identities, in no particular order.
    pub fn peers(&self) -> HashSet<PeerId> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Last accepted sequence number for a live entry.
    pub fn sequence(&self, id: &PeerId) -> Option<u64> {
        let now = Instant::now();
        self.entries
            .read()
            .get(id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.seq.load(Ordering::Acquire))
    }

    /// Number of entries still held, expired-but-unreaped included.
    pub fn tracked_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Remove every entry whose deadline is at or before `now`.
    /// Returns the evicted identities.
    pub fn reap(&self, now: Instant) -> Vec<PeerId> {
        let due: Vec<PeerId> = {
            let mut heap = self.deadlines.lock();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, id))) = heap.peek() {
                if *deadline > now {
                    break;
                }
                due.push(*id);
                heap.pop();
            }
            due
        };

        if due.is_empty() {
            return due;
        }

        let mut entries = self.entries.write();
        let mut evicted = Vec::new();
        for id in due {
            // Stale heap slot: the entry was rearmed or already removed.
            let expired = entries.get(&id).is_some_and(|entry| !entry.is_live(now));
            if expired {
                entries.remove(&id);
                tracing::debug!(peer = %id.fmt_short(), "liveness: peer expired");
                evicted.push(id);
            }
        }
        evicted
    }

    /// Evict expired entries until `cancel` fires.
    ///
    /// Sleeps until the earliest scheduled deadline; new deadlines wake
    /// it early so the sleep target stays current.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let next = self.deadlines.lock().peek().map(|Reverse((d, _))| *d);
            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.reap(Instant::now());
                        }
                        _ = self.wakeup.notified() => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                    }
                }
            }
        }
        tracing::debug!("liveness: reaper stopped");
    }

    fn schedule(&self, id: PeerId, deadline: Instant) {
        self.deadlines.lock().push(Reverse((deadline, id)));
        self.wakeup.notify_one();
    }
}

impl Default for LivenessFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LivenessFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessFilter")
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    const SEC: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn contains_until_ttl_elapses() {
        let filter = LivenessFilter::new();
        let alice = peer(1);

        assert!(!filter.contains(&alice));
        assert!(filter.upsert(alice, 1, SEC));
        assert!(filter.contains(&alice));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(filter.contains(&alice));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!filter.contains(&alice));
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_update_rearms_deadline() {
        let filter = LivenessFilter::new();
        let alice = peer(1);

        filter.upsert(alice, 1, SEC);
        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(filter.upsert(alice, 2, SEC));

        tokio::time::advance(Duration::from_millis(800)).await;
        assert!(filter.contains(&alice));
        assert_eq!(filter.sequence(&alice), Some(2));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!filter.contains(&alice));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_update_is_rejected_and_keeps_deadline() {
        let filter = LivenessFilter::new();
        let alice = peer(1);

        assert!(filter.upsert(alice, 1, SEC));
        assert!(!filter.upsert(alice, 0, 10 * SEC));
        assert!(!filter.upsert(alice, 1, 10 * SEC)); // equal is stale too
        assert_eq!(filter.sequence(&alice), Some(1));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!filter.contains(&alice), "stale update must not extend the TTL");
    }

    #[tokio::test(start_paused = true)]
    async fn update_after_expiry_is_a_fresh_insert() {
        let filter = LivenessFilter::new();
        let alice = peer(1);

        filter.upsert(alice, 10, SEC);
        tokio::time::advance(2 * SEC).await;
        assert!(!filter.contains(&alice));

        // Lower sequence number (e.g. restarted peer) is admitted again.
        assert!(filter.upsert(alice, 3, SEC));
        assert!(filter.contains(&alice));
        assert_eq!(filter.sequence(&alice), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn peers_excludes_expired() {
        let filter = LivenessFilter::new();
        filter.upsert(peer(1), 1, SEC);
        filter.upsert(peer(2), 1, 3 * SEC);
        filter.upsert(peer(2), 2, 3 * SEC);

        let peers = filter.peers();
        assert_eq!(peers.len(), 2);

        tokio::time::advance(2 * SEC).await;
        let peers = filter.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers.contains(&peer(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn reap_removes_only_expired() {
        let filter = LivenessFilter::new();
        filter.upsert(peer(1), 1, SEC);
        filter.upsert(peer(2), 1, 5 * SEC);
        // Rearmed: its first heap slot is stale by the time it is popped.
        filter.upsert(peer(3), 1, SEC);
        filter.upsert(peer(3), 2, 5 * SEC);

        tokio::time::advance(2 * SEC).await;
        let evicted = filter.reap(Instant::now());
        assert_eq!(evicted, vec![peer(1)]);
        assert_eq!(filter.tracked_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_task_evicts_in_background() {
        let filter = Arc::new(LivenessFilter::new());
        let cancel = CancellationToken::new();
        let reaper = tokio::spawn(filter.clone().run_reaper(cancel.clone()));

        filter.upsert(peer(1), 1, SEC);
        filter.upsert(peer(2), 1, 3 * SEC);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(filter.tracked_count(), 1);

        tokio::time::sleep(2 * SEC).await;
        assert_eq!(filter.tracked_count(), 0);

        cancel.cancel();
        reaper.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_keep_highest_sequence() {
        let filter = Arc::new(LivenessFilter::new());
        let alice = peer(1);
        filter.upsert(alice, 0, 60 * SEC);

        let mut tasks = Vec::new();
        for t in 0..8u64 {
            let filter = filter.clone();
            tasks.push(tokio::spawn(async move {
                let mut accepted = 0;
                for i in 0..500u64 {
                    if filter.upsert(alice, i * 8 + t + 1, 60 * SEC) {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert!(total >= 1);
        assert_eq!(filter.sequence(&alice), Some(4000));
        assert_eq!(filter.peers().len(), 1);
    }

    proptest! {
        #[test]
        fn acceptance_is_strictly_monotonic(seqs in proptest::collection::vec(0u64..50, 1..40)) {
            let filter = LivenessFilter::new();
            let id = peer(9);
            let mut best: Option<u64> = None;
            for seq in seqs {
                let expected = best.map_or(true, |b| seq > b);
                prop_assert_eq!(filter.upsert(id, seq, Duration::from_secs(3600)), expected);
                if expected {
                    best = Some(seq);
                }
            }
            prop_assert_eq!(filter.sequence(&id), best);
        }
    }
}
