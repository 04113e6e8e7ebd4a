//! Per (consumer, endpoint) invocation statistics.
//!
//! Recording is a pair of relaxed atomic increments on the current [`StatWindow`]. Rotation
//! swaps in a fresh window with a single compare-and-swap; the caller that wins the swap owns
//! the retired window. Increments that raced the swap and landed in the retired window after it
//! was read are carried into the next snapshot, so no sample is lost or counted twice.

use crate::types::{EndpointInfo, EndpointKey};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;

/// Invocation and exception totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounts {
    pub invocations: u64,
    pub exceptions: u64,
}

impl WindowCounts {
    /// `exceptions / invocations`, or `0.0` for an empty window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn exception_ratio(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        self.exceptions as f64 / self.invocations as f64
    }

    pub fn add(&mut self, other: WindowCounts) {
        self.invocations += other.invocations;
        self.exceptions += other.exceptions;
    }

    fn saturating_sub(self, other: WindowCounts) -> Self {
        Self {
            invocations: self.invocations.saturating_sub(other.invocations),
            exceptions: self.exceptions.saturating_sub(other.exceptions),
        }
    }
}

/// The live counters of one window.
#[derive(Debug)]
pub struct StatWindow {
    invocations: AtomicU64,
    exceptions: AtomicU64,
    started_at: Instant,
}

impl StatWindow {
    fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            exceptions: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    fn record(&self, failed: bool) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if failed {
            // Release publishes the invocation increment above to readers of `exceptions`.
            self.exceptions.fetch_add(1, Ordering::Release);
        }
    }

    /// Reads exceptions first so a concurrent reader never sees more exceptions than calls.
    fn counts(&self) -> WindowCounts {
        let exceptions = self.exceptions.load(Ordering::Acquire);
        let invocations = self.invocations.load(Ordering::Acquire);
        WindowCounts { invocations, exceptions }
    }

    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Immutable result of a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub counts: WindowCounts,
    pub started_at: Instant,
    pub duration: Duration,
}

impl WindowSnapshot {
    #[must_use]
    pub fn empty(now: Instant) -> Self {
        Self { counts: WindowCounts::default(), started_at: now, duration: Duration::ZERO }
    }

    #[must_use]
    pub fn exception_ratio(&self) -> f64 {
        self.counts.exception_ratio()
    }
}

struct Retired {
    window: Arc<StatWindow>,
    reported: WindowCounts,
}

/// Rolling counters for one (consumer, endpoint) pair.
pub struct InvocationStat {
    endpoint: Arc<EndpointInfo>,
    window: ArcSwap<StatWindow>,
    retired: Mutex<Option<Retired>>,
    history: Mutex<VecDeque<WindowSnapshot>>,
    history_limit: usize,
    total_invocations: AtomicU64,
    late_responses: AtomicU64,
}

impl InvocationStat {
    #[must_use]
    pub fn new(endpoint: Arc<EndpointInfo>, history_limit: usize) -> Self {
        Self {
            endpoint,
            window: ArcSwap::from_pointee(StatWindow::new()),
            retired: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
            history_limit,
            total_invocations: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Arc<EndpointInfo> {
        &self.endpoint
    }

    /// Records one completed invocation. Lock-free.
    pub fn record(&self, failed: bool) {
        self.window.load().record(failed);
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of a send that finished after its caller timed out.
    ///
    /// The timeout was already recorded as one failure. The late outcome is a sample of its own
    /// in whichever window is current when it arrives.
    pub fn record_late(&self, failed: bool) {
        self.record(failed);
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Late outcomes recorded over the lifetime of this stat.
    #[must_use]
    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }

    /// Counts accumulated in the current window so far.
    #[must_use]
    pub fn current(&self) -> WindowCounts {
        self.window.load().counts()
    }

    /// Invocations recorded over the lifetime of this stat.
    #[must_use]
    pub fn total_invocations(&self) -> u64 {
        self.total_invocations.load(Ordering::Relaxed)
    }

    /// Swaps in a fresh window and returns the retired one's counts.
    ///
    /// Returns `None` if another caller rotated concurrently; that caller owns the snapshot.
    pub fn rotate(&self) -> Option<WindowSnapshot> {
        let current = self.window.load_full();
        let previous = self.window.compare_and_swap(&current, Arc::new(StatWindow::new()));
        if !Arc::ptr_eq(&previous, &current) {
            return None;
        }

        let now = Instant::now();
        let reported = current.counts();
        let mut counts = reported;
        {
            let mut retired = self.retired.lock();
            // Increments that hit the previous window after it was reported.
            if let Some(late) = retired.take() {
                counts.add(late.window.counts().saturating_sub(late.reported));
            }
            *retired = Some(Retired { window: Arc::clone(&current), reported });
        }

        let snapshot = WindowSnapshot {
            counts,
            started_at: current.started_at(),
            duration: now.saturating_duration_since(current.started_at()),
        };

        if self.history_limit > 0 {
            let mut history = self.history.lock();
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(snapshot);
        }
        Some(snapshot)
    }

    /// Snapshots of past windows, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<WindowSnapshot> {
        self.history.lock().iter().copied().collect()
    }
}

impl std::fmt::Debug for InvocationStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationStat")
            .field("endpoint", &self.endpoint.key())
            .field("current", &self.current())
            .field("total_invocations", &self.total_invocations())
            .field("late_responses", &self.late_responses())
            .finish_non_exhaustive()
    }
}

type StatKey = (Arc<str>, EndpointKey);

/// Owner of every [`InvocationStat`], keyed by consumer id and endpoint.
pub struct StatRegistry {
    stats: DashMap<StatKey, Arc<InvocationStat>>,
    history_limit: usize,
}

impl StatRegistry {
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self { stats: DashMap::new(), history_limit }
    }

    /// Returns the stat for this pair, creating it on first use.
    pub fn stat_for(&self, consumer: &Arc<str>, endpoint: &Arc<EndpointInfo>) -> Arc<InvocationStat> {
        let key = (Arc::clone(consumer), endpoint.key().clone());
        if let Some(stat) = self.stats.get(&key) {
            return Arc::clone(stat.value());
        }
        let history_limit = self.history_limit;
        Arc::clone(
            self.stats
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(InvocationStat::new(Arc::clone(endpoint), history_limit))
                })
                .value(),
        )
    }

    #[must_use]
    pub fn get(&self, consumer: &str, endpoint: &EndpointKey) -> Option<Arc<InvocationStat>> {
        let key: StatKey = (Arc::from(consumer), endpoint.clone());
        self.stats.get(&key).map(|s| Arc::clone(s.value()))
    }

    /// Drops stats for endpoints that left a consumer's address book.
    pub fn remove_endpoints(&self, consumer: &str, endpoints: &[EndpointKey]) {
        for endpoint in endpoints {
            self.stats.remove(&(Arc::from(consumer), endpoint.clone()));
        }
    }

    pub fn remove_consumer(&self, consumer: &str) {
        self.stats.retain(|(owner, _), _| owner.as_ref() != consumer);
    }

    /// Every stat owned by `consumer`, sorted by endpoint.
    #[must_use]
    pub fn for_consumer(&self, consumer: &str) -> Vec<Arc<InvocationStat>> {
        let mut stats: Vec<_> = self
            .stats
            .iter()
            .filter(|entry| entry.key().0.as_ref() == consumer)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stats.sort_by(|a, b| a.endpoint().key().cmp(b.endpoint().key()));
        stats
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

impl Default for StatRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}
