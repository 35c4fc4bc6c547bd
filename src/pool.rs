//! A thread-safe pool of interchangeable resources with explicit
//! membership and an open/close lifecycle.
//!
//! The pool hands out resources by value and tracks them by equality, so
//! the resource type doubles as its own key: two resources that compare
//! equal cannot coexist in the pool.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::cancel::{CancelToken, WakeFn};
use crate::entry::Entry;
use crate::error::PoolError;
use crate::lifecycle::Lifecycle;

/// A thread-safe bounded resource pool.
///
/// Resources enter the pool through [`add`](Pool::add) and leave through
/// [`remove`](Pool::remove) or [`remove_now`](Pool::remove_now); the pool
/// never constructs or destroys resources itself. Acquisition is only
/// permitted while the pool is open.
///
/// Three synchronization domains are kept independent: the
/// entry collection (a reader/writer lock plus the condvar blocked
/// acquirers park on), each entry's own exclusive section, and the
/// lifecycle's exclusive section. No thread ever blocks on an entry while
/// holding a pool-wide lock, which is what lets a `release` get through
/// while a `remove` is waiting on the same resource.
///
/// Prefer [`close`](Pool::close) and [`remove`](Pool::remove) over their
/// `_now` variants; the latter are unsafe in the contract sense and leave
/// outstanding leases untracked.
///
/// # Example
///
/// ```
/// use leasepool::{CancelToken, Pool};
///
/// let pool = Pool::new();
/// pool.add(10);
/// pool.add(11);
/// pool.open();
///
/// let cancel = CancelToken::new();
/// let n = pool.acquire(&cancel).unwrap().unwrap();
/// pool.release(&n);
/// assert!(pool.close(&cancel));
/// ```
pub struct Pool<R> {
    /// Membership, keyed by resource value. Scans take the read side;
    /// add/remove take the write side.
    entries: RwLock<HashMap<R, Arc<Entry<R>>>>,
    /// Parking spot for acquirers that found nothing free.
    signal: Arc<AvailableSignal>,
    /// Open/closed flag and the outstanding-lease counter.
    lifecycle: Arc<Lifecycle>,
    counters: Counters,
}

/// The condvar blocked acquirers wait on, with its mutex.
///
/// The mutex guards no data; it exists so that notifiers and waiters
/// serialize on it, which is what makes the re-scan-then-wait step in
/// [`Pool::acquire`] immune to lost wakeups.
struct AvailableSignal {
    mutex: Mutex<()>,
    available: Condvar,
}

impl AvailableSignal {
    fn notify(&self) {
        let _guard = self.mutex.lock();
        self.available.notify_all();
    }

    fn waker(this: &Arc<Self>) -> WakeFn {
        let signal = Arc::downgrade(this);
        Box::new(move || {
            if let Some(signal) = signal.upgrade() {
                signal.notify();
            }
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    acquires: AtomicUsize,
    releases: AtomicUsize,
    timeouts: AtomicUsize,
}

/// A point-in-time view of pool occupancy plus cumulative counters.
///
/// The gauges are sampled without a global pause, so under concurrent
/// traffic `size`, `free` and `leased` may be mutually inconsistent by a
/// call or two; in a quiescent pool `size == free + leased` holds (unless
/// leases were stranded by [`Pool::remove_now`]).
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    /// Number of resources currently in the pool, free or leased.
    pub size: usize,
    /// Number of resources currently free to acquire.
    pub free: usize,
    /// Number of leases currently outstanding.
    pub leased: usize,
    /// Total successful acquisitions since the pool was created.
    pub total_acquires: usize,
    /// Total leases returned since the pool was created.
    pub total_releases: usize,
    /// Total timed acquisitions that expired empty-handed.
    pub total_timeouts: usize,
}

impl<R> Pool<R> {
    /// Create an empty pool. The pool starts closed; call
    /// [`open`](Pool::open) once the initial membership is in place.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            signal: Arc::new(AvailableSignal {
                mutex: Mutex::new(()),
                available: Condvar::new(),
            }),
            lifecycle: Arc::new(Lifecycle::new()),
            counters: Counters::default(),
        }
    }

    /// Number of resources currently in the pool, free or leased.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the pool currently has no members at all.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether the pool is open for acquisition.
    pub fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    /// Mark the pool open. Idempotent.
    pub fn open(&self) {
        self.lifecycle.open();
        info!("pool opened");
    }

    /// Mark the pool closed immediately, without waiting for outstanding
    /// leases to drain.
    ///
    /// Unsafe in the contract sense: leases taken before the call remain
    /// live and can still legitimately be [`release`](Pool::release)d.
    pub fn close_now(&self) {
        let outstanding = self.lifecycle.outstanding();
        self.lifecycle.close_now();
        if outstanding > 0 {
            warn!("pool force-closed with {} outstanding lease(s)", outstanding);
        } else {
            info!("pool closed");
        }
    }

    /// Block until every outstanding lease has been released, then mark
    /// the pool closed.
    ///
    /// Acquisitions already in flight are unaffected; acquisitions
    /// attempted once the flag flips fail with [`PoolError::Closed`].
    /// Returns `true` when the close completed; `false` when `cancel`
    /// fired first, in which case the pool is still open.
    pub fn close(&self, cancel: &CancelToken) -> bool {
        let _watch = cancel.watch(Lifecycle::waker(&self.lifecycle));
        let closed = self.lifecycle.wait_for_drain(cancel);
        if closed {
            info!("pool closed");
        } else {
            debug!("close abandoned: cancelled while draining");
        }
        closed
    }

    /// A snapshot of pool occupancy and cumulative counters.
    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.read();
        let size = entries.len();
        let free = entries.values().filter(|entry| entry.is_free()).count();
        drop(entries);
        PoolStats {
            size,
            free,
            leased: self.lifecycle.outstanding(),
            total_acquires: self.counters.acquires.load(Ordering::Relaxed),
            total_releases: self.counters.releases.load(Ordering::Relaxed),
            total_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl<R: Clone + Eq + Hash> Pool<R> {
    /// Insert `resource` into the pool, waking all blocked acquirers.
    ///
    /// Returns `false` (and changes nothing) when an equal resource is
    /// already pooled, whether free or leased.
    pub fn add(&self, resource: R) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&resource) {
            debug!("add rejected: equal resource already pooled");
            return false;
        }
        let entry = Arc::new(Entry::new(resource.clone()));
        entries.insert(resource, entry);
        let size = entries.len();
        drop(entries);
        debug!("resource added to pool (size now {})", size);
        self.signal.notify();
        true
    }

    /// Block until a free resource exists, claim it, and return it.
    ///
    /// Returns `Ok(None)` only when `cancel` fires while waiting.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] when the pool is not open at call time, or
    /// when it closes in the window between a free entry being found and
    /// the claim being registered.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<Option<R>, PoolError> {
        self.do_acquire(None, cancel)
    }

    /// Like [`acquire`](Pool::acquire), but give up once `timeout` has
    /// elapsed, returning `Ok(None)`.
    ///
    /// The deadline is wall-clock based and re-checked on every wake, so
    /// spurious wakeups cannot extend it. A timeout too large for the
    /// clock to represent degrades to an unbounded wait.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidTimeout`] for a zero `timeout`;
    /// [`PoolError::Closed`] as for [`acquire`](Pool::acquire).
    pub fn acquire_timeout(
        &self,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<R>, PoolError> {
        if timeout.is_zero() {
            return Err(PoolError::InvalidTimeout(timeout));
        }
        self.do_acquire(Instant::now().checked_add(timeout), cancel)
    }

    /// Claim a free resource without blocking.
    ///
    /// Returns `Ok(None)` when nothing is free right now.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] as for [`acquire`](Pool::acquire).
    pub fn try_acquire(&self) -> Result<Option<R>, PoolError> {
        if !self.lifecycle.is_open() {
            return Err(PoolError::Closed);
        }
        while let Some(entry) = self.find_free() {
            if let Some(resource) = entry.occupy(&self.lifecycle)? {
                self.counters.acquires.fetch_add(1, Ordering::Relaxed);
                trace!("resource acquired");
                return Ok(Some(resource));
            }
        }
        Ok(None)
    }

    /// Return a leased resource to the pool, waking all blocked
    /// acquirers.
    ///
    /// Silently does nothing when the resource is unknown or not
    /// currently leased; releasing is never an error.
    pub fn release(&self, resource: &R) {
        let Some(entry) = self.find_entry(resource) else {
            trace!("release ignored: resource is not pooled");
            return;
        };
        if entry.release() {
            self.lifecycle.end_lease();
            self.counters.releases.fetch_add(1, Ordering::Relaxed);
            self.signal.notify();
            trace!("resource released");
        } else {
            trace!("release ignored: resource is not leased");
        }
    }

    /// Remove `resource` from the pool, waiting for its lease (if any) to
    /// be released first.
    ///
    /// Returns `true` when this call invalidated and removed the entry;
    /// `false` when the resource is unknown, when another remover won, or
    /// when `cancel` fired while the entry was still leased.
    pub fn remove(&self, resource: &R, cancel: &CancelToken) -> bool {
        let Some(entry) = self.find_entry(resource) else {
            return false;
        };
        // The wait happens on the entry's own condvar with no pool-wide
        // lock held, so a concurrent release of this resource can proceed
        // and wake it.
        if !entry.invalidate_when_free(cancel) {
            return false;
        }
        let removed = self.entries.write().remove(resource).is_some();
        if removed {
            debug!("resource removed from pool");
        }
        removed
    }

    /// Remove `resource` immediately, regardless of whether it is leased.
    ///
    /// Unsafe in the contract sense: a holder that later releases the
    /// resource finds the entry gone (a no-op, not an error), and its
    /// lease is never counted as ended, so only [`close_now`](Pool::close_now)
    /// can then close the pool. Returns `false` when the resource is
    /// unknown.
    pub fn remove_now(&self, resource: &R) -> bool {
        let Some(entry) = self.find_entry(resource) else {
            return false;
        };
        let was_leased = entry.is_occupied();
        entry.invalidate();
        let removed = self.entries.write().remove(resource).is_some();
        if removed {
            if was_leased {
                warn!("resource force-removed from pool while leased");
            } else {
                debug!("resource force-removed from pool");
            }
        }
        removed
    }

    fn find_entry(&self, resource: &R) -> Option<Arc<Entry<R>>> {
        self.entries.read().get(resource).cloned()
    }

    fn find_free(&self) -> Option<Arc<Entry<R>>> {
        let entries = self.entries.read();
        entries.values().find(|entry| entry.is_free()).cloned()
    }

    /// The acquire loop: fast scan, then escalate to a condvar wait,
    /// retrying the claim until success, cancellation, or deadline expiry.
    fn do_acquire(
        &self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Result<Option<R>, PoolError> {
        if !self.lifecycle.is_open() {
            return Err(PoolError::Closed);
        }
        let _watch = cancel.watch(AvailableSignal::waker(&self.signal));
        loop {
            if cancel.is_cancelled() {
                trace!("acquire abandoned: cancelled");
                return Ok(None);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                    trace!("acquire timed out with no free resource");
                    return Ok(None);
                }
            }
            let entry = match self.find_free() {
                Some(entry) => entry,
                None => match self.wait_for_free(deadline, cancel) {
                    Some(entry) => entry,
                    // Cancelled or expired while parked; the loop head
                    // turns that into the right return value.
                    None => continue,
                },
            };
            if let Some(resource) = entry.occupy(&self.lifecycle)? {
                self.counters.acquires.fetch_add(1, Ordering::Relaxed);
                trace!("resource acquired");
                return Ok(Some(resource));
            }
            // Another acquirer claimed that entry between the scan and the
            // occupy attempt; scan again.
        }
    }

    /// Park until a free entry shows up, the deadline passes, or `cancel`
    /// fires. Returns the entry found, or `None` on expiry/cancellation.
    fn wait_for_free(
        &self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Option<Arc<Entry<R>>> {
        let mut slot = self.signal.mutex.lock();
        loop {
            // Re-scan while holding the signal mutex: a release or add has
            // to take this mutex to notify, so the wakeup cannot land
            // between this scan and the wait below.
            if let Some(entry) = self.find_free() {
                return Some(entry);
            }
            if cancel.is_cancelled() {
                return None;
            }
            match deadline {
                None => self.signal.available.wait(&mut slot),
                Some(deadline) => {
                    let remaining = deadline.checked_duration_since(Instant::now())?;
                    let _ = self.signal.available.wait_for(&mut slot, remaining);
                }
            }
        }
    }
}

impl<R> Default for Pool<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.entries.read().len())
            .field("open", &self.lifecycle.is_open())
            .field("leased", &self.lifecycle.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_then_acquire() {
        let pool = Pool::new();
        let cancel = CancelToken::new();
        pool.open();

        pool.add("Some resource");
        assert!(pool.remove(&"Some resource", &cancel));

        pool.add("Pool");
        assert_eq!(pool.acquire(&cancel).unwrap(), Some("Pool"));

        pool.close_now();
        assert!(!pool.is_open());
    }

    #[test]
    fn test_acquire_before_open_fails() {
        let pool = Pool::new();
        pool.add("Hello");
        assert!(matches!(
            pool.acquire(&CancelToken::new()),
            Err(PoolError::Closed)
        ));
    }

    #[test]
    fn test_acquire_returns_distinct_resources() {
        let pool = Pool::new();
        let cancel = CancelToken::new();
        pool.add("Hello");
        pool.add("Preved");
        pool.open();

        let first = pool.acquire(&cancel).unwrap().unwrap();
        let second = pool.acquire(&cancel).unwrap().unwrap();
        assert_ne!(first, second);
        assert!(["Hello", "Preved"].contains(&first));
        assert!(["Hello", "Preved"].contains(&second));

        pool.release(&"Hello");
        pool.release(&"Preved");
        assert!(pool.remove(&"Hello", &cancel));
        // Never added, only looks similar.
        assert!(!pool.remove(&"Privet", &cancel));
    }

    #[test]
    fn test_open_close_idempotence() {
        let pool: Pool<&str> = Pool::new();
        let cancel = CancelToken::new();
        assert!(!pool.is_open());

        pool.open();
        pool.open();
        assert!(pool.is_open());

        // Unknown resource: a silent no-op, not an error.
        pool.release(&"Hello111");

        assert!(pool.close(&cancel));
        assert!(!pool.is_open());

        pool.open();
        assert!(pool.is_open());

        pool.close_now();
        pool.close_now();
        assert!(!pool.is_open());
    }

    #[test]
    fn test_remove_now_leaves_no_trace() {
        let pool = Pool::new();
        let cancel = CancelToken::new();
        pool.add("Hello");
        pool.open();

        assert_eq!(pool.acquire(&cancel).unwrap(), Some("Hello"));
        assert!(pool.remove_now(&"Hello"));
        assert!(!pool.remove(&"Hello", &cancel));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_acquire_timeout_on_empty_pool() {
        let pool: Pool<String> = Pool::new();
        pool.open();

        let started = Instant::now();
        let result = pool
            .acquire_timeout(Duration::from_millis(200), &CancelToken::new())
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result, None);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(pool.stats().total_timeouts, 1);
    }

    #[test]
    fn test_acquire_release_remove_cycle() {
        let pool = Pool::new();
        let cancel = CancelToken::new();
        pool.add("loop");
        pool.open();

        assert_eq!(pool.acquire(&cancel).unwrap(), Some("loop"));
        pool.release(&"loop");
        assert!(pool.remove(&"loop", &cancel));

        let timed = pool
            .acquire_timeout(Duration::from_millis(100), &cancel)
            .unwrap();
        assert_eq!(timed, None);

        assert!(pool.close(&cancel));
        assert!(!pool.is_open());
    }

    #[test]
    fn test_close_now_while_leased() {
        let pool = Pool::new();
        let cancel = CancelToken::new();
        pool.add("Hello");
        pool.open();

        assert_eq!(pool.acquire(&cancel).unwrap(), Some("Hello"));
        pool.close_now();
        assert!(!pool.is_open());

        // The lease taken before the close can still be returned.
        pool.release(&"Hello");
        assert_eq!(pool.stats().leased, 0);
    }

    #[test]
    fn test_oversized_timeout_is_clamped() {
        let pool = Pool::new();
        pool.add("big");
        pool.open();

        // Too large for the clock to represent: degrades to an unbounded
        // wait instead of overflowing, and the free resource comes back
        // immediately.
        let got = pool
            .acquire_timeout(Duration::MAX, &CancelToken::new())
            .unwrap();
        assert_eq!(got, Some("big"));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let pool: Pool<u32> = Pool::new();
        pool.open();
        assert!(matches!(
            pool.acquire_timeout(Duration::ZERO, &CancelToken::new()),
            Err(PoolError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let pool = Pool::new();
        assert!(pool.add("twin"));
        assert!(!pool.add("twin"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_try_acquire() {
        let pool = Pool::new();
        assert!(matches!(pool.try_acquire(), Err(PoolError::Closed)));

        pool.open();
        assert_eq!(pool.try_acquire().unwrap(), None);

        pool.add("one");
        assert_eq!(pool.try_acquire().unwrap(), Some("one"));
        // The only member is leased now.
        assert_eq!(pool.try_acquire().unwrap(), None);
    }

    #[test]
    fn test_release_of_idle_resource_is_noop() {
        let pool = Pool::new();
        pool.add("idle");
        pool.open();

        pool.release(&"idle");
        let stats = pool.stats();
        assert_eq!(stats.total_releases, 0);
        assert_eq!(stats.leased, 0);
    }

    #[test]
    fn test_stats_reconcile() {
        let pool = Pool::new();
        let cancel = CancelToken::new();
        pool.add("a");
        pool.add("b");
        pool.open();

        let held = pool.acquire(&cancel).unwrap().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.free, 1);
        assert_eq!(stats.leased, 1);
        assert_eq!(stats.total_acquires, 1);

        pool.release(&held);
        let stats = pool.stats();
        assert_eq!(stats.size, stats.free + stats.leased);
        assert_eq!(stats.total_releases, 1);
    }
}
