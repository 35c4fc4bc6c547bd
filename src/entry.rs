//! Per-resource bookkeeping: the record pairing one pooled resource with
//! its free / occupied / invalidated state.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cancel::{CancelToken, WakeFn};
use crate::error::PoolError;
use crate::lifecycle::Lifecycle;

/// One pooled resource and its local lifecycle state.
///
/// Entries know nothing about the pool; the pool composes them with the
/// shared [`Lifecycle`]. All state changes go through the entry's own
/// mutex, so querying or mutating one entry never blocks operations on a
/// different entry.
pub(crate) struct Entry<R> {
    resource: R,
    gate: Arc<EntryGate>,
}

/// The entry's exclusive section, shared with cancellation wakers.
struct EntryGate {
    state: Mutex<EntryState>,
    /// Signalled whenever the entry stops being occupied, for threads
    /// waiting to remove this specific resource.
    freed: Condvar,
}

#[derive(Debug)]
struct EntryState {
    occupied: bool,
    /// Cleared by invalidation; never set again afterwards.
    available: bool,
}

impl<R> Entry<R> {
    pub(crate) fn new(resource: R) -> Self {
        Self {
            resource,
            gate: Arc::new(EntryGate {
                state: Mutex::new(EntryState {
                    occupied: false,
                    available: true,
                }),
                freed: Condvar::new(),
            }),
        }
    }

    /// True iff the entry is neither occupied nor invalidated.
    pub(crate) fn is_free(&self) -> bool {
        let state = self.gate.state.lock();
        !state.occupied && state.available
    }

    /// True iff the entry is occupied and still valid.
    pub(crate) fn is_occupied(&self) -> bool {
        let state = self.gate.state.lock();
        state.occupied && state.available
    }

    /// Claim the entry for a lease.
    ///
    /// The lease is registered with `lifecycle` before the occupied flag
    /// flips, so a pool that closed after this entry was scanned is still
    /// observed here and surfaces as [`PoolError::Closed`]. Returns
    /// `Ok(None)` when the entry is no longer free, usually because
    /// another thread claimed it first.
    pub(crate) fn occupy(&self, lifecycle: &Lifecycle) -> Result<Option<R>, PoolError>
    where
        R: Clone,
    {
        let mut state = self.gate.state.lock();
        if !state.occupied && state.available {
            lifecycle.begin_lease()?;
            state.occupied = true;
            Ok(Some(self.resource.clone()))
        } else {
            Ok(None)
        }
    }

    /// Free the entry if it is currently occupied and valid, waking any
    /// thread waiting to remove it. Returns whether a lease actually
    /// ended.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.gate.state.lock();
        if state.occupied && state.available {
            state.occupied = false;
            self.gate.freed.notify_all();
            true
        } else {
            false
        }
    }

    /// Wait until the entry is not occupied, then invalidate it.
    ///
    /// Waits on the entry's own condvar; the caller must not hold any
    /// pool-wide lock, so a concurrent release of this same resource can
    /// get through and wake the wait. Returns false when cancelled while
    /// the entry was still leased, or when another thread invalidated the
    /// entry first.
    pub(crate) fn invalidate_when_free(&self, cancel: &CancelToken) -> bool {
        let _watch = cancel.watch(EntryGate::waker(&self.gate));
        let mut state = self.gate.state.lock();
        while state.occupied && state.available && !cancel.is_cancelled() {
            self.gate.freed.wait(&mut state);
        }
        if !state.occupied && state.available {
            state.available = false;
            true
        } else {
            false
        }
    }

    /// Invalidate the entry regardless of occupancy, waking any removal
    /// waiters so they can observe the invalidation.
    pub(crate) fn invalidate(&self) {
        let mut state = self.gate.state.lock();
        state.available = false;
        self.gate.freed.notify_all();
    }
}

impl EntryGate {
    fn waker(this: &Arc<Self>) -> WakeFn {
        let gate = Arc::downgrade(this);
        Box::new(move || {
            if let Some(gate) = gate.upgrade() {
                let _state = gate.state.lock();
                gate.freed.notify_all();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn open_lifecycle() -> Lifecycle {
        let lifecycle = Lifecycle::new();
        lifecycle.open();
        lifecycle
    }

    #[test]
    fn test_occupy_and_release() {
        let lifecycle = open_lifecycle();
        let entry = Entry::new(7);
        assert!(entry.is_free());

        assert_eq!(entry.occupy(&lifecycle).unwrap(), Some(7));
        assert!(entry.is_occupied());
        assert!(!entry.is_free());

        // A second claim loses.
        assert_eq!(entry.occupy(&lifecycle).unwrap(), None);

        assert!(entry.release());
        assert!(entry.is_free());

        // Releasing a free entry is not a lease end.
        assert!(!entry.release());
    }

    #[test]
    fn test_occupy_fails_when_closed() {
        let lifecycle = Lifecycle::new();
        let entry = Entry::new("res");
        assert!(matches!(entry.occupy(&lifecycle), Err(PoolError::Closed)));
        // The failed claim must not leave the entry occupied.
        assert!(entry.is_free());
    }

    #[test]
    fn test_invalidate_is_irreversible() {
        let lifecycle = open_lifecycle();
        let entry = Entry::new("res");
        assert_eq!(entry.occupy(&lifecycle).unwrap(), Some("res"));

        entry.invalidate();
        assert!(!entry.is_occupied());
        assert!(!entry.is_free());

        // Releasing an invalidated entry does not resurrect it.
        assert!(!entry.release());
        assert!(!entry.is_free());
    }

    #[test]
    fn test_invalidate_when_free_waits_for_release() {
        let lifecycle = open_lifecycle();
        let entry = Arc::new(Entry::new("res"));
        assert_eq!(entry.occupy(&lifecycle).unwrap(), Some("res"));

        let releaser = {
            let entry = entry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                entry.release()
            })
        };

        assert!(entry.invalidate_when_free(&CancelToken::new()));
        assert!(!entry.is_free());
        assert!(releaser.join().unwrap());
    }

    #[test]
    fn test_invalidate_when_free_cancelled_while_leased() {
        let lifecycle = open_lifecycle();
        let entry = Arc::new(Entry::new("res"));
        assert_eq!(entry.occupy(&lifecycle).unwrap(), Some("res"));

        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };

        assert!(!entry.invalidate_when_free(&cancel));
        // Still leased and still valid: the removal did not complete.
        assert!(entry.is_occupied());
        canceller.join().unwrap();
    }

    #[test]
    fn test_second_remover_loses() {
        let lifecycle = open_lifecycle();
        let entry = Entry::new("res");
        assert_eq!(entry.occupy(&lifecycle).unwrap(), Some("res"));
        assert!(entry.release());

        let cancel = CancelToken::new();
        assert!(entry.invalidate_when_free(&cancel));
        assert!(!entry.invalidate_when_free(&cancel));
    }
}
