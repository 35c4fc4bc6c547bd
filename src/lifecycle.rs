//! Pool-wide open/close state and the close-waits-for-drain handshake.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cancel::{CancelToken, WakeFn};
use crate::error::PoolError;

/// Tracks whether the pool is open and how many leases are outstanding.
///
/// A freshly created lifecycle is closed; acquisition is only permitted
/// between [`open`](Lifecycle::open) and the close that follows it. The
/// flag and the counter live under one mutex so a lease can never begin
/// after the closed flag has been observed set.
pub(crate) struct Lifecycle {
    state: Mutex<LifecycleState>,
    /// Signalled when the outstanding count reaches zero.
    drained: Condvar,
}

#[derive(Debug)]
struct LifecycleState {
    closed: bool,
    outstanding: usize,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState {
                closed: true,
                outstanding: 0,
            }),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        self.state.lock().closed = false;
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.state.lock().closed
    }

    /// Register one more outstanding lease.
    ///
    /// Fails with [`PoolError::Closed`] if the pool is closed at this
    /// instant, which is also how a close racing an in-flight acquisition
    /// is surfaced.
    pub(crate) fn begin_lease(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        state.outstanding += 1;
        Ok(())
    }

    /// End one outstanding lease, waking drain waiters at zero.
    pub(crate) fn end_lease(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }

    /// Block until every outstanding lease has ended, then mark the pool
    /// closed. Returns whether the close completed; a cancelled wait
    /// leaves the pool open. An already-drained pool closes immediately.
    ///
    /// The caller is expected to have registered
    /// [`waker`](Lifecycle::waker) with the token before calling.
    pub(crate) fn wait_for_drain(&self, cancel: &CancelToken) -> bool {
        let mut state = self.state.lock();
        while state.outstanding > 0 && !cancel.is_cancelled() {
            self.drained.wait(&mut state);
        }
        if state.outstanding == 0 {
            state.closed = true;
            true
        } else {
            false
        }
    }

    /// Mark the pool closed immediately, without waiting for a drain.
    pub(crate) fn close_now(&self) {
        self.state.lock().closed = true;
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Wakeup for cancellation of a drain wait.
    pub(crate) fn waker(this: &Arc<Self>) -> WakeFn {
        let lifecycle = Arc::downgrade(this);
        Box::new(move || {
            if let Some(lifecycle) = lifecycle.upgrade() {
                let _state = lifecycle.state.lock();
                lifecycle.drained.notify_all();
            }
        })
    }
}
