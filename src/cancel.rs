//! Cooperative cancellation for blocking pool operations.
//!
//! Rust threads cannot be interrupted from the outside, so every pool
//! operation that may block takes a [`CancelToken`]. Cancelling the token
//! sets a permanent flag and then pokes each wait site that registered
//! interest, by locking that site's mutex and notifying its condvar. The
//! lock-then-notify step is what makes cancellation race-free: a waiter
//! always checks the flag while holding the same mutex, so the wakeup
//! cannot slip into the gap between the check and the wait.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

/// Type-erased wakeup for one wait site. The closure locks the site's
/// mutex and notifies its condvar.
pub(crate) type WakeFn = Box<dyn Fn() + Send + Sync>;

/// Signals blocked pool operations to give up and return.
///
/// Tokens are cheap to clone; all clones share one flag. Once cancelled a
/// token stays cancelled, so the caller can still observe the signal after
/// the interrupted operation has returned. A fresh token is needed to
/// block again.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    watchers: Mutex<Watchers>,
}

#[derive(Default)]
struct Watchers {
    next_id: u64,
    wakers: Vec<(u64, WakeFn)>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token, waking every blocked operation that was passed it.
    ///
    /// Idempotent: only the first call notifies anyone.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("cancel token fired");
        let watchers = self.inner.watchers.lock();
        for (_, wake) in &watchers.wakers {
            wake();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a wait site to be poked on cancellation.
    ///
    /// The returned guard deregisters the site when dropped; wait loops
    /// hold it for exactly the duration of the blocking call.
    pub(crate) fn watch(&self, waker: WakeFn) -> WatchGuard {
        let mut watchers = self.inner.watchers.lock();
        let id = watchers.next_id;
        watchers.next_id += 1;
        watchers.wakers.push((id, waker));
        WatchGuard {
            token: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Deregisters a wait site when the blocking call returns.
pub(crate) struct WatchGuard {
    token: Weak<TokenInner>,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.upgrade() {
            let mut watchers = token.watchers.lock();
            watchers.wakers.retain(|(id, _)| *id != self.id);
        }
    }
}
