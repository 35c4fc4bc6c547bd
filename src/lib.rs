#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Leasepool
//!
//! A thread-safe bounded resource pool with explicit membership and an
//! open/close lifecycle.
//!
//! Callers hand the pool already-constructed resources with [`Pool::add`],
//! borrow them with [`Pool::acquire`] and return them with
//! [`Pool::release`]. Membership can change while acquisitions are in
//! flight: [`Pool::remove`] waits for the targeted resource to be released
//! first, while the unsafe variants [`Pool::remove_now`] and
//! [`Pool::close_now`] skip the waiting at the caller's risk.
//!
//! The crate provides:
//!
//! - Blocking acquisition, with or without a timeout
//! - A graceful close that drains all outstanding leases before completing
//! - Cooperative cancellation of any blocked call via [`CancelToken`]
//! - Safe interleaving of membership changes with concurrent acquire/release
//!
//! There is no resource construction, sizing, or eviction policy: the pool
//! only ever tracks what callers explicitly add to it.
//!
//! ## Example
//!
//! ```
//! use leasepool::{CancelToken, Pool};
//!
//! let pool = Pool::new();
//! pool.add("alpha");
//! pool.add("beta");
//! pool.open();
//!
//! let cancel = CancelToken::new();
//! let resource = pool.acquire(&cancel).unwrap().unwrap();
//! pool.release(&resource);
//!
//! assert!(pool.close(&cancel));
//! assert!(!pool.is_open());
//! ```

/// Cooperative cancellation for blocking pool operations
pub mod cancel;

/// Error types shared by all pool operations
pub mod error;

/// The pool itself: membership, acquisition, and lifecycle
pub mod pool;

mod entry;
mod lifecycle;

pub use crate::cancel::CancelToken;
pub use crate::error::PoolError;
pub use crate::pool::{Pool, PoolStats};
