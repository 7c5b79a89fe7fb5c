//! # frankenrcu-core
//!
//! Userspace read-copy-update with wait-free readers and coalesced writer
//! grace periods — the memory-barrier flavor: readers pay a compiler
//! barrier on their fast path, writers recover the ordering by issuing an
//! expedited process-wide memory barrier around their scans.
//!
//! Readers bracket critical sections with [`read_lock`] / [`read_unlock`]
//! (or a [`ReadGuard`]); writers publish a new version through an
//! [`RcuCell`], call [`synchronize`], and then reclaim the old one. When
//! `synchronize` returns, every read-side critical section that existed
//! when it was entered has ended.
//!
//! ```no_run
//! use frankenrcu_core as rcu;
//!
//! static CONFIG: rcu::RcuCell<u64> = rcu::RcuCell::new();
//!
//! // Reader thread:
//! rcu::register_thread();
//! {
//!     let _section = rcu::read_guard();
//!     // SAFETY: inside a read-side critical section.
//!     if let Some(v) = unsafe { CONFIG.deref() } {
//!         println!("config: {v}");
//!     }
//! }
//! rcu::unregister_thread();
//!
//! // Writer thread:
//! let old = CONFIG.swap(Box::into_raw(Box::new(42)));
//! rcu::synchronize();
//! if !old.is_null() {
//!     // SAFETY: no reader can still hold the replaced version.
//!     drop(unsafe { Box::from_raw(old) });
//! }
//! ```
//!
//! Reclamation is the caller's responsibility; there is no callback queue,
//! no fairness guarantee between writers, and no bound on grace-period
//! latency beyond the slowest live reader.

pub mod barrier;
pub mod gp;
mod list;
pub mod ptr;
mod reader;
mod sys;
mod wait;

pub use gp::{RCU_QS_ACTIVE_ATTEMPTS, Stats, counter, scanner_parked, stats, synchronize};
pub use ptr::RcuCell;
pub use reader::{
    GP_CTR_NEST_MASK, GP_CTR_PHASE, ReadGuard, read_guard, read_lock, read_ongoing, read_unlock,
    register_thread, unregister_thread,
};
pub use wait::RCU_WAIT_ATTEMPTS;
