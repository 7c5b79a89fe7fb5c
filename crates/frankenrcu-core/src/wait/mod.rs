//! Writer wait queue.
//!
//! Concurrent `synchronize` callers coalesce onto one grace period: each
//! pushes a stack-allocated [`WaitNode`] onto a lock-free stack, the first
//! pusher becomes the leader, and everyone else blocks on their own node
//! until the leader's grace period covers them.
//!
//! There is no ABA hazard: a node lives on its waiter's frame and is pushed
//! exactly once. The teardown handshake (the `TEARDOWN` bit) keeps the
//! waker from touching a node whose frame has already unwound.

use core::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::time::Duration;

use crate::barrier::{cpu_relax, smp_mb};
use crate::sys;

/// Node state bits.
pub(crate) const WAIT_WAITING: i32 = 0;
pub(crate) const WAIT_WAKEUP: i32 = 1 << 0;
pub(crate) const WAIT_RUNNING: i32 = 1 << 1;
pub(crate) const WAIT_TEARDOWN: i32 = 1 << 2;

/// Spin budget before a follower parks on its node's futex, and again
/// before it falls back to sleeping in the teardown handshake.
pub const RCU_WAIT_ATTEMPTS: u32 = 1000;

/// Poll interval while waiting for the waker's final `TEARDOWN` store.
const TEARDOWN_POLL: Duration = Duration::from_millis(10);

/// One waiting writer. Stack-allocated in `synchronize`.
pub(crate) struct WaitNode {
    next: AtomicPtr<WaitNode>,
    pub(crate) state: AtomicI32,
}

impl WaitNode {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicPtr::new(core::ptr::null_mut()),
            state: AtomicI32::new(WAIT_WAITING),
        }
    }
}

/// Lock-free stack of waiting writers.
pub(crate) struct WaitQueue {
    head: AtomicPtr<WaitNode>,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Push `node`; returns true when the queue was non-empty, i.e. the
    /// caller is a follower and somebody else will run the grace period.
    ///
    /// The node's `next` link is written before the node becomes reachable
    /// from `head`, so a concurrent drain never observes a half-linked
    /// node.
    ///
    /// # Safety
    ///
    /// `node` must stay valid until its owner has been released by
    /// `adaptive_wake_up` (or, for the leader, until after drain).
    pub(crate) unsafe fn push(&self, node: *mut WaitNode) -> bool {
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node is owned by the caller and not yet shared.
            unsafe { (*node).next.store(old, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(old, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return !old.is_null(),
                Err(cur) => old = cur,
            }
        }
    }

    /// Take the whole stack, leaving the queue empty for the next
    /// generation of writers.
    pub(crate) fn drain(&self) -> *mut WaitNode {
        self.head.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }
}

/// Walk a drained stack, yielding each node.
///
/// The successor link is loaded *before* the callback runs: waking a node
/// releases its owner, after which the node's memory is gone.
///
/// # Safety
///
/// `head` must come from [`WaitQueue::drain`] and every node must still be
/// un-woken.
pub(crate) unsafe fn for_each_drained(head: *mut WaitNode, mut f: impl FnMut(&WaitNode)) {
    let mut it = head;
    while !it.is_null() {
        // SAFETY: nodes between drain and wake are valid; next is captured
        // before f can release the node's owner.
        let node = unsafe { &*it };
        let next = node.next.load(Ordering::Relaxed);
        f(node);
        it = next;
    }
}

/// Follower side: block until the leader signals this node, then complete
/// the teardown handshake so the waker is done with the node before the
/// frame unwinds.
pub(crate) fn adaptive_busy_wait(node: &WaitNode) {
    smp_mb();
    let mut signaled = false;
    for _ in 0..RCU_WAIT_ATTEMPTS {
        if node.state.load(Ordering::Relaxed) != WAIT_WAITING {
            signaled = true;
            break;
        }
        cpu_relax();
    }
    if !signaled {
        loop {
            match sys::futex_wait(&node.state, WAIT_WAITING) {
                Ok(()) => break,
                Err(e) if e == sys::EWOULDBLOCK || e == sys::EAGAIN => break,
                Err(e) if e == sys::EINTR => continue,
                Err(e) => sys::fatal("futex wait on writer wait-node", e),
            }
        }
    }
    node.state.fetch_or(WAIT_RUNNING, Ordering::SeqCst);
    for _ in 0..RCU_WAIT_ATTEMPTS {
        if node.state.load(Ordering::Relaxed) & WAIT_TEARDOWN != 0 {
            return;
        }
        cpu_relax();
    }
    while node.state.load(Ordering::Relaxed) & WAIT_TEARDOWN == 0 {
        std::thread::sleep(TEARDOWN_POLL);
    }
}

/// Leader side: signal one follower and finish the teardown handshake.
pub(crate) fn adaptive_wake_up(node: &WaitNode) {
    smp_mb();
    node.state.store(WAIT_WAKEUP, Ordering::SeqCst);
    if node.state.load(Ordering::Relaxed) & WAIT_RUNNING == 0 {
        if let Err(e) = sys::futex_wake(&node.state, 1) {
            sys::fatal("futex wake on writer wait-node", e);
        }
    }
    node.state.fetch_or(WAIT_TEARDOWN, Ordering::SeqCst);
}
