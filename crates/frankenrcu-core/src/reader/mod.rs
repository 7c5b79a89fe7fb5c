//! Per-thread reader records and the read-side fast path.
//!
//! Each thread owns one heap-allocated [`Reader`] record, reached through
//! thread-local storage. The record's `ctr` word is the whole read-side
//! protocol: the low 32 bits hold the nest depth, bit 32 holds the phase
//! snapshotted from the global grace-period counter at outermost entry.
//! Only the owning thread stores to `ctr`; the scanning writer loads it.
//!
//! `read_lock` / `read_unlock` never allocate, never block, and never
//! execute an atomic read-modify-write. The only syscall a reader can make
//! is the futex wake on outermost unlock, and only when a writer has
//! declared it is sleeping.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::barrier;
use crate::gp;
use crate::list::{ListNode, ReaderList};
use crate::sys;

/// Phase bit of a counter word.
pub const GP_CTR_PHASE: u64 = 1 << 32;

/// Nest-depth half of a counter word.
pub const GP_CTR_NEST_MASK: u64 = GP_CTR_PHASE - 1;

/// Per-thread reader record.
///
/// `ctr` is single-writer (the owning thread, relaxed stores bracketed by
/// barriers) and multi-reader (any thread scanning a grace period).
/// `registered` and `node` change only under the registry mutex.
pub(crate) struct Reader {
    pub(crate) ctr: AtomicU64,
    tid: i32,
    registered: AtomicBool,
    node: AtomicPtr<ListNode>,
}

impl Reader {
    pub(crate) fn new(tid: i32) -> Self {
        Self {
            ctr: AtomicU64::new(0),
            tid,
            registered: AtomicBool::new(false),
            node: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub(crate) fn tid(&self) -> i32 {
        self.tid
    }
}

/// Classification of one reader against the current grace-period counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReaderState {
    /// Inside a critical section begun after the current phase started.
    ActiveCurrent,
    /// Inside a critical section begun under the previous phase; the
    /// grace period must wait for this reader.
    ActiveOld,
    /// Not inside any critical section.
    Inactive,
}

pub(crate) fn reader_state(gp_ctr: u64, reader: &Reader) -> ReaderState {
    let v = reader.ctr.load(Ordering::Relaxed);
    if v & GP_CTR_NEST_MASK == 0 {
        ReaderState::Inactive
    } else if (v ^ gp_ctr) & GP_CTR_PHASE == 0 {
        ReaderState::ActiveCurrent
    } else {
        ReaderState::ActiveOld
    }
}

// ---------------------------------------------------------------------------
// Thread-local record
// ---------------------------------------------------------------------------

struct ReaderTls {
    reader: Box<Reader>,
}

impl Drop for ReaderTls {
    fn drop(&mut self) {
        // A thread that exits while registered would leave a dangling
        // registry entry for the scanner to chase. Unregister on its
        // behalf; exiting inside a read-side section stays a caller bug.
        if self.reader.registered.load(Ordering::Relaxed) {
            debug_assert_eq!(
                self.reader.ctr.load(Ordering::Relaxed) & GP_CTR_NEST_MASK,
                0,
                "thread {} exited inside a read-side critical section",
                self.reader.tid()
            );
            unregister_record(&self.reader);
        }
    }
}

thread_local! {
    static READER_TLS: ReaderTls = ReaderTls {
        reader: Box::new(Reader::new(sys::gettid())),
    };
}

fn with_reader<R>(f: impl FnOnce(&Reader) -> R) -> R {
    READER_TLS.with(|tls| f(&tls.reader))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Add the calling thread to the reader registry.
///
/// Must be called before the thread's first `read_lock`, and not from
/// inside a read-side critical section. Registering an already-registered
/// thread is a no-op.
pub fn register_thread() {
    with_reader(|r| {
        let mut registry = gp::registry().lock();
        if r.registered.load(Ordering::Relaxed) {
            return;
        }
        barrier::init_membarrier();
        r.registered.store(true, Ordering::Relaxed);
        let node = registry.push_front(r as *const Reader);
        r.node.store(node, Ordering::Relaxed);
    });
}

/// Remove the calling thread from the reader registry.
///
/// Must not be called from inside a read-side critical section. After
/// unregistration the thread is invisible to `synchronize`; it may
/// re-register later.
pub fn unregister_thread() {
    with_reader(unregister_record);
}

fn unregister_record(r: &Reader) {
    let _registry = gp::registry().lock();
    r.registered.store(false, Ordering::Relaxed);
    let node = r.node.swap(core::ptr::null_mut(), Ordering::Relaxed);
    if !node.is_null() {
        // SAFETY: the node was created by this record's registration and
        // is linked on the registry or on a scanner's transient list; both
        // are only mutated under the registry mutex we hold.
        unsafe { ReaderList::remove(node) };
    }
}

// ---------------------------------------------------------------------------
// Read-side critical sections
// ---------------------------------------------------------------------------

fn read_lock_record(r: &Reader) {
    barrier::barrier();
    let tmp = r.ctr.load(Ordering::Relaxed);
    if tmp & GP_CTR_NEST_MASK == 0 {
        // Outermost entry: snapshot the global counter. This publishes
        // nest depth 1 and the observed phase in a single store.
        r.ctr.store(gp::counter(), Ordering::Relaxed);
        barrier::smp_mb_slave();
    } else {
        // Nested entry: bump the nest count, nothing else. No barrier.
        r.ctr.store(tmp.wrapping_add(1), Ordering::Relaxed);
    }
}

fn read_unlock_record(r: &Reader) {
    let tmp = r.ctr.load(Ordering::Relaxed);
    if tmp & GP_CTR_NEST_MASK == 1 {
        // Outermost exit: order the section's reads before the counter
        // store the scanner will observe, then let a sleeping writer know.
        barrier::smp_mb_slave();
        r.ctr.store(tmp.wrapping_sub(1), Ordering::Relaxed);
        barrier::smp_mb_slave();
        gp::wake_up_gp();
    } else {
        r.ctr.store(tmp.wrapping_sub(1), Ordering::Relaxed);
    }
    barrier::barrier();
}

/// Enter (or nest) a read-side critical section.
///
/// Values loaded from an [`RcuCell`](crate::RcuCell) between this call and
/// the matching [`read_unlock`] stay valid until a later `synchronize`
/// returns. Wait-free: no atomic read-modify-write, no allocation, no
/// blocking. Nests to `2^32 - 1`.
///
/// The calling thread must be registered.
#[inline]
pub fn read_lock() {
    with_reader(read_lock_record);
}

/// Leave the innermost read-side critical section.
///
/// Calls must balance [`read_lock`] on the same thread; an unmatched
/// unlock underflows the nest counter and the resulting behavior is
/// unspecified.
#[inline]
pub fn read_unlock() {
    with_reader(read_unlock_record);
}

/// Whether the calling thread is inside a read-side critical section.
/// Debug predicate for caller assertions.
pub fn read_ongoing() -> bool {
    with_reader(|r| r.ctr.load(Ordering::Relaxed) & GP_CTR_NEST_MASK != 0)
}

/// RAII read-side critical section; drops call [`read_unlock`].
///
/// Not `Send`: the section must end on the thread that began it.
pub struct ReadGuard {
    _thread_bound: core::marker::PhantomData<*mut ()>,
}

/// Enter a read-side critical section, leaving it when the guard drops.
pub fn read_guard() -> ReadGuard {
    read_lock();
    ReadGuard {
        _thread_bound: core::marker::PhantomData,
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        read_unlock();
    }
}
