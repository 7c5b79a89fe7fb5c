//! Memory-ordering primitives.
//!
//! The engine's ordering contract is asymmetric: readers issue only a
//! compiler barrier on their fast path (the *slave* side), and writers pay
//! for both sides by issuing an expedited process-wide memory barrier (the
//! *master* side) around their scans. The expedited barrier makes every
//! reader's program order appear as memory order to the writer, exactly as
//! if the reader had fenced — without the reader ever executing a fence
//! instruction.
//!
//! If the kernel cannot provide the expedited membarrier command, both
//! sides degrade to `fence(SeqCst)` for the life of the process. The
//! asymmetry is lost but the happens-before edges are not.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering, compiler_fence, fence};
use std::sync::Once;

use crate::sys;

/// True once the membarrier probe failed and both barrier sides must use
/// real fences. Read on the reader fast path with a relaxed load.
static FALLBACK_FENCES: AtomicBool = AtomicBool::new(false);

static MEMBARRIER_INIT: Once = Once::new();

/// Master barriers issued since process start. Writer-path only.
static MASTER_BARRIERS: AtomicU64 = AtomicU64::new(0);

/// Compiler barrier. Forbids compile-time reordering across this point;
/// emits no instruction.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Full store-load fence.
#[inline(always)]
pub fn smp_mb() {
    fence(Ordering::SeqCst);
}

/// Spin-wait pause hint.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// One-time process setup for the expedited membarrier command.
///
/// Called from thread registration. On kernels without the command the
/// probe fails with ENOSYS/EINVAL and every later barrier, master and
/// slave, becomes a full fence.
pub(crate) fn init_membarrier() {
    MEMBARRIER_INIT.call_once(|| {
        if sys::membarrier_register().is_err() {
            FALLBACK_FENCES.store(true, Ordering::Release);
        }
    });
}

/// Master barrier: expedited memory barrier on every CPU running a thread
/// of this process.
pub(crate) fn smp_mb_master() {
    MASTER_BARRIERS.fetch_add(1, Ordering::Relaxed);
    if FALLBACK_FENCES.load(Ordering::Relaxed) {
        smp_mb();
        return;
    }
    if let Err(err) = sys::membarrier_private_expedited() {
        sys::fatal("membarrier(PRIVATE_EXPEDITED)", err);
    }
}

/// Slave barrier: the reader-side counterpart of [`smp_mb_master`]. A
/// compiler barrier normally; a full fence under membarrier fallback.
#[inline]
pub(crate) fn smp_mb_slave() {
    if FALLBACK_FENCES.load(Ordering::Relaxed) {
        smp_mb();
    } else {
        barrier();
    }
}

/// Number of master barriers issued so far.
pub fn master_barrier_count() -> u64 {
    MASTER_BARRIERS.load(Ordering::Relaxed)
}
