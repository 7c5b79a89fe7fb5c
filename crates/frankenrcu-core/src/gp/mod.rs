//! Grace-period engine.
//!
//! A grace period is driven by one elected writer on behalf of every
//! concurrent `synchronize` caller. The leader, holding the grace-period
//! mutex and the registry mutex, classifies every registered reader
//! against the global counter, parks the already-quiescent ones aside,
//! flips the phase bit, and waits for the pre-flip readers to drain. Two
//! scans bound the wait: a reader observed quiescent once can only re-enter
//! on the new phase, and new-phase readers cannot hold pre-flip state.
//!
//! The scanner's wait is adaptive: cheap lock-cycling spins first, then a
//! declared sleep on the grace-period futex that outermost `read_unlock`
//! calls wake.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::LazyLock;

use parking_lot::{Mutex, MutexGuard};

use crate::barrier::{barrier, cpu_relax, master_barrier_count, smp_mb, smp_mb_master};
use crate::list::ReaderList;
use crate::reader::{GP_CTR_PHASE, ReaderState, reader_state};
use crate::sys;
use crate::wait::{
    WAIT_RUNNING, WaitNode, WaitQueue, adaptive_busy_wait, adaptive_wake_up, for_each_drained,
};

/// Scan passes over the remaining readers before the scanner declares
/// intent to sleep on the grace-period futex.
pub const RCU_QS_ACTIVE_ATTEMPTS: u32 = 100;

/// Global grace-period state. Only the phase bit of `ctr` is meaningful;
/// the low word is initialized to 1 so an outermost reader's snapshot of
/// `ctr` is simultaneously "nest depth 1" and "current phase".
struct GracePeriod {
    ctr: AtomicU64,
    futex: AtomicI32,
}

static GP: GracePeriod = GracePeriod {
    ctr: AtomicU64::new(1),
    futex: AtomicI32::new(0),
};

/// Serializes writers. Held for the whole scan.
static GP_LOCK: Mutex<()> = Mutex::new(());

/// Coalesces concurrent `synchronize` callers into one grace period.
static GP_WAITERS: WaitQueue = WaitQueue::new();

/// All currently registered readers. The mutex also covers every splice
/// between the registry and a scanner's transient lists.
static REGISTRY: LazyLock<Mutex<ReaderList>> = LazyLock::new(|| Mutex::new(ReaderList::new()));

static GRACE_PERIODS: AtomicU64 = AtomicU64::new(0);
static SCANNER_FUTEX_SLEEPS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn registry() -> &'static Mutex<ReaderList> {
    &REGISTRY
}

/// Current grace-period counter word. Readers snapshot this at outermost
/// entry; tests and diagnostics may watch the phase bit move.
pub fn counter() -> u64 {
    GP.ctr.load(Ordering::Relaxed)
}

/// Whether a scanning writer has declared intent to sleep on the
/// grace-period futex. Diagnostic.
pub fn scanner_parked() -> bool {
    GP.futex.load(Ordering::SeqCst) == -1
}

/// Writer-path counters. All values are process-lifetime totals; callers
/// compare deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Grace periods that actually scanned a non-empty registry.
    pub grace_periods: u64,
    /// Expedited master barriers issued.
    pub master_barriers: u64,
    /// Times a scanner slept on the grace-period futex.
    pub scanner_futex_sleeps: u64,
}

pub fn stats() -> Stats {
    Stats {
        grace_periods: GRACE_PERIODS.load(Ordering::Relaxed),
        master_barriers: master_barrier_count(),
        scanner_futex_sleeps: SCANNER_FUTEX_SLEEPS.load(Ordering::Relaxed),
    }
}

/// Reader-side coupling: called on outermost `read_unlock`. If a scanner
/// has declared intent to sleep, reset the word and wake it.
pub(crate) fn wake_up_gp() {
    if GP.futex.load(Ordering::Relaxed) == -1 {
        if GP
            .futex
            .compare_exchange(-1, 0, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            if let Err(e) = sys::futex_wake(&GP.futex, 1) {
                sys::fatal("futex wake on grace-period word", e);
            }
        }
    }
}

/// Park the scanner until a reader signals the grace-period futex.
///
/// The registry mutex is released across the sleep and always re-held on
/// return, racing readers notwithstanding.
fn wait_gp<'a>(
    lock: &'a Mutex<ReaderList>,
    guard: MutexGuard<'a, ReaderList>,
) -> MutexGuard<'a, ReaderList> {
    smp_mb_master();
    drop(guard);
    if GP.futex.load(Ordering::SeqCst) == -1 {
        SCANNER_FUTEX_SLEEPS.fetch_add(1, Ordering::Relaxed);
        loop {
            match sys::futex_wait(&GP.futex, -1) {
                Ok(()) => break,
                Err(e) if e == sys::EWOULDBLOCK || e == sys::EAGAIN => break,
                Err(e) if e == sys::EINTR => continue,
                Err(e) => sys::fatal("futex wait on grace-period word", e),
            }
        }
    }
    lock.lock()
}

/// One classification pass over `input`.
///
/// Readers on the current phase move to `cur_snap` when one is supplied;
/// with no snapshot target (the post-flip scan) a current-phase reader has
/// re-entered on the new phase and counts as quiescent for this grace
/// period. Inactive readers move to `qs`. Old-phase readers stay put;
/// they are what the caller is waiting out.
///
/// # Safety
///
/// All three lists must be valid and mutated only under the registry
/// mutex, which the caller holds.
unsafe fn scan_pass(input: *mut ReaderList, cur_snap: Option<*mut ReaderList>, qs: *mut ReaderList) {
    // SAFETY: caller holds the registry mutex; the successor link is
    // captured before a node is spliced onto another list.
    unsafe {
        let head = (*input).sentinel();
        let mut it = (*head).next();
        while it != head {
            let next = (*it).next();
            let reader = &*(*it).reader();
            match reader_state(GP.ctr.load(Ordering::Relaxed), reader) {
                ReaderState::ActiveCurrent => match cur_snap {
                    Some(snap) => ReaderList::move_front(it, &mut *snap),
                    None => ReaderList::move_front(it, &mut *qs),
                },
                ReaderState::Inactive => ReaderList::move_front(it, &mut *qs),
                ReaderState::ActiveOld => {}
            }
            it = next;
        }
    }
}

/// Wait until every reader on `input` has been classified off it.
///
/// The first `RCU_QS_ACTIVE_ATTEMPTS` passes spin, cycling the registry
/// mutex between passes so readers can (un)register. Later passes declare
/// intent to sleep (`gp.futex = -1`), re-scan once under a master barrier,
/// and park on the futex until an outermost `read_unlock` signals it.
fn wait_for_readers<'a>(
    lock: &'a Mutex<ReaderList>,
    mut guard: MutexGuard<'a, ReaderList>,
    input: *mut ReaderList,
    cur_snap: Option<*mut ReaderList>,
    qs: *mut ReaderList,
) -> MutexGuard<'a, ReaderList> {
    let mut wait_loops: u32 = 0;
    loop {
        wait_loops = wait_loops.saturating_add(1);
        let parked = wait_loops >= RCU_QS_ACTIVE_ATTEMPTS;
        if parked {
            // Write the futex before reading reader counters, so an
            // unlocking reader either sees -1 and wakes us, or its counter
            // store is visible to the scan below.
            GP.futex.fetch_sub(1, Ordering::SeqCst);
            smp_mb_master();
        }

        // SAFETY: guard holds the registry mutex; the lists stay valid
        // across the unlock windows below because we never touch them
        // without re-acquiring it first.
        unsafe { scan_pass(input, cur_snap, qs) };

        // SAFETY: as above.
        let drained = unsafe { (*input).is_empty() };
        if drained {
            if parked {
                smp_mb_master();
                GP.futex.store(0, Ordering::SeqCst);
            }
            return guard;
        }
        if parked {
            guard = wait_gp(lock, guard);
        } else {
            drop(guard);
            cpu_relax();
            guard = lock.lock();
        }
    }
}

/// Block until every read-side critical section in progress at the moment
/// of the call has ended.
///
/// Concurrent callers coalesce: one leader runs the grace period and the
/// rest block until it covers them. Not callable from inside a read-side
/// critical section (self-deadlock), and not interruptible.
pub fn synchronize() {
    let mut wait = WaitNode::new();
    // SAFETY: the node outlives its queue membership: a follower blocks
    // until the waker's teardown handshake finishes, and the leader drains
    // the queue before its own frame can unwind.
    if unsafe { GP_WAITERS.push(&mut wait) } {
        // Follower: the leader's grace period covers this call.
        adaptive_busy_wait(&wait);
        smp_mb();
        return;
    }

    wait.state.store(WAIT_RUNNING, Ordering::Relaxed);
    let gp_guard = GP_LOCK.lock();
    // Later arrivals form the next generation and elect their own leader.
    let waiters = GP_WAITERS.drain();

    let lock = registry();
    let mut guard = lock.lock();
    if !guard.is_empty() {
        GRACE_PERIODS.fetch_add(1, Ordering::Relaxed);
        let mut cur_snap = ReaderList::new();
        let mut qs = ReaderList::new();

        // Every pre-existing reader's phase-snapshot store becomes visible
        // before the first scan loads it.
        smp_mb_master();

        let input: *mut ReaderList = &mut *guard;
        guard = wait_for_readers(lock, guard, input, Some(&mut cur_snap), &mut qs);

        // Order the scan's counter loads before the flip, and the flip
        // before the second scan's loads.
        barrier();
        GP.ctr.store(
            GP.ctr.load(Ordering::Relaxed) ^ GP_CTR_PHASE,
            Ordering::Release,
        );
        barrier();

        // The former current-phase readers are now old relative to the new
        // phase; there is no further phase for them to migrate to.
        guard = wait_for_readers(lock, guard, &mut cur_snap, None, &mut qs);

        if !qs.is_empty() {
            qs.splice_into(&mut guard);
        }
        smp_mb_master();
    }
    drop(guard);
    drop(gp_guard);

    // SAFETY: every drained node is still owned by a blocked waiter; the
    // leader's own node is skipped via its RUNNING bit.
    unsafe {
        for_each_drained(waiters, |node| {
            if node.state.load(Ordering::Relaxed) & WAIT_RUNNING == 0 {
                adaptive_wake_up(node);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{read_lock, read_unlock, register_thread, unregister_thread};
    use crate::test_support;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn empty_registry_synchronize_leaves_counter_untouched() {
        let _serial = test_support::serialize();
        let before = counter();
        let gp_before = stats().grace_periods;
        synchronize();
        assert_eq!(counter(), before);
        assert_eq!(stats().grace_periods, gp_before);
    }

    #[test]
    fn back_to_back_synchronize_flips_phase_twice() {
        let _serial = test_support::serialize();
        register_thread();
        let c0 = counter();
        synchronize();
        assert_eq!(counter(), c0 ^ GP_CTR_PHASE);
        synchronize();
        assert_eq!(counter(), c0);
        unregister_thread();
    }

    #[test]
    fn synchronize_waits_for_a_preexisting_reader() {
        let _serial = test_support::serialize();
        let (entered_tx, entered_rx) = mpsc::channel();
        let hold = Duration::from_millis(150);

        let reader = std::thread::spawn(move || {
            register_thread();
            read_lock();
            entered_tx.send(()).expect("signal read-side entry");
            std::thread::sleep(hold);
            read_unlock();
            unregister_thread();
        });

        entered_rx.recv().expect("reader entered");
        let start = Instant::now();
        synchronize();
        let waited = start.elapsed();
        reader.join().expect("reader thread");

        assert!(
            waited >= hold - Duration::from_millis(50),
            "synchronize returned after {waited:?}, before the reader released"
        );
    }

    #[test]
    fn repeated_synchronize_against_quiescent_reader_is_prompt() {
        let _serial = test_support::serialize();
        // A quiescent reader is parked aside on the first pass of every
        // scan; fifty grace periods should be nowhere near the bound.
        register_thread();
        let start = Instant::now();
        for _ in 0..50 {
            synchronize();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        unregister_thread();
    }

    #[test]
    fn wake_up_gp_without_parked_scanner_is_a_noop() {
        let _serial = test_support::serialize();
        wake_up_gp();
        assert!(!scanner_parked());
    }
}
