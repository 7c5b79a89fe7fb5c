//! Futex and membarrier syscall veneer.
//!
//! Typed wrappers over the two kernel facilities the grace-period engine
//! needs: `futex` (wait-if-equal / wake-N) and `membarrier` (the expedited
//! process-wide memory barrier). Wrappers return `Result<(), i32>` with the
//! raw errno; callers decide which codes are benign. Anything unexpected
//! goes through [`fatal`]: a synchronization primitive cannot limp along
//! after its kernel contract breaks.
//!
//! Non-Linux builds degrade to polling: futex waits become a yield that
//! reports "value already changed", and the membarrier probe fails so the
//! barrier layer falls back to full fences on both sides.

use core::sync::atomic::AtomicI32;

/// `MEMBARRIER_CMD_PRIVATE_EXPEDITED`: issue a memory barrier on every CPU
/// currently running a thread of this process.
#[cfg(target_os = "linux")]
const MEMBARRIER_CMD_PRIVATE_EXPEDITED: libc::c_int = 1 << 3;

/// `MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED`: opt the process into the
/// expedited command. Required once before the first expedited barrier.
#[cfg(target_os = "linux")]
const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_int = 1 << 4;

/// Last-os-error errno, 0 if unavailable.
#[cfg(target_os = "linux")]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// `futex(word, FUTEX_WAIT | FUTEX_PRIVATE_FLAG, expected, NULL)`.
///
/// Blocks until woken, iff `*word == expected` at call time. `Ok(())` means
/// a wakeup was delivered; `Err(EAGAIN)` means the word no longer held
/// `expected` (the counterpart already signaled); `Err(EINTR)` means a
/// signal interrupted the wait. Callers treat the latter two as "re-check
/// state".
#[cfg(target_os = "linux")]
pub(crate) fn futex_wait(word: &AtomicI32, expected: i32) -> Result<(), i32> {
    // SAFETY: Linux futex syscall on a valid, live userspace address with a
    // null timeout.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicI32 as *const i32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        )
    };
    if rc == 0 { Ok(()) } else { Err(errno()) }
}

/// Polling stand-in: yield once and report "value already changed" so the
/// caller re-checks its condition.
#[cfg(not(target_os = "linux"))]
pub(crate) fn futex_wait(_word: &AtomicI32, _expected: i32) -> Result<(), i32> {
    std::thread::yield_now();
    Err(EWOULDBLOCK)
}

/// `futex(word, FUTEX_WAKE | FUTEX_PRIVATE_FLAG, n)`. Returns the number of
/// waiters woken.
#[cfg(target_os = "linux")]
pub(crate) fn futex_wake(word: &AtomicI32, n: i32) -> Result<i32, i32> {
    // SAFETY: Linux futex syscall on a valid userspace address.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicI32 as *const i32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n,
        )
    };
    if rc >= 0 { Ok(rc as i32) } else { Err(errno()) }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn futex_wake(_word: &AtomicI32, _n: i32) -> Result<i32, i32> {
    Ok(0)
}

/// Issue the expedited process-wide memory barrier.
#[cfg(target_os = "linux")]
pub(crate) fn membarrier_private_expedited() -> Result<(), i32> {
    membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn membarrier_private_expedited() -> Result<(), i32> {
    Err(ENOSYS)
}

/// Register the process for the expedited membarrier command.
#[cfg(target_os = "linux")]
pub(crate) fn membarrier_register() -> Result<(), i32> {
    membarrier(MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn membarrier_register() -> Result<(), i32> {
    Err(ENOSYS)
}

#[cfg(target_os = "linux")]
fn membarrier(cmd: libc::c_int) -> Result<(), i32> {
    // SAFETY: membarrier takes no pointers; flags and cpu_id are zero.
    let rc = unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0, 0) };
    if rc == 0 { Ok(()) } else { Err(errno()) }
}

/// Kernel thread id of the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn gettid() -> i32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn gettid() -> i32 {
    use core::sync::atomic::{AtomicI32 as Counter, Ordering};
    static NEXT: Counter = Counter::new(1);
    thread_local! {
        static TID: i32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}

// Errno values the engine treats as benign; mirrored here so the engine
// does not reach into `libc` directly on non-Linux targets.
#[cfg(target_os = "linux")]
pub(crate) const EWOULDBLOCK: i32 = libc::EWOULDBLOCK;
#[cfg(target_os = "linux")]
pub(crate) const EAGAIN: i32 = libc::EAGAIN;
#[cfg(target_os = "linux")]
pub(crate) const EINTR: i32 = libc::EINTR;
#[cfg(not(target_os = "linux"))]
pub(crate) const EWOULDBLOCK: i32 = 11;
#[cfg(not(target_os = "linux"))]
pub(crate) const EAGAIN: i32 = 11;
#[cfg(not(target_os = "linux"))]
pub(crate) const EINTR: i32 = 4;
#[cfg(not(target_os = "linux"))]
const ENOSYS: i32 = 38;

/// Terminal error sink for syscall failures outside the benign set.
///
/// The grace-period protocol has no recoverable errors: a futex or
/// membarrier failure we did not anticipate means the waiter/waker pairing
/// is broken and blocked threads may never wake. Abort rather than deadlock.
pub(crate) fn fatal(op: &str, err: i32) -> ! {
    eprintln!("frankenrcu: {op} failed with errno {err}; aborting");
    std::process::abort();
}
