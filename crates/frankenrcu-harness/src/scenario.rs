//! The reader/writer demonstration workload.
//!
//! Writers publish a fresh boxed value, wait a grace period, and reclaim
//! the replaced box. Readers register, sum the published value across
//! their iterations, and unregister. The interesting output is that it
//! terminates, that every reader read a live value on every iteration,
//! and that the final published value is some writer's last publish.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use frankenrcu_core as rcu;
use rcu::RcuCell;
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid scenario: {0}")]
    InvalidConfig(String),
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Workload shape. Defaults mirror the classic demonstration: ten readers
/// and three writers, a thousand iterations each.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub readers: usize,
    pub writers: usize,
    pub reader_iters: u64,
    pub writer_iters: u64,
    /// Hold time inside each read-side critical section.
    pub reader_hold: Duration,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            readers: 10,
            writers: 3,
            reader_iters: 1000,
            writer_iters: 1000,
            reader_hold: Duration::ZERO,
        }
    }
}

impl Scenario {
    fn validate(&self) -> Result<(), HarnessError> {
        if self.readers == 0 || self.writers == 0 {
            return Err(HarnessError::InvalidConfig(
                "at least one reader and one writer are required".into(),
            ));
        }
        if self.reader_iters == 0 || self.writer_iters == 0 {
            return Err(HarnessError::InvalidConfig(
                "iteration counts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Run outcome, for callers that want more than the log.
#[derive(Debug, Clone)]
pub struct Summary {
    pub reader_sums: Vec<u64>,
    pub final_value: u64,
    pub elapsed: Duration,
    pub grace_periods: u64,
    pub master_barriers: u64,
}

pub fn run(scenario: &Scenario, log: &Arc<LogEmitter>) -> Result<Summary, HarnessError> {
    scenario.validate()?;

    let mut entry = LogEntry::new(LogLevel::Info, "scenario_start");
    entry.iterations = Some(scenario.reader_iters);
    log.emit(&entry)?;

    let stats_before = rcu::stats();
    let start = Instant::now();

    let cell = Arc::new(RcuCell::<u64>::new());
    cell.store(Box::into_raw(Box::new(1)));

    let readers: Vec<_> = (0..scenario.readers)
        .map(|idx| {
            let cell = Arc::clone(&cell);
            let log = Arc::clone(log);
            let iters = scenario.reader_iters;
            let hold = scenario.reader_hold;
            thread::spawn(move || {
                rcu::register_thread();
                let mut sum = 0u64;
                for _ in 0..iters {
                    rcu::read_lock();
                    // SAFETY: inside a read-side critical section; the
                    // slot is never published null during the run.
                    if let Some(v) = unsafe { cell.deref() } {
                        sum = sum.wrapping_add(*v);
                    }
                    if !hold.is_zero() {
                        thread::sleep(hold);
                    }
                    rcu::read_unlock();
                }
                rcu::unregister_thread();

                let mut entry = LogEntry::new(LogLevel::Info, "thread_done");
                entry.thread = Some(format!("reader-{idx}"));
                entry.iterations = Some(iters);
                entry.sum = Some(sum);
                let _ = log.emit(&entry);
                sum
            })
        })
        .collect();

    let writers: Vec<_> = (0..scenario.writers)
        .map(|idx| {
            let cell = Arc::clone(&cell);
            let log = Arc::clone(log);
            let iters = scenario.writer_iters;
            thread::spawn(move || {
                for i in 0..iters {
                    let old = cell.swap(Box::into_raw(Box::new(i)));
                    rcu::synchronize();
                    if !old.is_null() {
                        // SAFETY: the grace period guarantees no reader
                        // still holds the replaced version.
                        drop(unsafe { Box::from_raw(old) });
                    }
                }
                let mut entry = LogEntry::new(LogLevel::Info, "thread_done");
                entry.thread = Some(format!("writer-{idx}"));
                entry.iterations = Some(iters);
                let _ = log.emit(&entry);
            })
        })
        .collect();

    let mut reader_sums = Vec::with_capacity(scenario.readers);
    for handle in readers {
        reader_sums.push(handle.join().map_err(|_| HarnessError::ThreadPanicked("reader"))?);
    }
    for handle in writers {
        handle.join().map_err(|_| HarnessError::ThreadPanicked("writer"))?;
    }

    // Retire the final version now that every reader is gone.
    let last = cell.swap(core::ptr::null_mut());
    rcu::synchronize();
    let final_value = if last.is_null() {
        0
    } else {
        // SAFETY: no readers remain; the slot was just emptied.
        let v = unsafe { *last };
        drop(unsafe { Box::from_raw(last) });
        v
    };

    let elapsed = start.elapsed();
    let stats_after = rcu::stats();
    let summary = Summary {
        reader_sums,
        final_value,
        elapsed,
        grace_periods: stats_after.grace_periods - stats_before.grace_periods,
        master_barriers: stats_after.master_barriers - stats_before.master_barriers,
    };

    let mut entry = LogEntry::new(LogLevel::Info, "scenario_end");
    entry.elapsed_ms = Some(elapsed.as_millis() as u64);
    entry.grace_periods = Some(summary.grace_periods);
    entry.master_barriers = Some(summary.master_barriers);
    entry.final_value = Some(summary.final_value);
    log.emit(&entry)?;

    Ok(summary)
}
