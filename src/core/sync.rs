//! # Stage barrier and pool lifecycle
//!
//! One mutex guards everything the pool coordinates on: the barrier
//! counters, the start/exit requests for the persistent primary worker,
//! the stop request and the error slot. Its condition variable is
//! broadcast on every transition (barrier advance, start, stop, error,
//! worker exit). Workers only ever hold the mutex for O(1) bookkeeping —
//! never across allocation, I/O or pipeline inner loops.
//!
//! The barrier is re-entrant with a twist: the last thread to arrive
//! performs the stage transition (re-arming the count and advancing the
//! stage number) and releases the rest. A thread that observes the stop
//! request while waiting returns [`Cancelled`] instead; every caller
//! propagates it outward without touching the error taxonomy.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::{Cancelled, EngineError};

#[derive(Debug, Default)]
struct PoolState {
    start_request: bool,
    exit_primary: bool,
    stop_request: bool,
    stage: i32,
    threads_remaining: i32,
    threads_running: i32,
    error: Option<EngineError>,
}

/// What woke the parked primary worker.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PrimaryWake {
    Start,
    Exit,
}

pub(crate) struct PoolSync {
    state: Mutex<PoolState>,
    cond: Condvar,
    /// Mirror of the stop request for lock-free checks in inner loops.
    stop: AtomicBool,
    progress: AtomicU64,
    finished: AtomicBool,
    /// Thread count of the current run; the barrier re-arms with it.
    nthreads: AtomicUsize,
    /// Progress denominator (f32 bits); set once the tiler is built.
    progress_denominator: AtomicU32,
    on_finished: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl PoolSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            progress: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            nthreads: AtomicUsize::new(0),
            progress_denominator: AtomicU32::new(0),
            on_finished: Mutex::new(None),
        }
    }

    pub fn set_on_finished(&self, cb: Option<Box<dyn Fn() + Send>>) {
        *self.on_finished.lock().unwrap() = cb;
    }

    /// True while any worker of the current run is alive.
    pub fn any_threads_running(&self) -> bool {
        self.state.lock().unwrap().threads_running > 0
    }

    /// Arm the lifecycle state for a new run of `nthreads` workers.
    pub fn begin_run(&self, nthreads: usize) {
        self.nthreads.store(nthreads, Ordering::Relaxed);
        self.progress.store(0, Ordering::Relaxed);
        self.progress_denominator.store(0, Ordering::Relaxed);
        self.stop.store(false, Ordering::Relaxed);
        self.finished.store(false, Ordering::Relaxed);
        let mut st = self.state.lock().unwrap();
        st.stop_request = false;
        st.stage = -1;
        st.threads_running = nthreads as i32;
    }

    /// Reset between runs once all workers have exited.
    pub fn reset_after_run(&self) {
        self.progress.store(0, Ordering::Relaxed);
        self.stop.store(false, Ordering::Relaxed);
        self.finished.store(false, Ordering::Relaxed);
        self.state.lock().unwrap().stop_request = false;
    }

    /// Wake the parked primary worker with a start request.
    pub fn request_start(&self) {
        let mut st = self.state.lock().unwrap();
        st.start_request = true;
        self.cond.notify_all();
    }

    /// Tell the primary worker to exit its park loop for good.
    pub fn request_exit(&self) {
        let mut st = self.state.lock().unwrap();
        st.exit_primary = true;
        self.cond.notify_all();
    }

    /// Park until a start or exit request arrives. Primary worker only.
    pub fn wait_for_wake(&self) -> PrimaryWake {
        let mut st = self.state.lock().unwrap();
        while !st.start_request && !st.exit_primary {
            st = self.cond.wait(st).unwrap();
        }
        st.start_request = false;
        if st.exit_primary {
            PrimaryWake::Exit
        } else {
            PrimaryWake::Start
        }
    }

    /// Run-start handshake: the primary opens stage 0; late-arriving
    /// auxiliaries spin here until it has.
    pub fn open_stage_zero(&self, primary: bool) {
        let nthreads = self.nthreads.load(Ordering::Relaxed) as i32;
        let mut st = self.state.lock().unwrap();
        if primary {
            st.stage = 0;
            st.threads_remaining = nthreads;
            self.cond.notify_all();
        } else {
            while st.stage == -1 && !st.stop_request {
                st = self.cond.wait(st).unwrap();
            }
        }
    }

    /// The stage barrier. Must be called the same number of times by
    /// every worker within a run or the pool deadlocks.
    pub fn synchronize(&self) -> Result<(), Cancelled> {
        let nthreads = self.nthreads.load(Ordering::Relaxed) as i32;
        let mut st = self.state.lock().unwrap();
        st.threads_remaining -= 1;
        let stage = st.stage;
        self.cond.notify_all();

        while st.threads_remaining > 0 && st.stage == stage && !st.stop_request {
            st = self.cond.wait(st).unwrap();
        }
        let stopped = st.stop_request;

        if st.stage == stage {
            // Last arriver: re-arm the count and advance the stage.
            st.threads_remaining = nthreads;
            st.stage = stage + 1;
            self.cond.notify_all();
        }
        drop(st);

        if stopped {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Lock-free stop check for inner loops.
    #[inline]
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// The raw stop flag, for handing to blur routines that poll it
    /// between passes.
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    #[inline]
    pub fn check_cancel(&self) -> Result<(), Cancelled> {
        if self.stopping() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Bump the progress counter; monotonic increase is the only ordering
    /// promised.
    #[inline]
    pub fn tick(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
    }

    /// Install the tick count a full run amounts to. Written by the
    /// primary worker once the tiling is known.
    pub fn set_progress_denominator(&self, denominator: f32) {
        self.progress_denominator.store(denominator.to_bits(), Ordering::Relaxed);
    }

    /// Fraction complete in `[0, 1]`; monotonic within a run and pinned
    /// to 1.0 once finished. Capped just under 1.0 while running so only
    /// completion reports completion.
    pub fn progress(&self) -> f32 {
        if self.finished() {
            return 1.0;
        }
        let denominator = f32::from_bits(self.progress_denominator.load(Ordering::Relaxed));
        if denominator <= 0.0 {
            return 0.0;
        }
        let counter = self.progress.load(Ordering::Relaxed) as f32;
        (counter * 99.9 / denominator).min(99.9) / 100.0
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    /// Record a worker fault. The first writer wins; everyone else then
    /// observes the stop request at their next barrier.
    pub fn record_error(&self, err: EngineError) {
        let mut st = self.state.lock().unwrap();
        if st.error.is_none() {
            st.error = Some(err);
        }
        st.stop_request = true;
        self.stop.store(true, Ordering::Relaxed);
        self.cond.notify_all();
    }

    /// Consuming read of the stored error.
    pub fn take_error(&self) -> Option<EngineError> {
        self.state.lock().unwrap().error.take()
    }

    /// Request a stop and wait for every worker of the run to exit.
    /// Idempotent; returns immediately when nothing is running.
    pub fn abort_and_wait(&self) {
        let mut st = self.state.lock().unwrap();
        if st.threads_running == 0 {
            return;
        }
        st.stop_request = true;
        self.stop.store(true, Ordering::Relaxed);
        self.cond.notify_all();
        while st.threads_running > 0 {
            st = self.cond.wait(st).unwrap();
        }
    }

    /// Block until every worker of the current run has signed off.
    /// Callers use this after observing `finished` to close the small
    /// window where the primary has flagged completion but not yet
    /// decremented the running count.
    pub fn wait_idle(&self) {
        let mut st = self.state.lock().unwrap();
        while st.threads_running > 0 {
            st = self.cond.wait(st).unwrap();
        }
    }

    /// Worker exit bookkeeping. The primary marks the run finished and
    /// fires the completion callback before the count drops, so observers
    /// that see `threads_running == 0` also see `finished`.
    pub fn worker_exit(&self, primary: bool) {
        if primary {
            self.finished.store(true, Ordering::Relaxed);
            if let Some(cb) = self.on_finished.lock().unwrap().as_ref() {
                cb();
            }
        }
        let mut st = self.state.lock().unwrap();
        st.threads_running -= 1;
        self.cond.notify_all();
    }
}
