//! # Controller and worker pool
//!
//! The high-level surface of the engine: accepts a source image, a mask
//! and the tuning records, runs the selected pipeline asynchronously over
//! a pool of workers, and reports progress, completion and errors.
//!
//! ## Pool topology
//!
//! One *primary* worker lives as long as the controller: it is created at
//! construction, parks on a condition variable between runs, and is only
//! joined at destruction. Back-ends that bind a context to their creating
//! thread (the GPU path does) would otherwise pay the context setup on
//! every run, which is substantial for preview-sized images. The
//! remaining N-1 *auxiliary* workers are spawned per run and joined when
//! the run ends.
//!
//! ## Stage choreography
//!
//! Workers move through the pipeline in lock step: the primary performs
//! tiler and buffer setup between barriers, row-parallel stages fan out
//! through the row dispatcher, and every worker calls [`PoolSync::synchronize`]
//! the same number of times per run. A worker that faults records its
//! error (first writer wins) and trips the stop flag; everyone else
//! observes cancellation at their next barrier and unwinds cleanly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use aniso_pix::{FloatImage, IntImage, MaskView};
use log::debug;

use crate::config::{Options, Pipeline, Settings};
use crate::core::rows::RowDispatcher;
use crate::core::shared::StageCell;
use crate::core::sync::{PoolSync, PrimaryWake};
use crate::error::{EngineError, StageAbort};
use crate::pipeline::{diffusion, unsharp};
use crate::tiler::{BlockTiler, Rect, MAX_PIXELS_PER_BLOCK};

/// Everything a run shares between its workers. Built by [`Controller::run`],
/// handed to each worker as an owned `(Arc, thread index)` pair, dropped
/// when the run is finished or aborted.
struct RunJob {
    settings: Settings,
    pipeline: Pipeline,
    gpu: bool,
    block_pixel_limit: usize,
    /// Channels of the working tile; at least four so the lane paths
    /// apply.
    channels: usize,
    source: Arc<StageCell<IntImage>>,
    mask: Option<Arc<IntImage>>,
    sync: Arc<PoolSync>,
    tiler: StageCell<BlockTiler>,
    /// The current working tile.
    work: StageCell<FloatImage>,
    /// Outer rectangle of the current block within the mask; `None` once
    /// the primary determines every covered pixel is active.
    block_mask: StageCell<Option<Rect>>,
    /// Structure tensors; reused as the per-angle walk field.
    g: StageCell<FloatImage>,
    /// Smoothed tensor geometry.
    g2: StageCell<FloatImage>,
    /// Accumulator for the angle integrals.
    dest: StageCell<FloatImage>,
    rows: RowDispatcher,
    /// Set by the primary during setup; every worker's loop bound.
    total_blocks: AtomicUsize,
}

impl RunJob {
    /// Mask view clipped to the current block, if mask checks are still
    /// needed for it.
    fn block_mask_view(&self) -> Option<MaskView<'_>> {
        // Written by the primary between barriers, read-only here.
        let rect = unsafe { *self.block_mask.get() }?;
        let mask = self.mask.as_deref()?;
        Some(mask.view(rect.left, rect.top, rect.width, rect.height))
    }
}

/// Asynchronous engine front-end. See the module docs for the threading
/// model.
pub struct Controller {
    /// Diffusion tuning, read at `run()` time.
    pub settings: Settings,
    /// Non-output-affecting options, read at `run()` time.
    pub options: Options,
    /// Which pipeline `run()` executes.
    pub pipeline: Pipeline,

    sync: Arc<PoolSync>,
    job_slot: Arc<Mutex<Option<Arc<RunJob>>>>,
    primary: Option<JoinHandle<()>>,
    aux: Vec<JoinHandle<()>>,
    source: Option<Arc<StageCell<IntImage>>>,
    mask: Option<Arc<IntImage>>,
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Controller {
    pub fn new() -> Self {
        let sync = Arc::new(PoolSync::new());
        let job_slot: Arc<Mutex<Option<Arc<RunJob>>>> = Arc::new(Mutex::new(None));

        let primary = {
            let sync = Arc::clone(&sync);
            let job_slot = Arc::clone(&job_slot);
            std::thread::Builder::new()
                .name("aniso-worker-0".to_string())
                .spawn(move || primary_main(sync, job_slot))
                .expect("spawning the primary worker")
        };

        Self {
            settings: Settings::default(),
            options: Options::default(),
            pipeline: Pipeline::default(),
            sync,
            job_slot,
            primary: Some(primary),
            aux: Vec::new(),
            source: None,
            mask: None,
        }
    }

    /// Install the source image. It doubles as the destination: processed
    /// blocks are stored back into it.
    pub fn set_target(&mut self, image: IntImage) {
        self.source = Some(Arc::new(StageCell::new(image)));
    }

    /// Install the processing mask: a pixel is active iff its mask byte
    /// is non-zero. An empty mask means every pixel is active.
    pub fn set_mask(&mut self, mask: IntImage) {
        self.mask = Some(Arc::new(mask));
    }

    /// Callback invoked by the primary worker as a run completes, from
    /// the worker thread.
    pub fn set_finished_callback<F: Fn() + Send + 'static>(&self, cb: F) {
        self.sync.set_on_finished(Some(Box::new(cb)));
    }

    /// Start processing asynchronously; returns immediately. Fails when a
    /// run is already in flight or the inputs do not line up.
    pub fn run(&mut self) -> Result<(), EngineError> {
        if self.sync.any_threads_running() {
            return Err(EngineError::Validation("already running".to_string()));
        }
        self.finish();

        let source = self
            .source
            .clone()
            .ok_or_else(|| EngineError::Validation("no target image".to_string()))?;

        // Quiescent: no workers are running, so reading the cell is safe.
        let (src_w, src_h, src_channels) = {
            let img = unsafe { source.get() };
            (img.width(), img.height(), img.channels())
        };

        let mask = self.mask.clone().filter(|m| !m.is_empty());
        if let Some(mask) = &mask {
            if mask.width() != src_w || mask.height() != src_h {
                return Err(EngineError::Validation(
                    "given mask and image have different dimensions".to_string(),
                ));
            }
        }

        let nthreads = self.options.resolved_threads();
        debug!("threads: {}, settings: [{}]", nthreads, self.settings.summary());

        // Process at least four channels so the lane fast paths apply.
        let channels = if self.options.gpu { 4 } else { src_channels.max(4) };
        let block_pixel_limit = if self.options.block_pixel_limit > 0 {
            self.options.block_pixel_limit as usize
        } else {
            MAX_PIXELS_PER_BLOCK
        };

        let job = Arc::new(RunJob {
            settings: self.settings,
            pipeline: self.pipeline,
            gpu: self.options.gpu,
            block_pixel_limit,
            channels,
            source,
            mask,
            sync: Arc::clone(&self.sync),
            tiler: StageCell::default(),
            work: StageCell::default(),
            block_mask: StageCell::new(None),
            g: StageCell::default(),
            g2: StageCell::default(),
            dest: StageCell::default(),
            rows: RowDispatcher::new(),
            total_blocks: AtomicUsize::new(0),
        });

        self.sync.begin_run(nthreads);
        *self.job_slot.lock().unwrap() = Some(Arc::clone(&job));
        self.sync.request_start();

        for i in 1..nthreads {
            let job = Arc::clone(&job);
            let spawned = std::thread::Builder::new()
                .name(format!("aniso-worker-{}", i))
                .spawn(move || worker_main(job, i));
            match spawned {
                Ok(handle) => self.aux.push(handle),
                Err(e) => {
                    // A short pool would deadlock the barrier; pull the
                    // whole run down instead.
                    self.abort();
                    return Err(EngineError::Worker(format!("spawning worker {}: {}", i, e)));
                }
            }
        }
        Ok(())
    }

    /// Fraction complete, monotonic per run.
    pub fn progress(&self) -> f32 {
        self.sync.progress()
    }

    /// True once every worker of the last run has exited, successfully or
    /// not. Cleared again by `run()` and `abort()`.
    pub fn finished(&self) -> bool {
        self.sync.finished()
    }

    /// Consuming read of the pending error, if any. Cancellation never
    /// shows up here.
    pub fn error(&self) -> Option<EngineError> {
        self.sync.take_error()
    }

    /// Stop the current run and block until every worker has exited.
    /// Idempotent; safe to call when nothing is running.
    pub fn abort(&mut self) {
        self.sync.abort_and_wait();
        self.finish();
    }

    /// Read access to the processed image; only available while no run is
    /// in flight.
    pub fn with_result<R>(&self, f: impl FnOnce(&IntImage) -> R) -> Result<R, EngineError> {
        if self.sync.any_threads_running() {
            if !self.sync.finished() {
                return Err(EngineError::Validation("still running".to_string()));
            }
            // Finished is flagged just before the last sign-off; close
            // that window.
            self.sync.wait_idle();
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| EngineError::Validation("no target image".to_string()))?;
        // Quiescent, see above.
        Ok(f(unsafe { source.get() }))
    }

    /// Reclaim the (possibly processed) target image.
    pub fn take_target(&mut self) -> Option<IntImage> {
        if self.sync.any_threads_running() {
            if !self.sync.finished() {
                return None;
            }
            self.sync.wait_idle();
        }
        self.finish();
        let cell = self.source.take()?;
        match Arc::try_unwrap(cell) {
            Ok(cell) => Some(cell.into_inner()),
            Err(arc) => {
                self.source = Some(arc);
                None
            }
        }
    }

    /// Join finished auxiliaries and clear per-run state. The working
    /// buffers live in the job record, so dropping it frees them.
    fn finish(&mut self) {
        for handle in self.aux.drain(..) {
            let _ = handle.join();
        }
        self.sync.reset_after_run();
        *self.job_slot.lock().unwrap() = None;
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.abort();
        self.sync.request_exit();
        if let Some(handle) = self.primary.take() {
            let _ = handle.join();
        }
    }
}

/// Park loop of the persistent primary worker.
fn primary_main(sync: Arc<PoolSync>, job_slot: Arc<Mutex<Option<Arc<RunJob>>>>) {
    loop {
        match sync.wait_for_wake() {
            PrimaryWake::Exit => break,
            PrimaryWake::Start => {
                let job = job_slot.lock().unwrap().clone();
                if let Some(job) = job {
                    worker_main(job, 0);
                }
            }
        }
    }
}

/// Common worker entry: run the block loop, funnel faults into the shared
/// error slot, and sign off. The job record is released *before* the exit
/// handshake, so an observer that has seen the pool go idle also sees the
/// per-run buffers unreferenced.
fn worker_main(job: Arc<RunJob>, thread_no: usize) {
    let started = Instant::now();
    let sync = Arc::clone(&job.sync);
    match run_blocks(&job, thread_no) {
        Ok(()) | Err(StageAbort::Cancelled) => {}
        Err(StageAbort::Failed(err)) => job.sync.record_error(err),
    }
    if thread_no == 0 {
        debug!("run took {:.3}s", started.elapsed().as_secs_f32());
    }
    drop(job);
    sync.worker_exit(thread_no == 0);
}

/// The per-worker block loop: stage-zero handshake, tiler setup on the
/// primary, then the per-iteration, per-block pipeline with matching
/// barrier counts on every thread.
fn run_blocks(job: &Arc<RunJob>, thread_no: usize) -> Result<(), StageAbort> {
    let s = &job.settings;
    // Parameter validation happens here so the failure funnels through
    // the shared error slot like any other worker fault.
    s.validate()?;
    if let Pipeline::Unsharp(u) = &job.pipeline {
        u.validate()?;
    }

    let primary = thread_no == 0;
    job.sync.open_stage_zero(primary);
    job.sync.synchronize()?;

    if primary {
        let overlap = match &job.pipeline {
            Pipeline::Diffusion => {
                // A guess of the walk length: enough for the final data,
                // clamped to tolerate very large amplitudes.
                let n = 2.0f32;
                let length = s.gauss_prec * n * (2.0 * s.amplitude).sqrt();
                (length as usize).min(100)
            }
            Pipeline::Unsharp(u) => u.radius as usize + 10,
        };

        let tiler = unsafe { job.tiler.get() };
        let source = unsafe { job.source.get() };
        tiler.set_gpu_axis_limit(job.gpu && matches!(job.pipeline, Pipeline::Diffusion));
        tiler.load(source, overlap, job.block_pixel_limit);
        if let Some(mask) = &job.mask {
            tiler.prune_masked(mask);
        }
        job.total_blocks.store(tiler.total_blocks(), Ordering::Relaxed);

        let denominator = match &job.pipeline {
            Pipeline::Diffusion => {
                let factor = 2.0 * (360.0 / s.da) + 1.0;
                tiler.total_rows() as f32 * factor * s.iterations as f32
            }
            Pipeline::Unsharp(u) => {
                unsharp::progress_denominator(u, tiler.total_rows(), tiler.total_cols()) as f32
            }
        };
        job.sync.set_progress_denominator(denominator);

        let dest = unsafe { job.dest.get() };
        dest.alloc(tiler.max_block_width(), tiler.max_block_height(), job.channels)?;
    }
    job.sync.synchronize()?;

    let iterations = match &job.pipeline {
        Pipeline::Diffusion => s.iterations.max(0) as usize,
        Pipeline::Unsharp(_) => 1,
    };
    // Fixed after the setup barrier; every thread reads the same count.
    let total_blocks = job.total_blocks.load(Ordering::Relaxed);

    if primary {
        for iteration in 0..iterations {
            {
                let tiler = unsafe { job.tiler.get() };
                let source = unsafe { job.source.get() };
                tiler.save_overlaps(source)?;
            }

            for block in 0..total_blocks {
                {
                    let tiler = unsafe { job.tiler.get() };
                    let source = unsafe { job.source.get() };
                    let work = unsafe { job.work.get() };
                    tiler.get_block(work, block, job.channels, source)?;
                    let block_mask = unsafe { job.block_mask.get() };
                    *block_mask = job.mask.as_ref().map(|_| tiler.block_rect(block));
                }

                job.sync.synchronize()?;
                process_tile(job, thread_no, iteration)?;
                job.sync.synchronize()?;

                let tiler = unsafe { job.tiler.get() };
                let source = unsafe { job.source.get() };
                let work = unsafe { job.work.get() };
                tiler.store_block(work, block, source);
            }
        }
    } else {
        for iteration in 0..iterations {
            for _ in 0..total_blocks {
                // The primary handles fetch and store; match its barriers.
                job.sync.synchronize()?;
                process_tile(job, thread_no, iteration)?;
                job.sync.synchronize()?;
            }
        }
    }
    Ok(())
}

/// Process the current working tile with the selected pipeline. Must make
/// the same barrier calls on every thread.
fn process_tile(job: &Arc<RunJob>, thread_no: usize, iteration: usize) -> Result<(), StageAbort> {
    match job.pipeline {
        Pipeline::Diffusion => diffusion_tile(job, thread_no, iteration),
        Pipeline::Unsharp(u) => {
            if thread_no == 0 {
                let work = unsafe { job.work.get() };
                let dest = unsafe { job.dest.get() };
                unsharp::unsharp_tile(work, dest, &u, &job.sync)?;
            }
            job.sync.synchronize()?;
            Ok(())
        }
    }
}

/// The diffusion stage sequence for one tile. Stage A on the primary,
/// everything else row-parallel; every barrier here has a twin on every
/// other worker.
fn diffusion_tile(job: &Arc<RunJob>, thread_no: usize, iteration: usize) -> Result<(), StageAbort> {
    let s = &job.settings;
    let sync = &job.sync;
    let primary = thread_no == 0;

    if primary {
        let work = unsafe { job.work.get() };
        job.rows.init(work.height());
        unsafe { job.dest.get() }.fill(0.0);
        unsafe { job.g.get() }.fill(0.0);

        // If the mask covers this whole block, drop it so the inner
        // loops skip the checks.
        let block_mask = unsafe { job.block_mask.get() };
        if let (Some(rect), Some(mask)) = (*block_mask, &job.mask) {
            if mask.view(rect.left, rect.top, rect.width, rect.height).all_active() {
                *block_mask = None;
            }
        }

        let started = Instant::now();
        diffusion::prep_tensors(
            work,
            unsafe { job.g.get() },
            sync,
            if iteration == 0 { s.pre_blur } else { 0.0 },
            s.alpha,
            s.sigma,
            s.gfact * s.input_scale,
            s.partial_stage_output,
        )?;
        diffusion::log_stage("prep", started);
    }

    // Wait for the processed structure tensors to be ready.
    sync.synchronize()?;

    // Diagnostic mode: the intermediate is already in the tile.
    if s.partial_stage_output != 0 {
        return Ok(());
    }

    sync.synchronize()?;
    if primary {
        let work = unsafe { job.work.get() };
        let g2 = unsafe { job.g2.get() };
        g2.alloc(work.width(), work.height(), 4)?;
        g2.fill(0.0);
        job.rows.reset();
    }
    sync.synchronize()?;

    // G is read-only here; each worker writes only its rows of G2.
    diffusion::smooth_tensors(
        unsafe { job.g.get() },
        unsafe { job.g2.get() },
        sync,
        &job.rows,
        s.sharpness,
        s.anisotropy,
    )?;
    sync.synchronize()?;

    if primary {
        // Done with the raw tensors; reuse the storage for the walk
        // field.
        let work = unsafe { job.work.get() };
        unsafe { job.g.get() }.alloc(work.width(), work.height(), 4)?;
    }
    sync.synchronize()?;

    let started = Instant::now();
    let da_int = s.da as i32;
    let start_theta = if da_int > 0 { (360 % da_int) as f32 / 2.0 } else { 0.0 };
    let mut n_angles = 0;
    let mut theta = start_theta;
    while theta < 360.0 {
        n_angles += 1;

        sync.synchronize()?;
        if primary {
            job.rows.reset();
        }
        sync.synchronize()?;
        diffusion::init_angle_field(
            unsafe { job.g2.get() },
            unsafe { job.g.get() },
            sync,
            &job.rows,
            theta,
            s.dl,
        )?;

        sync.synchronize()?;
        if primary {
            job.rows.reset();
        }
        sync.synchronize()?;
        let mask_view = job.block_mask_view();
        diffusion::integrate_angle(
            unsafe { job.work.get() },
            unsafe { job.g.get() },
            mask_view.as_ref(),
            unsafe { job.dest.get() },
            sync,
            &job.rows,
            s.alt_amplitude,
            s.amplitude,
            s.dl,
            s.gauss_prec,
            s.interpolation,
            s.fast_approx,
        )?;

        theta += s.da;
    }
    if primary {
        diffusion::log_stage("angle loop", started);
    }

    sync.synchronize()?;
    if sync.stopping() {
        // Unwinds at the next barrier either way; skip the finalise work.
        return Ok(());
    }

    sync.synchronize()?;
    if primary {
        job.rows.reset();
    }
    sync.synchronize()?;
    let mask_view = job.block_mask_view();
    diffusion::finalize(
        unsafe { job.dest.get() },
        unsafe { job.work.get() },
        n_angles,
        mask_view.as_ref(),
        sync,
        &job.rows,
    )?;

    sync.synchronize()?;
    Ok(())
}
