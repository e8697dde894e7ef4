//! Persistent worker pool
//!
//! A fixed set of threads is spawned once and parked on a condition
//! variable between ticks. Each dispatch bumps a generation counter, wakes
//! every worker, and blocks the caller until the last worker reports in.
//! Jobs that declare a first phase get a barrier between the phases.

pub mod barrier;

use std::any::Any;
use std::io;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::sim::{FlockJob, World};
pub use barrier::{BarrierWait, PhaseBarrier};

/// Work split by index range across all pool workers
pub trait PartitionJob: Send + Sync {
    /// Number of indices to cover
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `prepare` must complete on every worker before any `run`
    fn two_phase(&self) -> bool {
        false
    }

    /// First phase over this worker's partition (two-phase jobs only)
    fn prepare(&self, _range: Range<usize>) {}

    /// Main phase over this worker's partition
    fn run(&self, range: Range<usize>);
}

/// Contiguous slice of `0..len` owned by `worker` out of `workers`
#[inline]
pub fn partition(len: usize, worker: usize, workers: usize) -> Range<usize> {
    debug_assert!(workers > 0 && worker < workers);
    (len * worker / workers)..(len * (worker + 1) / workers)
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool needs at least one thread")]
    NoThreads,
    #[error("failed to spawn worker {index}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("worker {worker} panicked: {message}")]
    WorkerPanicked { worker: usize, message: String },
    #[error("worker pool has been shut down")]
    ShutDown,
}

/// Dispatch state, only touched under `Shared::control`
struct Control {
    generation: u64,
    job: Option<Arc<dyn PartitionJob>>,
    /// A tick is dispatched and not every worker has finished
    pending: bool,
    shutdown: bool,
    panics: Vec<(usize, String)>,
}

struct Shared {
    thread_count: usize,
    control: Mutex<Control>,
    work_cv: Condvar,
    done_cv: Condvar,
    /// Workers done with the current generation; lock-free increment
    finished: AtomicUsize,
    barrier: PhaseBarrier,
}

/// Fixed-size pool of long-lived worker threads
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    two_phase: bool,
}

impl WorkerPool {
    /// Spawn `thread_count` workers, all parked until the first dispatch.
    ///
    /// If any spawn fails, the workers already running are stopped and
    /// joined before the error is returned.
    pub fn new(thread_count: usize) -> Result<Self, PoolError> {
        Self::spawn_with(thread_count, |id, shared| {
            thread::Builder::new()
                .name(format!("flock-worker-{id}"))
                .spawn(move || worker_loop(&shared, id))
        })
    }

    fn spawn_with<F>(thread_count: usize, mut spawn: F) -> Result<Self, PoolError>
    where
        F: FnMut(usize, Arc<Shared>) -> io::Result<JoinHandle<()>>,
    {
        if thread_count == 0 {
            return Err(PoolError::NoThreads);
        }
        let shared = Arc::new(Shared {
            thread_count,
            control: Mutex::new(Control {
                generation: 0,
                job: None,
                pending: false,
                shutdown: false,
                panics: Vec::new(),
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            finished: AtomicUsize::new(0),
            barrier: PhaseBarrier::new(thread_count),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(thread_count),
            two_phase: false,
        };
        for id in 0..thread_count {
            match spawn(id, Arc::clone(&pool.shared)) {
                Ok(handle) => pool.workers.push(handle),
                Err(source) => {
                    log::error!("Spawning worker {id} failed: {source}");
                    pool.stop_workers();
                    return Err(PoolError::Spawn { index: id, source });
                }
            }
        }

        log::debug!("Worker pool started with {thread_count} threads");
        Ok(pool)
    }

    /// Enable the two-phase tick (detach marking, barrier, then flocking)
    pub fn with_two_phase(mut self, two_phase: bool) -> Self {
        self.two_phase = two_phase;
        self
    }

    pub fn two_phase(&self) -> bool {
        self.two_phase
    }

    pub fn thread_count(&self) -> usize {
        self.shared.thread_count
    }

    /// Whether the pool still has live workers
    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Advance `world` by `dt` across all workers and swap its buffers.
    ///
    /// Blocks until every agent has been computed exactly once. On error
    /// the buffers are left unswapped and the pool is shut down.
    pub fn step(&mut self, world: &mut World, dt: f64) -> Result<(), PoolError> {
        let job = FlockJob::new(world, dt, self.two_phase);
        self.run(Arc::new(job))?;
        world.swap_buffers();
        Ok(())
    }

    /// Run `job` over all workers and wait for completion
    pub fn run(&mut self, job: Arc<dyn PartitionJob>) -> Result<(), PoolError> {
        if !self.is_running() {
            return Err(PoolError::ShutDown);
        }

        let panics = {
            let mut ctl = self.shared.control.lock();
            debug_assert!(!ctl.pending, "dispatch while a tick is in flight");
            self.shared.finished.store(0, Ordering::Relaxed);
            ctl.job = Some(job);
            ctl.pending = true;
            ctl.generation = ctl.generation.wrapping_add(1);
            self.shared.work_cv.notify_all();

            while ctl.pending {
                self.shared.done_cv.wait(&mut ctl);
            }
            ctl.job = None;
            std::mem::take(&mut ctl.panics)
        };

        if let Some((worker, message)) = panics.into_iter().next() {
            log::error!("Worker {worker} panicked mid-tick, shutting pool down: {message}");
            self.stop_workers();
            return Err(PoolError::WorkerPanicked { worker, message });
        }
        Ok(())
    }

    /// Stop and join every worker
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let mut ctl = self.shared.control.lock();
            ctl.shutdown = true;
            self.shared.work_cv.notify_all();
        }
        self.shared.barrier.break_barrier();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("Worker thread exited with a panic");
            }
        }
        log::debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn worker_loop(shared: &Shared, id: usize) {
    let mut seen = 0u64;
    loop {
        let job = {
            let mut ctl = shared.control.lock();
            while ctl.generation == seen && !ctl.shutdown {
                shared.work_cv.wait(&mut ctl);
            }
            if ctl.shutdown {
                return;
            }
            seen = ctl.generation;
            ctl.job.clone()
        };

        if let Some(job) = job {
            let range = partition(job.len(), id, shared.thread_count);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_partition(shared, job.as_ref(), range)));
            drop(job);
            if let Err(payload) = outcome {
                // Peers parked at the barrier must not wait for us
                shared.barrier.break_barrier();
                shared.control.lock().panics.push((id, panic_message(payload.as_ref())));
            }
        }

        if shared.finished.fetch_add(1, Ordering::AcqRel) + 1 == shared.thread_count {
            let mut ctl = shared.control.lock();
            ctl.pending = false;
            shared.done_cv.notify_one();
        }
    }
}

fn run_partition(shared: &Shared, job: &dyn PartitionJob, range: Range<usize>) {
    if job.two_phase() {
        job.prepare(range.clone());
        if shared.barrier.wait().is_broken() {
            return;
        }
    }
    job.run(range);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
