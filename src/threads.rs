//! Fixed-size worker pool with structured parallel regions.
//!
//! A pool of `P` threads is really `P - 1` spawned workers plus the
//! submitting thread, which participates as worker 0. [`ThreadPool::run`]
//! invokes a closure once per worker and blocks until every worker has
//! finished; there is no task queue that survives across calls.
//!
//! A panicking worker does not poison the pool: panics are caught per
//! worker, crashed threads are respawned, and `run` reports an aggregate
//! [`ThreadPoolError`] naming every failed worker.
//!
//! Work distribution is either *static*, where [`balance`] splits `[0, n)`
//! into near-equal contiguous ranges, or *dynamic*, where an atomic counter
//! serves grain-sized chunks to whichever worker asks next.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::JoinHandle;
use thiserror::Error;

/// Aggregate failure raised when one or more workers panic during a run.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    /// Worker panics collected from a single `run`, as `(tid, message)`.
    #[error("{} worker(s) failed: {}", .0.len(), format_failures(.0))]
    WorkerPanics(Vec<(usize, String)>),

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

fn format_failures(failures: &[(usize, String)]) -> String {
    let parts: Vec<String> = failures
        .iter()
        .map(|(tid, msg)| format!("thread {tid}: {msg}"))
        .collect();
    parts.join("; ")
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    task_tx: Option<Sender<Task>>,
    done_rx: Receiver<Result<(), String>>,
    handle: Option<JoinHandle<()>>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

impl Worker {
    fn spawn(tid: usize) -> Result<Self, ThreadPoolError> {
        let (task_tx, task_rx) = channel::<Task>();
        let (done_tx, done_rx) = channel::<Result<(), String>>();
        let handle = std::thread::Builder::new()
            .name(format!("vespr-worker-{tid}"))
            .spawn(move || {
                while let Ok(task) = task_rx.recv() {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                        .map_err(|payload| panic_message(payload.as_ref()));
                    if done_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            task_tx: Some(task_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    /// Returns `false` if the worker thread is gone and the task was dropped.
    fn submit(&self, task: Task) -> bool {
        match &self.task_tx {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Disconnect the channel first so the worker loop exits.
        drop(self.task_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A fixed pool of worker threads. See the module docs for the model.
pub struct ThreadPool {
    workers: Vec<Worker>,
}

impl ThreadPool {
    /// Creates a pool of `num_threads` workers (minimum 1). The calling
    /// thread is worker 0, so `num_threads - 1` threads are spawned.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadPoolError::Spawn`] if the OS refuses a thread.
    pub fn new(num_threads: usize) -> Result<Self, ThreadPoolError> {
        let mut workers = Vec::new();
        for tid in 1..num_threads.max(1) {
            workers.push(Worker::spawn(tid)?);
        }
        Ok(Self { workers })
    }

    /// The number of workers, counting the submitting thread.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len() + 1
    }

    /// Changes the pool to `new_size` workers (minimum 1).
    ///
    /// # Errors
    ///
    /// Returns [`ThreadPoolError::Spawn`] if the OS refuses a thread.
    pub fn resize(&mut self, new_size: usize) -> Result<(), ThreadPoolError> {
        let new_size = new_size.max(1);
        if new_size < self.size() {
            self.workers.truncate(new_size - 1);
        } else {
            while self.size() < new_size {
                let tid = self.size();
                self.workers.push(Worker::spawn(tid)?);
            }
        }
        Ok(())
    }

    /// Runs `f(tid)` on every worker concurrently, blocking until all
    /// complete. `tid` is in `[0, size())`; the caller runs `f(0)`.
    ///
    /// # Errors
    ///
    /// If any worker panics, all remaining workers still run to completion,
    /// crashed threads are respawned, and the collected panic messages are
    /// returned as [`ThreadPoolError::WorkerPanics`].
    pub fn run<F>(&mut self, f: F) -> Result<(), ThreadPoolError>
    where
        F: Fn(usize) + Sync,
    {
        let f_ref: &(dyn Fn(usize) + Sync) = &f;
        // SAFETY: every task dispatched below is awaited before this
        // function returns, so the borrow of `f` is never outlived. The
        // transmute only extends the reference lifetime; the vtable and
        // address are unchanged.
        let f_static: &'static (dyn Fn(usize) + Sync) = unsafe { std::mem::transmute(f_ref) };

        let mut dispatched = vec![false; self.workers.len()];
        for (i, worker) in self.workers.iter().enumerate() {
            let tid = i + 1;
            dispatched[i] = worker.submit(Box::new(move || f_static(tid)));
        }

        // The submitting thread is worker 0.
        let own = panic::catch_unwind(AssertUnwindSafe(|| f_static(0)));

        let mut failures: Vec<(usize, String)> = Vec::new();
        if let Err(payload) = own {
            failures.push((0, panic_message(payload.as_ref())));
        }

        for i in 0..self.workers.len() {
            let tid = i + 1;
            if !dispatched[i] {
                failures.push((tid, "worker thread terminated".to_string()));
                self.workers[i] = Worker::spawn(tid)?;
                continue;
            }
            match self.workers[i].done_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(message)) => failures.push((tid, message)),
                Err(_) => {
                    // The thread itself died; restore the pool.
                    failures.push((tid, "worker thread terminated".to_string()));
                    self.workers[i] = Worker::spawn(tid)?;
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ThreadPoolError::WorkerPanics(failures))
        }
    }

    /// Runs `f(range, tid)` over the chunks of `partition`.
    ///
    /// Static partitions call `f` at most once per worker with that
    /// worker's [`balance`] range; dynamic partitions repeatedly serve
    /// grain-sized chunks from an atomic counter. Empty chunks are not
    /// delivered.
    ///
    /// # Errors
    ///
    /// Propagates worker panics as [`ThreadPoolError::WorkerPanics`].
    pub fn parallel_for<F>(&mut self, partition: Partition, f: F) -> Result<(), ThreadPoolError>
    where
        F: Fn(Range<usize>, usize) + Sync,
    {
        let nthreads = self.size();
        match partition {
            Partition::Static { start, stop } => self.run(|tid| {
                let local = balance(stop - start, nthreads, tid);
                if !local.is_empty() {
                    f(start + local.start..start + local.end, tid);
                }
            }),
            Partition::Dynamic {
                start,
                stop,
                grainsize,
            } => {
                let grainsize = grainsize.max(1);
                let counter = AtomicUsize::new(start);
                self.run(|tid| loop {
                    let begin = counter.fetch_add(grainsize, Ordering::Relaxed);
                    if begin >= stop {
                        break;
                    }
                    f(begin..(begin + grainsize).min(stop), tid);
                })
            }
        }
    }
}

/// A work-distribution strategy over a half-open index range.
#[derive(Debug, Clone, Copy)]
pub enum Partition {
    /// One contiguous [`balance`] range per worker; deterministic
    /// id-to-thread mapping.
    Static {
        /// First index.
        start: usize,
        /// One past the last index.
        stop: usize,
    },
    /// Grain-sized chunks served by an atomic counter; load balanced but
    /// nondeterministic assignment.
    Dynamic {
        /// First index.
        start: usize,
        /// One past the last index.
        stop: usize,
        /// Chunk length served per request.
        grainsize: usize,
    },
}

impl Partition {
    /// A static partition of `[0, n)`.
    #[must_use]
    pub fn fixed(n: usize) -> Self {
        Partition::Static { start: 0, stop: n }
    }

    /// A static partition of `[start, stop)`.
    #[must_use]
    pub fn fixed_range(range: Range<usize>) -> Self {
        Partition::Static {
            start: range.start,
            stop: range.end,
        }
    }

    /// A dynamic partition of `[0, n)` with the given grain size.
    #[must_use]
    pub fn dynamic(n: usize, grainsize: usize) -> Self {
        Partition::Dynamic {
            start: 0,
            stop: n,
            grainsize,
        }
    }
}

/// Splits `[0, n)` among `nthreads` workers and returns worker `tid`'s
/// contiguous sub-range.
///
/// Ranges are disjoint, cover `[0, n)`, and differ in length by at most
/// one; the longer ranges go to the low-index workers. This is the
/// balance211 scheme from oneDNN.
#[must_use]
pub fn balance(n: usize, nthreads: usize, tid: usize) -> Range<usize> {
    if nthreads <= 1 || n == 0 {
        return if tid == 0 { 0..n } else { n..n };
    }
    let b1 = n.div_ceil(nthreads);
    let b2 = b1 - 1;
    let team1 = n - b2 * nthreads;
    let (len, start) = if tid < team1 {
        (b1, b1 * tid)
    } else {
        (b2, b1 * team1 + b2 * (tid - team1))
    };
    start..(start + len).min(n)
}

/// A test-and-set spin lock protecting one graph vertex during back-edge
/// insertion. Critical sections are a handful of word writes, so spinning
/// beats a futex.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until available.
    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

/// RAII guard returned by [`SpinLock::lock`].
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A container shared across workers through a raw pointer.
///
/// The graph builder and the compaction path mutate disjoint rows of one
/// container from multiple threads: writes are serialized either by a
/// per-vertex lock or by each row being visited exactly once. This wrapper
/// makes that sharing expressible; every dereference site documents which
/// discipline protects it.
pub(crate) struct SharedMut<C> {
    ptr: *mut C,
}

// SAFETY: callers uphold the per-row exclusion discipline documented
// above; the pointee outlives every parallel region (the pool joins
// before the wrapper is dropped).
unsafe impl<C> Sync for SharedMut<C> {}
unsafe impl<C> Send for SharedMut<C> {}

impl<C> SharedMut<C> {
    pub(crate) fn new(container: &mut C) -> Self {
        Self { ptr: container }
    }

    /// Returns a mutable reference to the container.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock for every row it mutates, or
    /// otherwise guarantee no other worker touches those rows.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self) -> &mut C {
        unsafe { &mut *self.ptr }
    }
}

/// A shared mutable slice written at disjoint indices by parallel workers.
///
/// Wraps a raw pointer so that workers can write result rows without
/// locking. Callers must guarantee that no index is written by more than
/// one worker within a single parallel region.
pub struct DisjointWriter<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: std::marker::PhantomData<&'a mut [T]>,
}

// SAFETY: writes go to caller-guaranteed disjoint indices; reads happen
// only after the parallel region joins.
unsafe impl<T: Send> Sync for DisjointWriter<'_, T> {}
unsafe impl<T: Send> Send for DisjointWriter<'_, T> {}

impl<'a, T> DisjointWriter<'a, T> {
    /// Wraps a slice for disjoint parallel writes.
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Number of elements in the wrapped slice.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the wrapped slice is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `value` at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be in bounds and must not be written concurrently by
    /// any other worker.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index).write(value) };
    }

    /// Reads the value at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be in bounds and owned by the calling worker, under
    /// the same exclusivity contract as [`DisjointWriter::write`].
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(index < self.len);
        unsafe { self.ptr.add(index).read() }
    }
}
