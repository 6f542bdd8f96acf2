//! # Weft Pool
//!
//! The worker pool used by pipeline kernels. The lowering core is strictly
//! single-threaded; this crate is the runtime collaborator that kernels may
//! use internally.
//!
//! Two pieces:
//!
//! - [`ParallelFor`]: a `K`-way work-stealing iteration plan over `[0, n)`
//!   with cache-line-padded per-task cursors and a global remaining counter.
//!   Each index runs at most once.
//! - [`ThreadPool`] / [`ThreadPoolImpl`]: a task queue with `enqueue`, `run`,
//!   advisory `cancel`, `wait_for` (waiting threads help drain the queue),
//!   and `atomic_call` (serialized with respect to `wait_for` predicates).
//!   [`ThreadPool::parallel_for`] combines the two and returns only once
//!   every index has completed.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Identifies a group of queued tasks for [`ThreadPool::cancel`] and the
/// recursion guard in [`ThreadPool::run`].
pub type TaskId = usize;

/// A shareable queued task.
pub type Task = Arc<dyn Fn() + Send + Sync>;

/// Returns a task id that has never been returned before.
#[must_use]
pub fn unique_task_id() -> TaskId {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

struct TaskCursor {
    // The next iteration to run.
    i: CachePadded<AtomicUsize>,
    // One past the last iteration of this task.
    end: usize,
}

/// A work-stealing iteration plan for a parallel loop over `[0, n)`.
///
/// The work is divided among `K` cursors that can be driven independently by
/// separate threads. A thread that exhausts its own cursor steals from the
/// others. Every index is claimed by exactly one `fetch_add`, so each runs
/// at most once.
pub struct ParallelFor<const K: usize> {
    tasks: [TaskCursor; K],
    worker: CachePadded<AtomicUsize>,
    todo: AtomicUsize,
}

impl<const K: usize> ParallelFor<K> {
    /// Sets up a loop over `n` items, dividing them evenly among `K` tasks.
    #[must_use]
    pub fn new(n: usize) -> Self {
        let tasks = std::array::from_fn(|k| {
            let (begin, end) = if K > 1 && n < K {
                if k < n {
                    (k, k + 1)
                } else {
                    (0, 0)
                }
            } else {
                ((k * n) / K, ((k + 1) * n) / K)
            };
            TaskCursor {
                i: CachePadded::new(AtomicUsize::new(begin)),
                end,
            }
        });
        Self {
            tasks,
            worker: CachePadded::new(AtomicUsize::new(0)),
            todo: AtomicUsize::new(n),
        }
    }

    /// Works on the loop. Returns when work on every item has started,
    /// which may be before all items are complete.
    pub fn run(&self, body: impl Fn(usize)) {
        let w = if K == 1 {
            0
        } else {
            self.worker.fetch_add(1, Ordering::Relaxed)
        };
        let mut done = 0;
        // The first pass over this loop runs the work allocated to this
        // worker; subsequent passes steal from the others.
        for k in 0..K {
            let task = &self.tasks[(k + w) % K];
            loop {
                let i = task.i.fetch_add(1, Ordering::Relaxed);
                if i >= task.end {
                    break;
                }
                body(i);
                done += 1;
            }
        }
        self.todo.fetch_sub(done, Ordering::AcqRel);
    }

    /// True once every index has completed.
    #[must_use]
    pub fn done(&self) -> bool {
        self.todo.load(Ordering::Acquire) == 0
    }
}

thread_local! {
    // Ids of tasks currently running on this thread; used to keep `wait_for`
    // from re-entering a task group recursively.
    static RUNNING: RefCell<Vec<TaskId>> = const { RefCell::new(Vec::new()) };
}

fn run_guarded(task: &dyn Fn(), id: TaskId) {
    RUNNING.with(|r| r.borrow_mut().push(id));
    task();
    RUNNING.with(|r| {
        r.borrow_mut().pop();
    });
}

/// The worker pool interface kernels program against.
pub trait ThreadPool {
    /// The number of worker threads.
    fn thread_count(&self) -> usize;

    /// Enqueues `n` copies of `task`. The task will not be run recursively
    /// on a thread that is already running a task with the same id.
    fn enqueue_n(&self, n: usize, task: Task, id: TaskId);

    /// Enqueues one copy of `task`.
    fn enqueue(&self, task: Task, id: TaskId) {
        self.enqueue_n(1, task, id);
    }

    /// Runs `task` on the calling thread, preventing tasks with the same id
    /// from running recursively under it.
    fn run(&self, task: &dyn Fn(), id: TaskId);

    /// Cancels tasks previously enqueued with `id`. Advisory: tasks already
    /// started are unaffected.
    fn cancel(&self, id: TaskId);

    /// Waits for `condition` to become true. While waiting, executes tasks
    /// from the queue. The condition is evaluated atomically with respect to
    /// [`ThreadPool::atomic_call`].
    fn wait_for(&self, condition: &dyn Fn() -> bool);

    /// Runs `task` on the calling thread, atomically with respect to other
    /// `atomic_call`s and `wait_for` conditions.
    fn atomic_call(&self, task: &dyn Fn());

    /// Runs `body(i)` for every `i` in `[0, n)`, using up to `max_workers`
    /// threads. Each index runs exactly once; returns only when every index
    /// has completed.
    fn parallel_for(&self, n: usize, body: impl Fn(usize) + Send + Sync + 'static, max_workers: usize)
    where
        Self: Sized,
    {
        match n {
            0 => return,
            1 => {
                body(0);
                return;
            }
            _ => {}
        }

        let lp = Arc::new(ParallelFor::<1>::new(n));
        let id = unique_task_id();
        let body = Arc::new(body);

        let workers = max_workers.min(self.thread_count() + 1).min(n);
        if workers > 1 {
            let worker_loop = lp.clone();
            let worker_body = body.clone();
            let task: Task = Arc::new(move || {
                worker_loop.run(worker_body.as_ref());
            });
            self.enqueue_n(workers - 1, task, id);
        }
        // Running here guarantees forward progress even if no worker threads
        // are available.
        self.run(&|| lp.run(body.as_ref()), id);
        // The queued copies are now redundant at best.
        self.cancel(id);
        self.wait_for(&|| lp.done());
    }
}

struct QueuedTask {
    remaining: usize,
    task: Task,
    id: TaskId,
}

struct SharedState {
    queue: VecDeque<QueuedTask>,
    stop: bool,
}

struct Inner {
    state: Mutex<SharedState>,
    // Two condition variables to limit spurious wakeups: workers sleep on
    // cv_worker and are woken by enqueues; helpers inside wait_for sleep on
    // cv_helper and are woken whenever a condition may have changed.
    cv_worker: Condvar,
    cv_helper: Condvar,
}

impl Inner {
    fn dequeue(state: &mut SharedState) -> Option<(Task, TaskId)> {
        let running = RUNNING.with(|r| r.borrow().clone());
        let pos = state.queue.iter().position(|t| !running.contains(&t.id))?;
        let entry = &mut state.queue[pos];
        entry.remaining -= 1;
        let result = (entry.task.clone(), entry.id);
        if entry.remaining == 0 {
            state.queue.remove(pos);
        }
        Some(result)
    }
}

/// A queue-backed [`ThreadPool`] with a fixed number of worker threads.
pub struct ThreadPoolImpl {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPoolImpl {
    /// Creates a pool with `workers` worker threads. A pool with zero
    /// workers still makes progress: `run` and `wait_for` execute queued
    /// tasks on the calling thread.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(SharedState {
                queue: VecDeque::new(),
                stop: false,
            }),
            cv_worker: Condvar::new(),
            cv_helper: Condvar::new(),
        });
        let threads = (0..workers)
            .map(|_| {
                let inner = inner.clone();
                std::thread::spawn(move || worker_loop(&inner))
            })
            .collect();
        Self { inner, threads }
    }
}

fn worker_loop(inner: &Inner) {
    let mut state = inner.state.lock();
    loop {
        if let Some((task, id)) = Inner::dequeue(&mut state) {
            drop(state);
            run_guarded(task.as_ref(), id);
            state = inner.state.lock();
            inner.cv_helper.notify_all();
        } else if state.stop {
            return;
        } else {
            inner.cv_worker.wait(&mut state);
        }
    }
}

impl ThreadPool for ThreadPoolImpl {
    fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn enqueue_n(&self, n: usize, task: Task, id: TaskId) {
        if n == 0 {
            return;
        }
        let mut state = self.inner.state.lock();
        state.queue.push_back(QueuedTask {
            remaining: n,
            task,
            id,
        });
        drop(state);
        self.inner.cv_worker.notify_all();
        self.inner.cv_helper.notify_all();
    }

    fn run(&self, task: &dyn Fn(), id: TaskId) {
        run_guarded(task, id);
        self.inner.cv_helper.notify_all();
    }

    fn cancel(&self, id: TaskId) {
        let mut state = self.inner.state.lock();
        state.queue.retain(|t| t.id != id);
    }

    fn wait_for(&self, condition: &dyn Fn() -> bool) {
        let mut state = self.inner.state.lock();
        loop {
            if condition() {
                return;
            }
            if let Some((task, id)) = Inner::dequeue(&mut state) {
                drop(state);
                run_guarded(task.as_ref(), id);
                state = self.inner.state.lock();
                self.inner.cv_helper.notify_all();
            } else {
                self.inner.cv_helper.wait(&mut state);
            }
        }
    }

    fn atomic_call(&self, task: &dyn Fn()) {
        let state = self.inner.state.lock();
        task();
        drop(state);
        self.inner.cv_helper.notify_all();
    }
}

impl Drop for ThreadPoolImpl {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.stop = true;
        }
        self.inner.cv_worker.notify_all();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}
