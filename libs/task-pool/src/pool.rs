// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Shutdown;
use crate::priority::Priority;
use crate::queue::{PrioritisedQueue, Task};
use completable::{Execute, Job, RejectedError};
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use util::Backoff;

type ThreadConfigurator = Box<dyn Fn(usize) -> thread::Builder + Send + Sync>;

/// A pool of worker threads scheduling *executor groups*.
///
/// Each group owns executors; each executor owns a [`PrioritisedQueue`], a
/// parallelism cap, and a hold time telling a worker how long to stay with
/// it before selecting elsewhere. Workers pick the executor with the lowest
/// `(priority, parallelism, last retrieved)` tuple, first within each group
/// and then across groups; cross-group priority comparisons are only
/// meaningful between groups sharing a division, which is a contract on the
/// caller, not something the scheduler enforces.
///
/// Worker threads hold the pool state alive until [`shutdown`] or [`halt`];
/// merely dropping the handle leaves them running.
///
/// [`shutdown`]: PrioritisedPool::shutdown
/// [`halt`]: PrioritisedPool::halt
pub struct PrioritisedPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Guards executor selection and the worker/group topology.
    state: Mutex<PoolState>,
    configurator: ThreadConfigurator,
    shutdown: AtomicBool,
    /// Epoch for `last_retrieved` timestamps.
    started: Instant,
}

struct PoolState {
    workers: Vec<WorkerHandle>,
    groups: Vec<Arc<GroupInner>>,
    next_worker_id: usize,
}

struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: Thread,
    join: Option<thread::JoinHandle<()>>,
}

struct WorkerShared {
    id: usize,
    /// Set while the worker sits in `park_timeout`; a notifier that flips
    /// this claims the right to unpark it.
    parked: AtomicBool,
    /// Sticky high-priority alert: drop the current executor at the next
    /// poll boundary.
    alerted: AtomicBool,
    halted: AtomicBool,
}

struct GroupInner {
    division: i32,
    executors: Mutex<Vec<Arc<ExecutorInner>>>,
    current_parallelism: AtomicU32,
    suborder_gen: AtomicI64,
}

struct ExecutorInner {
    queue: PrioritisedQueue,
    /// 0 means unlimited.
    max_parallelism: u32,
    hold_time: Duration,
    current_parallelism: AtomicU32,
    /// Nanoseconds since pool start; oldest-retrieved wins ties.
    last_retrieved: AtomicU64,
    halted: AtomicBool,
    group: Weak<GroupInner>,
}

/// Handle to a group of executors sharing a division and a suborder
/// generator.
pub struct ExecutorGroup {
    pool: Arc<PoolInner>,
    inner: Arc<GroupInner>,
}

/// Handle to one executor. Cheap to clone; implements
/// [`Execute`] so completable continuations can be dispatched onto it.
#[derive(Clone)]
pub struct PoolExecutor {
    pool: Arc<PoolInner>,
    inner: Arc<ExecutorInner>,
}

static_assertions::assert_impl_all!(PrioritisedPool: Send, Sync);
static_assertions::assert_impl_all!(PoolExecutor: Send, Sync);

// === impl PrioritisedPool ===

impl PrioritisedPool {
    /// Creates an empty pool; call [`adjust_thread_count`] to start workers.
    ///
    /// `configurator` builds the [`thread::Builder`] for each worker id,
    /// which is where names, stack sizes and the like are decided.
    ///
    /// [`adjust_thread_count`]: Self::adjust_thread_count
    #[must_use]
    pub fn new(configurator: impl Fn(usize) -> thread::Builder + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    groups: Vec::new(),
                    next_worker_id: 0,
                }),
                configurator: Box::new(configurator),
                shutdown: AtomicBool::new(false),
                started: Instant::now(),
            }),
        }
    }

    /// Creates an executor group labelled with `division`.
    ///
    /// # Panics
    ///
    /// Panics if the pool is shut down.
    #[must_use]
    pub fn create_executor_group(&self, division: i32) -> ExecutorGroup {
        assert!(
            !self.inner.shutdown.load(Ordering::SeqCst),
            "pool is shut down"
        );
        let group = Arc::new(GroupInner {
            division,
            executors: Mutex::new(Vec::new()),
            current_parallelism: AtomicU32::new(0),
            suborder_gen: AtomicI64::new(0),
        });
        self.inner.state.lock().groups.push(Arc::clone(&group));
        ExecutorGroup {
            pool: Arc::clone(&self.inner),
            inner: group,
        }
    }

    /// Grows or shrinks the worker set to `target` threads.
    ///
    /// # Panics
    ///
    /// Panics if the pool is shut down, or if spawning a worker thread
    /// fails.
    pub fn adjust_thread_count(&self, target: usize) {
        assert!(
            !self.inner.shutdown.load(Ordering::SeqCst),
            "pool is shut down"
        );
        let mut state = self.inner.state.lock();
        while state.workers.len() < target {
            PoolInner::spawn_worker(&self.inner, &mut state);
        }
        if state.workers.len() > target {
            // Halted workers detach and exit on their own once they finish
            // their current task.
            for handle in state.workers.drain(target..) {
                handle.shared.halted.store(true, Ordering::SeqCst);
                handle.thread.unpark();
            }
        }
    }

    /// Shuts the pool down: every executor queue stops accepting tasks, and
    /// workers exit once nothing pollable remains. With `wait`, blocks until
    /// they have.
    pub fn shutdown(&self, wait: bool) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        {
            let state = self.inner.state.lock();
            for group in &state.groups {
                for executor in group.executors.lock().iter() {
                    executor.queue.shutdown();
                }
            }
            for worker in &state.workers {
                worker.thread.unpark();
            }
        }
        if wait {
            self.join_all();
        }
    }

    /// Stops the pool without draining: workers exit after their current
    /// task; pending tasks are abandoned. With `kill_queues`, the executor
    /// queues additionally reject future submissions.
    pub fn halt(&self, kill_queues: bool) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let state = self.inner.state.lock();
        for worker in &state.workers {
            worker.shared.halted.store(true, Ordering::SeqCst);
            worker.thread.unpark();
        }
        if kill_queues {
            for group in &state.groups {
                for executor in group.executors.lock().iter() {
                    executor.queue.shutdown();
                }
            }
        }
    }

    /// Waits up to `timeout` for every worker to terminate. Returns whether
    /// they all did.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let all_done = self
                .inner
                .state
                .lock()
                .workers
                .iter()
                .all(|worker| worker.join.as_ref().is_none_or(|join| join.is_finished()));
            if all_done {
                self.join_all();
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Deadline-bounded wait, like [`join`][Self::join]. Rust threads carry
    /// no interruption state, so the two forms coincide.
    pub fn join_interruptible(&self, timeout: Duration) -> bool {
        self.join(timeout)
    }

    fn join_all(&self) {
        let handles: Vec<_> = {
            let mut state = self.inner.state.lock();
            state
                .workers
                .iter_mut()
                .filter_map(|worker| worker.join.take())
                .collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl core::fmt::Debug for PrioritisedPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PrioritisedPool")
            .field("workers", &state.workers.len())
            .field("groups", &state.groups.len())
            .field("shutdown", &self.inner.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

// === impl PoolInner ===

impl PoolInner {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn spawn_worker(pool: &Arc<Self>, state: &mut PoolState) {
        let id = state.next_worker_id;
        state.next_worker_id += 1;

        let shared = Arc::new(WorkerShared {
            id,
            parked: AtomicBool::new(false),
            alerted: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        });

        let builder = (pool.configurator)(id);
        let join = {
            let pool = Arc::clone(pool);
            let shared = Arc::clone(&shared);
            builder
                .spawn(move || worker_loop(&pool, &shared))
                .expect("failed to spawn pool worker")
        };
        let thread = join.thread().clone();
        state.workers.push(WorkerHandle {
            shared,
            thread,
            join: Some(join),
        });
    }

    /// Selects the executor a worker should drain next: per group the
    /// lowest `(priority, executor parallelism, last retrieved)` among
    /// executors with capacity and work, then across groups the lowest
    /// `(priority, group parallelism, last retrieved)`. Bumps the
    /// parallelism counters of the selection.
    fn obtain_queue(&self) -> Option<Arc<ExecutorInner>> {
        let state = self.state.lock();
        let now = self.now_ns();

        let mut best: Option<((i8, u32, u64), Arc<GroupInner>, Arc<ExecutorInner>)> = None;
        for group in &state.groups {
            let mut group_best: Option<((i8, u32, u64), Arc<ExecutorInner>)> = None;
            for executor in group.executors.lock().iter() {
                if executor.halted.load(Ordering::Acquire) {
                    continue;
                }
                if executor.max_parallelism != 0
                    && executor.current_parallelism.load(Ordering::Acquire)
                        >= executor.max_parallelism
                {
                    continue;
                }
                let Some(priority) = executor.queue.highest_priority() else {
                    continue;
                };
                let key = (
                    priority.ordinal(),
                    executor.current_parallelism.load(Ordering::Acquire),
                    executor.last_retrieved.load(Ordering::Acquire),
                );
                if group_best.as_ref().is_none_or(|(best_key, _)| key < *best_key) {
                    group_best = Some((key, Arc::clone(executor)));
                }
            }

            if let Some(((priority, _, last_retrieved), executor)) = group_best {
                let key = (
                    priority,
                    group.current_parallelism.load(Ordering::Acquire),
                    last_retrieved,
                );
                if best.as_ref().is_none_or(|(best_key, _, _)| key < *best_key) {
                    best = Some((key, Arc::clone(group), executor));
                }
            }
        }

        let (_, group, executor) = best?;
        executor.current_parallelism.fetch_add(1, Ordering::AcqRel);
        group.current_parallelism.fetch_add(1, Ordering::AcqRel);
        executor.last_retrieved.store(now, Ordering::Release);
        Some(executor)
    }

    /// Releases a selection made by `obtain_queue`, detaching executors
    /// that are shut down and fully drained.
    fn return_queue(&self, executor: &Arc<ExecutorInner>) {
        let _state = self.state.lock();
        executor.current_parallelism.fetch_sub(1, Ordering::AcqRel);
        if let Some(group) = executor.group.upgrade() {
            group.current_parallelism.fetch_sub(1, Ordering::AcqRel);
            if executor.queue.is_shutdown() && !executor.queue.has_tasks() {
                group
                    .executors
                    .lock()
                    .retain(|candidate| !Arc::ptr_eq(candidate, executor));
            }
        }
    }

    /// Wakes the first parked worker. If none is parked and the arrival is
    /// high priority, sticks an alert on a live worker so it abandons its
    /// current executor at the next poll boundary.
    fn notify_tasks(&self, high_priority: bool) {
        let state = self.state.lock();
        for worker in &state.workers {
            if worker
                .shared
                .parked
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                worker.thread.unpark();
                return;
            }
        }
        if high_priority {
            if let Some(worker) = state
                .workers
                .iter()
                .find(|worker| !worker.shared.halted.load(Ordering::Acquire))
            {
                worker.shared.alerted.store(true, Ordering::SeqCst);
                worker.thread.unpark();
            }
        }
    }
}

fn worker_loop(pool: &Arc<PoolInner>, me: &Arc<WorkerShared>) {
    let _span = tracing::debug_span!("pool worker", worker = me.id).entered();
    // Spins for roughly 0.1 ms of emptiness before the worker parks.
    let mut idle = Backoff::new();

    loop {
        if me.halted.load(Ordering::Acquire) {
            break;
        }

        if let Some(executor) = pool.obtain_queue() {
            idle.reset();

            let deadline = Instant::now() + executor.hold_time;
            loop {
                if me.halted.load(Ordering::Acquire) || executor.halted.load(Ordering::Acquire) {
                    break;
                }
                // A high-priority arrival elsewhere preempts this executor
                // at the poll boundary.
                if me.alerted.swap(false, Ordering::SeqCst) {
                    break;
                }
                if !executor.queue.execute_task() {
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
            pool.return_queue(&executor);
            continue;
        }

        if pool.shutdown.load(Ordering::Acquire) {
            // Shutting down with nothing pollable left.
            break;
        }

        if !idle.is_saturated() {
            idle.spin();
            continue;
        }

        // The timeout bounds the lost-wakeup window between the alert check
        // below and the park itself.
        me.parked.store(true, Ordering::SeqCst);
        if me.alerted.swap(false, Ordering::SeqCst) || me.halted.load(Ordering::Acquire) {
            me.parked.store(false, Ordering::SeqCst);
            continue;
        }
        thread::park_timeout(Duration::from_millis(1));
        me.parked.store(false, Ordering::SeqCst);
    }

    tracing::debug!(worker = me.id, "worker exiting");
}

// === impl ExecutorGroup ===

impl ExecutorGroup {
    /// Creates an executor scheduled within this group.
    ///
    /// `max_parallelism` caps how many workers drain it at once (0 means
    /// unlimited); `hold_time` is how long a worker stays with it before
    /// polling elsewhere.
    #[must_use]
    pub fn create_executor(&self, max_parallelism: u32, hold_time: Duration) -> PoolExecutor {
        let queue = PrioritisedQueue::new();
        let executor = Arc::new(ExecutorInner {
            queue: queue.clone(),
            max_parallelism,
            hold_time,
            current_parallelism: AtomicU32::new(0),
            last_retrieved: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            group: Arc::downgrade(&self.inner),
        });

        let pool = Arc::downgrade(&self.pool);
        queue.set_notifier(Box::new(move |priority| {
            if let Some(pool) = pool.upgrade() {
                pool.notify_tasks(priority.is_higher_or_equal(Priority::High));
            }
        }));

        self.inner.executors.lock().push(Arc::clone(&executor));
        PoolExecutor {
            pool: Arc::clone(&self.pool),
            inner: executor,
        }
    }

    /// The division this group was created with.
    #[must_use]
    pub fn division(&self) -> i32 {
        self.inner.division
    }
}

// === impl PoolExecutor ===

impl PoolExecutor {
    /// Queues `job` at [`Priority::Normal`] with the group's next suborder.
    ///
    /// # Errors
    ///
    /// Returns [`Shutdown`] if the executor's queue has been shut down.
    pub fn queue_task(&self, job: Job) -> Result<Task, Shutdown> {
        self.queue_task_with(job, Priority::Normal, None)
    }

    /// Queues `job` at an explicit priority and, optionally, suborder; an
    /// omitted suborder draws the group's next one.
    ///
    /// # Errors
    ///
    /// Returns [`Shutdown`] if the executor's queue has been shut down.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is `Completing`.
    pub fn queue_task_with(
        &self,
        job: Job,
        priority: Priority,
        suborder: Option<i64>,
    ) -> Result<Task, Shutdown> {
        let suborder = suborder.unwrap_or_else(|| {
            self.inner.group.upgrade().map_or(0, |group| {
                group.suborder_gen.fetch_add(1, Ordering::Relaxed)
            })
        });
        self.inner.queue.queue_task(job, priority, suborder)
    }

    /// The executor's queue, for direct polling or inspection.
    #[must_use]
    pub fn queue(&self) -> &PrioritisedQueue {
        &self.inner.queue
    }
}

impl Execute for PoolExecutor {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        self.queue_task(job)
            .map(|_| ())
            .map_err(|_| RejectedError::new("pool executor shut down"))
    }
}

impl core::fmt::Debug for PoolExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolExecutor")
            .field("max_parallelism", &self.inner.max_parallelism)
            .field("hold_time", &self.inner.hold_time)
            .field(
                "current_parallelism",
                &self.inner.current_parallelism.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::mpsc;

    fn test_pool() -> PrioritisedPool {
        PrioritisedPool::new(|id| thread::Builder::new().name(format!("pool-worker-{id}")))
    }

    #[test]
    fn runs_every_queued_task() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let pool = test_pool();
        pool.adjust_thread_count(2);
        let group = pool.create_executor_group(0);
        let executor = group.create_executor(0, Duration::from_millis(10));

        let done = Arc::new(StdAtomicU32::new(0));
        for _ in 0..100 {
            let done = done.clone();
            executor
                .queue_task(Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        pool.shutdown(true);
        assert!(pool.join(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 100);
        assert_eq!(executor.queue().executed_count(), 100);
    }

    #[test]
    fn max_parallelism_caps_concurrent_workers() {
        let pool = test_pool();
        pool.adjust_thread_count(4);
        let group = pool.create_executor_group(0);
        let executor = group.create_executor(1, Duration::from_millis(50));

        let inside = Arc::new(StdAtomicU32::new(0));
        let peak = Arc::new(StdAtomicU32::new(0));
        for _ in 0..64 {
            let inside = inside.clone();
            let peak = peak.clone();
            executor
                .queue_task(Box::new(move || {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        pool.shutdown(true);
        assert_eq!(peak.load(Ordering::SeqCst), 1, "parallelism cap violated");
    }

    #[test]
    fn blocking_arrival_preempts_a_draining_worker() {
        let pool = test_pool();
        pool.adjust_thread_count(1);
        let group = pool.create_executor_group(0);
        let normal = group.create_executor(1, Duration::from_secs(10));
        let urgent = group.create_executor(1, Duration::from_secs(10));

        let (started_tx, started_rx) = mpsc::channel();
        for i in 0..10 {
            let started_tx = started_tx.clone();
            normal
                .queue_task(Box::new(move || {
                    if i == 0 {
                        started_tx.send(()).unwrap();
                    }
                    thread::sleep(Duration::from_millis(20));
                }))
                .unwrap();
        }

        // Wait for the drain of the normal executor to begin, then submit
        // the blocking task.
        started_rx.recv().unwrap();
        let normal_done_at_preempt = Arc::new(StdAtomicU32::new(u32::MAX));
        {
            let normal_queue = normal.queue().clone();
            let normal_done_at_preempt = normal_done_at_preempt.clone();
            urgent
                .queue_task_with(
                    Box::new(move || {
                        let done = u32::try_from(normal_queue.executed_count()).unwrap();
                        normal_done_at_preempt.store(done, Ordering::SeqCst);
                    }),
                    Priority::Blocking,
                    None,
                )
                .unwrap();
        }

        pool.shutdown(true);
        let done = normal_done_at_preempt.load(Ordering::SeqCst);
        assert!(
            done < 10,
            "the blocking task must preempt the normal drain, ran after {done} tasks"
        );
    }

    #[test]
    fn adjust_to_zero_halts_and_readjust_resumes() {
        let pool = test_pool();
        pool.adjust_thread_count(2);
        let group = pool.create_executor_group(0);
        let executor = group.create_executor(0, Duration::from_millis(10));

        pool.adjust_thread_count(0);
        // Halted workers drain out; nothing serves the queue afterwards.
        thread::sleep(Duration::from_millis(20));

        let ran = Arc::new(StdAtomicU32::new(0));
        {
            let ran = ran.clone();
            executor
                .queue_task(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ran.load(Ordering::SeqCst), 0, "no workers may be serving");

        pool.adjust_thread_count(1);
        pool.shutdown(true);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn halt_abandons_pending_tasks() {
        let pool = test_pool();
        pool.adjust_thread_count(1);
        let group = pool.create_executor_group(0);
        let executor = group.create_executor(0, Duration::from_secs(1));

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let ran = Arc::new(StdAtomicU32::new(0));

        {
            let ran = ran.clone();
            executor
                .queue_task(Box::new(move || {
                    // Hold the only worker until the pool is halted.
                    gate_rx.recv().unwrap();
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        for _ in 0..10 {
            let ran = ran.clone();
            executor
                .queue_task(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        // Give the worker time to pick up the gated task, then halt.
        thread::sleep(Duration::from_millis(20));
        pool.halt(true);
        gate_tx.send(()).unwrap();

        assert!(pool.join(Duration::from_secs(5)));
        assert_eq!(
            ran.load(Ordering::SeqCst),
            1,
            "halt must not drain pending tasks"
        );
        assert!(executor.queue_task(Box::new(|| {})).is_err());
    }

    #[test]
    fn executor_dispatches_completable_continuations() {
        use completable::Completable;

        let pool = test_pool();
        pool.adjust_thread_count(1);
        let group = pool.create_executor_group(0);
        let executor = Arc::new(group.create_executor(0, Duration::from_millis(10)));

        let value = Completable::supplied_async(executor.clone(), || 3)
            .then_apply_async(executor.clone(), |x| x * 2)
            .then_apply_async(executor.clone(), |x| x + 1)
            .join()
            .unwrap();
        assert_eq!(value, 7);

        pool.shutdown(true);

        // A shut-down executor rejects, failing the downstream.
        let rejected = Completable::completed(1_u32).then_apply_async(executor, |x| x + 1);
        assert!(rejected.is_exceptionally_complete());
    }

    #[test]
    fn default_suborders_keep_fifo_within_a_priority() {
        let pool = test_pool();
        let group = pool.create_executor_group(0);
        let executor = group.create_executor(0, Duration::from_millis(10));

        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0_u32..20 {
            let log = log.clone();
            executor
                .queue_task(Box::new(move || log.lock().push(tag)))
                .unwrap();
        }

        // Drain on this thread; no workers were started.
        while executor.queue().execute_task() {}
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());

        pool.shutdown(false);
    }

    #[test]
    #[should_panic(expected = "pool is shut down")]
    fn adjusting_a_shut_down_pool_panics() {
        let pool = test_pool();
        pool.shutdown(false);
        pool.adjust_thread_count(1);
    }
}
