// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Shutdown;
use crate::priority::Priority;
use completable::Job;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Index key of a queued task: the total order is
/// `(priority ordinal, suborder, id)` ascending, `id` being the per-queue
/// creation counter that makes the order a stable total one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HolderKey {
    priority: i8,
    suborder: i64,
    id: u64,
}

/// A holder placed into the ordered index. Changing a task's order inserts a
/// fresh holder and flags the old one removed; polls skim flagged holders
/// off the front.
struct HolderSlot {
    task: Arc<TaskInner>,
    removed: AtomicBool,
}

struct TaskState {
    runnable: Option<Job>,
    /// `Completing` once executed or cancelled; never schedulable again.
    priority: Priority,
    suborder: i64,
    /// The key of this task's live holder. `Some` iff the task is currently
    /// keyed into the index.
    queued_key: Option<HolderKey>,
}

struct TaskInner {
    id: u64,
    queue: Arc<QueueCore>,
    /// Serialises lifecycle transitions (queue/cancel/execute/re-key)
    /// against the polling side.
    state: Mutex<TaskState>,
}

struct QueueCore {
    index: SkipMap<HolderKey, HolderSlot>,
    shutdown: AtomicBool,
    executed: AtomicU64,
    id_gen: AtomicU64,
    /// Invoked after a task is queued or raised, with its priority; the
    /// thread pool hangs its worker wakeups off this.
    notifier: Mutex<Option<Box<dyn Fn(Priority) + Send + Sync>>>,
}

// === impl QueueCore ===

impl QueueCore {
    fn notify(&self, priority: Priority) {
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier(priority);
        }
    }

    /// Flags and removes the holder at `key`, if it is still indexed.
    fn remove_holder(&self, key: &HolderKey) {
        if let Some(entry) = self.index.get(key) {
            entry.value().removed.store(true, Ordering::Release);
            entry.remove();
        }
    }
}

/// An ordered multiset of tasks, polled smallest-first by
/// `(priority, suborder, id)`.
///
/// Handles are cheap clones sharing one queue. Shutting the queue down
/// rejects new [`queue`][Task::queue] calls but does not drain: whatever was
/// already queued stays pollable.
#[derive(Clone)]
pub struct PrioritisedQueue {
    core: Arc<QueueCore>,
}

/// Handle to a task created on a [`PrioritisedQueue`].
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

static_assertions::assert_impl_all!(PrioritisedQueue: Send, Sync);
static_assertions::assert_impl_all!(Task: Send, Sync);

// === impl PrioritisedQueue ===

impl PrioritisedQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(QueueCore {
                index: SkipMap::new(),
                shutdown: AtomicBool::new(false),
                executed: AtomicU64::new(0),
                id_gen: AtomicU64::new(0),
                notifier: Mutex::new(None),
            }),
        }
    }

    /// Creates a task without queueing it; call [`Task::queue`] to schedule.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is `Completing`.
    #[must_use]
    pub fn create_task(&self, job: Job, priority: Priority, suborder: i64) -> Task {
        assert!(
            priority.is_schedulable(),
            "cannot schedule a task at the completing priority"
        );
        Task {
            inner: Arc::new(TaskInner {
                id: self.core.id_gen.fetch_add(1, Ordering::Relaxed),
                queue: Arc::clone(&self.core),
                state: Mutex::new(TaskState {
                    runnable: Some(job),
                    priority,
                    suborder,
                    queued_key: None,
                }),
            }),
        }
    }

    /// Creates and queues a task in one step.
    ///
    /// # Errors
    ///
    /// Returns [`Shutdown`] if the queue has been shut down.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is `Completing`.
    pub fn queue_task(&self, job: Job, priority: Priority, suborder: i64) -> Result<Task, Shutdown> {
        let task = self.create_task(job, priority, suborder);
        task.queue()?;
        Ok(task)
    }

    /// Polls and runs the smallest-ordered live task. Returns whether a task
    /// ran.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn execute_task(&self) -> bool {
        loop {
            let Some(entry) = self.core.index.front() else {
                return false;
            };
            let slot = entry.value();
            if slot.removed.load(Ordering::Acquire) {
                entry.remove();
                continue;
            }

            let job = {
                let mut state = slot.task.state.lock();
                // The holder may be stale: the task was cancelled, already
                // executed, or re-keyed to a different position.
                if state.priority == Priority::Completing
                    || state.queued_key != Some(*entry.key())
                {
                    slot.removed.store(true, Ordering::Release);
                    entry.remove();
                    continue;
                }
                state.priority = Priority::Completing;
                state.queued_key = None;
                slot.removed.store(true, Ordering::Release);
                entry.remove();
                state.runnable.take()
            };

            // A live holder always carries its runnable.
            let job = job.expect("queued task lost its runnable");
            job();
            self.core.executed.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    /// The priority of the task a poll would take next, skimming stale
    /// holders off the front as a side effect.
    #[must_use]
    pub fn highest_priority(&self) -> Option<Priority> {
        loop {
            let entry = self.core.index.front()?;
            if entry.value().removed.load(Ordering::Acquire) {
                entry.remove();
                continue;
            }
            return Priority::from_ordinal(entry.key().priority);
        }
    }

    #[must_use]
    pub fn has_tasks(&self) -> bool {
        self.highest_priority().is_some()
    }

    /// Number of tasks run through this queue (polled or executed directly).
    #[must_use]
    pub fn executed_count(&self) -> u64 {
        self.core.executed.load(Ordering::Relaxed)
    }

    /// Rejects new `queue` calls from now on. Pending tasks stay pollable.
    pub fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown.load(Ordering::SeqCst)
    }

    /// Installs the callback invoked whenever a task is queued or raised.
    pub(crate) fn set_notifier(&self, notifier: Box<dyn Fn(Priority) + Send + Sync>) {
        *self.core.notifier.lock() = Some(notifier);
    }
}

impl Default for PrioritisedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PrioritisedQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PrioritisedQueue")
            .field("executed", &self.executed_count())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

// === impl Task ===

impl Task {
    /// Queues the task at its current `(priority, suborder)`. Returns
    /// `false` if it is already queued or already completing.
    ///
    /// # Errors
    ///
    /// Returns [`Shutdown`] if the queue has been shut down.
    pub fn queue(&self) -> Result<bool, Shutdown> {
        let core = &self.inner.queue;
        let priority = {
            let mut state = self.inner.state.lock();
            if state.priority == Priority::Completing || state.queued_key.is_some() {
                return Ok(false);
            }
            if core.shutdown.load(Ordering::SeqCst) {
                return Err(Shutdown(()));
            }
            let key = HolderKey {
                priority: state.priority.ordinal(),
                suborder: state.suborder,
                id: self.inner.id,
            };
            core.index.insert(
                key,
                HolderSlot {
                    task: Arc::clone(&self.inner),
                    removed: AtomicBool::new(false),
                },
            );
            state.queued_key = Some(key);
            state.priority
        };
        core.notify(priority);
        Ok(true)
    }

    /// Cancels the task, atomically flipping it to `Completing`. Returns
    /// `false` if it already completed (a poll that flipped it first runs
    /// it; a cancel that flipped first makes the poll skip it).
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing {
            return false;
        }
        state.priority = Priority::Completing;
        state.runnable = None;
        if let Some(key) = state.queued_key.take() {
            self.inner.queue.remove_holder(&key);
        }
        true
    }

    /// Runs the task on the calling thread, bypassing the queue. Returns
    /// `false` if it already completed.
    #[expect(clippy::missing_panics_doc, reason = "internal assertion")]
    pub fn execute(&self) -> bool {
        let job = {
            let mut state = self.inner.state.lock();
            if state.priority == Priority::Completing {
                return false;
            }
            state.priority = Priority::Completing;
            if let Some(key) = state.queued_key.take() {
                self.inner.queue.remove_holder(&key);
            }
            state.runnable.take()
        };
        let job = job.expect("live task lost its runnable");
        job();
        self.inner.queue.executed.fetch_add(1, Ordering::Relaxed);
        true
    }

    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.inner.state.lock().queued_key.is_some()
    }

    /// The task's current priority; `Completing` once executed or
    /// cancelled.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.state.lock().priority
    }

    #[must_use]
    pub fn suborder(&self) -> i64 {
        self.inner.state.lock().suborder
    }

    /// Re-keys the task to `priority`. Returns `false` if it already
    /// completed.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is `Completing`; cancel or execute instead.
    pub fn set_priority(&self, priority: Priority) -> bool {
        assert!(
            priority.is_schedulable(),
            "cannot schedule a task at the completing priority"
        );
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing {
            return false;
        }
        if state.priority != priority {
            state.priority = priority;
            self.re_key(&mut state);
            drop(state);
            self.inner.queue.notify(priority);
        }
        true
    }

    /// Raises the task to `priority` if that is more urgent than its
    /// current level. Returns `false` if it already completed.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is `Completing`.
    pub fn raise_priority(&self, priority: Priority) -> bool {
        assert!(
            priority.is_schedulable(),
            "cannot schedule a task at the completing priority"
        );
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing {
            return false;
        }
        if priority.is_higher_than(state.priority) {
            state.priority = priority;
            self.re_key(&mut state);
            drop(state);
            self.inner.queue.notify(priority);
        }
        true
    }

    /// Lowers the task to `priority` if that is less urgent than its
    /// current level. Returns `false` if it already completed.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is `Completing`.
    pub fn lower_priority(&self, priority: Priority) -> bool {
        assert!(
            priority.is_schedulable(),
            "cannot schedule a task at the completing priority"
        );
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing {
            return false;
        }
        if state.priority.is_higher_than(priority) {
            state.priority = priority;
            self.re_key(&mut state);
        }
        true
    }

    /// Re-keys the task to `suborder`. Returns `false` if it already
    /// completed.
    pub fn set_suborder(&self, suborder: i64) -> bool {
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing {
            return false;
        }
        if state.suborder != suborder {
            state.suborder = suborder;
            self.re_key(&mut state);
        }
        true
    }

    /// Moves the task's holder to the position matching `state`: inserts a
    /// fresh holder, then flags and removes the old one.
    fn re_key(&self, state: &mut TaskState) {
        let Some(old_key) = state.queued_key else {
            return;
        };
        let new_key = HolderKey {
            priority: state.priority.ordinal(),
            suborder: state.suborder,
            id: self.inner.id,
        };
        self.inner.queue.index.insert(
            new_key,
            HolderSlot {
                task: Arc::clone(&self.inner),
                removed: AtomicBool::new(false),
            },
        );
        state.queued_key = Some(new_key);
        self.inner.queue.remove_holder(&old_key);
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("priority", &state.priority)
            .field("suborder", &state.suborder)
            .field("queued", &state.queued_key.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn recording_job(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> Job {
        let log = Arc::clone(log);
        Box::new(move || log.lock().push(tag))
    }

    #[test]
    fn polls_in_lexicographic_order() {
        let queue = PrioritisedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Queued out of order on purpose.
        queue
            .queue_task(recording_job(&log, 2), Priority::Normal, 0)
            .unwrap();
        queue
            .queue_task(recording_job(&log, 4), Priority::Idle, -5)
            .unwrap();
        queue
            .queue_task(recording_job(&log, 0), Priority::Blocking, 9)
            .unwrap();
        queue
            .queue_task(recording_job(&log, 3), Priority::Normal, 1)
            .unwrap();
        queue
            .queue_task(recording_job(&log, 1), Priority::Highest, 0)
            .unwrap();

        while queue.execute_task() {}
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.executed_count(), 5);
    }

    #[test]
    fn creation_order_breaks_ties() {
        let queue = PrioritisedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..10 {
            queue
                .queue_task(recording_job(&log, tag), Priority::Normal, 0)
                .unwrap();
        }
        while queue.execute_task() {}
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn cancelled_tasks_are_skipped() {
        let queue = PrioritisedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let doomed = queue
            .queue_task(recording_job(&log, 0), Priority::Blocking, 0)
            .unwrap();
        queue
            .queue_task(recording_job(&log, 1), Priority::Normal, 0)
            .unwrap();

        assert!(doomed.cancel());
        assert!(!doomed.cancel());
        assert_eq!(doomed.priority(), Priority::Completing);

        assert!(queue.execute_task());
        assert!(!queue.execute_task());
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn raising_reorders_a_queued_task() {
        let queue = PrioritisedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow = queue
            .queue_task(recording_job(&log, 0), Priority::Lowest, 0)
            .unwrap();
        queue
            .queue_task(recording_job(&log, 1), Priority::Normal, 0)
            .unwrap();

        assert!(slow.raise_priority(Priority::Blocking));
        // Lower-than-current raises are ignored.
        assert!(slow.raise_priority(Priority::Idle));
        assert_eq!(slow.priority(), Priority::Blocking);

        while queue.execute_task() {}
        assert_eq!(*log.lock(), vec![0, 1]);
    }

    #[test]
    fn suborder_changes_re_key() {
        let queue = PrioritisedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let late = queue
            .queue_task(recording_job(&log, 1), Priority::Normal, 0)
            .unwrap();
        queue
            .queue_task(recording_job(&log, 0), Priority::Normal, 5)
            .unwrap();

        assert!(late.set_suborder(10));

        while queue.execute_task() {}
        assert_eq!(*log.lock(), vec![0, 1]);
    }

    #[test]
    fn direct_execute_wins_against_the_poll() {
        let queue = PrioritisedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let task = queue
            .queue_task(recording_job(&log, 7), Priority::Normal, 0)
            .unwrap();
        assert!(task.execute());
        assert!(!task.execute());
        assert!(!task.is_queued());

        // The stale holder must not run the task again.
        assert!(!queue.execute_task());
        assert_eq!(*log.lock(), vec![7]);
        assert_eq!(queue.executed_count(), 1);
    }

    #[test]
    fn shutdown_rejects_new_tasks_but_drains_pending() {
        let queue = PrioritisedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue
            .queue_task(recording_job(&log, 1), Priority::Normal, 0)
            .unwrap();
        queue.shutdown();
        assert!(queue.is_shutdown());

        assert_eq!(
            queue
                .queue_task(recording_job(&log, 2), Priority::Normal, 0)
                .unwrap_err(),
            Shutdown(())
        );

        assert!(queue.execute_task());
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    #[should_panic(expected = "completing priority")]
    fn scheduling_at_completing_is_rejected() {
        let queue = PrioritisedQueue::new();
        let _ = queue.create_task(Box::new(|| {}), Priority::Completing, 0);
    }

    #[test]
    fn queue_is_reentrant_for_unqueued_tasks() {
        let queue = PrioritisedQueue::new();
        let task = queue.create_task(Box::new(|| {}), Priority::Normal, 0);
        assert!(!task.is_queued());
        assert!(task.queue().unwrap());
        assert!(task.is_queued());
        // Double queue is a no-op.
        assert!(!task.queue().unwrap());
        assert!(queue.execute_task());
        // Completed tasks cannot be re-queued.
        assert!(!task.queue().unwrap());
    }

    proptest! {
        #[test]
        fn polls_follow_the_key_order(
            specs in proptest::collection::vec((0_i8..9, -4_i64..4), 1..64)
        ) {
            let queue = PrioritisedQueue::new();
            let log = Arc::new(Mutex::new(Vec::new()));

            let mut expected: Vec<(i8, i64, u32)> = Vec::new();
            for (id, (ordinal, suborder)) in specs.iter().enumerate() {
                let tag = u32::try_from(id).unwrap();
                queue
                    .queue_task(
                        recording_job(&log, tag),
                        Priority::from_ordinal(*ordinal).unwrap(),
                        *suborder,
                    )
                    .unwrap();
                expected.push((*ordinal, *suborder, tag));
            }
            expected.sort_unstable();

            while queue.execute_task() {}

            let executed = log.lock().clone();
            let expected: Vec<u32> = expected.into_iter().map(|(_, _, tag)| tag).collect();
            prop_assert_eq!(executed, expected);
        }
    }
}
