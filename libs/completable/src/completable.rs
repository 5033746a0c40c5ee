// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{ErrorTransformer, Failure};
use crate::executor::{Execute, Job};
use crate::future::CompletableFuture;
use crate::loom::{AtomicPtr, Ordering};
use crate::node::{Node, Outcome, Work};
use core::fmt;
use core::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use std::thread;
use util::Backoff;

/// A single-assignment result carrier with composable transforms.
///
/// A `Completable` starts *unset* and transitions exactly once to either a
/// value or a [`Failure`]; it never resets. Handles are cheap clones sharing
/// the same underlying cell, so a completable can be completed from one
/// thread while others join on it or chain continuations.
///
/// Continuations registered before completion are stored in a lock-free LIFO
/// and run exactly once when the result is published; continuations
/// registered afterwards run immediately on the registering thread (or on
/// their executor, for the `_async` forms).
pub struct Completable<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

pub(crate) struct Inner<T> {
    /// Null while unset. A successful completion CAS publishes the boxed
    /// outcome, which is then immutable and freed only on drop.
    result: AtomicPtr<Outcome<T>>,
    /// LIFO of pending continuations. Swapped to the `COMPLETED` sentinel
    /// exactly once, by the completing thread, after `result` is published.
    stack: AtomicPtr<Node<T>>,
    _marker: PhantomData<T>,
}

/// Sentinel stored in `stack` once the continuation LIFO has been drained.
/// Never dereferenced; its address is unreachable by any allocation.
fn completed<T>() -> *mut Node<T> {
    ptr::without_provenance_mut(usize::MAX)
}

static_assertions::assert_impl_all!(Completable<u32>: Send, Sync);

// === impl Inner ===

impl<T: Send + Sync + 'static> Inner<T> {
    fn new() -> Self {
        Self {
            result: AtomicPtr::new(ptr::null_mut()),
            stack: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn outcome(&self) -> Option<&Outcome<T>> {
        let result = self.result.load(Ordering::Acquire);
        if result.is_null() {
            None
        } else {
            // Safety: a non-null `result` was published by the completion CAS
            // (acquire pairs with its release), is never replaced, and is
            // freed only on drop, which cannot race with this borrow.
            Some(unsafe { &*result })
        }
    }

    /// First completion wins; losers return `false` and the cell is
    /// unchanged.
    fn try_complete(this: &Arc<Self>, outcome: Outcome<T>) -> bool {
        let new = Box::into_raw(Box::new(outcome));
        match this.result.compare_exchange(
            ptr::null_mut(),
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                Self::drain(this);
                true
            }
            Err(_) => {
                // Safety: the failed CAS never published `new`, we still own it.
                drop(unsafe { Box::from_raw(new) });
                false
            }
        }
    }

    /// Atomically takes over the continuation stack and runs every pending
    /// continuation. Called exactly once, after `result` is published.
    fn drain(this: &Arc<Self>) {
        let mut head = this.stack.swap(completed(), Ordering::AcqRel);
        while !head.is_null() {
            debug_assert_ne!(head, completed::<T>());
            // Safety: the swap transferred exclusive ownership of the whole
            // list to this thread; each node was published by a successful
            // push CAS.
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            Self::execute_node(this, node);
        }
    }

    /// Pushes a continuation, or runs it on this thread if the stack was
    /// already drained.
    pub(crate) fn push(this: &Arc<Self>, work: Work<T>) {
        let mut node = Box::new(Node {
            next: ptr::null_mut(),
            work,
        });
        let mut head = this.stack.load(Ordering::Acquire);
        let mut boff = Backoff::new();

        loop {
            if head == completed::<T>() {
                // The stack is gone; the result is visible (the drain swap
                // happens after the result publication).
                Self::execute_node(this, node);
                return;
            }

            node.next = head;
            let raw = Box::into_raw(node);
            match this
                .stack
                .compare_exchange(head, raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => {
                    // Safety: the failed CAS never published the node.
                    node = unsafe { Box::from_raw(raw) };
                    head = actual;
                    boff.spin();
                }
            }
        }
    }

    /// Runs a single continuation against the published outcome.
    fn execute_node(this: &Arc<Self>, node: Box<Node<T>>) {
        match node.work {
            Work::Unpark(thread) => thread.unpark(),
            Work::Wake(waker) => waker.wake(),
            Work::Transform {
                executor: None,
                transform,
                run,
                ..
            } => {
                let outcome = this
                    .outcome()
                    .expect("continuation executed before completion");
                run(outcome, &transform);
            }
            Work::Transform {
                executor: Some(executor),
                transform,
                run,
                fail,
            } => {
                let inner = Arc::clone(this);
                let job_transform = transform.clone();
                let job: Job = Box::new(move || {
                    let outcome = inner
                        .outcome()
                        .expect("continuation executed before completion");
                    run(outcome, &job_transform);
                });
                if let Err(rejected) = executor.execute(job) {
                    // An executor refusing the submission is a user-level
                    // error, routed like a failing callback.
                    fail(transform.transform(Failure::new(rejected)));
                }
            }
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let result = self.result.load(Ordering::Acquire);
        if !result.is_null() {
            // Safety: exclusive access; published results are freed exactly here.
            drop(unsafe { Box::from_raw(result) });
        }

        let mut head = self.stack.load(Ordering::Acquire);
        while !head.is_null() && head != completed::<T>() {
            // Safety: exclusive access; unexecuted nodes are owned by the stack.
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
        }
    }
}

// === impl Completable ===

impl<T: Send + Sync + 'static> Completable<T> {
    /// Creates an unset completable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// A completable that is already completed with `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        let this = Self::new();
        this.complete(value);
        this
    }

    /// A completable that is already completed exceptionally with `err`.
    #[must_use]
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        let this = Self::new();
        this.complete_exceptionally(err);
        this
    }

    /// Runs `supplier` on the calling thread and returns a completable
    /// settled with its result; a panicking supplier settles it
    /// exceptionally.
    pub fn supplied(supplier: impl FnOnce() -> T + Send + 'static) -> Self {
        Self::supplied_with(ErrorTransformer::default(), supplier)
    }

    pub fn supplied_with(
        transform: ErrorTransformer,
        supplier: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        let this = Self::new();
        match catch_unwind(AssertUnwindSafe(supplier)) {
            Ok(value) => {
                this.complete(value);
            }
            Err(payload) => {
                this.complete_failure(transform.transform(Failure::from_panic(payload)));
            }
        }
        this
    }

    /// Submits `supplier` to `executor` and returns the completable its
    /// result will settle. A rejected submission settles it exceptionally.
    pub fn supplied_async(
        executor: Arc<dyn Execute>,
        supplier: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        Self::supplied_async_with(executor, ErrorTransformer::default(), supplier)
    }

    pub fn supplied_async_with(
        executor: Arc<dyn Execute>,
        transform: ErrorTransformer,
        supplier: impl FnOnce() -> T + Send + 'static,
    ) -> Self {
        let this = Self::new();
        let downstream = this.clone();
        let job_transform = transform.clone();
        let job: Job = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(supplier)) {
                Ok(value) => {
                    downstream.complete(value);
                }
                Err(payload) => {
                    downstream.complete_failure(job_transform.transform(Failure::from_panic(payload)));
                }
            }
        });
        if let Err(rejected) = executor.execute(job) {
            this.complete_failure(transform.transform(Failure::new(rejected)));
        }
        this
    }

    /// Whether this completable has settled, normally or exceptionally.
    pub fn is_done(&self) -> bool {
        self.inner.outcome().is_some()
    }

    pub fn is_normally_complete(&self) -> bool {
        matches!(self.inner.outcome(), Some(Ok(_)))
    }

    pub fn is_exceptionally_complete(&self) -> bool {
        matches!(self.inner.outcome(), Some(Err(_)))
    }

    /// The failure this completable settled to.
    ///
    /// # Panics
    ///
    /// Panics if the completable is unset or completed normally.
    pub fn get_exception(&self) -> Failure {
        match self.inner.outcome() {
            Some(Err(failure)) => failure.clone(),
            Some(Ok(_)) => panic!("get_exception on a normally completed completable"),
            None => panic!("get_exception on an unset completable"),
        }
    }

    /// Returns the settled value, `absent` if unset, or the failure.
    ///
    /// # Errors
    ///
    /// Returns the [`Failure`] this completable settled to, if any.
    pub fn get_now(&self, absent: T) -> Result<T, Failure>
    where
        T: Clone,
    {
        match self.inner.outcome() {
            Some(outcome) => outcome.clone(),
            None => Ok(absent),
        }
    }

    /// Blocks the calling thread until this completable settles.
    ///
    /// # Errors
    ///
    /// Returns the [`Failure`] this completable settled to, if any.
    pub fn join(&self) -> Result<T, Failure>
    where
        T: Clone,
    {
        if let Some(outcome) = self.inner.outcome() {
            return outcome.clone();
        }

        Inner::push(&self.inner, Work::Unpark(thread::current()));
        loop {
            if let Some(outcome) = self.inner.outcome() {
                return outcome.clone();
            }
            // The unpark token persists across the registration race, and
            // spurious wakeups only re-run the check above.
            thread::park();
        }
    }

    /// Completes with `value`. The first completion wins; later attempts
    /// return `false` and change nothing.
    pub fn complete(&self, value: T) -> bool {
        Inner::try_complete(&self.inner, Ok(value))
    }

    /// Completes exceptionally with `err`. The first completion wins; later
    /// attempts return `false` and change nothing.
    pub fn complete_exceptionally(&self, err: impl Into<anyhow::Error>) -> bool {
        Inner::try_complete(&self.inner, Err(Failure::new(err)))
    }

    pub(crate) fn complete_failure(&self, failure: Failure) -> bool {
        Inner::try_complete(&self.inner, Err(failure))
    }

    /// Whether two handles refer to the same underlying completable.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Adapter implementing [`Future`] for this completable.
    #[must_use]
    pub fn as_future(&self) -> CompletableFuture<T> {
        CompletableFuture::new(self.clone())
    }

    /// Registers a transform continuation and returns its downstream.
    fn chain<U: Send + Sync + 'static>(
        &self,
        executor: Option<Arc<dyn Execute>>,
        transform: ErrorTransformer,
        run: impl FnOnce(&Outcome<T>, &ErrorTransformer, Completable<U>) + Send + 'static,
    ) -> Completable<U> {
        let downstream = Completable::new();
        let run_downstream = downstream.clone();
        let fail_downstream = downstream.clone();
        Inner::push(&self.inner, Work::Transform {
            executor,
            transform,
            run: Box::new(move |outcome, t| run(outcome, t, run_downstream)),
            fail: Box::new(move |failure| {
                fail_downstream.complete_failure(failure);
            }),
        });
        downstream
    }

    fn apply_dispatch<U: Send + Sync + 'static>(
        &self,
        executor: Option<Arc<dyn Execute>>,
        transform: ErrorTransformer,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.chain(executor, transform, move |outcome, t, down| match outcome {
            Ok(value) => {
                let value = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(value))) {
                    Ok(mapped) => {
                        down.complete(mapped);
                    }
                    Err(payload) => {
                        down.complete_failure(t.transform(Failure::from_panic(payload)));
                    }
                }
            }
            Err(err) => {
                down.complete_failure(err.clone());
            }
        })
    }

    /// Transforms the value once this completable settles normally;
    /// upstream failures propagate unchanged.
    pub fn then_apply<U: Send + Sync + 'static>(
        &self,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.apply_dispatch(None, ErrorTransformer::default(), f)
    }

    pub fn then_apply_with<U: Send + Sync + 'static>(
        &self,
        transform: ErrorTransformer,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.apply_dispatch(None, transform, f)
    }

    pub fn then_apply_async<U: Send + Sync + 'static>(
        &self,
        executor: Arc<dyn Execute>,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.apply_dispatch(Some(executor), ErrorTransformer::default(), f)
    }

    pub fn then_apply_async_with<U: Send + Sync + 'static>(
        &self,
        executor: Arc<dyn Execute>,
        transform: ErrorTransformer,
        f: impl FnOnce(T) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.apply_dispatch(Some(executor), transform, f)
    }

    /// Consumes the value once this completable settles normally; upstream
    /// failures propagate unchanged.
    pub fn then_accept(&self, f: impl FnOnce(T) + Send + 'static) -> Completable<()>
    where
        T: Clone,
    {
        self.apply_dispatch(None, ErrorTransformer::default(), f)
    }

    pub fn then_accept_with(
        &self,
        transform: ErrorTransformer,
        f: impl FnOnce(T) + Send + 'static,
    ) -> Completable<()>
    where
        T: Clone,
    {
        self.apply_dispatch(None, transform, f)
    }

    pub fn then_accept_async(
        &self,
        executor: Arc<dyn Execute>,
        f: impl FnOnce(T) + Send + 'static,
    ) -> Completable<()>
    where
        T: Clone,
    {
        self.apply_dispatch(Some(executor), ErrorTransformer::default(), f)
    }

    pub fn then_accept_async_with(
        &self,
        executor: Arc<dyn Execute>,
        transform: ErrorTransformer,
        f: impl FnOnce(T) + Send + 'static,
    ) -> Completable<()>
    where
        T: Clone,
    {
        self.apply_dispatch(Some(executor), transform, f)
    }

    fn run_dispatch(
        &self,
        executor: Option<Arc<dyn Execute>>,
        transform: ErrorTransformer,
        f: impl FnOnce() + Send + 'static,
    ) -> Completable<()> {
        self.chain(executor, transform, move |outcome, t, down| match outcome {
            Ok(_) => match catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => {
                    down.complete(());
                }
                Err(payload) => {
                    down.complete_failure(t.transform(Failure::from_panic(payload)));
                }
            },
            Err(err) => {
                down.complete_failure(err.clone());
            }
        })
    }

    /// Runs `f` once this completable settles normally, ignoring the value;
    /// upstream failures propagate unchanged.
    pub fn then_run(&self, f: impl FnOnce() + Send + 'static) -> Completable<()> {
        self.run_dispatch(None, ErrorTransformer::default(), f)
    }

    pub fn then_run_with(
        &self,
        transform: ErrorTransformer,
        f: impl FnOnce() + Send + 'static,
    ) -> Completable<()> {
        self.run_dispatch(None, transform, f)
    }

    pub fn then_run_async(
        &self,
        executor: Arc<dyn Execute>,
        f: impl FnOnce() + Send + 'static,
    ) -> Completable<()> {
        self.run_dispatch(Some(executor), ErrorTransformer::default(), f)
    }

    pub fn then_run_async_with(
        &self,
        executor: Arc<dyn Execute>,
        transform: ErrorTransformer,
        f: impl FnOnce() + Send + 'static,
    ) -> Completable<()> {
        self.run_dispatch(Some(executor), transform, f)
    }

    fn handle_dispatch<U: Send + Sync + 'static>(
        &self,
        executor: Option<Arc<dyn Execute>>,
        transform: ErrorTransformer,
        f: impl FnOnce(Option<T>, Option<Failure>) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.chain(executor, transform, move |outcome, t, down| {
            let (value, err) = match outcome {
                Ok(value) => (Some(value.clone()), None),
                Err(err) => (None, Some(err.clone())),
            };
            match catch_unwind(AssertUnwindSafe(move || f(value, err))) {
                Ok(mapped) => {
                    down.complete(mapped);
                }
                Err(payload) => {
                    down.complete_failure(t.transform(Failure::from_panic(payload)));
                }
            }
        })
    }

    /// Transforms the outcome, whichever way this completable settles. The
    /// callback receives `(Some(value), None)` or `(None, Some(failure))`.
    pub fn handle<U: Send + Sync + 'static>(
        &self,
        f: impl FnOnce(Option<T>, Option<Failure>) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.handle_dispatch(None, ErrorTransformer::default(), f)
    }

    pub fn handle_with<U: Send + Sync + 'static>(
        &self,
        transform: ErrorTransformer,
        f: impl FnOnce(Option<T>, Option<Failure>) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.handle_dispatch(None, transform, f)
    }

    pub fn handle_async<U: Send + Sync + 'static>(
        &self,
        executor: Arc<dyn Execute>,
        f: impl FnOnce(Option<T>, Option<Failure>) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.handle_dispatch(Some(executor), ErrorTransformer::default(), f)
    }

    pub fn handle_async_with<U: Send + Sync + 'static>(
        &self,
        executor: Arc<dyn Execute>,
        transform: ErrorTransformer,
        f: impl FnOnce(Option<T>, Option<Failure>) -> U + Send + 'static,
    ) -> Completable<U>
    where
        T: Clone,
    {
        self.handle_dispatch(Some(executor), transform, f)
    }

    fn when_dispatch(
        &self,
        executor: Option<Arc<dyn Execute>>,
        transform: ErrorTransformer,
        f: impl FnOnce(Option<T>, Option<Failure>) + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.chain(executor, transform, move |outcome, t, down| match outcome {
            Ok(value) => {
                let observed = value.clone();
                match catch_unwind(AssertUnwindSafe(move || f(Some(observed), None))) {
                    Ok(()) => {
                        down.complete(value.clone());
                    }
                    Err(payload) => {
                        down.complete_failure(t.transform(Failure::from_panic(payload)));
                    }
                }
            }
            Err(err) => {
                // The upstream failure wins; a panicking callback is
                // suppressed into the log.
                let observed = err.clone();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(move || f(None, Some(observed))))
                {
                    tracing::error!(
                        suppressed = %Failure::from_panic(payload),
                        "when_complete callback panicked while observing a failure"
                    );
                }
                down.complete_failure(err.clone());
            }
        })
    }

    /// Observes the outcome without changing it: the downstream mirrors the
    /// upstream. A failure is re-propagated after the callback sees it.
    pub fn when_complete(
        &self,
        f: impl FnOnce(Option<T>, Option<Failure>) + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.when_dispatch(None, ErrorTransformer::default(), f)
    }

    pub fn when_complete_with(
        &self,
        transform: ErrorTransformer,
        f: impl FnOnce(Option<T>, Option<Failure>) + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.when_dispatch(None, transform, f)
    }

    pub fn when_complete_async(
        &self,
        executor: Arc<dyn Execute>,
        f: impl FnOnce(Option<T>, Option<Failure>) + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.when_dispatch(Some(executor), ErrorTransformer::default(), f)
    }

    pub fn when_complete_async_with(
        &self,
        executor: Arc<dyn Execute>,
        transform: ErrorTransformer,
        f: impl FnOnce(Option<T>, Option<Failure>) + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.when_dispatch(Some(executor), transform, f)
    }

    fn exceptionally_dispatch(
        &self,
        executor: Option<Arc<dyn Execute>>,
        transform: ErrorTransformer,
        f: impl FnOnce(Failure) -> T + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.chain(executor, transform, move |outcome, t, down| match outcome {
            Ok(value) => {
                down.complete(value.clone());
            }
            Err(err) => {
                let err = err.clone();
                match catch_unwind(AssertUnwindSafe(move || f(err))) {
                    Ok(recovered) => {
                        down.complete(recovered);
                    }
                    Err(payload) => {
                        down.complete_failure(t.transform(Failure::from_panic(payload)));
                    }
                }
            }
        })
    }

    /// Recovers from an upstream failure by computing a substitute value;
    /// normal completions pass through unchanged.
    pub fn exceptionally(&self, f: impl FnOnce(Failure) -> T + Send + 'static) -> Completable<T>
    where
        T: Clone,
    {
        self.exceptionally_dispatch(None, ErrorTransformer::default(), f)
    }

    pub fn exceptionally_with(
        &self,
        transform: ErrorTransformer,
        f: impl FnOnce(Failure) -> T + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.exceptionally_dispatch(None, transform, f)
    }

    pub fn exceptionally_async(
        &self,
        executor: Arc<dyn Execute>,
        f: impl FnOnce(Failure) -> T + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.exceptionally_dispatch(Some(executor), ErrorTransformer::default(), f)
    }

    pub fn exceptionally_async_with(
        &self,
        executor: Arc<dyn Execute>,
        transform: ErrorTransformer,
        f: impl FnOnce(Failure) -> T + Send + 'static,
    ) -> Completable<T>
    where
        T: Clone,
    {
        self.exceptionally_dispatch(Some(executor), transform, f)
    }
}

impl<T: Send + Sync + 'static> Default for Completable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Completable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Completable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.outcome() {
            None => "unset",
            Some(Ok(_)) => "value",
            Some(Err(_)) => "error",
        };
        f.debug_struct("Completable").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RejectedError;
    use crate::loom;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;
    use std::thread::ThreadId;

    /// Runs every job on a dedicated thread, recording that thread's id.
    struct ThreadExecutor {
        tx: Mutex<Option<mpsc::Sender<Job>>>,
        worker: Mutex<Option<std::thread::JoinHandle<()>>>,
        id: ThreadId,
    }

    impl ThreadExecutor {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::channel::<Job>();
            let (id_tx, id_rx) = mpsc::channel();
            let worker = std::thread::spawn(move || {
                id_tx.send(std::thread::current().id()).unwrap();
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
                id: id_rx.recv().unwrap(),
            })
        }

        fn shutdown(&self) {
            drop(self.tx.lock().unwrap().take());
            if let Some(worker) = self.worker.lock().unwrap().take() {
                worker.join().unwrap();
            }
        }
    }

    impl Execute for ThreadExecutor {
        fn execute(&self, job: Job) -> Result<(), RejectedError> {
            self.tx
                .lock()
                .unwrap()
                .as_ref()
                .ok_or(RejectedError::new("shutdown"))?
                .send(job)
                .map_err(|_| RejectedError::new("shutdown"))
        }
    }

    struct Rejecting;

    impl Execute for Rejecting {
        fn execute(&self, _job: Job) -> Result<(), RejectedError> {
            Err(RejectedError::new("always rejects"))
        }
    }

    #[test]
    fn first_completion_wins() {
        let c = Completable::new();
        assert!(c.complete(1));
        assert!(!c.complete(2));
        assert!(!c.complete_exceptionally(anyhow::anyhow!("nope")));
        assert_eq!(c.get_now(0).unwrap(), 1);
        assert!(c.is_done());
        assert!(c.is_normally_complete());
        assert!(!c.is_exceptionally_complete());
    }

    #[test]
    fn chain_applies_in_order() {
        let result = Completable::supplied(|| 3)
            .then_apply(|x| x * 2)
            .then_apply(|x| x + 1)
            .join()
            .unwrap();
        assert_eq!(result, 7);
    }

    #[test]
    fn continuations_before_and_after_completion_run_exactly_once() {
        let c = Completable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let hits = hits.clone();
            c.then_run(move || {
                hits.fetch_add(1, AtomicOrdering::Relaxed);
            });
        }
        assert_eq!(hits.load(AtomicOrdering::Relaxed), 0);

        c.complete(7_u32);
        assert_eq!(hits.load(AtomicOrdering::Relaxed), 4);

        // Registered post-completion: runs inline on this thread.
        let hits2 = hits.clone();
        c.then_run(move || {
            hits2.fetch_add(1, AtomicOrdering::Relaxed);
        });
        assert_eq!(hits.load(AtomicOrdering::Relaxed), 5);
    }

    #[test]
    fn error_propagates_past_apply_into_exceptionally() {
        let touched = Arc::new(AtomicUsize::new(0));
        let touched2 = touched.clone();

        let c = Completable::<u32>::failed(anyhow::anyhow!("boom"));
        let recovered = c
            .then_apply(move |x| {
                touched2.fetch_add(1, AtomicOrdering::Relaxed);
                x + 1
            })
            .exceptionally(|_err| 42);

        assert_eq!(recovered.join().unwrap(), 42);
        // The apply callback must never run on the error path.
        assert_eq!(touched.load(AtomicOrdering::Relaxed), 0);
    }

    #[test]
    fn handle_observes_the_failure() {
        let c = Completable::<u32>::failed(anyhow::anyhow!("boom"));
        let handled = c.handle(|value, err| {
            assert!(value.is_none());
            err.unwrap().to_string()
        });
        assert_eq!(handled.join().unwrap(), "boom");
    }

    #[test]
    fn when_complete_mirrors_and_repropagates() {
        let seen = Arc::new(AtomicUsize::new(0));

        let ok = Completable::completed(5_u32);
        let seen2 = seen.clone();
        let mirrored = ok.when_complete(move |value, err| {
            assert_eq!(value, Some(5));
            assert!(err.is_none());
            seen2.fetch_add(1, AtomicOrdering::Relaxed);
        });
        assert_eq!(mirrored.join().unwrap(), 5);

        let failed = Completable::<u32>::failed(anyhow::anyhow!("boom"));
        let seen3 = seen.clone();
        let mirrored = failed.when_complete(move |value, err| {
            assert!(value.is_none());
            assert!(err.is_some());
            seen3.fetch_add(1, AtomicOrdering::Relaxed);
        });
        assert!(mirrored.join().is_err());

        assert_eq!(seen.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn supplier_panic_becomes_failure() {
        let c = Completable::<u32>::supplied(|| panic!("kaput"));
        assert!(c.is_exceptionally_complete());
        assert!(c.get_exception().to_string().contains("kaput"));
    }

    #[test]
    #[should_panic(expected = "normally completed")]
    fn get_exception_panics_on_value() {
        Completable::completed(1_u32).get_exception();
    }

    #[test]
    fn join_across_threads() {
        let c = Completable::<u32>::new();
        let completer = {
            let c = c.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                c.complete(99)
            })
        };
        assert_eq!(c.join().unwrap(), 99);
        assert!(completer.join().unwrap());
        // Once settled, join and get_now agree.
        assert_eq!(c.get_now(0).unwrap(), 99);
    }

    #[test]
    fn async_dispatch_runs_on_executor_thread() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let exec = ThreadExecutor::new();
        let expected = exec.id;

        let c = Completable::<u32>::new();
        let staged = c
            .then_apply_async(exec.clone(), move |x| {
                assert_eq!(std::thread::current().id(), expected);
                x * 2
            })
            .then_apply_async(exec.clone(), move |x| {
                assert_eq!(std::thread::current().id(), expected);
                x + 1
            });

        c.complete(3);
        assert_eq!(staged.join().unwrap(), 7);
        exec.shutdown();
    }

    #[test]
    fn rejected_submission_fails_downstream() {
        let c = Completable::completed(1_u32);
        let downstream = c.then_apply_async(Arc::new(Rejecting), |x| x + 1);
        assert!(downstream.is_exceptionally_complete());
        assert!(
            downstream
                .get_exception()
                .to_string()
                .contains("always rejects")
        );
    }

    #[test]
    fn future_adapter_wakes() {
        use core::task::{Context, Poll, Waker};

        let c = Completable::<u32>::new();
        let mut future = Box::pin(c.as_future());

        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        assert!(future.as_mut().poll(&mut cx).is_pending());

        c.complete(11);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 11),
            other => panic!("expected ready value, got {other:?}"),
        }
    }

    #[test]
    fn race_between_push_and_complete() {
        loom::model(|| {
            let c = Completable::<u32>::new();
            let hits = Arc::new(AtomicUsize::new(0));

            let pusher = {
                let c = c.clone();
                let hits = hits.clone();
                loom::thread::spawn(move || {
                    c.then_run(move || {
                        hits.fetch_add(1, AtomicOrdering::Relaxed);
                    });
                })
            };
            let completer = {
                let c = c.clone();
                loom::thread::spawn(move || {
                    c.complete(1);
                })
            };

            pusher.join().unwrap();
            completer.join().unwrap();

            // Whichever way the race goes, the continuation runs exactly once.
            assert_eq!(hits.load(AtomicOrdering::Relaxed), 1);
        });
    }

    #[test]
    fn race_between_two_completers() {
        loom::model(|| {
            let c = Completable::<u32>::new();

            let a = {
                let c = c.clone();
                loom::thread::spawn(move || c.complete(1))
            };
            let b = {
                let c = c.clone();
                loom::thread::spawn(move || c.complete(2))
            };

            let a = a.join().unwrap();
            let b = b.join().unwrap();
            assert!(a ^ b, "exactly one completion must win");

            let value = c.get_now(0).unwrap();
            assert!(value == 1 || value == 2);
        });
    }
}
