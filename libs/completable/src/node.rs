// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{ErrorTransformer, Failure};
use crate::executor::Execute;
use std::sync::Arc;
use std::task::Waker;
use std::thread::Thread;

/// The result a [`Completable`][crate::Completable] settles to.
pub(crate) type Outcome<T> = Result<T, Failure>;

/// A continuation pushed onto a completable's pending stack.
///
/// The original inheritance hierarchy of continuation classes collapses to a
/// closure-plus-kind pair here: every transform kind (apply, accept, run,
/// handle, when-complete, exceptionally) is a [`Work::Transform`] whose `run`
/// closure captures the user callback and the downstream completable, while
/// the blocking and async entry points use the two wake variants.
pub(crate) struct Node<T> {
    /// Next node in the LIFO stack. Only read or written while the node is
    /// exclusively owned: by the pushing thread before a successful CAS, or
    /// by the draining thread after the `COMPLETED` swap.
    pub(crate) next: *mut Node<T>,
    pub(crate) work: Work<T>,
}

pub(crate) enum Work<T> {
    Transform {
        /// Where to run `run`; `None` runs it synchronously on the
        /// completing (or, post-completion, the registering) thread.
        executor: Option<Arc<dyn Execute>>,
        transform: ErrorTransformer,
        /// Consumes the upstream outcome and settles the captured
        /// downstream. Invoked exactly once.
        run: Box<dyn FnOnce(&Outcome<T>, &ErrorTransformer) + Send>,
        /// Settles the downstream exceptionally without running `run`, used
        /// when the executor refuses the submission.
        fail: Box<dyn FnOnce(Failure) + Send>,
    },
    /// Wakes a thread blocked in `join`.
    Unpark(Thread),
    /// Wakes a task polling the [`CompletableFuture`][crate::CompletableFuture] adapter.
    Wake(Waker),
}

// Safety: `next` is a plain pointer into the stack; it is only dereferenced
// by whichever thread exclusively owns the node (see field docs), and every
// other field is `Send`.
unsafe impl<T: Send> Send for Node<T> {}
