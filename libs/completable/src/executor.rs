// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::RejectedError;

/// A unit of work handed to an [`Execute`] implementation.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The executor seam used by the `_async` continuation forms.
///
/// Implementations promise that a job accepted with `Ok(())` runs exactly
/// once, and that a job refused with `Err` never runs. Refusals are surfaced
/// to the caller as a failed downstream completable, the same way a failing
/// user callback is.
pub trait Execute: Send + Sync {
    /// Submit `job` for execution.
    ///
    /// # Errors
    ///
    /// Returns [`RejectedError`] if the executor cannot accept the
    /// submission; the job is dropped without running.
    fn execute(&self, job: Job) -> Result<(), RejectedError>;
}

impl<E: Execute + ?Sized> Execute for std::sync::Arc<E> {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        (**self).execute(job)
    }
}
