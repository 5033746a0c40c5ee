// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Completable;
use crate::error::Failure;
use crate::node::Work;
use core::pin::Pin;
use core::task::{Context, Poll};

/// Adapter implementing [`Future`] for a [`Completable`].
///
/// Each poll that finds the completable unset registers the task's waker as
/// a wake continuation; completion (or a poll racing with it) wakes the task,
/// whose next poll observes the published outcome.
pub struct CompletableFuture<T> {
    inner: Completable<T>,
}

impl<T> Clone for CompletableFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> core::fmt::Debug for CompletableFuture<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("CompletableFuture").field(&self.inner).finish()
    }
}

// === impl CompletableFuture ===

impl<T: Send + Sync + 'static> CompletableFuture<T> {
    pub(crate) fn new(inner: Completable<T>) -> Self {
        Self { inner }
    }

    /// The underlying completable.
    #[must_use]
    pub fn completable(&self) -> &Completable<T> {
        &self.inner
    }
}

impl<T: Clone + Send + Sync + 'static> Future for CompletableFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.inner.inner.outcome() {
            return Poll::Ready(outcome.clone());
        }

        // Registering on an already-drained stack runs the wake inline, so a
        // completion racing with this push is never lost, merely re-polled.
        crate::completable::Inner::push(&self.inner.inner, Work::Wake(cx.waker().clone()));

        Poll::Pending
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Completable<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = CompletableFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        CompletableFuture::new(self)
    }
}
