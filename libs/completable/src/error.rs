// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;
use std::sync::Arc;

/// The exception channel of a [`Completable`][crate::Completable].
///
/// A completion error fans out to every registered continuation, so the
/// underlying [`anyhow::Error`] is shared behind an `Arc` and handles are
/// cheap to clone.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

/// Error returned by [`Execute::execute`][crate::Execute::execute] when the
/// executor refuses the submission, e.g. because it was shut down.
///
/// A rejected continuation submission is treated exactly like a failing user
/// callback: it is routed through the continuation's [`ErrorTransformer`]
/// and completes the downstream exceptionally.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RejectedError(pub(crate) &'static str);

/// Transforms the error produced by a failing user callback (or a rejected
/// executor submission) before it is published downstream.
///
/// The default transformer logs the error and returns it unchanged. If the
/// transformer itself panics, the panic is logged as suppressed and the
/// original error is used.
#[derive(Clone)]
pub struct ErrorTransformer(Arc<dyn Fn(Failure) -> Failure + Send + Sync>);

// === impl Failure ===

impl Failure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn msg(msg: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(msg)))
    }

    /// Recovers a failure from a panic payload, preserving `&str` and
    /// `String` panic messages.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        let msg = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "user callback panicked".to_string());
        Self::msg(msg)
    }

    /// The underlying error value shared by all handles to this failure.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Whether two handles refer to the same underlying error.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

// === impl RejectedError ===

impl fmt::Display for RejectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor rejected submission: {}", self.0)
    }
}

impl core::error::Error for RejectedError {}

impl RejectedError {
    /// A rejection with a short static reason, e.g. `"shutdown"`.
    #[must_use]
    pub const fn new(reason: &'static str) -> Self {
        Self(reason)
    }
}

// === impl ErrorTransformer ===

impl ErrorTransformer {
    pub fn new(f: impl Fn(Failure) -> Failure + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Applies the transformer, falling back to the original error if the
    /// transformer panics.
    pub(crate) fn transform(&self, failure: Failure) -> Failure {
        let fallback = failure.clone();
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.0)(failure))) {
            Ok(transformed) => transformed,
            Err(payload) => {
                tracing::error!(
                    suppressed = %Failure::from_panic(payload),
                    "error transformer panicked, using the untransformed error"
                );
                fallback
            }
        }
    }
}

impl Default for ErrorTransformer {
    fn default() -> Self {
        Self(Arc::new(|failure| {
            tracing::error!(error = %failure, "continuation failed");
            failure
        }))
    }
}

impl fmt::Debug for ErrorTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorTransformer(..)")
    }
}
