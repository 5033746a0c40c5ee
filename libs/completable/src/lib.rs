// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free, single-assignment completion future with chained
//! continuations.
//!
//! A [`Completable`] holds at most one result (a value or a [`Failure`]) and
//! a LIFO stack of pending continuations. Completing it drains the stack and
//! runs every continuation exactly once, either inline on the completing
//! thread or on an executor implementing [`Execute`]. Continuations
//! registered after completion run immediately on the registering thread.
//!
//! This is deliberately much smaller than a general futures framework: the
//! only combinators are the `then_apply`/`then_accept`/`then_run`/`handle`/
//! `when_complete`/`exceptionally` family, each with an `_async` form taking
//! an explicit executor and a `_with` form taking an [`ErrorTransformer`].

mod completable;
mod error;
mod executor;
mod future;
mod loom;
mod node;

pub use completable::Completable;
pub use error::{ErrorTransformer, Failure, RejectedError};
pub use executor::{Execute, Job};
pub use future::CompletableFuture;
