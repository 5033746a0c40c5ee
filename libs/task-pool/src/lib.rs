// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A prioritised task queue and the work-distributing thread pool on top of
//! it.
//!
//! Tasks are totally ordered by `(priority, suborder, id)` in a concurrent
//! skip-list index; polling always takes the lexicographically smallest
//! non-cancelled task. The pool schedules *executor groups* over a shared
//! set of worker threads: each executor has its own queue, a parallelism
//! cap, and a hold time telling workers how long to stay with it before
//! looking elsewhere. Arrivals at or above [`Priority::High`] alert idle or
//! busy workers so they reach the new task at the next poll boundary.

mod error;
mod pool;
mod priority;
mod queue;

pub use error::Shutdown;
pub use pool::{ExecutorGroup, PoolExecutor, PrioritisedPool};
pub use priority::Priority;
pub use queue::{PrioritisedQueue, Task};
