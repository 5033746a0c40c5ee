// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A concurrent chained hash table keyed on `i64`, with lock-free readers
//! and incremental resizing.
//!
//! Readers never block: they walk bucket chains through atomic pointers
//! under an epoch pin, and follow redirect-tagged bucket heads into the
//! successor table while a resize is in flight. Writers serialise per bucket
//! on the head entry's mutex, so disjoint buckets never contend.
//!
//! The compute family (`compute`, `compute_if_absent`, `compute_if_present`,
//! `merge`, `remove_if`) holds the bucket lock across the user closure, so
//! the closure runs at most once per call and observes a consistent "before"
//! value. Calling back into the same map from inside such a closure is
//! undefined (it deadlocks on the bucket lock).

mod adder;
mod iter;
mod map;

pub use adder::IntAdder;
pub use iter::{Iter, Keys, Values};
pub use map::ConcurrentI64Map;
