// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::{Deref, DerefMut};

/// Pads and aligns `T` to the size of a cache line, so that values written
/// from different threads never share one.
///
/// The counter cells of a striped size counter and the per-worker flags of
/// the thread pool are updated by different threads at high rates; if two of
/// them land on the same cache line, every write invalidates the line for
/// the other thread and the stripes stop being independent. Wrapping each in
/// `CachePadded` gives every value its own line.
///
/// The server targets this library cares about are x86_64, aarch64, and
/// powerpc64, where the safe padding is 128 bytes: x86_64 prefetches cache
/// lines in adjacent pairs since Sandy Bridge, and the big cores of
/// heterogeneous aarch64 parts use 128-byte lines outright. Everything else
/// gets the common 64-byte line.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
#[derive(Default)]
pub struct CachePadded<T> {
    value: T,
}

// === impl CachePadded ===

impl<T> CachePadded<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CachePadded").field(&self.value).finish()
    }
}
