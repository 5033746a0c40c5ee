// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// Exponential backoff for contended retry loops.
///
/// Tracks a spin budget that doubles on every call to
/// [`spin`][Backoff::spin], from one spin-loop hint up to
/// [`MAX_SPINS`][Backoff::MAX_SPINS] per call. Used where an operation lost
/// a race and retrying immediately would keep the contended line bouncing:
/// the continuation-stack push CAS, and the idle phase of pool workers
/// before they park ([`is_saturated`][Backoff::is_saturated] tells them the
/// spinning phase is spent).
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    /// Spin-loop hints the next `spin` call will issue.
    spins: u32,
}

// === impl Backoff ===

impl Backoff {
    /// Upper bound on the spins issued by a single [`spin`][Backoff::spin]
    /// call; once reached, further calls stay at this budget.
    pub const MAX_SPINS: u32 = 256;

    #[must_use]
    pub const fn new() -> Self {
        Self { spins: 1 }
    }

    /// Burns the current spin budget, then doubles it for the next call.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.spins {
            // Tests, and loom models in particular, need the spinning thread
            // handed back to the scheduler or the model cannot advance the
            // thread it is waiting on.
            // See https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(loom)]
            loom::thread::yield_now();
            #[cfg(all(test, not(loom)))]
            std::thread::yield_now();

            hint::spin_loop();
        }

        self.spins = (self.spins * 2).min(Self::MAX_SPINS);
    }

    /// Whether the budget has reached [`MAX_SPINS`][Backoff::MAX_SPINS].
    /// Callers with a blocking fallback use this as the signal to stop
    /// spinning and park instead.
    #[inline]
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.spins >= Self::MAX_SPINS
    }

    /// Starts the budget over, after the contended operation succeeded.
    #[inline]
    pub fn reset(&mut self) {
        self.spins = 1;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
