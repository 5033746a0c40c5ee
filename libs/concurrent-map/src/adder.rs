// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::sync::atomic::{AtomicI64, Ordering};
use util::CachePadded;

/// A striped counter for contended size accounting.
///
/// The count is sharded across one cache-padded cell per hardware thread;
/// each thread picks its cell through a thread-local probe that is rehashed
/// when a CAS on the chosen cell fails. [`sum`][IntAdder::sum] is the total
/// across all cells and is only guaranteed to be accurate when no concurrent
/// updates are in flight.
#[derive(Debug)]
pub struct IntAdder {
    cells: Box<[CachePadded<AtomicI64>]>,
}

std::thread_local! {
    /// Per-thread stripe probe. Seeded randomly so fresh threads spread out
    /// instead of piling onto cell zero.
    static PROBE: Cell<u64> = Cell::new(fastrand::u64(1..));
}

/// xorshift step used to move a probe to a new stripe after contention.
fn rehash(probe: u64) -> u64 {
    let mut p = probe;
    p ^= p << 13;
    p ^= p >> 17;
    p ^= p << 5;
    p
}

// === impl IntAdder ===

impl IntAdder {
    #[must_use]
    pub fn new() -> Self {
        let stripes = std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .next_power_of_two();
        Self {
            cells: (0..stripes)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
        }
    }

    pub fn add(&self, delta: i64) {
        let mask = self.cells.len() as u64 - 1;
        PROBE.with(|probe| {
            let p = probe.get();
            #[expect(
                clippy::cast_possible_truncation,
                reason = "the cell index is masked to the stripe count"
            )]
            let cell = &self.cells[(p & mask) as usize];
            let current = cell.load(Ordering::Relaxed);
            if cell
                .compare_exchange(
                    current,
                    current.wrapping_add(delta),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                // Contended; move this thread to a different stripe and
                // settle the update with an unconditional add.
                let p = rehash(p);
                probe.set(p);
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "the cell index is masked to the stripe count"
                )]
                let cell = &self.cells[(p & mask) as usize];
                cell.fetch_add(delta, Ordering::SeqCst);
            }
        });
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Sum of all cells. May be transiently negative or stale under
    /// concurrent updates.
    #[must_use]
    pub fn sum(&self) -> i64 {
        self.cells
            .iter()
            .map(|cell| cell.load(Ordering::SeqCst))
            .fold(0_i64, i64::wrapping_add)
    }

    /// The sum clamped to `0..=i32::MAX`, the shape size queries report.
    #[must_use]
    pub fn sum_saturated(&self) -> usize {
        #[expect(
            clippy::cast_sign_loss,
            reason = "the sum is clamped to a non-negative range first"
        )]
        {
            self.sum().clamp(0, i64::from(i32::MAX)) as usize
        }
    }
}

impl Default for IntAdder {
    fn default() -> Self {
        Self::new()
    }
}
