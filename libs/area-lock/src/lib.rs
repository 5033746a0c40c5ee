// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A reentrant 2-D range lock over a grid of section coordinates.
//!
//! A thread locks an inclusive rectangle of sections; overlapping rectangles
//! from different threads serialise on at least one shared cell, while
//! disjoint rectangles never contend. A thread that already holds an area
//! may re-lock any subset of it at no cost; *partially* overlapping its own
//! holdings while also having to wait on another thread is a programming
//! error and panics.
//!
//! Ownership is tracked in a [`ConcurrentI64Map`] from packed cell
//! coordinates to the acquiring node, which makes the map's `put_if_absent`
//! the entire acquisition primitive.

mod waiters;

use concurrent_map::ConcurrentI64Map;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use util::Backoff;
use waiters::Waiters;

/// Packs a cell coordinate pair into the map key.
fn pack(cx: i32, cz: i32) -> i64 {
    (i64::from(cx) << 32) | (i64::from(cz) & 0xFFFF_FFFF)
}

/// Owner record for every cell a single acquisition holds.
struct AreaNode {
    owner: ThreadId,
    waiters: Waiters,
}

// === impl AreaNode ===

impl AreaNode {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            waiters: Waiters::new(),
        })
    }
}

/// Holds the acquired cells of one `lock`/`try_lock` call; released on drop
/// or through [`ReentrantAreaLock::unlock`].
#[must_use = "dropping the guard releases the area"]
pub struct AreaGuard<'l> {
    lock: &'l ReentrantAreaLock,
    node: Arc<AreaNode>,
    /// Only the cells this call actually inserted; cells already held by
    /// this thread through an enclosing guard stay owned by that guard.
    cells: Vec<i64>,
}

// === impl AreaGuard ===

impl AreaGuard<'_> {
    /// Number of cells this guard owns.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

impl Drop for AreaGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.node, &self.cells);
    }
}

/// Outcome of one acquisition walk.
enum Acquire {
    Acquired,
    Conflict {
        blocker: Arc<AreaNode>,
        /// Whether the walk also hit cells already held by this thread.
        reentered: bool,
    },
}

/// The range lock itself. See the [module docs](self).
pub struct ReentrantAreaLock {
    shift: u32,
    owners: ConcurrentI64Map<Arc<AreaNode>>,
}

// === impl ReentrantAreaLock ===

impl ReentrantAreaLock {
    /// Failure counts bounding the spin, micro-park, and long-park phases of
    /// the blocking backoff ladder.
    const SPIN_FAILURES: u64 = 128;
    const MICRO_PARK_FAILURES: u64 = 1_200;

    /// Creates a lock where cells are coordinates divided by
    /// `2^coordinate_shift`.
    ///
    /// # Panics
    ///
    /// Panics if `coordinate_shift` is 32 or larger.
    #[must_use]
    pub fn new(coordinate_shift: u32) -> Self {
        assert!(coordinate_shift < 32, "coordinate shift out of range");
        Self {
            shift: coordinate_shift,
            owners: ConcurrentI64Map::new(),
        }
    }

    fn section(&self, coord: i32) -> i32 {
        coord >> self.shift
    }

    /// Attempts to lock the single cell containing `(x, z)`.
    #[must_use]
    pub fn try_lock(&self, x: i32, z: i32) -> Option<AreaGuard<'_>> {
        self.try_lock_area(x, z, x, z)
    }

    /// Attempts to lock the square of radius `radius` around `(cx, cz)`.
    ///
    /// # Panics
    ///
    /// Panics if `radius` is negative.
    #[must_use]
    pub fn try_lock_radius(&self, cx: i32, cz: i32, radius: i32) -> Option<AreaGuard<'_>> {
        assert!(radius >= 0, "radius must be non-negative");
        self.try_lock_area(
            cx.saturating_sub(radius),
            cz.saturating_sub(radius),
            cx.saturating_add(radius),
            cz.saturating_add(radius),
        )
    }

    /// Attempts to lock the inclusive rectangle `(x1, z1)..=(x2, z2)`,
    /// returning `None` without waiting if any cell is held by another
    /// thread.
    ///
    /// # Panics
    ///
    /// Panics if `x1 > x2` or `z1 > z2`.
    #[must_use]
    pub fn try_lock_area(&self, x1: i32, z1: i32, x2: i32, z2: i32) -> Option<AreaGuard<'_>> {
        assert!(x1 <= x2 && z1 <= z2, "impossible area range");

        let node = AreaNode::new();
        let mut cells = Vec::new();
        match self.walk(&node, x1, z1, x2, z2, &mut cells) {
            Acquire::Acquired => Some(AreaGuard {
                lock: self,
                node,
                cells,
            }),
            Acquire::Conflict { .. } => {
                self.undo(&node, &mut cells);
                None
            }
        }
    }

    /// Locks the single cell containing `(x, z)`, waiting as long as another
    /// thread holds it.
    pub fn lock(&self, x: i32, z: i32) -> AreaGuard<'_> {
        self.lock_area(x, z, x, z)
    }

    /// Locks the square of radius `radius` around `(cx, cz)`.
    ///
    /// # Panics
    ///
    /// Panics if `radius` is negative; see [`lock_area`][Self::lock_area]
    /// for the contention panics.
    pub fn lock_radius(&self, cx: i32, cz: i32, radius: i32) -> AreaGuard<'_> {
        assert!(radius >= 0, "radius must be non-negative");
        self.lock_area(
            cx.saturating_sub(radius),
            cz.saturating_sub(radius),
            cx.saturating_add(radius),
            cz.saturating_add(radius),
        )
    }

    /// Locks the inclusive rectangle `(x1, z1)..=(x2, z2)`, waiting for
    /// conflicting holders to release.
    ///
    /// # Panics
    ///
    /// Panics if `x1 > x2` or `z1 > z2`, or on an intersecting-areas
    /// violation: the calling thread already holds part (but not all) of the
    /// requested rectangle while another thread holds some of the rest.
    /// The contract forbids partial-overlap acquisition because waiting in
    /// that state can deadlock.
    pub fn lock_area(&self, x1: i32, z1: i32, x2: i32, z2: i32) -> AreaGuard<'_> {
        assert!(x1 <= x2 && z1 <= z2, "impossible area range");

        let node = AreaNode::new();
        let mut cells = Vec::new();
        let mut boff = Backoff::new();
        let mut failures = 0_u64;

        loop {
            match self.walk(&node, x1, z1, x2, z2, &mut cells) {
                Acquire::Acquired => {
                    return AreaGuard {
                        lock: self,
                        node,
                        cells,
                    };
                }
                Acquire::Conflict { blocker, reentered } => {
                    let inserted_any = !cells.is_empty();
                    self.undo(&node, &mut cells);

                    assert!(
                        !reentered,
                        "intersecting areas: partial overlap with cells already held by this thread"
                    );

                    self.wait_for(&blocker, &mut boff, failures);
                    failures += 1;

                    // The undo closed our waiter list; other threads must be
                    // able to park on us again before the next attempt.
                    if inserted_any {
                        self.node_allow_adds(&node);
                    }
                }
            }
        }
    }

    /// Whether the calling thread holds the cell containing `(x, z)`.
    #[must_use]
    pub fn is_held_by_current_thread(&self, x: i32, z: i32) -> bool {
        let key = pack(self.section(x), self.section(z));
        self.owners
            .get(key)
            .is_some_and(|node| node.owner == thread::current().id())
    }

    /// Whether the calling thread holds every cell of the inclusive
    /// rectangle.
    ///
    /// # Panics
    ///
    /// Panics if `x1 > x2` or `z1 > z2`.
    #[must_use]
    pub fn is_area_held_by_current_thread(&self, x1: i32, z1: i32, x2: i32, z2: i32) -> bool {
        assert!(x1 <= x2 && z1 <= z2, "impossible area range");
        let me = thread::current().id();
        for cx in self.section(x1)..=self.section(x2) {
            for cz in self.section(z1)..=self.section(z2) {
                let held = self
                    .owners
                    .get(pack(cx, cz))
                    .is_some_and(|node| node.owner == me);
                if !held {
                    return false;
                }
            }
        }
        true
    }

    /// Releases a guard obtained from this lock.
    ///
    /// Dropping the guard is equivalent; this form exists to make the
    /// release point explicit and to catch cross-lock misuse.
    ///
    /// # Panics
    ///
    /// Panics if the guard was issued by a different lock instance.
    pub fn unlock(&self, guard: AreaGuard<'_>) {
        assert!(
            core::ptr::eq(self, guard.lock),
            "unlock against a different lock instance"
        );
        drop(guard);
    }

    /// Row-major `put_if_absent` walk over the rectangle. Cells already held
    /// by this thread (through an enclosing guard) are skipped; a cell held
    /// by another thread aborts the walk.
    fn walk(
        &self,
        node: &Arc<AreaNode>,
        x1: i32,
        z1: i32,
        x2: i32,
        z2: i32,
        cells: &mut Vec<i64>,
    ) -> Acquire {
        let mut reentered = false;
        for cx in self.section(x1)..=self.section(x2) {
            for cz in self.section(z1)..=self.section(z2) {
                let key = pack(cx, cz);
                match self.owners.put_if_absent(key, Arc::clone(node)) {
                    None => cells.push(key),
                    Some(existing) => {
                        if existing.owner == node.owner {
                            reentered = true;
                            continue;
                        }
                        return Acquire::Conflict {
                            blocker: existing,
                            reentered,
                        };
                    }
                }
            }
        }
        Acquire::Acquired
    }

    /// Removes every cell this walk inserted and wakes any thread that
    /// parked on the candidate node in the meantime. A walk that inserted
    /// nothing never published the node, so there is nothing to remove or
    /// wake.
    fn undo(&self, node: &Arc<AreaNode>, cells: &mut Vec<i64>) {
        if cells.is_empty() {
            return;
        }
        for key in cells.drain(..) {
            let removed = self
                .owners
                .remove_if(key, |candidate| Arc::ptr_eq(candidate, node));
            assert!(
                removed.is_some(),
                "area lock invariant violated: cell {key:#x} no longer maps to its owner"
            );
        }
        node.waiters.close_and_wake();
    }

    fn release(&self, node: &Arc<AreaNode>, cells: &[i64]) {
        for &key in cells {
            let removed = self
                .owners
                .remove_if(key, |candidate| Arc::ptr_eq(candidate, node));
            assert!(
                removed.is_some(),
                "area lock invariant violated: cell {key:#x} no longer maps to its owner"
            );
        }
        node.waiters.close_and_wake();
    }

    fn node_allow_adds(&self, node: &Arc<AreaNode>) {
        node.waiters.allow_adds();
    }

    /// Scaling backoff against the blocking node: busy spin first, then
    /// micro-parks, then yield plus parks growing with the failure count.
    /// Registration happens before parking so the blocker's release wakes us;
    /// a closed waiter list means the blocker is already on its way out.
    fn wait_for(&self, blocker: &Arc<AreaNode>, boff: &mut Backoff, failures: u64) {
        if failures < Self::SPIN_FAILURES {
            boff.spin();
        } else if failures < Self::MICRO_PARK_FAILURES {
            if failures == Self::SPIN_FAILURES {
                tracing::trace!(failures, "area lock contended, moving to parking");
            }
            if blocker.waiters.add(thread::current()) {
                thread::park_timeout(Duration::from_micros(1));
            }
        } else {
            thread::yield_now();
            if blocker.waiters.add(thread::current()) {
                thread::park_timeout(Duration::from_micros(100).saturating_mul(
                    u32::try_from(failures).unwrap_or(u32::MAX),
                ));
            }
        }
    }
}

impl core::fmt::Debug for ReentrantAreaLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReentrantAreaLock")
            .field("shift", &self.shift)
            .field("held_cells", &self.owners.size())
            .finish()
    }
}
