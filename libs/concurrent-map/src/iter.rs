// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::map::{ConcurrentI64Map, Entry, REDIRECT, Table};
use core::marker::PhantomData;
use core::sync::atomic::Ordering;
use crossbeam::epoch::{self, Guard};

/// Iterator over `(key, value)` pairs.
///
/// Carries a stack of `(table, index, increment)` frames: crossing a
/// redirect pushes the successor table with `increment` set to the
/// redirecting table's length (an old bucket `i` spreads to successor
/// buckets `i` and `i + old_len`), and exhausting a table pops. The iterator
/// sees every key live at creation that is not removed while iterating, may
/// see later insertions, and skips placeholder entries.
pub struct Iter<'m, V> {
    /// Raw cursors below stay valid for as long as this guard pins the
    /// epoch, which is the iterator's whole lifetime.
    guard: Guard,
    frames: Vec<Frame<V>>,
    /// Next entry to visit in the current chain.
    cursor: *const Entry<V>,
    _map: PhantomData<&'m ConcurrentI64Map<V>>,
}

struct Frame<V> {
    table: *const Table<V>,
    index: usize,
    increment: usize,
}

// === impl Iter ===

impl<'m, V: Clone + Send + Sync + 'static> Iter<'m, V> {
    pub(crate) fn new(map: &'m ConcurrentI64Map<V>) -> Self {
        let guard = epoch::pin();
        let table = map.table.load(Ordering::SeqCst, &guard).as_raw();
        Self {
            guard,
            frames: vec![Frame {
                table,
                index: 0,
                increment: 1,
            }],
            cursor: core::ptr::null(),
            _map: PhantomData,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Iterator for Iter<'_, V> {
    type Item = (i64, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.cursor.is_null() {
                // Safety: entries are reclaimed only after an epoch grace
                // period; `self.guard` pins this thread for the iterator's
                // lifetime.
                let entry = unsafe { &*self.cursor };
                self.cursor = entry.next.load(Ordering::SeqCst, &self.guard).as_raw();

                let value = entry.value.load(Ordering::SeqCst, &self.guard);
                // Safety: as above. Null values are placeholders and skipped.
                if let Some(value) = unsafe { value.as_ref() } {
                    return Some((entry.key, value.clone()));
                }
                continue;
            }

            let frame = self.frames.last_mut()?;
            // Safety: tables are reclaimed only after all pins drop.
            let table = unsafe { &*frame.table };
            if frame.index >= table.buckets.len() {
                self.frames.pop();
                continue;
            }

            let index = frame.index;
            frame.index += frame.increment;

            let head = table.buckets[index].load(Ordering::SeqCst, &self.guard);
            if head.tag() == REDIRECT {
                let successor = table.next.load(Ordering::SeqCst, &self.guard).as_raw();
                let increment = table.buckets.len();
                self.frames.push(Frame {
                    table: successor,
                    index,
                    increment,
                });
                continue;
            }
            self.cursor = head.as_raw();
        }
    }
}

/// Iterator over keys. See [`Iter`] for the visibility guarantees.
pub struct Keys<'m, V>(Iter<'m, V>);

impl<'m, V: Clone + Send + Sync + 'static> Keys<'m, V> {
    pub(crate) fn new(map: &'m ConcurrentI64Map<V>) -> Self {
        Self(Iter::new(map))
    }
}

impl<V: Clone + Send + Sync + 'static> Iterator for Keys<'_, V> {
    type Item = i64;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(key, _)| key)
    }
}

/// Iterator over values. See [`Iter`] for the visibility guarantees.
pub struct Values<'m, V>(Iter<'m, V>);

impl<'m, V: Clone + Send + Sync + 'static> Values<'m, V> {
    pub(crate) fn new(map: &'m ConcurrentI64Map<V>) -> Self {
        Self(Iter::new(map))
    }
}

impl<V: Clone + Send + Sync + 'static> Iterator for Values<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(_, value)| value)
    }
}
