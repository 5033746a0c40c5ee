// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::adder::IntAdder;
use crate::iter::{Iter, Keys, Values};
use core::fmt;
use core::sync::atomic::{AtomicI64, Ordering};
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

/// Bucket-head pointer tag marking a bucket as moved to the successor table.
///
/// A redirect is terminal: once a bucket head carries this tag, the bucket is
/// never written again in its table and all traffic proceeds to
/// [`Table::next`].
pub(crate) const REDIRECT: usize = 1;

/// Largest table size; at this capacity the threshold becomes [`NO_RESIZE`]
/// and the table stops growing.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Threshold sentinel: the table is at maximum capacity.
const NO_RESIZE: i64 = -1;
/// Threshold sentinel: a resize is in flight; writers skip threshold checks.
const RESIZING: i64 = -2;

const DEFAULT_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// Avalanches a key with the golden-ratio multiplier plus an xor-shift so
/// that packed-coordinate keys spread over the low index bits.
#[expect(
    clippy::cast_sign_loss,
    reason = "hash mixing treats the key as raw bits"
)]
fn spread(key: i64) -> u64 {
    let h = (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^ (h >> 32)
}

pub(crate) struct Entry<V> {
    pub(crate) key: i64,
    /// Null while this entry is a compute placeholder. A placeholder exists
    /// only while its creator holds the bucket lock and is not observable as
    /// mapped.
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<Entry<V>>,
    /// Writers serialise on the *bucket head's* lock. Every entry carries
    /// one because any entry can become a head.
    lock: Mutex<()>,
}

pub(crate) struct Table<V> {
    pub(crate) buckets: Box<[Atomic<Entry<V>>]>,
    /// Successor table; set before the first bucket of this table redirects.
    pub(crate) next: Atomic<Table<V>>,
}

/// A concurrent `i64 → V` chained hash table with lock-free readers.
///
/// Values are shared with concurrent readers for their whole lifetime, so
/// read operations hand out clones; storing `Arc<T>` keeps that cheap.
///
/// See the [crate docs](crate) for the locking and resize discipline.
pub struct ConcurrentI64Map<V> {
    pub(crate) table: Atomic<Table<V>>,
    /// State machine: a non-negative value is the current resize trigger,
    /// [`NO_RESIZE`] means capacity is at maximum, [`RESIZING`] means a
    /// resize is in flight (at most one at a time).
    threshold: AtomicI64,
    load_factor: f32,
    size: IntAdder,
}

// === impl Entry ===

impl<V> Entry<V> {
    fn new(key: i64) -> Self {
        Self {
            key,
            value: Atomic::null(),
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }

    fn with_value(key: i64, value: Owned<V>) -> Self {
        Self {
            key,
            value: Atomic::from(value),
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }
}

// === impl Table ===

impl<V> Table<V> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            buckets: (0..capacity).map(|_| Atomic::null()).collect(),
            next: Atomic::null(),
        }
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "the index is masked to the table length"
    )]
    pub(crate) fn index(&self, key: i64) -> usize {
        (spread(key) & (self.buckets.len() as u64 - 1)) as usize
    }
}

// === impl ConcurrentI64Map ===

impl<V: Clone + Send + Sync + 'static> ConcurrentI64Map<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_LOAD_FACTOR)
    }

    /// Creates a table with at least `capacity` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `load_factor` is not a positive
    /// finite number.
    #[must_use]
    pub fn with_capacity(capacity: usize, load_factor: f32) -> Self {
        assert!(capacity >= 1, "capacity must be at least 1");
        assert!(
            load_factor.is_finite() && load_factor > 0.0,
            "load factor must be a positive finite number"
        );

        let capacity = capacity.next_power_of_two().min(MAXIMUM_CAPACITY);
        Self {
            table: Atomic::new(Table::new(capacity)),
            threshold: AtomicI64::new(Self::threshold_for(capacity, load_factor)),
            load_factor,
            size: IntAdder::new(),
        }
    }

    /// Creates a table sized so that `expected` insertions do not trigger a
    /// resize.
    ///
    /// # Panics
    ///
    /// Panics if `load_factor` is not a positive finite number.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        reason = "sizing arithmetic, clamped to the valid capacity range"
    )]
    pub fn with_expected(expected: usize, load_factor: f32) -> Self {
        assert!(
            load_factor.is_finite() && load_factor > 0.0,
            "load factor must be a positive finite number"
        );
        let capacity = ((expected as f32 / load_factor) as usize).max(1);
        Self::with_capacity(capacity, load_factor)
    }

    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        reason = "the trigger point does not need float precision"
    )]
    fn threshold_for(capacity: usize, load_factor: f32) -> i64 {
        if capacity >= MAXIMUM_CAPACITY {
            NO_RESIZE
        } else {
            (capacity as f32 * load_factor) as i64
        }
    }

    /// Follows redirects to the bucket currently responsible for `key`,
    /// returning its table, bucket slot, and (untagged) head.
    fn locate<'g>(
        &self,
        key: i64,
        guard: &'g Guard,
    ) -> (&'g Table<V>, &'g Atomic<Entry<V>>, Shared<'g, Entry<V>>) {
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            // Safety: the table pointer is never null and tables are only
            // reclaimed once unreachable from `self.table` and all pins drop.
            let t = unsafe { table.deref() };
            let bucket = &t.buckets[t.index(key)];
            let head = bucket.load(Ordering::SeqCst, guard);
            if head.tag() == REDIRECT {
                table = t.next.load(Ordering::SeqCst, guard);
                continue;
            }
            return (t, bucket, head);
        }
    }

    /// Takes the value allocation back out of an entry that was never
    /// published.
    fn unwrap_value(entry: Owned<Entry<V>>, guard: &Guard) -> Owned<V> {
        let value = entry.value.load(Ordering::Relaxed, guard);
        // Safety: the entry never left this thread, so we exclusively own
        // the value allocation it references.
        unsafe { value.into_owned() }
    }

    fn note_insertion(&self, guard: &Guard) {
        self.size.increment();
        self.check_resize(guard);
    }

    fn check_resize(&self, guard: &Guard) {
        let threshold = self.threshold.load(Ordering::Acquire);
        if threshold < 0 {
            // NO_RESIZE, or another writer is already resizing.
            return;
        }
        if self.size.sum() < threshold {
            return;
        }
        if self
            .threshold
            .compare_exchange(threshold, RESIZING, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            self.resize(guard);
        }
    }

    /// Doubles the table. Exactly one thread runs this at a time (the winner
    /// of the `RESIZING` CAS); readers and writers keep working throughout.
    #[cold]
    fn resize(&self, guard: &Guard) {
        let old_shared = self.table.load(Ordering::SeqCst, guard);
        // Safety: the table pointer is never null, see `locate`.
        let old = unsafe { old_shared.deref() };
        let old_len = old.buckets.len();
        debug_assert!(old_len < MAXIMUM_CAPACITY);
        let new_len = (old_len * 2).min(MAXIMUM_CAPACITY);
        tracing::debug!(old_len, new_len, "growing table");

        let new_table = Owned::new(Table::new(new_len)).into_shared(guard);
        // Publish the successor before any bucket can redirect to it.
        old.next.store(new_table, Ordering::SeqCst);

        for bucket in &old.buckets {
            loop {
                let head = bucket.load(Ordering::SeqCst, guard);
                if head.is_null() {
                    if bucket
                        .compare_exchange(
                            head,
                            Shared::null().with_tag(REDIRECT),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                            guard,
                        )
                        .is_ok()
                    {
                        break;
                    }
                    // Lost against an insert into the empty bucket.
                    continue;
                }

                // Safety: non-null and untagged; only this thread tags heads.
                let head_ref = unsafe { head.deref() };
                let bucket_lock = head_ref.lock.lock();
                if bucket.load(Ordering::SeqCst, guard) != head {
                    drop(bucket_lock);
                    continue;
                }

                // Rebuild the chain into the successor using fresh nodes, so
                // readers still walking this chain observe a stable snapshot.
                // Old buckets i map to successor buckets i and i + old_len,
                // which are unreachable until this bucket redirects, so the
                // target chains need no locking.
                let mut cur = head;
                while let Some(entry) = unsafe { cur.as_ref() } {
                    let value = entry.value.load(Ordering::Relaxed, guard);
                    debug_assert!(
                        !value.is_null(),
                        "placeholders only live under their bucket lock"
                    );
                    // Safety: just allocated above, never null.
                    let nt = unsafe { new_table.deref() };
                    let target = &nt.buckets[nt.index(entry.key)];

                    // The fresh node takes over ownership of the value
                    // allocation; the redirect store below releases it.
                    let fresh = Owned::new(Entry::new(entry.key));
                    fresh.value.store(value, Ordering::Relaxed);
                    fresh
                        .next
                        .store(target.load(Ordering::Relaxed, guard), Ordering::Relaxed);
                    target.store(fresh, Ordering::Relaxed);

                    let next = entry.next.load(Ordering::Relaxed, guard);
                    // Safety: once the bucket redirects no new reader can
                    // reach `cur`; already-pinned readers keep it alive
                    // until they unpin.
                    unsafe { guard.defer_destroy(cur) };
                    cur = next;
                }

                bucket.store(Shared::null().with_tag(REDIRECT), Ordering::SeqCst);
                drop(bucket_lock);
                break;
            }
        }

        self.table.store(new_table, Ordering::SeqCst);
        self.threshold.store(
            Self::threshold_for(new_len, self.load_factor),
            Ordering::SeqCst,
        );

        // Safety: the old table is unreachable now that `self.table` points
        // at the successor and every bucket redirects.
        unsafe { guard.defer_destroy(old_shared) };
    }

    /// Lock-free lookup.
    #[must_use]
    pub fn get(&self, key: i64) -> Option<V> {
        let guard = &epoch::pin();
        let (_, _, head) = self.locate(key, guard);
        let mut cur = head;
        // Safety: entries are reclaimed only after an epoch grace period;
        // the guard above pins this thread.
        while let Some(entry) = unsafe { cur.as_ref() } {
            if entry.key == key {
                let value = entry.value.load(Ordering::SeqCst, guard);
                // Safety: as above; a null value is a placeholder, reported
                // as absent.
                return unsafe { value.as_ref() }.cloned();
            }
            cur = entry.next.load(Ordering::SeqCst, guard);
        }
        None
    }

    #[must_use]
    pub fn get_or_default(&self, key: i64, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    #[must_use]
    pub fn contains_key(&self, key: i64) -> bool {
        let guard = &epoch::pin();
        let (_, _, head) = self.locate(key, guard);
        let mut cur = head;
        // Safety: see `get`.
        while let Some(entry) = unsafe { cur.as_ref() } {
            if entry.key == key {
                return !entry.value.load(Ordering::SeqCst, guard).is_null();
            }
            cur = entry.next.load(Ordering::SeqCst, guard);
        }
        false
    }

    /// Linear scan over all values. O(size).
    #[must_use]
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.values().any(|candidate| &candidate == value)
    }

    /// The number of mappings, clamped to `0..=i32::MAX`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.sum_saturated()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Maps `key` to `value`, returning the previous value if any.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn put(&self, key: i64, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let mut value = Some(Owned::new(value));
        loop {
            let (_, bucket, head) = self.locate(key, guard);

            if head.is_null() {
                let entry = Owned::new(Entry::with_value(key, value.take().expect("value kept")));
                match bucket.compare_exchange(
                    Shared::null(),
                    entry,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => {
                        self.note_insertion(guard);
                        return None;
                    }
                    Err(raced) => {
                        value = Some(Self::unwrap_value(raced.new, guard));
                        continue;
                    }
                }
            }

            // Safety: non-null untagged head, pinned by `guard`.
            let head_ref = unsafe { head.deref() };
            let bucket_lock = head_ref.lock.lock();
            if bucket.load(Ordering::SeqCst, guard) != head {
                drop(bucket_lock);
                continue;
            }

            let mut prev: Option<&Entry<V>> = None;
            let mut cur = head;
            loop {
                // Safety: chain entries stay live under the pin.
                let Some(entry) = (unsafe { cur.as_ref() }) else {
                    // Not found: link a fresh entry at the tail.
                    let entry =
                        Owned::new(Entry::with_value(key, value.take().expect("value kept")));
                    prev.expect("non-empty bucket has a tail")
                        .next
                        .store(entry, Ordering::Release);
                    drop(bucket_lock);
                    self.note_insertion(guard);
                    return None;
                };

                if entry.key == key {
                    let old = entry.value.swap(
                        value.take().expect("value kept"),
                        Ordering::SeqCst,
                        guard,
                    );
                    debug_assert!(!old.is_null(), "placeholders only live under their lock");
                    // Safety: `old` stays live under the pin; it is now
                    // unlinked so deferred destruction is safe.
                    let previous = unsafe { old.deref() }.clone();
                    unsafe { guard.defer_destroy(old) };
                    return Some(previous);
                }

                prev = Some(entry);
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
        }
    }

    /// Maps `key` to `value` unless already mapped; returns the existing
    /// value if there was one.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn put_if_absent(&self, key: i64, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let mut value = Some(Owned::new(value));
        loop {
            let (_, bucket, head) = self.locate(key, guard);

            if head.is_null() {
                let entry = Owned::new(Entry::with_value(key, value.take().expect("value kept")));
                match bucket.compare_exchange(
                    Shared::null(),
                    entry,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => {
                        self.note_insertion(guard);
                        return None;
                    }
                    Err(raced) => {
                        value = Some(Self::unwrap_value(raced.new, guard));
                        continue;
                    }
                }
            }

            // Safety: see `put`.
            let head_ref = unsafe { head.deref() };
            let bucket_lock = head_ref.lock.lock();
            if bucket.load(Ordering::SeqCst, guard) != head {
                drop(bucket_lock);
                continue;
            }

            let mut prev: Option<&Entry<V>> = None;
            let mut cur = head;
            loop {
                // Safety: see `put`.
                let Some(entry) = (unsafe { cur.as_ref() }) else {
                    let entry =
                        Owned::new(Entry::with_value(key, value.take().expect("value kept")));
                    prev.expect("non-empty bucket has a tail")
                        .next
                        .store(entry, Ordering::Release);
                    drop(bucket_lock);
                    self.note_insertion(guard);
                    return None;
                };

                if entry.key == key {
                    let existing = entry.value.load(Ordering::SeqCst, guard);
                    debug_assert!(!existing.is_null());
                    // Safety: see `put`.
                    return Some(unsafe { existing.deref() }.clone());
                }

                prev = Some(entry);
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
        }
    }

    /// Replaces the value for `key` only if it is currently mapped,
    /// returning the previous value.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn replace(&self, key: i64, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let mut value = Some(Owned::new(value));
        loop {
            let (_, bucket, head) = self.locate(key, guard);
            if head.is_null() {
                return None;
            }

            // Safety: see `put`.
            let head_ref = unsafe { head.deref() };
            let bucket_lock = head_ref.lock.lock();
            if bucket.load(Ordering::SeqCst, guard) != head {
                drop(bucket_lock);
                continue;
            }

            let mut cur = head;
            // Safety: see `put`.
            while let Some(entry) = unsafe { cur.as_ref() } {
                if entry.key == key {
                    let old = entry.value.swap(
                        value.take().expect("value kept"),
                        Ordering::SeqCst,
                        guard,
                    );
                    debug_assert!(!old.is_null());
                    // Safety: see `put`.
                    let previous = unsafe { old.deref() }.clone();
                    unsafe { guard.defer_destroy(old) };
                    return Some(previous);
                }
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
            return None;
        }
    }

    /// Replaces the value for `key` only if it currently equals `expected`.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn replace_expected(&self, key: i64, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        let mut value = Some(Owned::new(value));
        loop {
            let (_, bucket, head) = self.locate(key, guard);
            if head.is_null() {
                return false;
            }

            // Safety: see `put`.
            let head_ref = unsafe { head.deref() };
            let bucket_lock = head_ref.lock.lock();
            if bucket.load(Ordering::SeqCst, guard) != head {
                drop(bucket_lock);
                continue;
            }

            let mut cur = head;
            // Safety: see `put`.
            while let Some(entry) = unsafe { cur.as_ref() } {
                if entry.key == key {
                    let current = entry.value.load(Ordering::SeqCst, guard);
                    debug_assert!(!current.is_null());
                    // Safety: see `put`.
                    if unsafe { current.deref() } != expected {
                        return false;
                    }
                    let old = entry.value.swap(
                        value.take().expect("value kept"),
                        Ordering::SeqCst,
                        guard,
                    );
                    // Safety: see `put`.
                    unsafe { guard.defer_destroy(old) };
                    return true;
                }
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
            return false;
        }
    }

    /// Removes `key`, returning its value if it was mapped.
    pub fn remove(&self, key: i64) -> Option<V> {
        self.remove_matching(key, |_| true)
    }

    /// Removes `key` only if its value equals `expected`.
    pub fn remove_expected(&self, key: i64, expected: &V) -> bool
    where
        V: PartialEq,
    {
        self.remove_matching(key, |current| current == expected)
            .is_some()
    }

    /// Removes `key` only if `predicate` approves the current value. The
    /// predicate runs under the bucket lock and is invoked at most once.
    pub fn remove_if(&self, key: i64, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        self.remove_matching(key, predicate)
    }

    fn remove_matching(&self, key: i64, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let guard = &epoch::pin();
        let mut predicate = Some(predicate);
        loop {
            let (_, bucket, head) = self.locate(key, guard);
            if head.is_null() {
                return None;
            }

            // Safety: see `put`.
            let head_ref = unsafe { head.deref() };
            let bucket_lock = head_ref.lock.lock();
            if bucket.load(Ordering::SeqCst, guard) != head {
                drop(bucket_lock);
                continue;
            }

            let mut prev: Option<&Entry<V>> = None;
            let mut cur = head;
            // Safety: see `put`.
            while let Some(entry) = unsafe { cur.as_ref() } {
                if entry.key == key {
                    let value = entry.value.load(Ordering::SeqCst, guard);
                    debug_assert!(!value.is_null());
                    // Safety: see `put`.
                    let value_ref = unsafe { value.deref() };
                    if !(predicate.take().expect("predicate kept"))(value_ref) {
                        return None;
                    }

                    let next = entry.next.load(Ordering::Relaxed, guard);
                    match prev {
                        // Removing the head: publish the shortened chain.
                        None => bucket.store(next, Ordering::SeqCst),
                        Some(prev) => prev.next.store(next, Ordering::Release),
                    }
                    let removed = value_ref.clone();
                    // Safety: both are unlinked; pinned readers keep them
                    // alive until their guards drop.
                    unsafe {
                        guard.defer_destroy(value);
                        guard.defer_destroy(cur);
                    }
                    drop(bucket_lock);
                    self.size.decrement();
                    return Some(removed);
                }
                prev = Some(entry);
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
            return None;
        }
    }

    /// Recomputes the mapping for `key`. The closure sees the current value
    /// (or `None`), runs at most once under the bucket lock, and its return
    /// decides the new state: `Some` maps, `None` unmaps. Returns the value
    /// now mapped.
    ///
    /// Re-entering the same map from inside the closure is undefined.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn compute(&self, key: i64, f: impl FnOnce(Option<&V>) -> Option<V>) -> Option<V> {
        let guard = &epoch::pin();
        let mut f = Some(f);
        loop {
            let (_, bucket, head) = self.locate(key, guard);

            if head.is_null() {
                match self.compute_into_empty(bucket, key, guard, || {
                    (f.take().expect("closure kept"))(None)
                }) {
                    ComputeSlot::Raced => continue,
                    ComputeSlot::Done(result) => return result,
                }
            }

            // Safety: see `put`.
            let head_ref = unsafe { head.deref() };
            let bucket_lock = head_ref.lock.lock();
            if bucket.load(Ordering::SeqCst, guard) != head {
                drop(bucket_lock);
                continue;
            }

            let mut prev: Option<&Entry<V>> = None;
            let mut cur = head;
            loop {
                // Safety: see `put`.
                let Some(entry) = (unsafe { cur.as_ref() }) else {
                    // Absent: the head lock already serialises this bucket.
                    let Some(computed) = (f.take().expect("closure kept"))(None) else {
                        return None;
                    };
                    let result = computed.clone();
                    let entry = Owned::new(Entry::with_value(key, Owned::new(computed)));
                    prev.expect("non-empty bucket has a tail")
                        .next
                        .store(entry, Ordering::Release);
                    drop(bucket_lock);
                    self.note_insertion(guard);
                    return Some(result);
                };

                if entry.key == key {
                    let value = entry.value.load(Ordering::SeqCst, guard);
                    debug_assert!(!value.is_null());
                    // Safety: see `put`.
                    let value_ref = unsafe { value.deref() };
                    match (f.take().expect("closure kept"))(Some(value_ref)) {
                        Some(updated) => {
                            let result = updated.clone();
                            let old =
                                entry
                                    .value
                                    .swap(Owned::new(updated), Ordering::SeqCst, guard);
                            // Safety: see `put`.
                            unsafe { guard.defer_destroy(old) };
                            return Some(result);
                        }
                        None => {
                            let next = entry.next.load(Ordering::Relaxed, guard);
                            match prev {
                                None => bucket.store(next, Ordering::SeqCst),
                                Some(prev) => prev.next.store(next, Ordering::Release),
                            }
                            // Safety: see `remove_matching`.
                            unsafe {
                                guard.defer_destroy(value);
                                guard.defer_destroy(cur);
                            }
                            drop(bucket_lock);
                            self.size.decrement();
                            return None;
                        }
                    }
                }

                prev = Some(entry);
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
        }
    }

    /// Maps `key` to the computed value if absent; returns the value now
    /// mapped. The closure runs at most once, under the bucket lock.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn compute_if_absent(&self, key: i64, f: impl FnOnce() -> V) -> V {
        let guard = &epoch::pin();
        let mut f = Some(f);
        loop {
            let (_, bucket, head) = self.locate(key, guard);

            if head.is_null() {
                match self.compute_into_empty(bucket, key, guard, || {
                    Some((f.take().expect("closure kept"))())
                }) {
                    ComputeSlot::Raced => continue,
                    ComputeSlot::Done(result) => return result.expect("closure returned a value"),
                }
            }

            // Safety: see `put`.
            let head_ref = unsafe { head.deref() };
            let bucket_lock = head_ref.lock.lock();
            if bucket.load(Ordering::SeqCst, guard) != head {
                drop(bucket_lock);
                continue;
            }

            let mut prev: Option<&Entry<V>> = None;
            let mut cur = head;
            loop {
                // Safety: see `put`.
                let Some(entry) = (unsafe { cur.as_ref() }) else {
                    let computed = (f.take().expect("closure kept"))();
                    let result = computed.clone();
                    let entry = Owned::new(Entry::with_value(key, Owned::new(computed)));
                    prev.expect("non-empty bucket has a tail")
                        .next
                        .store(entry, Ordering::Release);
                    drop(bucket_lock);
                    self.note_insertion(guard);
                    return result;
                };

                if entry.key == key {
                    let value = entry.value.load(Ordering::SeqCst, guard);
                    debug_assert!(!value.is_null());
                    // Safety: see `put`.
                    return unsafe { value.deref() }.clone();
                }

                prev = Some(entry);
                cur = entry.next.load(Ordering::Relaxed, guard);
            }
        }
    }

    /// Recomputes the mapping for `key` only if it is currently mapped.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn compute_if_present(&self, key: i64, f: impl FnOnce(&V) -> Option<V>) -> Option<V> {
        let mut f = Some(f);
        self.compute(key, move |current| {
            current.and_then(|value| (f.take().expect("closure kept"))(value))
        })
    }

    /// Maps `key` to `value` if absent, otherwise remaps it to
    /// `f(current, value)` (`None` unmaps). Returns the value now mapped.
    #[expect(clippy::missing_panics_doc, reason = "internal assertions")]
    pub fn merge(&self, key: i64, value: V, f: impl FnOnce(&V, V) -> Option<V>) -> Option<V> {
        let mut state = Some((value, f));
        self.compute(key, move |current| {
            let (value, f) = state.take().expect("closure kept");
            match current {
                None => Some(value),
                Some(existing) => f(existing, value),
            }
        })
    }

    /// Runs a compute against an empty bucket by installing a pre-locked
    /// placeholder head, so there is a monitor to serialise on before the
    /// user closure produces (or declines to produce) a value.
    fn compute_into_empty(
        &self,
        bucket: &Atomic<Entry<V>>,
        key: i64,
        guard: &Guard,
        f: impl FnOnce() -> Option<V>,
    ) -> ComputeSlot<V> {
        let placeholder = Owned::new(Entry::new(key)).into_shared(guard);
        // Safety: not yet published; we are the exclusive owner.
        let ph = unsafe { placeholder.deref() };
        // Uncontended: the entry is unpublished. Holding the lock across the
        // CAS means any writer that sees this head blocks until the closure
        // settled the placeholder one way or the other.
        let ph_lock = ph.lock.lock();

        if bucket
            .compare_exchange(
                Shared::null(),
                placeholder,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            )
            .is_err()
        {
            drop(ph_lock);
            // Safety: never published.
            drop(unsafe { placeholder.into_owned() });
            return ComputeSlot::Raced;
        }

        // If the closure panics the placeholder must be erased before the
        // lock releases, otherwise writers blocked on it would observe a
        // mapped-looking head with no value.
        let mut erase = ErasePlaceholder {
            bucket,
            placeholder,
            guard,
            armed: true,
        };

        let result = match f() {
            Some(computed) => {
                erase.armed = false;
                let result = computed.clone();
                ph.value.store(Owned::new(computed), Ordering::SeqCst);
                Some(result)
            }
            // Leave `erase` armed: the placeholder is atomically taken back
            // out before the lock releases.
            None => None,
        };

        drop(erase);
        drop(ph_lock);
        if result.is_some() {
            self.note_insertion(guard);
        }
        ComputeSlot::Done(result)
    }

    /// Removes every mapping. Deliberately non-atomic: writes that race with
    /// the sweep may or may not survive it.
    pub fn clear(&self) {
        for (key, _) in self.iter() {
            self.remove(key);
        }
    }

    /// Iterates `(key, value)` pairs. The iterator sees every key that was
    /// live at creation and not removed since; insertions made while
    /// iterating may or may not be observed. Follows resize redirects.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, V> {
        Iter::new(self)
    }

    #[must_use]
    pub fn keys(&self) -> Keys<'_, V> {
        Keys::new(self)
    }

    #[must_use]
    pub fn values(&self) -> Values<'_, V> {
        Values::new(self)
    }
}

enum ComputeSlot<V> {
    /// Lost the empty-bucket CAS; the caller re-resolves the bucket.
    Raced,
    Done(Option<V>),
}

/// Erases a placeholder head on drop unless disarmed; keeps the compute
/// family exception-safe (a panicking closure unmaps the placeholder before
/// the bucket lock releases).
struct ErasePlaceholder<'a, 'g, V> {
    bucket: &'a Atomic<Entry<V>>,
    placeholder: Shared<'g, Entry<V>>,
    guard: &'g Guard,
    armed: bool,
}

impl<V> Drop for ErasePlaceholder<'_, '_, V> {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.store(Shared::null(), Ordering::SeqCst);
            // Safety: unlinked above; pinned readers keep it alive until
            // their guards drop.
            unsafe { self.guard.defer_destroy(self.placeholder) };
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for ConcurrentI64Map<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> fmt::Debug for ConcurrentI64Map<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentI64Map")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

impl<V> Drop for ConcurrentI64Map<V> {
    fn drop(&mut self) {
        // Safety: `&mut self` rules out concurrent access, so immediate
        // destruction instead of deferral is sound throughout.
        unsafe {
            let guard = epoch::unprotected();
            let mut table = self.table.load(Ordering::Relaxed, guard);
            while let Some(t) = table.as_ref() {
                for bucket in &t.buckets {
                    let head = bucket.load(Ordering::Relaxed, guard);
                    if head.tag() == REDIRECT {
                        // This chain was rebuilt into the successor; the old
                        // nodes are owned by the epoch collector.
                        continue;
                    }
                    let mut cur = head;
                    while let Some(entry) = cur.as_ref() {
                        let value = entry.value.load(Ordering::Relaxed, guard);
                        if !value.is_null() {
                            drop(value.into_owned());
                        }
                        let next = entry.next.load(Ordering::Relaxed, guard);
                        drop(cur.into_owned());
                        cur = next;
                    }
                }
                let next = t.next.load(Ordering::Relaxed, guard);
                drop(table.into_owned());
                table = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    #[test]
    fn put_get_remove_roundtrip() {
        let map = ConcurrentI64Map::new();
        assert!(map.is_empty());

        assert_eq!(map.put(1, "a"), None);
        assert_eq!(map.put(1, "b"), Some("a"));
        assert_eq!(map.get(1), Some("b"));
        assert!(map.contains_key(1));
        assert_eq!(map.size(), 1);

        assert_eq!(map.remove(1), Some("b"));
        assert_eq!(map.remove(1), None);
        assert!(!map.contains_key(1));
        assert!(map.is_empty());
    }

    #[test]
    fn negative_keys_are_ordinary_keys() {
        let map = ConcurrentI64Map::new();
        map.put(i64::MIN, 1_u32);
        map.put(-1, 2);
        map.put(0, 3);
        map.put(i64::MAX, 4);
        assert_eq!(map.get(i64::MIN), Some(1));
        assert_eq!(map.get(-1), Some(2));
        assert_eq!(map.get(0), Some(3));
        assert_eq!(map.get(i64::MAX), Some(4));
    }

    #[test]
    fn put_if_absent_keeps_the_first_value() {
        let map = ConcurrentI64Map::new();
        assert_eq!(map.put_if_absent(7, "first"), None);
        assert_eq!(map.put_if_absent(7, "second"), Some("first"));
        assert_eq!(map.get(7), Some("first"));
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn replace_only_touches_mapped_keys() {
        let map = ConcurrentI64Map::new();
        assert_eq!(map.replace(3, 30), None);
        assert!(!map.contains_key(3));

        map.put(3, 1);
        assert_eq!(map.replace(3, 30), Some(1));

        assert!(!map.replace_expected(3, &99, 40));
        assert_eq!(map.get(3), Some(30));
        assert!(map.replace_expected(3, &30, 40));
        assert_eq!(map.get(3), Some(40));
    }

    #[test]
    fn remove_expected_and_remove_if() {
        let map = ConcurrentI64Map::new();
        map.put(5, 50);
        assert!(!map.remove_expected(5, &51));
        assert!(map.remove_expected(5, &50));

        map.put(6, 60);
        assert_eq!(map.remove_if(6, |v| *v > 100), None);
        assert_eq!(map.get(6), Some(60));
        assert_eq!(map.remove_if(6, |v| *v == 60), Some(60));
        assert!(map.is_empty());
    }

    #[test]
    fn compute_covers_all_transitions() {
        let map = ConcurrentI64Map::new();

        // absent -> absent
        assert_eq!(map.compute(1, |v| v.copied()), None);
        assert!(!map.contains_key(1));

        // absent -> mapped (empty bucket, placeholder path)
        assert_eq!(map.compute(1, |_| Some(10)), Some(10));
        assert_eq!(map.get(1), Some(10));
        assert_eq!(map.size(), 1);

        // mapped -> mapped
        assert_eq!(map.compute(1, |v| v.map(|v| v + 1)), Some(11));

        // mapped -> absent
        assert_eq!(map.compute(1, |_| None), None);
        assert!(!map.contains_key(1));
        assert_eq!(map.size(), 0);
    }

    #[test]
    fn compute_if_absent_runs_at_most_once() {
        let map = ConcurrentI64Map::new();
        let ran = AtomicBool::new(false);

        assert_eq!(
            map.compute_if_absent(2, || {
                ran.store(true, AtomicOrdering::Relaxed);
                20
            }),
            20
        );
        assert!(ran.load(AtomicOrdering::Relaxed));

        // Present: the closure must not run again.
        assert_eq!(map.compute_if_absent(2, || panic!("must not run")), 20);
    }

    #[test]
    fn compute_if_present_skips_absent_keys() {
        let map = ConcurrentI64Map::new();
        assert_eq!(map.compute_if_present(9, |_| Some(1)), None);
        map.put(9, 90);
        assert_eq!(map.compute_if_present(9, |v| Some(v + 1)), Some(91));
        assert_eq!(map.compute_if_present(9, |_| None), None);
        assert!(!map.contains_key(9));
    }

    #[test]
    fn merge_inserts_then_remaps() {
        let map = ConcurrentI64Map::new();
        assert_eq!(map.merge(4, 1, |old, new| Some(old + new)), Some(1));
        assert_eq!(map.merge(4, 2, |old, new| Some(old + new)), Some(3));
        assert_eq!(map.merge(4, 0, |_, _| None), None);
        assert!(!map.contains_key(4));
    }

    #[test]
    fn panicking_compute_erases_the_placeholder() {
        let map: ConcurrentI64Map<u32> = ConcurrentI64Map::new();

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            map.compute(42, |_| panic!("user closure failed"));
        }));
        assert!(panicked.is_err());

        // The aborted call left no trace and the bucket is fully usable.
        assert!(!map.contains_key(42));
        assert_eq!(map.size(), 0);
        assert_eq!(map.put(42, 1), None);
        assert_eq!(map.get(42), Some(1));
    }

    #[test]
    fn grows_past_the_initial_capacity() {
        let map = ConcurrentI64Map::with_capacity(2, 0.75);
        for key in 0..1_000 {
            map.put(key, key * 2);
        }
        assert_eq!(map.size(), 1_000);
        for key in 0..1_000 {
            assert_eq!(map.get(key), Some(key * 2), "lost key {key}");
        }
    }

    #[test]
    fn threshold_pins_at_maximum_capacity() {
        assert_eq!(
            ConcurrentI64Map::<u32>::threshold_for(MAXIMUM_CAPACITY, 0.75),
            NO_RESIZE
        );
        assert_eq!(ConcurrentI64Map::<u32>::threshold_for(16, 0.75), 12);
    }

    #[test]
    fn iterator_sees_preexisting_keys_and_skips_none() {
        let map = ConcurrentI64Map::new();
        for key in 0..500 {
            map.put(key, key);
        }

        let mut seen: Vec<i64> = map.keys().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());

        assert!(map.contains_value(&123));
        assert!(!map.contains_value(&1_000));
    }

    #[test]
    fn clear_empties_the_map() {
        let map = ConcurrentI64Map::new();
        for key in 0..100 {
            map.put(key, key);
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn concurrent_inserts_with_readers_on_a_fixed_key() {
        const WRITERS: i64 = 4;
        const PER_WRITER: i64 = 5_000;
        const HOT_KEY: i64 = 12_345;

        let map = Arc::new(ConcurrentI64Map::with_capacity(2, 0.75));
        let stop = Arc::new(AtomicBool::new(false));

        map.put(HOT_KEY, u64::MAX);

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let map = map.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let mut reads = 0_u64;
                    while !stop.load(AtomicOrdering::Relaxed) {
                        // The hot key must stay visible through every resize.
                        assert_eq!(map.get(HOT_KEY), Some(u64::MAX));
                        assert!(map.contains_key(HOT_KEY));
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        let key = w * PER_WRITER + i;
                        #[expect(clippy::cast_sign_loss, reason = "test keys are non-negative")]
                        map.put(key, key as u64);
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, AtomicOrdering::Relaxed);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }

        // One extra mapping for the hot key (outside the writers' key range).
        assert_eq!(map.size(), usize::try_from(WRITERS * PER_WRITER).unwrap() + 1);
        for key in 0..WRITERS * PER_WRITER {
            #[expect(clippy::cast_sign_loss, reason = "test keys are non-negative")]
            let expected = key as u64;
            assert_eq!(map.get(key), Some(expected), "lost key {key}");
        }
    }

    #[test]
    fn concurrent_disjoint_removals() {
        let map = Arc::new(ConcurrentI64Map::with_capacity(2, 0.75));
        for key in 0..8_000 {
            map.put(key, key);
        }

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for key in (t..8_000).step_by(4) {
                        assert_eq!(map.remove(key), Some(key));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(i64, u32),
        PutIfAbsent(i64, u32),
        Remove(i64),
        Replace(i64, u32),
        Merge(i64, u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        // A narrow key range forces chain collisions and head removals.
        let key = -8_i64..8;
        prop_oneof![
            (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
            (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
            key.clone().prop_map(Op::Remove),
            (key.clone(), any::<u32>()).prop_map(|(k, v)| Op::Replace(k, v)),
            (key, any::<u32>()).prop_map(|(k, v)| Op::Merge(k, v)),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_hash_map(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let map = ConcurrentI64Map::with_capacity(2, 0.75);
            let mut model: HashMap<i64, u32> = HashMap::new();

            for op in ops {
                match op {
                    Op::Put(k, v) => {
                        prop_assert_eq!(map.put(k, v), model.insert(k, v));
                    }
                    Op::PutIfAbsent(k, v) => {
                        let expected = model.get(&k).copied();
                        prop_assert_eq!(map.put_if_absent(k, v), expected);
                        model.entry(k).or_insert(v);
                    }
                    Op::Remove(k) => {
                        prop_assert_eq!(map.remove(k), model.remove(&k));
                    }
                    Op::Replace(k, v) => {
                        let expected = model.get(&k).copied();
                        prop_assert_eq!(map.replace(k, v), expected);
                        if let std::collections::hash_map::Entry::Occupied(mut entry) = model.entry(k) {
                            entry.insert(v);
                        }
                    }
                    Op::Merge(k, v) => {
                        let merged = map.merge(k, v, |old, new| Some(old.wrapping_add(new)));
                        let expected = match model.entry(k) {
                            std::collections::hash_map::Entry::Occupied(mut entry) => {
                                let updated = entry.get().wrapping_add(v);
                                entry.insert(updated);
                                Some(updated)
                            }
                            std::collections::hash_map::Entry::Vacant(entry) => {
                                entry.insert(v);
                                Some(v)
                            }
                        };
                        prop_assert_eq!(merged, expected);
                    }
                }
            }

            prop_assert_eq!(map.size(), model.len());
            for (k, v) in &model {
                prop_assert_eq!(map.get(*k), Some(*v));
            }
            let mut contents: Vec<(i64, u32)> = map.iter().collect();
            contents.sort_unstable();
            let mut expected: Vec<(i64, u32)> = model.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(contents, expected);
        }
    }
}
