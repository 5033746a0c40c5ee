// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use parking_lot::Mutex;
use std::thread::Thread;

/// Threads parked on an area node, waiting for its cells to be released.
///
/// The list is guarded by a mutex with very short critical sections; closing
/// and adding are atomic with respect to each other, so a thread whose `add`
/// succeeded is guaranteed to be unparked by the close that follows, and a
/// thread whose `add` failed knows the node is already on its way out.
#[derive(Debug)]
pub(crate) struct Waiters {
    inner: Mutex<WaiterList>,
}

#[derive(Debug)]
struct WaiterList {
    /// Cleared when the owning node released (or undid) its cells; parked
    /// threads must not queue onto a dead node.
    open: bool,
    threads: Vec<Thread>,
}

// === impl Waiters ===

impl Waiters {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(WaiterList {
                open: true,
                threads: Vec::new(),
            }),
        }
    }

    /// Registers `thread` to be unparked on release. Returns `false` if the
    /// node already released, in which case the caller retries immediately
    /// instead of parking.
    pub(crate) fn add(&self, thread: Thread) -> bool {
        let mut list = self.inner.lock();
        if !list.open {
            return false;
        }
        list.threads.push(thread);
        true
    }

    /// Closes the list and unparks every registered thread.
    pub(crate) fn close_and_wake(&self) {
        let drained = {
            let mut list = self.inner.lock();
            list.open = false;
            core::mem::take(&mut list.threads)
        };
        for thread in drained {
            thread.unpark();
        }
    }

    /// Reopens the list after a failed acquisition attempt so other threads
    /// can park on this node again.
    pub(crate) fn allow_adds(&self) {
        self.inner.lock().open = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_list_rejects_adds_until_reopened() {
        let waiters = Waiters::new();
        assert!(waiters.add(std::thread::current()));

        waiters.close_and_wake();
        assert!(!waiters.add(std::thread::current()));

        waiters.allow_adds();
        assert!(waiters.add(std::thread::current()));
    }
}
