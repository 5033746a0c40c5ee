// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error returned when queueing into a task queue that has been shut down.
///
/// Shutdown only rejects *new* tasks; whatever was queued before stays
/// pollable until drained.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Shutdown(pub(crate) ());

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("queue shutdown")
    }
}

impl core::error::Error for Shutdown {}
