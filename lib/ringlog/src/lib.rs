// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static ring buffers for driver diagnostics.
//!
//! The driver core has no textual logging; instead, each module that wants
//! diagnostics declares a static ring of `Copy` event records with
//! [`ringlog!`] and deposits entries with [`ringlog_entry!`]. The rings are
//! meant to be read out by a debugger or dumped wholesale by a collaborator
//! after the fact. Recording is a couple of stores; there is no formatting
//! and nothing to configure.
//!
//! ```ignore
//! ringlog!(Event, 16, Event::None);
//!
//! ringlog_entry!(Event::Stall { ring: 1 });
//! ```
//!
//! If you use the variant of `ringlog!` that leaves the name implicit, you
//! can only have one ring per module.
//!
//! Entries carry the source line of the recording site, which is usually
//! enough to tell two otherwise-identical events apart.
//!
//! Recording takes `&self`, so a ring can be written from both the worker
//! and an interrupt entry. On the single-CPU targets this core supports the
//! worst interleaving is an interrupt overwriting the entry the worker was
//! composing; that costs one garbled diagnostic record, never memory safety
//! elsewhere, and is an accepted cost of keeping the write path trivial.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// One recorded event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry<T> {
    /// Source line of the `ringlog_entry!` site.
    pub line: u32,
    pub payload: T,
}

/// A ring of the last `N` events of type `T`.
pub struct RingLog<T, const N: usize> {
    /// Free-running count of entries ever recorded; the slot for the next
    /// entry is `next % N`.
    next: AtomicUsize,
    entries: UnsafeCell<[Entry<T>; N]>,
}

/// See the module docs for the (deliberately weak) concurrency story.
unsafe impl<T: Send, const N: usize> Sync for RingLog<T, N> {}

impl<T: Copy, const N: usize> RingLog<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            next: AtomicUsize::new(0),
            entries: UnsafeCell::new([Entry { line: 0, payload: init }; N]),
        }
    }

    /// Deposits one event, overwriting the oldest if the ring is full.
    pub fn record(&self, line: u32, payload: T) {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        // Safety: slot writes may race with a concurrent `record` or
        // `snapshot` only in the interrupt-overlap case described in the
        // module docs; a torn diagnostic entry is acceptable there and `T` is
        // `Copy` (no drop, no invariants).
        unsafe {
            (*self.entries.get())[n % N] = Entry { line, payload };
        }
    }

    /// Number of events ever recorded.
    pub fn recorded(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Copies the ring contents out, oldest first.
    pub fn snapshot(&self) -> ([Entry<T>; N], usize) {
        let n = self.next.load(Ordering::Relaxed);
        // Safety: reads may observe an entry mid-write; see module docs.
        let raw = unsafe { *self.entries.get() };
        let mut out = raw;
        if n > N {
            // Rotate so the oldest surviving entry comes first.
            let split = n % N;
            for (i, e) in raw[split..].iter().chain(&raw[..split]).enumerate() {
                out[i] = *e;
            }
        }
        (out, n)
    }
}

/// Declares a static event ring.
///
/// `ringlog!(NAME, Type, N, init)` declares a static named `NAME`; the
/// three-argument form names it `__RINGLOG`.
#[macro_export]
macro_rules! ringlog {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::RingLog<$t, $n> = $crate::RingLog::new($init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringlog!(__RINGLOG, $t, $n, $init);
    };
}

/// Records one event into a ring declared with [`ringlog!`].
#[macro_export]
macro_rules! ringlog_entry {
    ($name:ident, $payload:expr) => {
        $name.record(line!(), $payload);
    };
    ($payload:expr) => {
        $crate::ringlog_entry!(__RINGLOG, $payload);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Event {
        None,
        Hit(u16),
    }

    ringlog!(TEST_LOG, Event, 4, Event::None);

    #[test]
    fn records_and_wraps() {
        let log: RingLog<Event, 4> = RingLog::new(Event::None);
        for i in 0..6u16 {
            log.record(100 + u32::from(i), Event::Hit(i));
        }
        let (entries, n) = log.snapshot();
        assert_eq!(n, 6);
        // Oldest surviving is Hit(2).
        assert_eq!(entries[0].payload, Event::Hit(2));
        assert_eq!(entries[3].payload, Event::Hit(5));
        assert_eq!(entries[3].line, 105);
    }

    #[test]
    fn static_macro_form() {
        ringlog_entry!(TEST_LOG, Event::Hit(7));
        let (entries, n) = TEST_LOG.snapshot();
        assert!(n >= 1);
        assert_eq!(entries[n.min(4) - 1].payload, Event::Hit(7));
    }
}
