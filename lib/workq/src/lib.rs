// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single-producer single-consumer ring of work records.
//!
//! This queue carries fixed-size `Copy` records from an interrupt entry point
//! to a cooperatively scheduled worker. The producer half is intended to be
//! owned by the interrupt context and the consumer half by the worker; the
//! split is enforced by handing out two distinct types, each of which can
//! advance only its own cursor.
//!
//! # Design goals
//!
//! 1. `no_std`, no allocation -- records live in the queue structure itself,
//!    which can be a named `static` for debug visibility.
//! 2. The producer side never blocks and never allocates: `push` either
//!    deposits the record or reports that the queue is full, in bounded time.
//!    On overflow the queue keeps what it already holds; it is the caller's
//!    job to count the rejected record.
//! 3. Cursors are free-running and advanced with Acquire/Release pairs, so
//!    the two halves may live in different execution contexts on the same
//!    CPU (worker preempted by interrupt) without further locking.
//!
//! Non-goals: multiple producers, multiple consumers, records larger than a
//! few machine words (copy them, don't point at them).

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Storage and cursors for a queue of up to `N` records of type `T`.
///
/// `N` must be a power of two; `split` will panic otherwise. Create one of
/// these (typically in a `static`), then call [`WorkQueue::split`] to obtain
/// the two working halves.
pub struct WorkQueue<T, const N: usize> {
    /// Record storage. A slot is initialized iff its index (mod N) lies in
    /// `tail..head`.
    slots: [UnsafeCell<MaybeUninit<T>>; N],
    /// Free-running count of records ever pushed. Written only through
    /// `Producer`, with Release ordering.
    head: AtomicUsize,
    /// Free-running count of records ever popped. Written only through
    /// `Consumer`, with Release ordering.
    tail: AtomicUsize,
}

/// The queue is shared between two contexts, but each slot is accessed by at
/// most one of them at a time, governed by the cursors.
unsafe impl<T: Send, const N: usize> Sync for WorkQueue<T, N> {}

/// Error returned by [`Producer::push`] when the queue is full. Carries the
/// rejected record back to the caller, who is expected to count it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T: Copy, const N: usize> WorkQueue<T, N> {
    pub const fn new() -> Self {
        // Inline const lets us build the array without T: Copy bounds on the
        // initializer expression.
        Self {
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Breaks the queue into its producer and consumer halves.
    ///
    /// Requires `&mut self`, which proves the caller has exclusive access at
    /// split time; after this the two halves may be moved into different
    /// contexts.
    ///
    /// # Panics
    ///
    /// If `N` is zero or not a power of two.
    pub fn split(&mut self) -> (Producer<'_, T, N>, Consumer<'_, T, N>) {
        assert!(N.is_power_of_two());
        (Producer { q: self }, Consumer { q: self })
    }
}

impl<T: Copy, const N: usize> Default for WorkQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Push half. The sole writer of the queue's head cursor.
pub struct Producer<'q, T, const N: usize> {
    q: &'q WorkQueue<T, N>,
}

impl<T: Copy, const N: usize> Producer<'_, T, N> {
    /// Deposits `item` at the head of the queue, unless the queue is full.
    ///
    /// Runs in bounded time and performs no allocation, so it is safe to call
    /// from an interrupt entry.
    pub fn push(&mut self, item: T) -> Result<(), Full<T>> {
        let head = self.q.head.load(Ordering::Relaxed);
        let tail = self.q.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) == N {
            return Err(Full(item));
        }
        let slot = self.q.slots[head % N].get();
        // Safety: `head` is outside `tail..head`, so the consumer will not
        // touch this slot until our Release store below makes it visible; we
        // are the only producer.
        unsafe { (*slot).write(item) };
        self.q.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Number of records currently queued, as seen from the producer side.
    pub fn len(&self) -> usize {
        self.q
            .head
            .load(Ordering::Relaxed)
            .wrapping_sub(self.q.tail.load(Ordering::Acquire))
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }
}

/// Pop half. The sole writer of the queue's tail cursor.
pub struct Consumer<'q, T, const N: usize> {
    q: &'q WorkQueue<T, N>,
}

impl<T: Copy, const N: usize> Consumer<'_, T, N> {
    /// Removes and returns the oldest record, if any.
    pub fn pop(&mut self) -> Option<T> {
        let tail = self.q.tail.load(Ordering::Relaxed);
        let head = self.q.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = self.q.slots[tail % N].get();
        // Safety: `tail` lies in `tail..head`, so the slot was initialized by
        // a push whose Release store we have observed via the Acquire load of
        // `head`; the producer will not rewrite it until we advance `tail`.
        let item = unsafe { (*slot).assume_init() };
        self.q.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Number of records currently queued, as seen from the consumer side.
    pub fn len(&self) -> usize {
        self.q
            .head
            .load(Ordering::Acquire)
            .wrapping_sub(self.q.tail.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
