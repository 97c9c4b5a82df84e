// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel buffer policies.
//!
//! A buffer is owned by exactly one channel and only touched by it. The
//! channel always checks `is_full` before `add`, and that check-then-add
//! runs without any suspension in between.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ring::RingBuffer;

/// Bounded storage attached to a channel.
pub trait Buffer<T> {
    /// Whether a put must park instead of buffering.
    fn is_full(&self) -> bool;
    fn add(&mut self, value: T);
    /// Oldest buffered value.
    fn remove(&mut self) -> Option<T>;
    fn count(&self) -> usize;
}

/// Blocks putters once `n` values are buffered.
pub struct FixedBuffer<T> {
    ring: RingBuffer<T>,
    n: usize,
}

impl<T> FixedBuffer<T> {
    pub fn new(n: usize) -> Self {
        Self {
            ring: RingBuffer::new(n),
            n,
        }
    }
}

impl<T> Buffer<T> for FixedBuffer<T> {
    fn is_full(&self) -> bool {
        self.ring.len() >= self.n
    }

    // Adding past capacity is the caller's bug; the ring grows rather
    // than losing the value.
    fn add(&mut self, value: T) {
        self.ring.unbounded_unshift(value);
    }

    fn remove(&mut self) -> Option<T> {
        self.ring.pop()
    }

    fn count(&self) -> usize {
        self.ring.len()
    }
}

/// Never blocks; once `n` values are buffered, new values are discarded.
pub struct DroppingBuffer<T> {
    ring: RingBuffer<T>,
    n: usize,
}

impl<T> DroppingBuffer<T> {
    pub fn new(n: usize) -> Self {
        Self {
            ring: RingBuffer::new(n),
            n,
        }
    }
}

impl<T> Buffer<T> for DroppingBuffer<T> {
    fn is_full(&self) -> bool {
        false
    }

    fn add(&mut self, value: T) {
        if self.ring.len() < self.n {
            self.ring.unshift(value);
        }
    }

    fn remove(&mut self) -> Option<T> {
        self.ring.pop()
    }

    fn count(&self) -> usize {
        self.ring.len()
    }
}

/// Never blocks; once `n` values are buffered, the oldest is evicted to
/// make room.
pub struct SlidingBuffer<T> {
    ring: RingBuffer<T>,
    n: usize,
}

impl<T> SlidingBuffer<T> {
    pub fn new(n: usize) -> Self {
        Self {
            ring: RingBuffer::new(n),
            n,
        }
    }
}

impl<T> Buffer<T> for SlidingBuffer<T> {
    fn is_full(&self) -> bool {
        false
    }

    fn add(&mut self, value: T) {
        if self.n == 0 {
            return;
        }
        if self.ring.len() == self.n {
            self.ring.pop();
        }
        self.ring.unshift(value);
    }

    fn remove(&mut self) -> Option<T> {
        self.ring.pop()
    }

    fn count(&self) -> usize {
        self.ring.len()
    }
}

/// Declarative buffer choice used when creating channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BufferKind {
    Fixed(usize),
    Dropping(usize),
    Sliding(usize),
}

impl BufferKind {
    /// Build the buffer. `Fixed(0)` means no buffer at all (rendezvous).
    pub fn build<T: 'static>(self) -> Option<Box<dyn Buffer<T>>> {
        match self {
            BufferKind::Fixed(0) => None,
            BufferKind::Fixed(n) => Some(Box::new(FixedBuffer::new(n))),
            BufferKind::Dropping(n) => Some(Box::new(DroppingBuffer::new(n))),
            BufferKind::Sliding(n) => Some(Box::new(SlidingBuffer::new(n))),
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Fixed(n) => write!(f, "fixed({})", n),
            BufferKind::Dropping(n) => write!(f, "dropping({})", n),
            BufferKind::Sliding(n) => write!(f, "sliding({})", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut dyn Buffer<i32>) -> Vec<i32> {
        std::iter::from_fn(|| buf.remove()).collect()
    }

    #[test]
    fn fixed_fills_up() {
        let mut buf = FixedBuffer::new(3);
        for i in 0..3 {
            assert!(!buf.is_full());
            buf.add(i);
        }
        assert!(buf.is_full());
        assert_eq!(buf.count(), 3);
        assert_eq!(drain(&mut buf), vec![0, 1, 2]);
    }

    #[test]
    fn dropping_discards_newest() {
        let mut buf = DroppingBuffer::new(2);
        for i in 0..5 {
            buf.add(i);
            assert!(!buf.is_full());
        }
        assert_eq!(buf.count(), 2);
        assert_eq!(drain(&mut buf), vec![0, 1]);
    }

    #[test]
    fn sliding_evicts_oldest() {
        let mut buf = SlidingBuffer::new(2);
        for i in 0..5 {
            buf.add(i);
            assert!(!buf.is_full());
        }
        assert_eq!(buf.count(), 2);
        assert_eq!(drain(&mut buf), vec![3, 4]);
    }

    #[test]
    fn zero_sized_unblocking_buffers_discard_everything() {
        let mut dropping = DroppingBuffer::new(0);
        let mut sliding = SlidingBuffer::new(0);
        dropping.add(1);
        sliding.add(1);
        assert_eq!(dropping.count(), 0);
        assert_eq!(sliding.count(), 0);
    }

    #[test]
    fn kind_builds_matching_policy() {
        assert!(BufferKind::Fixed(0).build::<i32>().is_none());
        let mut sliding = BufferKind::Sliding(1).build::<i32>().unwrap();
        sliding.add(1);
        sliding.add(2);
        assert_eq!(sliding.remove(), Some(2));
        assert_eq!(BufferKind::Dropping(8).to_string(), "dropping(8)");
    }
}
